use crate::error::{FrameError, RequestError};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use std::io::{self, ErrorKind, Read, Write};

pub const REJECTED_MSG: &str = "Remote connections not allowed.";
pub const SUCCESS_INLINE_MSG: &str = "Success; output returned in Base64 format";
pub const SUCCESS_PATH_MSG: &str = "Success; output can be found in the output file";

const READ_CHUNK: usize = 8 * 1024;
const FRAME_SLACK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    #[default]
    Brace,
    LengthPrefixed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub output_filename: String,
    pub input_filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_base64_file_contents: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub msg: String,
    pub output_filename: Option<String>,
    pub output_base64_file_contents: Option<String>,
}

impl Response {
    pub fn rejected() -> Self {
        Self::failure(REJECTED_MSG)
    }

    pub fn failure(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            output_filename: None,
            output_base64_file_contents: None,
        }
    }

    pub fn success_inline(output_filename: String, encoded: String) -> Self {
        Self {
            msg: SUCCESS_INLINE_MSG.into(),
            output_filename: Some(output_filename),
            output_base64_file_contents: Some(encoded),
        }
    }

    pub fn success_path(output_filename: String) -> Self {
        Self {
            msg: SUCCESS_PATH_MSG.into(),
            output_filename: Some(output_filename),
            output_base64_file_contents: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.msg.starts_with("Success;")
    }
}

// Base64 expansion, MIME line breaks escaped as `\n`, then slack for the
// rest of the object.
pub fn frame_limit(max_upload_bytes: u64) -> usize {
    let encoded = usize::try_from(max_upload_bytes.div_ceil(3).saturating_mul(4)).unwrap_or(usize::MAX);
    encoded
        .saturating_add(encoded / 30)
        .saturating_add(FRAME_SLACK)
}

pub fn read_frame<R: Read>(reader: &mut R, framing: Framing, limit: usize) -> Result<Vec<u8>, FrameError> {
    match framing {
        Framing::Brace => read_brace_frame(reader, limit),
        Framing::LengthPrefixed => read_prefixed_frame(reader, limit),
    }
}

fn read_brace_frame<R: Read>(reader: &mut R, limit: usize) -> Result<Vec<u8>, FrameError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            // A stalled peer that already sent something still gets an answer.
            Err(e) if is_timeout(&e) && !buf.is_empty() => return Ok(buf),
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            if buf.is_empty() {
                return Err(FrameError::Closed);
            }
            return Ok(buf);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > limit {
            return Err(FrameError::TooLarge { limit });
        }
        if frame_complete(&buf) {
            return Ok(buf);
        }
    }
}

/// The frame ends at a trailing `}` unless that `}` sits inside a string
/// literal.
fn frame_complete(buf: &[u8]) -> bool {
    match buf.iter().rposition(|b| !b.is_ascii_whitespace()) {
        Some(i) if buf[i] == b'}' => !ends_in_string(&buf[..i]),
        _ => false,
    }
}

fn ends_in_string(buf: &[u8]) -> bool {
    let mut in_string = false;
    let mut escaped = false;
    for &b in buf {
        if escaped {
            escaped = false;
        } else if in_string && b == b'\\' {
            escaped = true;
        } else if b == b'"' {
            in_string = !in_string;
        }
    }
    in_string
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn read_prefixed_frame<R: Read>(reader: &mut R, limit: usize) -> Result<Vec<u8>, FrameError> {
    let mut header = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut header) {
        return Err(match e.kind() {
            ErrorKind::UnexpectedEof => FrameError::Closed,
            _ => FrameError::Io(e),
        });
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > limit {
        return Err(FrameError::TooLarge { limit });
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn write_frame<W: Write>(writer: &mut W, framing: Framing, body: &[u8]) -> io::Result<()> {
    if framing == Framing::LengthPrefixed {
        let len = u32::try_from(body.len())
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "frame longer than u32::MAX"))?;
        writer.write_all(&len.to_be_bytes())?;
    }
    writer.write_all(body)?;
    writer.flush()
}

pub fn decode_request(frame: &[u8]) -> Result<Request, RequestError> {
    Ok(serde_json::from_slice(frame)?)
}

pub fn write_response<W: Write>(writer: &mut W, framing: Framing, response: &Response) -> io::Result<()> {
    let body = serde_json::to_vec(response).map_err(io::Error::other)?;
    write_frame(writer, framing, &body)
}

// Whitespace is dropped so MIME-wrapped Base64 decodes.
pub fn decode_content(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: Vec<u8> = encoded
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    STANDARD.decode(compact)
}

pub fn encode_content(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
