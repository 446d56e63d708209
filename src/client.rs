use crate::codec::{self, Framing, Request, Response};
use anyhow::{Context, Result};
use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::time::Duration;

pub fn submit(
    addr: SocketAddr,
    request: &Request,
    framing: Framing,
    timeout: Option<Duration>,
) -> Result<Response> {
    let mut stream = TcpStream::connect(addr).with_context(|| format!("connecting to {addr}"))?;
    stream.set_read_timeout(timeout)?;

    let body = serde_json::to_vec(request)?;
    codec::write_frame(&mut stream, framing, &body).with_context(|| "sending request")?;

    let raw = match framing {
        Framing::Brace => {
            let mut raw = Vec::new();
            stream
                .read_to_end(&mut raw)
                .with_context(|| "reading response")?;
            raw
        }
        Framing::LengthPrefixed => codec::read_frame(&mut stream, framing, usize::MAX)
            .with_context(|| "reading response")?,
    };
    let response: Response =
        serde_json::from_slice(&raw).with_context(|| "parsing response JSON")?;
    Ok(response)
}

pub fn inline_request(input: &Path, output_filename: &str) -> Result<Request> {
    let bytes =
        std::fs::read(input).with_context(|| format!("reading input: {}", input.display()))?;
    let input_filename = input
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("input")
        .to_string();
    Ok(Request {
        output_filename: output_filename.to_string(),
        input_filename,
        input_base64_file_contents: Some(codec::encode_content(&bytes)),
        output_format: None,
    })
}

pub fn path_request(input: &str, output: &str) -> Request {
    Request {
        output_filename: output.to_string(),
        input_filename: input.to_string(),
        input_base64_file_contents: None,
        output_format: None,
    }
}
