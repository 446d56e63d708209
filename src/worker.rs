use crate::codec::{self, Framing, Request, Response};
use crate::config;
use crate::engine::ConversionTask;
use crate::error::{FrameError, RequestError};
use crate::gateway::ConversionGateway;
use crate::tempfiles::{JobFiles, TempFiles};
use crate::util::extension;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn};

pub struct ServerContext {
    pub framing: Framing,
    pub max_upload_bytes: u64,
    pub frame_limit: usize,
    pub read_timeout: Option<Duration>,
    pub temp: TempFiles,
    pub gateway: ConversionGateway,
}

impl ServerContext {
    pub fn new(cfg: &config::Server, temp: TempFiles, gateway: ConversionGateway) -> Self {
        Self {
            framing: cfg.framing,
            max_upload_bytes: cfg.max_upload_bytes,
            frame_limit: codec::frame_limit(cfg.max_upload_bytes),
            read_timeout: (cfg.read_timeout_seconds > 0)
                .then(|| Duration::from_secs(cfg.read_timeout_seconds)),
            temp,
            gateway,
        }
    }
}

#[derive(Debug)]
pub struct ConversionJob {
    pub files: JobFiles,
    pub source_format: String,
    pub target_format: String,
}

impl ConversionJob {
    pub fn owns_files(&self) -> bool {
        self.files.owns_files()
    }

    pub fn task(&self) -> ConversionTask {
        ConversionTask {
            input: self.files.input().to_path_buf(),
            output: self.files.output().to_path_buf(),
            source_format: self.source_format.clone(),
            target_format: self.target_format.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Reading,
    Decoding,
    Resolving,
    Converting,
    Responding,
    Closing,
}

pub struct ConnectionWorker {
    ctx: Arc<ServerContext>,
    stream: TcpStream,
    peer: SocketAddr,
    id: u64,
    stage: Stage,
}

impl ConnectionWorker {
    pub fn new(ctx: Arc<ServerContext>, stream: TcpStream, peer: SocketAddr, id: u64) -> Self {
        Self {
            ctx,
            stream,
            peer,
            id,
            stage: Stage::Reading,
        }
    }

    pub fn run(mut self) {
        let span = info_span!("conn", id = self.id, peer = %self.peer);
        let _guard = span.enter();
        info!("accepted a new connection");

        if let Err(e) = self.stream.set_read_timeout(self.ctx.read_timeout) {
            warn!("setting read timeout failed: {e}");
        }

        let response = match self.read_frame() {
            Ok(frame) => Some(self.process(&frame)),
            Err(FrameError::TooLarge { limit }) => {
                warn!("request frame exceeds {limit} bytes");
                Some(Response::failure(RequestError::TooBig.to_string()))
            }
            Err(FrameError::Closed) => {
                debug!("peer closed before sending a request");
                None
            }
            Err(err) => {
                warn!("{err}");
                None
            }
        };

        if let Some(response) = response {
            self.enter(Stage::Responding);
            if let Err(e) = codec::write_response(&mut self.stream, self.ctx.framing, &response) {
                warn!("writing response failed: {e}");
            }
        }

        self.enter(Stage::Closing);
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("socket shutdown: {e}");
        }
        info!("done");
    }

    fn enter(&mut self, stage: Stage) {
        debug!("{:?} -> {:?}", self.stage, stage);
        self.stage = stage;
    }

    fn read_frame(&mut self) -> Result<Vec<u8>, FrameError> {
        let frame = codec::read_frame(&mut self.stream, self.ctx.framing, self.ctx.frame_limit)?;
        debug!("read {} byte request", frame.len());
        Ok(frame)
    }

    /// Decode, resolve, convert and build the response for one frame. Job
    /// files are released before this returns.
    fn process(&mut self, frame: &[u8]) -> Response {
        self.enter(Stage::Decoding);
        let request = match codec::decode_request(frame) {
            Ok(request) => request,
            Err(err) => return fail(err),
        };
        debug!(
            "request input={} output={} inline={}",
            request.input_filename,
            request.output_filename,
            request.input_base64_file_contents.is_some()
        );

        self.enter(Stage::Resolving);
        let job = match resolve(&self.ctx, &request) {
            Ok(job) => job,
            Err(err) => return fail(err),
        };

        self.enter(Stage::Converting);
        info!(
            "calling convert of {} to {}",
            job.files.input().display(),
            job.files.output().display()
        );
        let outcome = self
            .ctx
            .gateway
            .convert(&job.task())
            .map_err(RequestError::from)
            .and_then(|()| {
                self.enter(Stage::Responding);
                respond(&request, &job)
            });

        job.files.release();
        match outcome {
            Ok(response) => response,
            Err(err) => fail(err),
        }
    }
}

fn fail(err: RequestError) -> Response {
    error!("{err}");
    Response::failure(err.to_string())
}

pub fn resolve(ctx: &ServerContext, request: &Request) -> Result<ConversionJob, RequestError> {
    if is_path_request(request) {
        let (source_format, target_format) = formats(request)?;
        return Ok(ConversionJob {
            files: JobFiles::Caller {
                input: PathBuf::from(&request.input_filename),
                output: PathBuf::from(&request.output_filename),
            },
            source_format,
            target_format,
        });
    }

    let Some(encoded) = request.input_base64_file_contents.as_deref() else {
        return Err(RequestError::NoInput);
    };
    let bytes = codec::decode_content(encoded)?;
    if bytes.len() as u64 > ctx.max_upload_bytes {
        warn!(
            "decoded payload of {} bytes exceeds limit of {}",
            bytes.len(),
            ctx.max_upload_bytes
        );
        return Err(RequestError::TooBig);
    }
    let (source_format, target_format) = formats(request)?;

    let input = ctx
        .temp
        .materialize(&request.input_filename, &bytes)
        .map_err(|e| RequestError::io("writing temp input file", e))?;
    let output = ctx
        .temp
        .allocate(&request.output_filename)
        .map_err(|e| RequestError::io("creating temp output file", e))?;

    Ok(ConversionJob {
        files: JobFiles::Owned { input, output },
        source_format,
        target_format,
    })
}

fn is_path_request(request: &Request) -> bool {
    !request.input_filename.is_empty()
        && Path::new(&request.input_filename).is_file()
        && Path::new(&request.output_filename).file_name().is_some()
}

fn formats(request: &Request) -> Result<(String, String), RequestError> {
    let source = extension(&request.input_filename);
    if source.is_empty() {
        return Err(RequestError::UnsupportedType(request.input_filename.clone()));
    }
    let target = match request
        .output_format
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty())
    {
        Some(format) => format.to_ascii_lowercase(),
        None => extension(&request.output_filename),
    };
    if target.is_empty() {
        return Err(RequestError::UnsupportedType(request.output_filename.clone()));
    }
    Ok((source, target))
}

fn respond(request: &Request, job: &ConversionJob) -> Result<Response, RequestError> {
    if !job.owns_files() {
        return Ok(Response::success_path(request.output_filename.clone()));
    }
    let bytes = std::fs::read(job.files.output())
        .map_err(|e| RequestError::io("reading converted output", e))?;
    Ok(Response::success_inline(
        request.output_filename.clone(),
        codec::encode_content(&bytes),
    ))
}
