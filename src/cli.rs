use crate::{
    client,
    codec::Framing,
    config::{Config, Overrides},
    engine::office::OfficeFactory,
    gateway::ConversionGateway,
    listener::{Listener, OriginPolicy},
    retry::RetryPolicy,
    supervisor::EngineSupervisor,
    tempfiles::TempFiles,
    util::ensure_dir,
    worker::ServerContext,
};
use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "doc-convertd")]
#[command(about = "Local document-conversion request server fronting a LibreOffice engine")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./doc-convertd.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the engine and serve conversion requests.
    Serve {
        #[command(flatten)]
        overrides: OverrideArgs,
    },
    /// Submit one request to a running server.
    Send {
        /// Input filename (a path on the server, or a local file with --inline).
        #[arg(long)]
        input: String,
        /// Output filename; its extension picks the target format.
        #[arg(long)]
        output: String,
        /// Ship the input's bytes in the request and write the returned bytes to --output.
        #[arg(long)]
        inline: bool,
        /// Explicit target format, overriding the output extension.
        #[arg(long)]
        output_format: Option<String>,
        #[arg(long, default_value = "127.0.0.1")]
        host: IpAddr,
        /// Server port; defaults to server.port from the config.
        #[arg(long)]
        port: Option<u16>,
        /// Seconds to wait for the response (0 waits forever).
        #[arg(long, default_value_t = 0)]
        timeout: u64,
    },
    /// Check that the office installation and helper programs resolve.
    Doctor {},
}

#[derive(clap::Args, Debug, Default)]
pub struct OverrideArgs {
    /// The port the service listens on.
    #[arg(long)]
    pub server_port: Option<u16>,
    /// The port the office daemon listens on.
    #[arg(long)]
    pub office_port: Option<u16>,
    /// The home directory of the office installation.
    #[arg(long)]
    pub office_home: Option<PathBuf>,
    /// The profile directory to use for the office daemon.
    #[arg(long)]
    pub office_profile: Option<PathBuf>,
    /// The largest decoded file size that can be uploaded, in bytes.
    #[arg(long)]
    pub file_upload_max_size: Option<u64>,
}

impl From<&OverrideArgs> for Overrides {
    fn from(a: &OverrideArgs) -> Self {
        Overrides {
            server_port: a.server_port,
            office_port: a.office_port,
            office_home: a.office_home.clone(),
            office_profile: a.office_profile.clone(),
            file_upload_max_size: a.file_upload_max_size,
        }
    }
}

pub fn dispatch(args: Args) -> Result<()> {
    let mut cfg = load_config(args.config.as_deref())?;

    match &args.cmd {
        Command::Serve { overrides } => {
            cfg.apply(&Overrides::from(overrides));
            cfg.validate()?;
            let _guard = init_logging(&args, &cfg)?;
            serve(&cfg)
        }
        Command::Send {
            input,
            output,
            inline,
            output_format,
            host,
            port,
            timeout,
        } => {
            let _guard = init_logging(&args, &cfg)?;
            let addr = SocketAddr::new(*host, port.unwrap_or(cfg.server.port));
            let timeout = (*timeout > 0).then(|| Duration::from_secs(*timeout));
            send(&cfg, addr, input, output, *inline, output_format.clone(), timeout)
        }
        Command::Doctor {} => {
            cfg.validate()?;
            let _guard = init_logging(&args, &cfg)?;
            doctor(&cfg)
        }
    }
}

fn load_config(user: Option<&Path>) -> Result<Config> {
    if let Some(p) = user {
        return Config::load(p);
    }
    let default = PathBuf::from("doc-convertd.toml");
    if default.exists() {
        Config::load(&default)
    } else {
        Ok(Config::default())
    }
}

fn init_logging(args: &Args, cfg: &Config) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stdout_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_names(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .boxed()
    };

    let (file_layer, guard) = if let Some(path) = resolve_log_path(cfg) {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::File::create(&path)
            .with_context(|| format!("create log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn resolve_log_path(cfg: &Config) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }
    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }
    Some(PathBuf::from("doc-convertd.log"))
}

fn serve(cfg: &Config) -> Result<()> {
    let factory = OfficeFactory::new(&cfg.engine);
    let supervisor = Arc::new(EngineSupervisor::new(
        Box::new(factory),
        RetryPolicy::from_config(&cfg.retry),
    ));
    supervisor.start();

    let gateway = ConversionGateway::from_config(supervisor, cfg)?;
    info!(
        "engine status: {}",
        serde_json::to_string(&gateway.supervisor().status())?
    );
    let temp = TempFiles::new(cfg.server.temp_dir())?;
    info!("inline jobs use temp files under {}", temp.dir().display());
    let ctx = Arc::new(ServerContext::new(&cfg.server, temp, gateway));

    let bind: IpAddr = cfg
        .server
        .bind
        .parse()
        .with_context(|| format!("server.bind: {}", cfg.server.bind))?;
    let addr = SocketAddr::new(bind, cfg.server.port);
    let listener = Listener::bind(
        addr,
        ctx,
        OriginPolicy::from_config(&cfg.server)?,
        cfg.server.max_workers,
    )?;
    listener.run();
    Ok(())
}

fn send(
    cfg: &Config,
    addr: SocketAddr,
    input: &str,
    output: &str,
    inline: bool,
    output_format: Option<String>,
    timeout: Option<Duration>,
) -> Result<()> {
    let mut request = if inline {
        client::inline_request(Path::new(input), output)?
    } else {
        client::path_request(input, output)
    };
    request.output_format = output_format;

    let framing: Framing = cfg.server.framing;
    let response = client::submit(addr, &request, framing, timeout)?;

    let mut written = None;
    if let Some(encoded) = &response.output_base64_file_contents {
        let bytes = crate::codec::decode_content(encoded)
            .with_context(|| "decoding returned content")?;
        std::fs::write(output, &bytes).with_context(|| format!("writing output: {output}"))?;
        written = Some(bytes.len());
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "msg": response.msg,
            "outputFilename": response.output_filename,
            "bytesWritten": written,
        }))?
    );

    if !response.is_success() {
        bail!("conversion failed: {}", response.msg);
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    let diag = OfficeFactory::new(&cfg.engine).diagnose();
    println!("{}", serde_json::to_string_pretty(&diag)?);
    if !diag.ok {
        bail!(
            "{}",
            diag.error.unwrap_or_else(|| "engine check failed".into())
        );
    }
    Ok(())
}
