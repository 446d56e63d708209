use crate::codec::Framing;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub engine: Engine,
    #[serde(default)]
    pub retry: Retry,
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        Ok(cfg)
    }

    pub fn apply(&mut self, ov: &Overrides) {
        if let Some(port) = ov.server_port {
            self.server.port = port;
        }
        if let Some(port) = ov.office_port {
            self.engine.office_port = port;
        }
        if let Some(home) = &ov.office_home {
            self.engine.office_home = home.display().to_string();
        }
        if let Some(profile) = &ov.office_profile {
            self.engine.office_profile = profile.display().to_string();
        }
        if let Some(max) = ov.file_upload_max_size {
            self.server.max_upload_bytes = max;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("server.port must be a non-zero port number");
        }
        if self.server.max_upload_bytes == 0 {
            bail!("server.max_upload_bytes must be greater than zero");
        }
        self.server
            .bind
            .parse::<IpAddr>()
            .with_context(|| format!("server.bind is not an IP address: {}", self.server.bind))?;
        for origin in &self.server.allowed_origins {
            origin
                .parse::<IpAddr>()
                .with_context(|| format!("server.allowed_origins entry is not an IP address: {origin}"))?;
        }
        if self.engine.office_home.trim().is_empty() {
            bail!("engine.office_home must be set");
        }
        if self.engine.office_port == 0 {
            bail!("engine.office_port must be a non-zero port number");
        }
        if self.engine.office_port == self.server.port {
            bail!(
                "engine.office_port and server.port are both {}",
                self.server.port
            );
        }
        if self.engine.listener_program.trim().is_empty() {
            bail!("engine.listener_program must be set");
        }
        if self.engine.client_program.trim().is_empty() {
            bail!("engine.client_program must be set");
        }
        if self.engine.task_slots == 0 {
            bail!("engine.task_slots must be at least 1");
        }
        if self.retry.multiplier < 1.0 {
            bail!("retry.multiplier must be >= 1.0, got {}", self.retry.multiplier);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub server_port: Option<u16>,
    pub office_port: Option<u16>,
    pub office_home: Option<PathBuf>,
    pub office_profile: Option<PathBuf>,
    pub file_upload_max_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Server {
    pub bind: String,
    pub port: u16,
    pub max_upload_bytes: u64,
    pub framing: Framing,
    pub max_workers: usize,
    pub temp_dir: String,
    pub read_timeout_seconds: u64,
    pub allowed_origins: Vec<String>,
}
impl Default for Server {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8080,
            max_upload_bytes: 50 * 1024 * 1024,
            framing: Framing::Brace,
            max_workers: 0,
            temp_dir: "".into(),
            read_timeout_seconds: 30,
            allowed_origins: Vec::new(),
        }
    }
}

impl Server {
    pub fn temp_dir(&self) -> PathBuf {
        if self.temp_dir.trim().is_empty() {
            std::env::temp_dir()
        } else {
            PathBuf::from(&self.temp_dir)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Engine {
    pub office_home: String,
    pub office_port: u16,
    pub office_profile: String,
    pub listener_program: String,
    pub listener_args: Vec<String>,
    pub client_program: String,
    pub client_args: Vec<String>,
    pub kill_command: Vec<String>,
    pub start_timeout_seconds: u64,
    pub task_timeout_seconds: u64,
    pub task_slots: usize,
    pub env: BTreeMap<String, String>,
}
impl Default for Engine {
    fn default() -> Self {
        Self {
            office_home: "/usr/lib/libreoffice".into(),
            office_port: 8100,
            office_profile: "".into(),
            listener_program: "{home}/program/soffice".into(),
            listener_args: vec![
                "--headless".into(),
                "--invisible".into(),
                "--nologo".into(),
                "--norestore".into(),
                "--accept=socket,host=127.0.0.1,port={port};urp;".into(),
            ],
            client_program: "unoconv".into(),
            client_args: vec![
                "--connection=socket,host=127.0.0.1,port={port};urp;StarOffice.ComponentContext"
                    .into(),
                "--format={format}".into(),
                "--output={output}".into(),
                "{input}".into(),
            ],
            kill_command: vec!["pkill".into(), "-f".into(), "soffice".into()],
            start_timeout_seconds: 60,
            task_timeout_seconds: 300,
            task_slots: 1,
            env: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Retry {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub failure_threshold: u32,
    pub cooldown_seconds: u64,
}
impl Default for Retry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 250,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            failure_threshold: 10,
            cooldown_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: false,
            file_path: "".into(),
        }
    }
}
