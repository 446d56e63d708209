#![allow(dead_code)]

use anyhow::{Result, bail};
use doc_convertd::{
    config::Config,
    engine::{ConversionTask, Engine, EngineError, EngineFactory},
    gateway::ConversionGateway,
    listener::{Listener, OriginPolicy},
    retry::RetryPolicy,
    supervisor::EngineSupervisor,
    tempfiles::TempFiles,
    worker::ServerContext,
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Knobs and counters shared between a test and its fake engine.
#[derive(Default)]
pub struct Script {
    pub start_failures: AtomicU32,
    pub transient_failures: AtomicU32,
    pub fatal: Mutex<Option<String>>,
    pub alive: AtomicBool,
    pub builds: AtomicU32,
    pub starts: AtomicU32,
    pub kills: AtomicU32,
    pub executions: AtomicU32,
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn executions(&self) -> u32 {
        self.executions.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub struct FakeFactory {
    pub script: Arc<Script>,
}

impl EngineFactory for FakeFactory {
    fn build(&self) -> Result<Box<dyn Engine>> {
        self.script.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeEngine {
            script: Arc::clone(&self.script),
        }))
    }

    fn kill_strays(&self) -> Result<()> {
        self.script.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Copies input to output; `pdf` targets get wrapped in a PDF envelope.
pub struct FakeEngine {
    script: Arc<Script>,
}

impl Engine for FakeEngine {
    fn start(&self) -> Result<()> {
        self.script.starts.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.script.start_failures) {
            bail!("office refused to start");
        }
        self.script.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.script.alive.load(Ordering::SeqCst)
    }

    fn execute(&self, task: &ConversionTask) -> Result<(), EngineError> {
        self.script.executions.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = self.script.fatal.lock().unwrap().clone() {
            return Err(EngineError::Fatal(msg));
        }
        if take_one(&self.script.transient_failures) {
            return Err(EngineError::Transient("office connection reset".into()));
        }
        let input = std::fs::read(&task.input).map_err(|e| EngineError::Fatal(e.to_string()))?;
        let output = if task.target_format == "pdf" {
            fake_pdf(&input)
        } else {
            input
        };
        std::fs::write(&task.output, output).map_err(|e| EngineError::Fatal(e.to_string()))
    }
}

pub fn fake_pdf(body: &[u8]) -> Vec<u8> {
    let mut out = b"%PDF-1.4\n".to_vec();
    out.extend_from_slice(format!("% {} source bytes\n", body.len()).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

pub fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.retry.initial_delay_ms = 1;
    cfg.retry.max_delay_ms = 5;
    cfg
}

pub fn supervisor(script: &Arc<Script>, cfg: &Config) -> Arc<EngineSupervisor> {
    Arc::new(EngineSupervisor::new(
        Box::new(FakeFactory {
            script: Arc::clone(script),
        }),
        RetryPolicy::from_config(&cfg.retry),
    ))
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub script: Arc<Script>,
    pub temp_dir: tempfile::TempDir,
}

impl TestServer {
    pub fn temp_entries(&self) -> usize {
        std::fs::read_dir(self.temp_dir.path()).unwrap().count()
    }
}

/// Start a server on an ephemeral loopback port backed by the fake engine.
pub fn spawn_server(cfg: Config, origin: OriginPolicy) -> TestServer {
    let script = Script::new();
    let temp_dir = tempfile::tempdir().unwrap();

    let supervisor = supervisor(&script, &cfg);
    supervisor.start();
    let gateway = ConversionGateway::from_config(supervisor, &cfg).unwrap();
    let temp = TempFiles::new(temp_dir.path()).unwrap();
    let ctx = Arc::new(ServerContext::new(&cfg.server, temp, gateway));

    let listener = Listener::bind(
        "127.0.0.1:0".parse().unwrap(),
        ctx,
        origin,
        cfg.server.max_workers,
    )
    .unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || listener.run());

    TestServer {
        addr,
        script,
        temp_dir,
    }
}

pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}
