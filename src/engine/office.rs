use super::{Engine, EngineError, EngineFactory, types::*};
use crate::config;
use crate::util::{expand_tilde, find_program, lock};
use anyhow::{Context, Result, bail};
use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct OfficeFactory {
    cfg: config::Engine,
}

impl OfficeFactory {
    pub fn new(cfg: &config::Engine) -> Self {
        Self { cfg: cfg.clone() }
    }

    pub fn diagnose(&self) -> EngineDiag {
        let home = expand_tilde(&self.cfg.office_home);
        let listener_program = expand(&self.cfg.listener_program, &self.base_vars());
        let client_program = expand(&self.cfg.client_program, &self.base_vars());
        let office_home_exists = home.is_dir();
        let listener_found = find_program(&listener_program).is_some();
        let client_found = find_program(&client_program).is_some();

        let mut problems = Vec::new();
        if !office_home_exists {
            problems.push(format!("office home not found: {}", home.display()));
        }
        if !listener_found {
            problems.push(format!("listener program not found: {listener_program}"));
        }
        if !client_found {
            problems.push(format!("client program not found: {client_program}"));
        }

        EngineDiag {
            office_home: home.display().to_string(),
            office_home_exists,
            listener_program,
            listener_found,
            client_program,
            client_found,
            ok: problems.is_empty(),
            error: (!problems.is_empty()).then(|| problems.join("; ")),
        }
    }

    fn base_vars(&self) -> Vec<(&'static str, String)> {
        base_vars(&self.cfg)
    }
}

impl EngineFactory for OfficeFactory {
    fn build(&self) -> Result<Box<dyn Engine>> {
        Ok(Box::new(OfficeEngine {
            cfg: self.cfg.clone(),
            child: Mutex::new(None),
        }))
    }

    fn kill_strays(&self) -> Result<()> {
        let Some((program, args)) = self.cfg.kill_command.split_first() else {
            return Ok(());
        };
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("running kill command: {program}"))?;
        // pkill/killall exit 1 when nothing matched, which is the common case.
        debug!(
            "kill command {:?} exited with {}",
            self.cfg.kill_command, output.status
        );
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            info!("kill command stdout: {}", stdout.trim());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            warn!("kill command stderr: {}", stderr.trim());
        }
        Ok(())
    }
}

pub struct OfficeEngine {
    cfg: config::Engine,
    child: Mutex<Option<Child>>,
}

impl OfficeEngine {
    fn listener_command(&self) -> Command {
        let vars = base_vars(&self.cfg);
        let mut cmd = Command::new(expand(&self.cfg.listener_program, &vars));
        for arg in &self.cfg.listener_args {
            cmd.arg(expand(arg, &vars));
        }
        if !self.cfg.office_profile.trim().is_empty() {
            let profile = expand_tilde(&self.cfg.office_profile);
            cmd.arg(format!("-env:UserInstallation=file://{}", profile.display()));
        }
        for (k, v) in &self.cfg.env {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd
    }

    fn client_command(&self, task: &ConversionTask) -> (String, Command) {
        let mut vars = base_vars(&self.cfg);
        vars.push(("input", task.input.display().to_string()));
        vars.push(("output", task.output.display().to_string()));
        vars.push(("format", task.target_format.clone()));
        let program = expand(&self.cfg.client_program, &vars);
        let mut cmd = Command::new(&program);
        for arg in &self.cfg.client_args {
            cmd.arg(expand(arg, &vars));
        }
        for (k, v) in &self.cfg.env {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        (program, cmd)
    }

    fn task_timeout(&self) -> Option<Duration> {
        (self.cfg.task_timeout_seconds > 0).then(|| Duration::from_secs(self.cfg.task_timeout_seconds))
    }
}

impl Engine for OfficeEngine {
    fn start(&self) -> Result<()> {
        let mut slot = lock(&self.child);
        if let Some(child) = slot.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return Ok(());
            }
        }

        let mut cmd = self.listener_command();
        debug!("starting office listener: {:?}", cmd);
        let mut child = cmd.spawn().with_context(|| "spawning office listener")?;

        let addr = SocketAddr::from(([127, 0, 0, 1], self.cfg.office_port));
        let deadline = Instant::now() + Duration::from_secs(self.cfg.start_timeout_seconds);
        loop {
            match child.try_wait() {
                Ok(Some(status)) => bail!("office listener exited during startup: {status}"),
                Ok(None) => {}
                Err(e) => {
                    abandon(&mut child);
                    return Err(e).with_context(|| "polling office listener");
                }
            }
            if TcpStream::connect_timeout(&addr, PORT_PROBE_TIMEOUT).is_ok() {
                break;
            }
            if Instant::now() >= deadline {
                abandon(&mut child);
                bail!(
                    "office listener did not open port {} within {}s",
                    self.cfg.office_port,
                    self.cfg.start_timeout_seconds
                );
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        info!(pid = child.id(), port = self.cfg.office_port, "office listener ready");
        *slot = Some(child);
        Ok(())
    }

    fn is_running(&self) -> bool {
        lock(&self.child)
            .as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }

    fn execute(&self, task: &ConversionTask) -> Result<(), EngineError> {
        if !task.input.is_file() {
            return Err(EngineError::Fatal(format!(
                "input file not found: {}",
                task.input.display()
            )));
        }

        let (program, mut cmd) = self.client_command(task);
        debug!("office client: {:?}", cmd);
        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::Fatal(format!("spawning {program}: {e}")))?;

        let output = match self.task_timeout() {
            Some(timeout) => wait_with_timeout(&mut child, timeout)?,
            None => child
                .wait_with_output()
                .map_err(|e| EngineError::Transient(format!("waiting for {program}: {e}")))?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Transient(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        if !has_content(&task.output) {
            return Err(EngineError::Transient(format!(
                "engine produced no output at {}",
                task.output.display()
            )));
        }
        Ok(())
    }
}

impl Drop for OfficeEngine {
    fn drop(&mut self) {
        if let Some(mut child) = lock(&self.child).take() {
            abandon(&mut child);
        }
    }
}

fn abandon(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!(pid = child.id(), "kill: {e}");
    }
    if let Err(e) = child.wait() {
        warn!(pid = child.id(), "reaping office process failed: {e}");
    }
}

fn has_content(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.len() > 0)
}

fn base_vars(cfg: &config::Engine) -> Vec<(&'static str, String)> {
    vec![
        ("home", expand_tilde(&cfg.office_home).display().to_string()),
        ("port", cfg.office_port.to_string()),
        ("profile", expand_tilde(&cfg.office_profile).display().to_string()),
    ]
}

fn expand(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<Output, EngineError> {
    // Drain pipes while waiting so a chatty client can't deadlock on a full
    // stdout/stderr buffer.
    let stdout_reader = child.stdout.take();
    let stderr_reader = child.stderr.take();

    let stdout_thread = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut out) = stdout_reader {
            let _ = out.read_to_end(&mut buf);
        }
        buf
    });
    let stderr_thread = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut err) = stderr_reader {
            let _ = err.read_to_end(&mut buf);
        }
        buf
    });

    let start = Instant::now();
    let (status, timed_out) = loop {
        let polled = child
            .try_wait()
            .map_err(|e| EngineError::Transient(format!("try_wait: {e}")))?;
        if let Some(status) = polled {
            break (status, false);
        }
        if start.elapsed() > timeout {
            warn!("office client timed out after {:?}", timeout);
            let _ = child.kill();
            let status = child
                .wait()
                .map_err(|e| EngineError::Transient(format!("wait after kill: {e}")))?;
            break (status, true);
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    let stdout = stdout_thread
        .join()
        .map_err(|_| EngineError::Transient("stdout reader thread panicked".into()))?;
    let stderr = stderr_thread
        .join()
        .map_err(|_| EngineError::Transient("stderr reader thread panicked".into()))?;

    if timed_out {
        return Err(EngineError::Transient(format!(
            "office client exceeded timeout ({:?}); stderr: {}",
            timeout,
            String::from_utf8_lossy(&stderr).trim()
        )));
    }
    Ok(Output {
        status,
        stdout,
        stderr,
    })
}
