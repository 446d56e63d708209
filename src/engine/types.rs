use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionTask {
    pub input: PathBuf,
    pub output: PathBuf,
    pub source_format: String,
    pub target_format: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Crashed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub restarts: u32,
    #[serde(default)]
    pub started_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineDiag {
    pub office_home: String,
    pub office_home_exists: bool,
    pub listener_program: String,
    pub listener_found: bool,
    pub client_program: String,
    pub client_found: bool,
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}
