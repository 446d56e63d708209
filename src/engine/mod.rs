pub mod office;
pub mod queue;
pub mod types;

use anyhow::Result;

pub use crate::error::EngineError;
pub use types::{ConversionTask, EngineDiag, EngineState, EngineStatus};

pub trait Engine: Send + Sync {
    fn start(&self) -> Result<()>;
    fn is_running(&self) -> bool;
    fn execute(&self, task: &ConversionTask) -> Result<(), EngineError>;
}

pub trait EngineFactory: Send + Sync {
    fn build(&self) -> Result<Box<dyn Engine>>;
    /// Kill engine processes left behind by earlier instances.
    fn kill_strays(&self) -> Result<()>;
}
