use crate::engine::{Engine, EngineFactory, EngineState, EngineStatus};
use crate::retry::RetryPolicy;
use crate::util::{lock, now_rfc3339};
use anyhow::Result;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

pub enum Acquire {
    Ready(Arc<dyn Engine>),
    Unavailable(String),
}

struct Slot {
    state: EngineState,
    engine: Option<Arc<dyn Engine>>,
    restarts: u32,
    started_at: Option<String>,
}

pub struct EngineSupervisor {
    factory: Box<dyn EngineFactory>,
    backoff: RetryPolicy,
    slot: Mutex<Slot>,
}

impl EngineSupervisor {
    pub fn new(factory: Box<dyn EngineFactory>, backoff: RetryPolicy) -> Self {
        Self {
            factory,
            backoff,
            slot: Mutex::new(Slot {
                state: EngineState::Stopped,
                engine: None,
                restarts: 0,
                started_at: None,
            }),
        }
    }

    /// Block until the engine is running. Never gives up.
    pub fn start(&self) {
        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            let outcome = {
                let mut slot = lock(&self.slot);
                self.bring_up(&mut slot)
            };
            match outcome {
                Ok(()) => {
                    info!(attempt, "conversion engine running");
                    return;
                }
                Err(err) => {
                    error!(attempt, "conversion engine failed to start: {err:#}");
                    self.kill_strays();
                    std::thread::sleep(self.backoff.delay_for_attempt(attempt));
                }
            }
        }
    }

    pub fn acquire(&self) -> Acquire {
        let mut slot = lock(&self.slot);

        if slot.state == EngineState::Running {
            match &slot.engine {
                Some(engine) if engine.is_running() => return Acquire::Ready(Arc::clone(engine)),
                _ => {
                    warn!("conversion engine is no longer running");
                    slot.state = EngineState::Crashed;
                    slot.engine = None;
                }
            }
        }

        match slot.state {
            EngineState::Stopped => Acquire::Unavailable("conversion engine has not been started".into()),
            EngineState::Starting => Acquire::Unavailable("conversion engine is starting".into()),
            EngineState::Running => match &slot.engine {
                Some(engine) => Acquire::Ready(Arc::clone(engine)),
                None => Acquire::Unavailable("conversion engine handle missing".into()),
            },
            EngineState::Crashed => {
                self.kill_strays();
                slot.restarts = slot.restarts.saturating_add(1);
                match self.bring_up(&mut slot) {
                    Ok(()) => {
                        info!(restarts = slot.restarts, "conversion engine recovered");
                        match &slot.engine {
                            Some(engine) => Acquire::Ready(Arc::clone(engine)),
                            None => Acquire::Unavailable("conversion engine handle missing".into()),
                        }
                    }
                    Err(err) => {
                        error!("conversion engine recovery failed: {err:#}");
                        Acquire::Unavailable(format!("conversion engine unavailable: {err:#}"))
                    }
                }
            }
        }
    }

    pub fn status(&self) -> EngineStatus {
        let slot = lock(&self.slot);
        EngineStatus {
            state: slot.state,
            restarts: slot.restarts,
            started_at: slot.started_at.clone(),
        }
    }

    fn bring_up(&self, slot: &mut Slot) -> Result<()> {
        slot.state = EngineState::Starting;
        slot.engine = None;
        let engine: Arc<dyn Engine> = match self.factory.build() {
            Ok(engine) => Arc::from(engine),
            Err(err) => {
                slot.state = EngineState::Crashed;
                return Err(err);
            }
        };
        if let Err(err) = engine.start() {
            slot.state = EngineState::Crashed;
            return Err(err);
        }
        slot.engine = Some(engine);
        slot.state = EngineState::Running;
        slot.started_at = Some(now_rfc3339());
        Ok(())
    }

    fn kill_strays(&self) {
        if let Err(err) = self.factory.kill_strays() {
            warn!("killing stray engine processes failed: {err:#}");
        }
    }
}
