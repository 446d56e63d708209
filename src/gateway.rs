use crate::config::Config;
use crate::engine::queue::TaskQueue;
use crate::engine::{ConversionTask, EngineError};
use crate::error::GatewayError;
use crate::retry::{CircuitBreaker, RetryPolicy};
use crate::supervisor::{Acquire, EngineSupervisor};
use crate::util::lock;
use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{error, info, warn};

pub struct ConversionGateway {
    supervisor: Arc<EngineSupervisor>,
    queue: TaskQueue,
    policy: RetryPolicy,
    breaker: Mutex<CircuitBreaker>,
}

impl ConversionGateway {
    pub fn new(
        supervisor: Arc<EngineSupervisor>,
        queue: TaskQueue,
        policy: RetryPolicy,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            supervisor,
            queue,
            policy,
            breaker: Mutex::new(breaker),
        }
    }

    pub fn from_config(supervisor: Arc<EngineSupervisor>, cfg: &Config) -> Result<Self> {
        Ok(Self::new(
            supervisor,
            TaskQueue::new(cfg.engine.task_slots)?,
            RetryPolicy::from_config(&cfg.retry),
            CircuitBreaker::from_config(&cfg.retry),
        ))
    }

    pub fn supervisor(&self) -> &EngineSupervisor {
        &self.supervisor
    }

    pub fn convert(&self, task: &ConversionTask) -> Result<(), GatewayError> {
        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            if !lock(&self.breaker).try_acquire(Instant::now()) {
                warn!("conversion engine circuit open; refusing {}", task.input.display());
                return Err(GatewayError::CircuitOpen);
            }

            let outcome = match self.supervisor.acquire() {
                Acquire::Ready(engine) => {
                    info!(
                        attempt,
                        "handling conversion task {} -> {}",
                        task.input.display(),
                        task.output.display()
                    );
                    self.queue.submit(engine, task.clone())
                }
                Acquire::Unavailable(reason) => Err(EngineError::Transient(reason)),
            };

            match outcome {
                Ok(()) => {
                    lock(&self.breaker).record_success();
                    info!(attempt, "handled conversion task {}", task.input.display());
                    return Ok(());
                }
                Err(EngineError::Fatal(msg)) => {
                    error!("conversion of {} failed: {msg}", task.input.display());
                    return Err(GatewayError::Fatal(msg));
                }
                Err(EngineError::Transient(msg)) => {
                    lock(&self.breaker).record_failure(Instant::now());
                    warn!(attempt, "conversion attempt failed: {msg}");
                    if !self.policy.allows_retry(attempt) {
                        return Err(GatewayError::RetriesExhausted {
                            attempts: attempt,
                            last: msg,
                        });
                    }
                    std::thread::sleep(self.policy.delay_for_attempt(attempt));
                }
            }
        }
    }
}
