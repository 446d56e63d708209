use super::{ConversionTask, Engine, EngineError};
use crate::util::lock;
use anyhow::{Context, Result};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, error};

struct Submission {
    engine: Arc<dyn Engine>,
    task: ConversionTask,
    reply: SyncSender<Result<(), EngineError>>,
}

pub struct TaskQueue {
    tx: Sender<Submission>,
}

impl TaskQueue {
    pub fn new(slots: usize) -> Result<Self> {
        let slots = slots.max(1);
        let (tx, rx) = mpsc::channel::<Submission>();
        let rx = Arc::new(Mutex::new(rx));
        for i in 0..slots {
            let rx = Arc::clone(&rx);
            thread::Builder::new()
                .name(format!("engine-task-{i}"))
                .spawn(move || drain(&rx))
                .with_context(|| format!("spawning engine executor {i}"))?;
        }
        debug!(slots, "engine task queue ready");
        Ok(Self { tx })
    }

    pub fn submit(&self, engine: Arc<dyn Engine>, task: ConversionTask) -> Result<(), EngineError> {
        let (reply, outcome) = mpsc::sync_channel(1);
        self.tx
            .send(Submission {
                engine,
                task,
                reply,
            })
            .map_err(|_| EngineError::Transient("engine task queue is closed".into()))?;
        outcome
            .recv()
            .map_err(|_| EngineError::Transient("engine executor dropped the task".into()))?
    }
}

fn drain(rx: &Mutex<Receiver<Submission>>) {
    loop {
        let next = lock(rx).recv();
        let Ok(submission) = next else {
            debug!("engine task queue closed; executor exiting");
            return;
        };
        let Submission { engine, task, reply } = submission;
        let outcome = catch_unwind(AssertUnwindSafe(|| engine.execute(&task))).unwrap_or_else(|_| {
            error!("engine panicked converting {}", task.input.display());
            Err(EngineError::Fatal("conversion engine panicked".into()))
        });
        // The submitter may have gone away; nothing to do about it here.
        let _ = reply.send(outcome);
    }
}
