//! Training runs
//!
//! At most one run is active at a time, on its own worker thread. Each epoch
//! is simulated by a forward probe through the loaded model followed by the
//! configured epoch interval. Cancellation is cooperative: the flag is
//! checked at every epoch boundary, so stopping takes effect within one
//! epoch. Progress and the outcome are reported through the event emitter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::pipeline::{run_with_timeout, InferencePipeline, ModelHandle};
use crate::error::{BridgeError, Result};
use crate::events::{Event, EventEmitter};

/// Parameters of a run
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingConfig {
    pub epochs: u32,
    pub learning_rate: f32,
    pub batch_size: u32,
    /// Fraction of samples held out, in `[0, 1)`
    pub validation_split: f32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            learning_rate: 0.001,
            batch_size: 32,
            validation_split: 0.2,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(BridgeError::InvalidArgument("epochs must be positive".to_string()));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(BridgeError::InvalidArgument(format!(
                "learning rate {} must be positive",
                self.learning_rate
            )));
        }
        if self.batch_size == 0 {
            return Err(BridgeError::InvalidArgument("batch size must be positive".to_string()));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(BridgeError::InvalidArgument(format!(
                "validation split {} outside [0, 1)",
                self.validation_split
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingState {
    Idle,
    Running,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOutcome {
    pub epochs_completed: u32,
    pub cancelled: bool,
    pub error: Option<String>,
}

struct TrainingRun {
    cancel: Arc<AtomicBool>,
    thread: JoinHandle<TrainingOutcome>,
}

/// Starts, stops and tracks training runs
pub struct Trainer {
    pipeline: Arc<InferencePipeline>,
    events: EventEmitter,
    epoch_interval: Duration,
    probe_timeout: Duration,
    active: Mutex<Option<TrainingRun>>,
}

impl Trainer {
    pub fn new(
        pipeline: Arc<InferencePipeline>,
        events: EventEmitter,
        epoch_interval: Duration,
    ) -> Self {
        Self {
            pipeline,
            events,
            epoch_interval,
            probe_timeout: Duration::from_secs(5),
            active: Mutex::new(None),
        }
    }

    /// Start a run in the background
    pub fn start(&self, config: TrainingConfig) -> Result<()> {
        config.validate()?;
        let handle = self.pipeline.handle().ok_or(BridgeError::NotLoaded)?;

        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|run| !run.thread.is_finished()) {
            return Err(BridgeError::Busy);
        }
        // Reap a run that already ended
        if let Some(run) = active.take() {
            let _ = run.thread.join();
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            config: config.clone(),
            handle,
            events: self.events.clone(),
            cancel: cancel.clone(),
            epoch_interval: self.epoch_interval,
            probe_timeout: self.probe_timeout,
        };
        let thread = thread::Builder::new()
            .name("training".to_string())
            .spawn(move || worker.run())
            .map_err(|e| BridgeError::Resource(format!("training worker: {}", e)))?;

        info!(
            "Training started: {} epochs, lr {}, batch {}",
            config.epochs, config.learning_rate, config.batch_size
        );
        *active = Some(TrainingRun { cancel, thread });
        Ok(())
    }

    /// Ask the active run to stop at its next epoch boundary.
    /// Returns whether a running run was signalled.
    pub fn stop(&self) -> bool {
        match self.active.lock().as_ref() {
            Some(run) if !run.thread.is_finished() => {
                run.cancel.store(true, Ordering::SeqCst);
                info!("Training stop requested");
                true
            }
            _ => false,
        }
    }

    pub fn state(&self) -> TrainingState {
        match self.active.lock().as_ref() {
            Some(run) if !run.thread.is_finished() => TrainingState::Running,
            _ => TrainingState::Idle,
        }
    }

    /// Wait for the current run to end and return its outcome
    pub fn wait(&self) -> Option<TrainingOutcome> {
        let run = self.active.lock().take()?;
        match run.thread.join() {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                warn!("Training worker panicked");
                None
            }
        }
    }
}

impl Drop for Trainer {
    fn drop(&mut self) {
        if let Some(run) = self.active.get_mut().as_ref() {
            run.cancel.store(true, Ordering::SeqCst);
        }
    }
}

/// State owned by the worker thread
struct Worker {
    config: TrainingConfig,
    handle: Arc<ModelHandle>,
    events: EventEmitter,
    cancel: Arc<AtomicBool>,
    epoch_interval: Duration,
    probe_timeout: Duration,
}

impl Worker {
    fn run(self) -> TrainingOutcome {
        let epochs = self.config.epochs;
        let probe = vec![0.0f32; self.handle.input_width];
        let mut completed = 0;

        for epoch in 0..epochs {
            if self.cancel.load(Ordering::SeqCst) {
                break;
            }

            self.events.emit(Event::TrainingProgress {
                epoch,
                progress: epoch as f32 / epochs as f32 * 100.0,
            });

            if let Err(e) = run_with_timeout(self.handle.clone(), &probe, self.probe_timeout) {
                warn!("Training failed at epoch {}: {}", epoch, e);
                self.events.emit(Event::TrainingFailed {
                    epoch,
                    message: e.to_string(),
                });
                return TrainingOutcome {
                    epochs_completed: completed,
                    cancelled: false,
                    error: Some(e.to_string()),
                };
            }
            thread::sleep(self.epoch_interval);
            completed += 1;
        }

        let cancelled = completed < epochs;
        info!(
            "Training {} after {} epoch(s)",
            if cancelled { "cancelled" } else { "finished" },
            completed
        );
        self.events.emit(Event::TrainingFinished {
            epochs_completed: completed,
            cancelled,
        });
        TrainingOutcome {
            epochs_completed: completed,
            cancelled,
            error: None,
        }
    }
}
