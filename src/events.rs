//! Event emitter
//!
//! One-directional, best-effort notification channel. Producers (session
//! reader threads, training workers) push [`Event`]s; whichever subscriber is
//! attached at emission time receives them on its channel. Nothing is queued
//! for a subscriber that attaches later.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

use crate::core::session::SessionId;

/// Asynchronous notifications
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Event {
    /// The session produced output
    #[serde(rename_all = "camelCase")]
    SessionOutput { session: SessionId, bytes: usize },
    /// The terminal title changed
    #[serde(rename_all = "camelCase")]
    SessionTitle { session: SessionId, title: String },
    /// The terminal rang the bell
    #[serde(rename_all = "camelCase")]
    SessionBell { session: SessionId },
    /// The session's process exited or was closed
    #[serde(rename_all = "camelCase")]
    SessionFinished {
        session: SessionId,
        exit_code: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    TrainingProgress { epoch: u32, progress: f32 },
    #[serde(rename_all = "camelCase")]
    TrainingFinished {
        epochs_completed: u32,
        cancelled: bool,
    },
    #[serde(rename_all = "camelCase")]
    TrainingFailed { epoch: u32, message: String },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::SessionOutput { .. } => "sessionOutput",
            Event::SessionTitle { .. } => "sessionTitle",
            Event::SessionBell { .. } => "sessionBell",
            Event::SessionFinished { .. } => "sessionFinished",
            Event::TrainingProgress { .. } => "trainingProgress",
            Event::TrainingFinished { .. } => "trainingFinished",
            Event::TrainingFailed { .. } => "trainingFailed",
        }
    }
}

/// Handle used to emit events and manage the single subscriber.
///
/// Cloning is cheap; all clones share the same subscriber slot.
#[derive(Clone, Default)]
pub struct EventEmitter {
    subscriber: Arc<Mutex<Option<Sender<Event>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new subscriber, replacing the current one.
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        *self.subscriber.lock() = Some(tx);
        rx
    }

    pub fn unsubscribe(&self) {
        self.subscriber.lock().take();
    }

    pub fn has_subscriber(&self) -> bool {
        self.subscriber.lock().is_some()
    }

    /// Deliver an event to the current subscriber, if any.
    ///
    /// Never blocks on the consumer. Returns whether the event was handed
    /// to a live subscriber channel.
    pub fn emit(&self, event: Event) -> bool {
        let mut slot = self.subscriber.lock();
        let Some(tx) = slot.as_ref() else {
            trace!("dropping {} event: no subscriber", event.name());
            return false;
        };
        match tx.send(event) {
            Ok(()) => true,
            Err(mpsc::SendError(event)) => {
                trace!("dropping {} event: subscriber went away", event.name());
                *slot = None;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(epoch: u32) -> Event {
        Event::TrainingProgress {
            epoch,
            progress: 0.0,
        }
    }

    #[test]
    fn test_emit_without_subscriber_is_dropped() {
        let emitter = EventEmitter::new();
        assert!(!emitter.emit(progress(0)));

        let rx = emitter.subscribe();
        assert!(emitter.emit(progress(1)));
        assert_eq!(rx.try_recv().unwrap(), progress(1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_subscribe_replaces_previous() {
        let emitter = EventEmitter::new();
        let first = emitter.subscribe();
        let second = emitter.clone().subscribe();

        assert!(emitter.emit(progress(2)));
        assert!(first.try_recv().is_err());
        assert_eq!(second.try_recv().unwrap(), progress(2));
    }

    #[test]
    fn test_dead_subscriber_is_detached() {
        let emitter = EventEmitter::new();
        drop(emitter.subscribe());
        assert!(emitter.has_subscriber());
        assert!(!emitter.emit(progress(3)));
        assert!(!emitter.has_subscriber());

        let rx = emitter.subscribe();
        emitter.unsubscribe();
        assert!(!emitter.emit(progress(4)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_serialized_shape() {
        let event = Event::SessionFinished {
            session: SessionId::from("session-3"),
            exit_code: Some(0),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "sessionFinished");
        assert_eq!(json["session"], "session-3");
        assert_eq!(json["exitCode"], 0);
        assert_eq!(event.name(), "sessionFinished");
    }
}
