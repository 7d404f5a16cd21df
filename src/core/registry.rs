//! Session registry
//!
//! Owns every live session, keyed by an identifier that is issued once and
//! never reused. Sessions leave the registry on explicit removal or when
//! their process exits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::pty::TerminalBackend;
use super::session::{Session, SessionId, SessionOptions};
use crate::config::SessionConfig;
use crate::error::{BridgeError, Result};
use crate::events::EventEmitter;

type SessionMap = Mutex<HashMap<SessionId, Arc<Session>>>;

/// Registry of live sessions
pub struct SessionRegistry {
    sessions: Arc<SessionMap>,
    next_id: AtomicU64,
    backend: Arc<dyn TerminalBackend>,
    events: EventEmitter,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn TerminalBackend>, events: EventEmitter) -> Self {
        Self::with_config(backend, events, &SessionConfig::default())
    }

    pub fn with_config(
        backend: Arc<dyn TerminalBackend>,
        events: EventEmitter,
        config: &SessionConfig,
    ) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            backend,
            events,
            config: config.clone(),
        }
    }

    /// Create a new session and start reading its output
    pub fn create(&self, options: &SessionOptions) -> Result<SessionId> {
        let id = SessionId::from_sequence(self.next_id.fetch_add(1, Ordering::SeqCst));

        let session = Arc::new(Session::spawn(
            id.clone(),
            options,
            self.backend.as_ref(),
            &self.config,
        )?);

        // Insert before the reader starts so a process that exits at once
        // is still removed by its exit hook.
        self.sessions.lock().insert(id.clone(), session.clone());

        let sessions = Arc::downgrade(&self.sessions);
        let on_exit = Box::new(move |id: &SessionId| remove_finished(&sessions, id));
        if let Err(e) = session.start(self.events.clone(), on_exit) {
            self.remove(&id);
            return Err(e);
        }

        info!(
            "Created {} ({} in {})",
            id,
            options.argv.join(" "),
            options.cwd.display()
        );
        Ok(id)
    }

    /// Look up a live session
    pub fn get(&self, id: &SessionId) -> Result<Arc<Session>> {
        self.sessions
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::SessionNotFound(id.clone()))
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.lock().contains_key(id)
    }

    /// Remove a session, terminating its process. Unknown ids are ignored.
    pub fn remove(&self, id: &SessionId) {
        let removed = self.sessions.lock().remove(id);
        match removed {
            Some(session) => {
                info!("Removed {}", id);
                // Dropped outside the map lock: dropping terminates the process
                drop(session);
            }
            None => debug!("remove: {} not registered", id),
        }
    }

    /// Live session ids in creation order
    pub fn list(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.lock().keys().cloned().collect();
        ids.sort_by_key(|id| id.sequence());
        ids
    }

    /// Get session count
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every session
    pub fn clear(&self) {
        let drained: Vec<Arc<Session>> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        if !drained.is_empty() {
            info!("Closing {} session(s)", drained.len());
        }
    }
}

fn remove_finished(sessions: &Weak<SessionMap>, id: &SessionId) {
    let Some(sessions) = sessions.upgrade() else {
        return;
    };
    let removed = sessions.lock().remove(id);
    if removed.is_some() {
        debug!("{} exited, removed from registry", id);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::core::loopback::LoopbackBackend;
    use crate::events::Event;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(LoopbackBackend::new()), EventEmitter::new())
    }

    #[test]
    fn test_create_get_remove() {
        let registry = registry();
        let id = registry.create(&SessionOptions::default()).unwrap();
        assert_eq!(id.as_str(), "session-1");
        assert!(registry.get(&id).unwrap().is_running());

        registry.remove(&id);
        assert!(registry.get(&id).unwrap_err().is_not_found());
        // Idempotent
        registry.remove(&id);
        registry.remove(&SessionId::from("session-99"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_ids_are_never_reused() {
        let registry = registry();
        let mut issued = HashSet::new();
        for round in 0..5 {
            let a = registry.create(&SessionOptions::default()).unwrap();
            let b = registry.create(&SessionOptions::default()).unwrap();
            assert!(issued.insert(a.clone()));
            assert!(issued.insert(b.clone()));
            if round % 2 == 0 {
                registry.remove(&a);
            } else {
                registry.remove(&b);
            }
            let live = registry.list();
            let unique: HashSet<_> = live.iter().collect();
            assert_eq!(unique.len(), live.len());
        }
        assert_eq!(registry.len(), 5);
        assert_eq!(issued.len(), 10);
    }

    #[test]
    fn test_concurrent_creates_are_distinct() {
        let registry = Arc::new(registry());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    (0..4)
                        .map(|_| registry.create(&SessionOptions::default()).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(ids.insert(id));
            }
        }
        assert_eq!(ids.len(), 32);
        assert_eq!(registry.len(), 32);

        let listed = registry.list();
        let sequences: Vec<u64> = listed.iter().filter_map(SessionId::sequence).collect();
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_failed_start_is_resource_error() {
        let registry = registry();
        let options = SessionOptions {
            argv: Vec::new(),
            ..SessionOptions::default()
        };
        let err = registry.create(&options).unwrap_err();
        assert_eq!(err.code(), "RESOURCE");
        assert!(registry.is_empty());

        // The failed attempt still consumed its id
        let id = registry.create(&SessionOptions::default()).unwrap();
        assert_eq!(id.as_str(), "session-2");
    }

    #[test]
    fn test_exited_session_leaves_registry() {
        let events = EventEmitter::new();
        let rx = events.subscribe();
        let registry = SessionRegistry::new(Arc::new(LoopbackBackend::new()), events);

        let id = registry.create(&SessionOptions::default()).unwrap();
        let session = registry.get(&id).unwrap();
        session.finish().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.contains(&id) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!registry.contains(&id));

        let finished = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            finished,
            Event::SessionFinished {
                session: id,
                exit_code: Some(0)
            }
        );
    }

    #[test]
    fn test_clear() {
        let registry = registry();
        registry.create(&SessionOptions::default()).unwrap();
        registry.create(&SessionOptions::default()).unwrap();
        registry.clear();
        assert!(registry.list().is_empty());
    }
}
