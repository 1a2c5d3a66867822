//! Session registry and connected-session live view
//!
//! The registry owns every [`TerminalSession`] in the process, keyed by
//! connection id. Lookup is create-on-first-use and the returned `Arc` is
//! the same object for the whole process lifetime, so callers can cache
//! it. The [`LiveView`] is a synchronously-updated roster of connected
//! sessions; connection lists render from it without polling.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use super::session::{ConnectionId, TerminalSession, TransportFactory};
use super::ssh::SshTransport;
use super::transport::{ConnectProfile, Result, Transport};
use crate::config::Settings;

/// One connected session as shown in connection lists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TerminalConnectionSummary {
    pub connection_id: ConnectionId,
    pub display_name: String,
    /// Unix milliseconds at the moment the session entered `Connected`
    pub connected_at: u64,
}

/// Roster of currently connected sessions.
///
/// Updated synchronously from session state transitions: an entry appears
/// before `connect` returns and is gone by the time a disconnect settles.
pub struct LiveView {
    connected: Mutex<HashMap<ConnectionId, TerminalConnectionSummary>>,
    watchers: Mutex<Vec<Sender<HashMap<ConnectionId, TerminalConnectionSummary>>>>,
}

impl LiveView {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
        })
    }

    /// Current roster, keyed by connection id.
    pub fn snapshot(&self) -> HashMap<ConnectionId, TerminalConnectionSummary> {
        lock(&self.connected).clone()
    }

    /// Receive the full roster after every change.
    pub fn subscribe(&self) -> Receiver<HashMap<ConnectionId, TerminalConnectionSummary>> {
        let (tx, rx) = mpsc::channel();
        lock(&self.watchers).push(tx);
        rx
    }

    pub(crate) fn publish(&self, connection_id: ConnectionId, display_name: String) {
        let connected_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let roster = {
            let mut connected = lock(&self.connected);
            connected.insert(
                connection_id,
                TerminalConnectionSummary {
                    connection_id,
                    display_name,
                    connected_at,
                },
            );
            connected.clone()
        };
        self.broadcast(roster);
    }

    pub(crate) fn remove(&self, connection_id: ConnectionId) {
        let roster = {
            let mut connected = lock(&self.connected);
            if connected.remove(&connection_id).is_none() {
                return;
            }
            connected.clone()
        };
        self.broadcast(roster);
    }

    fn broadcast(&self, roster: HashMap<ConnectionId, TerminalConnectionSummary>) {
        lock(&self.watchers).retain(|tx| tx.send(roster.clone()).is_ok());
    }
}

/// Owner of all terminal sessions in the process.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<ConnectionId, Arc<TerminalSession>>>,
    live: Arc<LiveView>,
    factory: Arc<TransportFactory>,
    settings: Settings,
}

impl SessionRegistry {
    /// Registry backed by real SSH transports.
    pub fn new(settings: Settings) -> Self {
        let term = settings.term.clone();
        Self::with_factory(
            settings,
            Arc::new(move || Box::new(SshTransport::new(term.clone())) as Box<dyn Transport>),
        )
    }

    /// Registry with a custom transport factory. Tests use this to wire in
    /// scripted transports.
    pub fn with_factory(settings: Settings, factory: Arc<TransportFactory>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            live: LiveView::new(),
            factory,
            settings,
        }
    }

    /// The session for this id, created on first use.
    pub fn get_or_create(&self, id: ConnectionId) -> Arc<TerminalSession> {
        let mut sessions = lock(&self.sessions);
        let session = sessions.entry(id).or_insert_with(|| {
            info!("registering session {id}");
            TerminalSession::new(
                id,
                self.live.clone(),
                self.factory.clone(),
                self.settings.clone(),
            )
        });
        Arc::clone(session)
    }

    /// Connect the session for `id` unless it already is connected.
    /// See [`TerminalSession::connect`] for the return contract.
    pub fn connect_if_needed(&self, id: ConnectionId, profile: &ConnectProfile) -> Result<bool> {
        self.get_or_create(id).connect(profile)
    }

    /// Disconnect one session if it exists. No-op for unknown ids.
    pub fn disconnect(&self, id: ConnectionId) {
        let session = lock(&self.sessions).get(&id).cloned();
        if let Some(session) = session {
            session.disconnect();
        }
    }

    /// Disconnect every session. Used on app shutdown.
    pub fn disconnect_all(&self) {
        let sessions: Vec<_> = lock(&self.sessions).values().cloned().collect();
        for session in sessions {
            session.disconnect();
        }
    }

    pub fn live_view(&self) -> Arc<LiveView> {
        self.live.clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::core::session::mock::{mock_registry, profile, MockBehavior};
    use crate::core::session::SessionState;

    #[test]
    fn get_or_create_returns_same_session() {
        let (registry, _, _) = mock_registry(MockBehavior::default());
        let a = registry.get_or_create(ConnectionId(1));
        let b = registry.get_or_create(ConnectionId(1));
        assert!(Arc::ptr_eq(&a, &b));

        let other = registry.get_or_create(ConnectionId(2));
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn live_view_publishes_and_retracts() {
        let (registry, _, _) = mock_registry(MockBehavior::default());
        let live = registry.live_view();
        let updates = live.subscribe();
        let id = ConnectionId(3);

        registry.connect_if_needed(id, &profile("staging")).unwrap();

        let roster = updates.recv_timeout(Duration::from_secs(1)).unwrap();
        let summary = &roster[&id];
        assert_eq!(summary.display_name, "staging");
        assert!(summary.connected_at > 0);

        registry.disconnect(id);
        let roster = updates.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(roster.is_empty());
        assert!(live.snapshot().is_empty());
    }

    #[test]
    fn disconnect_unknown_id_is_noop() {
        let (registry, _, created) = mock_registry(MockBehavior::default());
        registry.disconnect(ConnectionId(99));
        assert_eq!(created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn disconnect_all_settles_every_session() {
        let (registry, _, _) = mock_registry(MockBehavior::default());
        for raw in 1..=3 {
            registry
                .connect_if_needed(ConnectionId(raw), &profile("box"))
                .unwrap();
        }
        assert_eq!(registry.live_view().snapshot().len(), 3);

        registry.disconnect_all();
        assert!(registry.live_view().snapshot().is_empty());
        for raw in 1..=3 {
            let session = registry.get_or_create(ConnectionId(raw));
            assert_eq!(session.state(), SessionState::Disconnected);
        }
    }

    #[test]
    fn concurrent_connects_open_one_transport() {
        let behavior = MockBehavior {
            connect_delay: Duration::from_millis(100),
            ..MockBehavior::default()
        };
        let (registry, _, created) = mock_registry(behavior);
        let registry = Arc::new(registry);
        let id = ConnectionId(7);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(thread::spawn(move || {
                registry.connect_if_needed(id, &profile("shared")).unwrap()
            }));
        }
        let fresh: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(fresh.iter().filter(|&&f| f).count(), 1);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(
            registry.get_or_create(id).state(),
            SessionState::Connected
        );
    }
}
