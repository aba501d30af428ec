//! The session manager owns every open port handle and the session/lock state
//! machine around it. All hardware access funnels through here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::serial::driver::{PortDriver, PortOpener};
use crate::serial::settings::PortSettings;

/// How many inbound payloads a subscriber channel buffers before sends start
/// dropping for that subscriber.
pub const SUBSCRIBER_CAPACITY: usize = 100;

/// Identifies one subscriber channel on a session or reader.
pub type SubscriberId = u64;

/// Session lifecycle. Transitions are one-way: open, closing, closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum SessionState {
    /// The handle is live and operations are allowed.
    Open = 0,
    /// Teardown has begun; hardware-mutating operations fail.
    Closing = 1,
    /// The handle is released and the session unindexed.
    Closed = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Open,
            1 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Monotonic transfer counters plus activity wall-clocks for one session.
///
/// Counters are atomics so I/O paths can bump them with relaxed stores without
/// holding the port guard any longer than the I/O call itself.
#[derive(Debug)]
pub struct Statistics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    errors: AtomicU64,
    opened_at: DateTime<Utc>,
    last_activity_ms: AtomicI64,
}

impl Statistics {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            opened_at: now,
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A point-in-time copy of the counters.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            opened_at: self.opened_at,
            last_activity: Utc
                .timestamp_millis_opt(self.last_activity_ms.load(Ordering::Relaxed))
                .single()
                .unwrap_or(self.opened_at),
        }
    }
}

/// Serializable copy of [`Statistics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    /// Bytes successfully written to the port.
    pub bytes_sent: u64,
    /// Bytes read from the port.
    pub bytes_received: u64,
    /// Failed driver operations.
    pub errors: u64,
    /// When the session was created.
    pub opened_at: DateTime<Utc>,
    /// Last successful read or write.
    pub last_activity: DateTime<Utc>,
}

/// One open port coupled to its owner: a unique id, a client identity, the OS
/// handle, statistics, and the set of inbound-byte subscribers.
///
/// The handle is owned exclusively; the per-session port guard serializes
/// read, write, configure and flush so they never race at the driver. The
/// subscriber list lives under its own guard so broadcasting inbound bytes
/// does not stall I/O.
pub struct Session {
    id: Uuid,
    port_name: String,
    client_id: String,
    exclusive: bool,
    settings: Mutex<PortSettings>,
    stats: Statistics,
    state: AtomicU8,
    port: Mutex<Box<dyn PortDriver>>,
    subscribers: RwLock<Vec<(SubscriberId, mpsc::Sender<Vec<u8>>)>>,
    next_subscriber: AtomicU64,
}

impl Session {
    fn new(
        port_name: &str,
        client_id: &str,
        exclusive: bool,
        settings: PortSettings,
        driver: Box<dyn PortDriver>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            port_name: port_name.to_string(),
            client_id: client_id.to_string(),
            exclusive,
            settings: Mutex::new(settings),
            stats: Statistics::new(),
            state: AtomicU8::new(SessionState::Open as u8),
            port: Mutex::new(driver),
            subscribers: RwLock::new(Vec::new()),
            next_subscriber: AtomicU64::new(0),
        }
    }

    /// The session's unique id, stable for its whole life.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The platform port name this session owns.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// The caller-supplied client identity.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Whether this session blocks all other opens of the port.
    pub fn exclusive(&self) -> bool {
        self.exclusive
    }

    /// The session's lifecycle state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// The settings currently applied to the port.
    pub fn settings(&self) -> PortSettings {
        self.settings.lock().expect("lock poisoned").clone()
    }

    /// A point-in-time copy of the transfer statistics.
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    /// How many inbound-byte subscribers are attached.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().expect("lock poisoned").len()
    }

    fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    fn transition(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Fan a freshly read slice out to every subscriber.
    ///
    /// The list is snapshotted under a short read guard and the sends happen
    /// outside it, so subscribe/unsubscribe never wait on a broadcast.
    fn broadcast(&self, data: &[u8]) {
        let subscribers: Vec<mpsc::Sender<Vec<u8>>> = self
            .subscribers
            .read()
            .expect("lock poisoned")
            .iter()
            .map(|(_, tx)| tx.clone())
            .collect();

        for tx in subscribers {
            // Full or closed: drop for that subscriber, never block the line.
            let _ = tx.try_send(data.to_vec());
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("port_name", &self.port_name)
            .field("client_id", &self.client_id)
            .field("exclusive", &self.exclusive)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Default)]
struct Tables {
    by_name: HashMap<String, Arc<Session>>,
    by_id: HashMap<Uuid, Arc<Session>>,
}

/// Port-name and session-id indexes over live sessions, plus the operations
/// that act on them.
///
/// Locking discipline: the table guard is held only for map operations (and
/// the close path); hardware calls happen under the per-session port guard
/// after the table guard is released.
pub struct SessionManager {
    tables: RwLock<Tables>,
    opener: Box<dyn PortOpener>,
    allow_shared_access: bool,
    default_settings: PortSettings,
}

impl SessionManager {
    /// A manager that opens ports through the given backend.
    pub fn new(
        opener: Box<dyn PortOpener>,
        allow_shared_access: bool,
        default_settings: PortSettings,
    ) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            opener,
            allow_shared_access,
            default_settings,
        }
    }

    /// The settings applied when a caller does not supply any.
    pub fn default_settings(&self) -> PortSettings {
        self.default_settings.clone()
    }

    /// Open a port and create its session.
    ///
    /// At most one session may be open per port. A second non-exclusive open
    /// with the same `client_id` returns the existing session (shared access,
    /// when enabled); any other collision fails with [`Error::PortLocked`].
    pub fn open_port(
        &self,
        port_name: &str,
        settings: PortSettings,
        client_id: &str,
        exclusive: bool,
    ) -> Result<Arc<Session>, Error> {
        settings.validate()?;

        let mut tables = self.tables.write().expect("lock poisoned");

        if let Some(existing) = tables.by_name.get(port_name) {
            if existing.exclusive || exclusive || !self.allow_shared_access {
                return Err(Error::PortLocked);
            }
            if existing.client_id == client_id {
                debug!(%port_name, %client_id, "Shared re-open returns existing session");
                return Ok(Arc::clone(existing));
            }
            return Err(Error::PortLocked);
        }

        let mut driver = self.opener.open(port_name, &settings)?;

        if let Some(timeout) = settings.read_timeout() {
            if let Err(e) = driver.set_read_timeout(timeout) {
                // The handle is dropped (and thereby closed) on this path.
                return Err(e);
            }
        }

        let session = Arc::new(Session::new(
            port_name, client_id, exclusive, settings, driver,
        ));

        info!(%port_name, session = %session.id, %client_id, exclusive, "Port opened");

        tables
            .by_name
            .insert(port_name.to_string(), Arc::clone(&session));
        tables.by_id.insert(session.id, Arc::clone(&session));

        Ok(session)
    }

    /// Close the session holding `port_name`, verifying the caller owns it.
    pub fn close_port(&self, port_name: &str, session_id: Uuid) -> Result<(), Error> {
        let mut tables = self.tables.write().expect("lock poisoned");

        let session = tables
            .by_name
            .get(port_name)
            .ok_or_else(|| Error::PortNotOpen(port_name.to_string()))?
            .clone();

        if session.id != session_id {
            return Err(Error::InvalidSession);
        }

        Self::close_session_locked(&mut tables, &session)
    }

    /// Tear a session down: flip to closing, drop every subscriber channel,
    /// release the handle, unindex, flip to closed. Must run under the table
    /// write guard so open and close on one port are totally ordered.
    fn close_session_locked(tables: &mut Tables, session: &Arc<Session>) -> Result<(), Error> {
        session.transition(SessionState::Closing);

        // Dropping the senders closes every subscriber channel.
        session.subscribers.write().expect("lock poisoned").clear();

        // A concurrently blocked read holds the port guard for at most the
        // configured read timeout; wait it out and release the handle.
        let close_result = session.port.lock().expect("lock poisoned").close();

        tables.by_name.remove(&session.port_name);
        tables.by_id.remove(&session.id);

        session.transition(SessionState::Closed);

        info!(port_name = %session.port_name, session = %session.id, "Port closed");

        close_result
    }

    /// Resolve a (port, session id) pair to a live session.
    pub fn validate_session(&self, port_name: &str, session_id: Uuid) -> Result<Arc<Session>, Error> {
        let tables = self.tables.read().expect("lock poisoned");

        let session = tables
            .by_name
            .get(port_name)
            .ok_or_else(|| Error::PortNotOpen(port_name.to_string()))?;

        if session.id != session_id {
            return Err(Error::InvalidSession);
        }

        if !session.is_open() {
            return Err(Error::PortClosed);
        }

        Ok(Arc::clone(session))
    }

    /// Blocking write to the port.
    pub fn write(&self, port_name: &str, session_id: Uuid, data: &[u8]) -> Result<usize, Error> {
        let session = self.validate_session(port_name, session_id)?;

        let mut port = session.port.lock().expect("lock poisoned");
        if !session.is_open() {
            return Err(Error::PortClosed);
        }

        match port.write(data) {
            Err(e) => {
                session.stats.add_error();
                Err(e)
            }
            Ok(n) => {
                session
                    .stats
                    .bytes_sent
                    .fetch_add(n as u64, Ordering::Relaxed);
                session.stats.touch();
                Ok(n)
            }
        }
    }

    /// Blocking read of up to `max_bytes`, bounded by the driver read timeout.
    ///
    /// Freshly read bytes are fanned out to every subscriber channel before
    /// the call returns. An empty result means the timeout expired.
    pub fn read(&self, port_name: &str, session_id: Uuid, max_bytes: usize) -> Result<Vec<u8>, Error> {
        let session = self.validate_session(port_name, session_id)?;

        let mut buffer = vec![0u8; max_bytes];

        let n = {
            let mut port = session.port.lock().expect("lock poisoned");
            if !session.is_open() {
                return Err(Error::PortClosed);
            }

            match port.read(&mut buffer) {
                Err(e) => {
                    session.stats.add_error();
                    return Err(e);
                }
                Ok(n) => n,
            }
        };

        session
            .stats
            .bytes_received
            .fetch_add(n as u64, Ordering::Relaxed);
        session.stats.touch();

        buffer.truncate(n);

        if n > 0 {
            session.broadcast(&buffer);
        }

        Ok(buffer)
    }

    /// Apply new settings to a live session's port.
    pub fn configure(
        &self,
        port_name: &str,
        session_id: Uuid,
        settings: PortSettings,
    ) -> Result<(), Error> {
        let session = self.validate_session(port_name, session_id)?;
        settings.validate()?;

        let mut port = session.port.lock().expect("lock poisoned");
        if !session.is_open() {
            return Err(Error::PortClosed);
        }

        port.set_mode(&settings)?;
        if let Some(timeout) = settings.read_timeout() {
            port.set_read_timeout(timeout)?;
        }

        *session.settings.lock().expect("lock poisoned") = settings;

        Ok(())
    }

    /// Discard the port's input and output buffers. The first failure aborts.
    pub fn flush(&self, port_name: &str, session_id: Uuid) -> Result<(), Error> {
        let session = self.validate_session(port_name, session_id)?;

        let mut port = session.port.lock().expect("lock poisoned");
        if !session.is_open() {
            return Err(Error::PortClosed);
        }

        port.reset_input_buffer()?;
        port.reset_output_buffer()
    }

    /// The session holding `port_name`, or [`Error::PortNotOpen`].
    pub fn get_status(&self, port_name: &str) -> Result<Arc<Session>, Error> {
        self.get_session(port_name)
            .ok_or_else(|| Error::PortNotOpen(port_name.to_string()))
    }

    /// The session holding `port_name`, if any.
    pub fn get_session(&self, port_name: &str) -> Option<Arc<Session>> {
        self.tables
            .read()
            .expect("lock poisoned")
            .by_name
            .get(port_name)
            .cloned()
    }

    /// The session with the given id, if any.
    pub fn get_session_by_id(&self, session_id: Uuid) -> Option<Arc<Session>> {
        self.tables
            .read()
            .expect("lock poisoned")
            .by_id
            .get(&session_id)
            .cloned()
    }

    /// Names of every port with an open session.
    pub fn list_open_ports(&self) -> Vec<String> {
        self.tables
            .read()
            .expect("lock poisoned")
            .by_name
            .keys()
            .cloned()
            .collect()
    }

    /// Close every session. Close errors are logged, not propagated.
    pub fn close_all(&self) {
        let mut tables = self.tables.write().expect("lock poisoned");

        let sessions: Vec<Arc<Session>> = tables.by_name.values().cloned().collect();
        for session in sessions {
            if let Err(e) = Self::close_session_locked(&mut tables, &session) {
                warn!(port_name = %session.port_name, %e, "Close failed during shutdown");
            }
        }
    }

    /// Attach a bounded inbound-byte channel to the session.
    ///
    /// Each slice a successful [`SessionManager::read`] returns is also
    /// try-sent here; a full channel drops for that subscriber only.
    pub fn subscribe(
        &self,
        port_name: &str,
        session_id: Uuid,
    ) -> Result<(SubscriberId, mpsc::Receiver<Vec<u8>>), Error> {
        let session = self.validate_session(port_name, session_id)?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = session.next_subscriber.fetch_add(1, Ordering::Relaxed);

        session
            .subscribers
            .write()
            .expect("lock poisoned")
            .push((id, tx));

        Ok((id, rx))
    }

    /// Detach a subscriber channel. Unknown ids are ignored.
    pub fn unsubscribe(
        &self,
        port_name: &str,
        session_id: Uuid,
        subscriber: SubscriberId,
    ) -> Result<(), Error> {
        let session = self.validate_session(port_name, session_id)?;

        session
            .subscribers
            .write()
            .expect("lock poisoned")
            .retain(|(id, _)| *id != subscriber);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::mock::LoopbackOpener;

    fn manager() -> SessionManager {
        manager_with_shared_access(false)
    }

    fn manager_with_shared_access(allow: bool) -> SessionManager {
        let defaults = PortSettings {
            read_timeout_ms: 10,
            ..Default::default()
        };
        SessionManager::new(Box::new(LoopbackOpener::new()), allow, defaults)
    }

    fn open(manager: &SessionManager, name: &str) -> Arc<Session> {
        manager
            .open_port(name, manager.default_settings(), "test-client", true)
            .unwrap()
    }

    #[test]
    fn open_then_close_roundtrip() {
        let manager = manager();
        let session = open(&manager, "loop0");

        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(manager.list_open_ports(), vec!["loop0".to_string()]);

        manager.close_port("loop0", session.id()).unwrap();

        assert_eq!(session.state(), SessionState::Closed);
        assert!(manager.list_open_ports().is_empty());
        assert!(manager.get_session("loop0").is_none());
        assert!(manager.get_session_by_id(session.id()).is_none());
    }

    #[test]
    fn both_indexes_point_at_the_same_session() {
        let manager = manager();
        let session = open(&manager, "loop0");

        let by_name = manager.get_session("loop0").unwrap();
        let by_id = manager.get_session_by_id(session.id()).unwrap();

        assert!(Arc::ptr_eq(&by_name, &by_id));
        assert!(Arc::ptr_eq(&by_name, &session));
    }

    #[test]
    fn exclusive_open_locks_out_everyone() {
        let manager = manager_with_shared_access(true);
        let _session = open(&manager, "loop0");

        let second = manager.open_port("loop0", manager.default_settings(), "other", false);
        assert_eq!(second.unwrap_err(), Error::PortLocked);
    }

    #[test]
    fn shared_reopen_with_same_client_returns_existing_session() {
        let manager = manager_with_shared_access(true);
        let first = manager
            .open_port("loop0", manager.default_settings(), "shared", false)
            .unwrap();

        let again = manager
            .open_port("loop0", manager.default_settings(), "shared", false)
            .unwrap();
        assert_eq!(first.id(), again.id());

        let stranger = manager.open_port("loop0", manager.default_settings(), "other", false);
        assert_eq!(stranger.unwrap_err(), Error::PortLocked);
    }

    #[test]
    fn shared_access_disabled_rejects_second_open() {
        let manager = manager();
        let _session = manager
            .open_port("loop0", manager.default_settings(), "shared", false)
            .unwrap();

        let again = manager.open_port("loop0", manager.default_settings(), "shared", false);
        assert_eq!(again.unwrap_err(), Error::PortLocked);
    }

    #[test]
    fn close_with_wrong_id_leaves_session_untouched() {
        let manager = manager();
        let session = open(&manager, "loop0");

        let result = manager.close_port("loop0", Uuid::new_v4());
        assert_eq!(result.unwrap_err(), Error::InvalidSession);
        assert_eq!(session.state(), SessionState::Open);

        manager.close_port("loop0", session.id()).unwrap();
    }

    #[test]
    fn reopen_yields_a_fresh_session_id() {
        let manager = manager();
        let first = open(&manager, "loop0");
        manager.close_port("loop0", first.id()).unwrap();

        let second = open(&manager, "loop0");
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn write_then_read_moves_bytes_and_counts_them() {
        let manager = manager();
        let session = open(&manager, "loop0");

        let n = manager.write("loop0", session.id(), b"HI").unwrap();
        assert_eq!(n, 2);

        let data = manager.read("loop0", session.id(), 16).unwrap();
        assert_eq!(data, b"HI".to_vec());

        let stats = session.statistics();
        assert_eq!(stats.bytes_sent, 2);
        assert_eq!(stats.bytes_received, 2);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn read_on_empty_line_returns_no_bytes() {
        let manager = manager();
        let session = open(&manager, "loop0");

        let data = manager.read("loop0", session.id(), 16).unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn subscribers_see_read_bytes() {
        let manager = manager();
        let session = open(&manager, "loop0");

        let (_, mut rx) = manager.subscribe("loop0", session.id()).unwrap();

        manager.write("loop0", session.id(), b"abc").unwrap();
        let direct = manager.read("loop0", session.id(), 16).unwrap();
        assert_eq!(direct, b"abc".to_vec());

        let broadcast = rx.recv().await.unwrap();
        assert_eq!(broadcast, b"abc".to_vec());
    }

    #[tokio::test]
    async fn closing_drops_subscriber_channels() {
        let manager = manager();
        let session = open(&manager, "loop0");

        let (_, mut rx) = manager.subscribe("loop0", session.id()).unwrap();
        manager.close_port("loop0", session.id()).unwrap();

        assert!(rx.recv().await.is_none());
        assert_eq!(
            manager.validate_session("loop0", session.id()).unwrap_err(),
            Error::PortNotOpen("loop0".into())
        );
    }

    #[test]
    fn unsubscribe_removes_by_id() {
        let manager = manager();
        let session = open(&manager, "loop0");

        let (id, _rx) = manager.subscribe("loop0", session.id()).unwrap();
        assert_eq!(session.subscriber_count(), 1);

        manager.unsubscribe("loop0", session.id(), id).unwrap();
        assert_eq!(session.subscriber_count(), 0);
    }

    #[test]
    fn configure_replaces_settings() {
        let manager = manager();
        let session = open(&manager, "loop0");

        let faster = PortSettings {
            baud_rate: 115_200,
            read_timeout_ms: 10,
            ..Default::default()
        };
        manager
            .configure("loop0", session.id(), faster.clone())
            .unwrap();

        assert_eq!(session.settings(), faster);
        // The session survives reconfiguration untouched.
        assert_eq!(
            manager.get_session("loop0").unwrap().id(),
            session.id()
        );
    }

    #[test]
    fn flush_reaches_both_driver_buffers() {
        let manager = manager();
        let session = open(&manager, "loop0");

        manager.write("loop0", session.id(), b"kept").unwrap();
        manager.flush("loop0", session.id()).unwrap();

        // The loopback's buffer resets are no-ops, so the line survives.
        let data = manager.read("loop0", session.id(), 16).unwrap();
        assert_eq!(data, b"kept".to_vec());
    }

    #[tokio::test]
    async fn close_all_tears_every_session_down() {
        let manager = manager();
        let sessions = [
            open(&manager, "loop0"),
            open(&manager, "loop1"),
            open(&manager, "loop2"),
        ];

        let mut receivers = Vec::new();
        for session in &sessions {
            let (_, rx) = manager
                .subscribe(session.port_name(), session.id())
                .unwrap();
            receivers.push(rx);
        }

        manager.close_all();

        for session in &sessions {
            assert_eq!(session.state(), SessionState::Closed);
        }
        for mut rx in receivers {
            assert!(rx.recv().await.is_none());
        }
        assert!(manager.list_open_ports().is_empty());

        // No leaked handles: reopening succeeds immediately.
        let reopened = open(&manager, "loop0");
        assert_eq!(reopened.state(), SessionState::Open);
    }

    #[test]
    fn operations_against_missing_port_fail_cleanly() {
        let manager = manager();

        assert!(matches!(
            manager.write("nope", Uuid::new_v4(), b"x").unwrap_err(),
            Error::PortNotOpen(_)
        ));
        assert!(matches!(
            manager.read("nope", Uuid::new_v4(), 8).unwrap_err(),
            Error::PortNotOpen(_)
        ));
    }

    #[test]
    fn mismatched_session_id_is_rejected() {
        let manager = manager();
        let _session = open(&manager, "loop0");

        assert_eq!(
            manager.write("loop0", Uuid::new_v4(), b"x").unwrap_err(),
            Error::InvalidSession
        );
    }

    #[test]
    fn invalid_settings_never_reach_the_driver() {
        let manager = manager();

        let bad = PortSettings {
            baud_rate: 50,
            ..Default::default()
        };
        assert!(matches!(
            manager.open_port("loop0", bad, "c", true).unwrap_err(),
            Error::InvalidConfig(_)
        ));
        assert!(manager.get_session("loop0").is_none());
    }
}
