//! Continuous per-port reading with multi-subscriber fan-out.
//!
//! One reader drives one read loop against a session and broadcasts every
//! chunk to its subscribers. Channels are bounded and sends never block: a
//! stuck consumer would otherwise back-pressure the only read task for a
//! physical line and freeze inbound data for every other consumer. Losing
//! bytes for one slow subscriber beats halting the line; sequence numbers
//! expose the gaps.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::serial::manager::{SessionManager, SubscriberId, SUBSCRIBER_CAPACITY};

/// Read-chunk size used when callers pass a nonpositive one.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Backoff after a timeout read produced no bytes, so an idle line does not
/// become a busy spin.
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// Backoff after a transient error before the loop retries.
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(10);

/// One read produced by the continuous reader.
#[derive(Debug, Clone)]
pub struct DataEvent {
    /// The bytes read. Empty when `error` is set.
    pub data: Vec<u8>,
    /// When the read returned.
    pub timestamp: DateTime<Utc>,
    /// Monotonically increasing per reader, wrapping at `u32::MAX`.
    pub sequence: u32,
    /// Set when the read failed; subscribers may observe and ignore.
    pub error: Option<Error>,
}

/// Continuous reader for one (port, session) pair.
///
/// Single-use: start spawns the loop, stop tears it down for good. Both are
/// idempotent.
pub struct StreamReader {
    manager: Arc<SessionManager>,
    port_name: String,
    session_id: Uuid,
    buffer_size: usize,
    running: AtomicBool,
    stop: CancellationToken,
    subscribers: RwLock<Vec<(SubscriberId, mpsc::Sender<DataEvent>)>>,
    next_subscriber: AtomicU64,
    sequence: AtomicU32,
}

impl StreamReader {
    /// A reader for the given session. `buffer_size <= 0` falls back to
    /// [`DEFAULT_BUFFER_SIZE`].
    pub fn new(
        manager: Arc<SessionManager>,
        port_name: &str,
        session_id: Uuid,
        buffer_size: usize,
    ) -> Self {
        Self {
            manager,
            port_name: port_name.to_string(),
            session_id,
            buffer_size: if buffer_size == 0 {
                DEFAULT_BUFFER_SIZE
            } else {
                buffer_size
            },
            running: AtomicBool::new(false),
            stop: CancellationToken::new(),
            subscribers: RwLock::new(Vec::new()),
            next_subscriber: AtomicU64::new(0),
            sequence: AtomicU32::new(0),
        }
    }

    /// Spawn the read loop. A no-op if the loop is already running; fails if
    /// the session is gone or the reader was already stopped.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<(), Error> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.stop.is_cancelled() {
            self.running.store(false, Ordering::SeqCst);
            return Err(Error::Internal("reader was already stopped".into()));
        }

        if let Err(e) = self.manager.validate_session(&self.port_name, self.session_id) {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let reader = Arc::clone(self);
        tokio::task::spawn_blocking(move || reader.read_loop(cancel));

        Ok(())
    }

    /// The loop: read, broadcast, back off. Runs on the blocking pool since
    /// every manager read blocks for up to the driver timeout.
    fn read_loop(&self, cancel: CancellationToken) {
        debug!(port_name = %self.port_name, "Read loop starting");

        while self.running.load(Ordering::SeqCst)
            && !cancel.is_cancelled()
            && !self.stop.is_cancelled()
        {
            match self
                .manager
                .read(&self.port_name, self.session_id, self.buffer_size)
            {
                // Timeout with no data; yield briefly.
                Ok(data) if data.is_empty() => std::thread::sleep(IDLE_BACKOFF),
                Ok(data) => self.broadcast(data, None),
                Err(e) => {
                    let fatal = e.is_fatal_for_streaming();
                    if !fatal {
                        warn!(port_name = %self.port_name, %e, "Transient read error");
                    }

                    self.broadcast(Vec::new(), Some(e));

                    if fatal {
                        break;
                    }
                    std::thread::sleep(TRANSIENT_BACKOFF);
                }
            }
        }

        self.stop();
        debug!(port_name = %self.port_name, "Read loop finished");
    }

    fn broadcast(&self, data: Vec<u8>, error: Option<Error>) {
        let event = DataEvent {
            data,
            timestamp: Utc::now(),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1),
            error,
        };

        // Snapshot under a short read guard, send outside it, so subscribing
        // never waits on a broadcast in flight.
        let subscribers: Vec<mpsc::Sender<DataEvent>> = self
            .subscribers
            .read()
            .expect("lock poisoned")
            .iter()
            .map(|(_, tx)| tx.clone())
            .collect();

        for tx in subscribers {
            // Full or closed: drop for that subscriber.
            let _ = tx.try_send(event.clone());
        }
    }

    /// Attach a bounded event channel.
    ///
    /// After the reader stopped this yields an already-closed channel.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<DataEvent>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);

        if self.stop.is_cancelled() {
            // Sender drops here; the receiver reads as closed.
            return (id, rx);
        }

        self.subscribers
            .write()
            .expect("lock poisoned")
            .push((id, tx));

        (id, rx)
    }

    /// Detach a subscriber channel. Unknown ids are ignored.
    pub fn unsubscribe(&self, subscriber: SubscriberId) {
        self.subscribers
            .write()
            .expect("lock poisoned")
            .retain(|(id, _)| *id != subscriber);
    }

    /// How many subscribers are attached.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().expect("lock poisoned").len()
    }

    /// Whether the read loop is live.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the loop and close every subscriber channel. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop.cancel();
        self.subscribers.write().expect("lock poisoned").clear();
    }
}

/// Default line cap for [`LineReader`].
pub const DEFAULT_MAX_LINE: usize = 4096;

/// Splits subscriber events into delimiter-terminated lines.
///
/// On overflow past `max_line` the accumulated bytes are emitted as a partial
/// line; when the channel closes with a non-empty buffer the remainder is
/// flushed once before [`Error::PortClosed`] is reported.
pub struct LineReader {
    delimiter: u8,
    max_line: usize,
    buffer: Vec<u8>,
}

impl LineReader {
    /// A line reader splitting on `delimiter`. `max_line == 0` falls back to
    /// [`DEFAULT_MAX_LINE`].
    pub fn new(delimiter: u8, max_line: usize) -> Self {
        Self {
            delimiter,
            max_line: if max_line == 0 { DEFAULT_MAX_LINE } else { max_line },
            buffer: Vec::new(),
        }
    }

    /// The next line from the subscription, without its delimiter.
    pub async fn read_line(
        &mut self,
        events: &mut mpsc::Receiver<DataEvent>,
    ) -> Result<Vec<u8>, Error> {
        loop {
            if let Some(position) = self.buffer.iter().position(|b| *b == self.delimiter) {
                let rest = self.buffer.split_off(position + 1);
                let mut line = std::mem::replace(&mut self.buffer, rest);
                line.pop();
                return Ok(line);
            }

            match events.recv().await {
                None => {
                    if self.buffer.is_empty() {
                        return Err(Error::PortClosed);
                    }
                    return Ok(std::mem::take(&mut self.buffer));
                }
                Some(event) => {
                    if let Some(e) = event.error {
                        return Err(e);
                    }

                    self.buffer.extend_from_slice(&event.data);

                    if self.buffer.len() > self.max_line {
                        return Ok(std::mem::take(&mut self.buffer));
                    }
                }
            }
        }
    }

    /// Discard any accumulated partial line.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::mock::LoopbackOpener;
    use crate::serial::settings::PortSettings;

    fn manager() -> Arc<SessionManager> {
        let defaults = PortSettings {
            read_timeout_ms: 10,
            ..Default::default()
        };
        Arc::new(SessionManager::new(
            Box::new(LoopbackOpener::new()),
            false,
            defaults,
        ))
    }

    fn open(manager: &Arc<SessionManager>, name: &str) -> Uuid {
        manager
            .open_port(name, manager.default_settings(), "reader-test", true)
            .unwrap()
            .id()
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let manager = manager();
        let session = open(&manager, "loop0");
        let reader = Arc::new(StreamReader::new(Arc::clone(&manager), "loop0", session, 16));

        reader.start(CancellationToken::new()).unwrap();
        assert!(reader.is_running());

        // Second start is a no-op.
        reader.start(CancellationToken::new()).unwrap();
        assert!(reader.is_running());

        reader.stop();
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_closes_subscribers() {
        let manager = manager();
        let session = open(&manager, "loop0");
        let reader = Arc::new(StreamReader::new(Arc::clone(&manager), "loop0", session, 16));

        reader.start(CancellationToken::new()).unwrap();
        let (_, mut events) = reader.subscribe();

        reader.stop();
        reader.stop();

        assert!(!reader.is_running());
        assert!(events.recv().await.is_none());

        // Post-stop subscriptions read as closed immediately.
        let (_, mut late) = reader.subscribe();
        assert!(late.recv().await.is_none());
    }

    #[tokio::test]
    async fn start_fails_without_a_session() {
        let manager = manager();
        let reader = Arc::new(StreamReader::new(
            Arc::clone(&manager),
            "loop0",
            Uuid::new_v4(),
            16,
        ));

        assert!(matches!(
            reader.start(CancellationToken::new()).unwrap_err(),
            Error::PortNotOpen(_)
        ));
        assert!(!reader.is_running());
    }

    #[tokio::test]
    async fn events_carry_increasing_sequences() {
        let manager = manager();
        let session = open(&manager, "loop0");
        let reader = Arc::new(StreamReader::new(Arc::clone(&manager), "loop0", session, 4));

        reader.start(CancellationToken::new()).unwrap();
        let (_, mut events) = reader.subscribe();

        let feeder = Arc::clone(&manager);
        tokio::task::spawn_blocking(move || {
            for chunk in [b"one".as_slice(), b"two".as_slice(), b"three".as_slice()] {
                feeder.write("loop0", session, chunk).unwrap();
                std::thread::sleep(Duration::from_millis(20));
            }
        });

        let mut bytes = Vec::new();
        let mut last_sequence = 0u32;
        while bytes.len() < 11 {
            let event = events.recv().await.unwrap();
            assert!(event.error.is_none());
            assert!(event.sequence > last_sequence);
            last_sequence = event.sequence;
            bytes.extend_from_slice(&event.data);
        }

        assert_eq!(bytes, b"onetwothree".to_vec());
        reader.stop();
    }

    #[tokio::test]
    async fn closing_the_port_stops_the_loop() {
        let manager = manager();
        let session = open(&manager, "loop0");
        let reader = Arc::new(StreamReader::new(Arc::clone(&manager), "loop0", session, 16));

        reader.start(CancellationToken::new()).unwrap();
        let (_, mut events) = reader.subscribe();

        manager.close_port("loop0", session).unwrap();

        // The loop hits PortNotOpen/PortClosed, stops itself, and the channel
        // closes. Any events before that must be error-free data.
        loop {
            match events.recv().await {
                None => break,
                Some(event) if event.error.is_some() => break,
                Some(_) => continue,
            }
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_running());
    }

    #[tokio::test]
    async fn cancellation_token_stops_the_loop() {
        let manager = manager();
        let session = open(&manager, "loop0");
        let reader = Arc::new(StreamReader::new(Arc::clone(&manager), "loop0", session, 16));

        let cancel = CancellationToken::new();
        reader.start(cancel.clone()).unwrap();
        cancel.cancel();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!reader.is_running());
    }

    fn event(data: &[u8]) -> DataEvent {
        DataEvent {
            data: data.to_vec(),
            timestamp: Utc::now(),
            sequence: 1,
            error: None,
        }
    }

    #[tokio::test]
    async fn line_reader_splits_on_delimiter() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut lines = LineReader::new(b'\n', 64);

        tx.send(event(b"hello\nwor")).await.unwrap();
        tx.send(event(b"ld\n")).await.unwrap();

        assert_eq!(lines.read_line(&mut rx).await.unwrap(), b"hello".to_vec());
        assert_eq!(lines.read_line(&mut rx).await.unwrap(), b"world".to_vec());
    }

    #[tokio::test]
    async fn line_reader_flushes_partial_line_on_overflow() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut lines = LineReader::new(b'\n', 4);

        tx.send(event(b"toolong")).await.unwrap();

        assert_eq!(lines.read_line(&mut rx).await.unwrap(), b"toolong".to_vec());
    }

    #[tokio::test]
    async fn line_reader_flushes_remainder_then_reports_closed() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut lines = LineReader::new(b'\n', 64);

        tx.send(event(b"tail")).await.unwrap();
        drop(tx);

        assert_eq!(lines.read_line(&mut rx).await.unwrap(), b"tail".to_vec());
        assert_eq!(lines.read_line(&mut rx).await.unwrap_err(), Error::PortClosed);
    }

    #[tokio::test]
    async fn line_reader_surfaces_event_errors() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut lines = LineReader::new(b'\n', 64);

        tx.send(DataEvent {
            data: Vec::new(),
            timestamp: Utc::now(),
            sequence: 1,
            error: Some(Error::Io("glitch".into())),
        })
        .await
        .unwrap();

        assert_eq!(
            lines.read_line(&mut rx).await.unwrap_err(),
            Error::Io("glitch".into())
        );
    }
}
