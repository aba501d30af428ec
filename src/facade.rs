//! The service facade: turns wire requests into manager, scanner and reader
//! operations, and maps their failures into the right kind of answer.
//!
//! Recoverable, client-visible failures come back inside the response body
//! with `success: false`; argument violations and unexpected internal
//! problems surface as transport-level errors instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actions::{AgentInfo, DataChunk, PortStatus, Response};
use crate::config::Config;
use crate::error::Error;
use crate::serial::manager::{SessionManager, SubscriberId};
use crate::serial::reader::{DataEvent, StreamReader};
use crate::serial::scanner::{PortInfo, Scanner};
use crate::serial::settings::PortSettings;

/// Extra slack on top of a request-level read timeout, so the driver timeout
/// gets a fair chance to return first.
const READ_TIMEOUT_GRACE: Duration = Duration::from_secs(2);

/// Client identity used when a caller does not supply one.
const DEFAULT_CLIENT_ID: &str = "default-client";

/// Byte cap applied when a read request passes a nonpositive one.
const DEFAULT_MAX_BYTES: usize = 1024;

/// A running stream subscription handed to the transport layer.
///
/// The transport forwards events off `events` and gives the subscription back
/// via [`Facade::release_stream`] when the client cancels or disconnects.
pub struct StreamSubscription {
    /// The streamed port.
    pub port_name: String,
    /// Whether chunks should carry timestamps.
    pub include_timestamps: bool,
    /// The bounded event channel.
    pub events: mpsc::Receiver<DataEvent>,
    subscriber: SubscriberId,
}

struct Inner {
    manager: Arc<SessionManager>,
    scanner: Arc<Scanner>,
    config: Config,
    started_at: DateTime<Utc>,
    readers: Mutex<HashMap<String, Arc<StreamReader>>>,
    shutdown: CancellationToken,
}

/// Cheap-to-clone handle onto the agent's service surface.
#[derive(Clone)]
pub struct Facade {
    inner: Arc<Inner>,
}

impl Facade {
    /// A facade over the given manager and scanner.
    pub fn new(manager: Arc<SessionManager>, scanner: Arc<Scanner>, config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager,
                scanner,
                config,
                started_at: Utc::now(),
                readers: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// The session manager behind this facade.
    pub fn manager(&self) -> Arc<SessionManager> {
        Arc::clone(&self.inner.manager)
    }

    /// The scanner behind this facade.
    pub fn scanner(&self) -> Arc<Scanner> {
        Arc::clone(&self.inner.scanner)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| Error::Internal(format!("blocking task failed: {e}")))
    }

    fn require(value: &str, field: &str) -> Result<(), Error> {
        if value.is_empty() {
            return Err(Error::InvalidArgument(format!("{field} is required")));
        }
        Ok(())
    }

    fn parse_session(session_id: &str) -> Result<Uuid, Error> {
        Uuid::parse_str(session_id).map_err(|_| Error::InvalidSession)
    }

    /// Enumerate detected ports, optionally dropping the open ones.
    pub async fn list_ports(&self, only_available: bool) -> Result<Vec<PortInfo>, Error> {
        let scanner = Arc::clone(&self.inner.scanner);
        let ports = self.blocking(move || scanner.scan()).await??;

        Ok(ports
            .into_iter()
            .filter(|port| !(only_available && port.is_open))
            .collect())
    }

    /// A fresh snapshot of one port.
    pub async fn get_port_info(&self, port_name: String) -> Result<PortInfo, Error> {
        Self::require(&port_name, "port_name")?;

        let scanner = Arc::clone(&self.inner.scanner);
        self.blocking(move || scanner.get_port(&port_name)).await?
    }

    /// Open a port; lock conflicts and driver failures come back in the body.
    pub async fn open_port(
        &self,
        port_name: String,
        settings: Option<PortSettings>,
        client_id: String,
        exclusive: bool,
    ) -> Result<Response, Error> {
        Self::require(&port_name, "port_name")?;

        let client_id = if client_id.is_empty() {
            DEFAULT_CLIENT_ID.to_string()
        } else {
            client_id
        };
        let settings = settings.unwrap_or_else(|| self.inner.manager.default_settings());

        let manager = self.manager();
        let result = self
            .blocking(move || manager.open_port(&port_name, settings, &client_id, exclusive))
            .await?;

        Ok(match result {
            Ok(session) => Response::Opened {
                success: true,
                session_id: Some(session.id().to_string()),
                message: "port opened successfully".into(),
            },
            Err(e @ (Error::InvalidConfig(_) | Error::InvalidArgument(_))) => return Err(e),
            Err(e) => Response::Opened {
                success: false,
                session_id: None,
                message: e.to_string(),
            },
        })
    }

    /// Close a port, stopping any stream attached to it first.
    pub async fn close_port(
        &self,
        port_name: String,
        session_id: String,
    ) -> Result<Response, Error> {
        Self::require(&port_name, "port_name")?;
        Self::require(&session_id, "session_id")?;

        let session_id = match Self::parse_session(&session_id) {
            Ok(id) => id,
            Err(e) => {
                return Ok(Response::Closed {
                    success: false,
                    message: e.to_string(),
                })
            }
        };

        self.stop_reader(&port_name);

        let manager = self.manager();
        let name = port_name.clone();
        let result = self
            .blocking(move || manager.close_port(&name, session_id))
            .await?;

        Ok(match result {
            Ok(()) => Response::Closed {
                success: true,
                message: "port closed successfully".into(),
            },
            Err(e @ Error::PortNotOpen(_)) => return Err(e),
            Err(e) => Response::Closed {
                success: false,
                message: e.to_string(),
            },
        })
    }

    /// Status of one port; a port with no session reports `is_open: false`.
    pub async fn get_port_status(&self, port_name: String) -> Result<PortStatus, Error> {
        Self::require(&port_name, "port_name")?;

        let session = match self.inner.manager.get_status(&port_name) {
            Ok(session) => session,
            Err(Error::PortNotOpen(_)) => return Ok(PortStatus::not_open(&port_name)),
            Err(e) => return Err(e),
        };

        Ok(PortStatus {
            port_name: session.port_name().to_string(),
            is_open: true,
            is_locked: session.exclusive(),
            locked_by: session.client_id().to_string(),
            session_id: Some(session.id().to_string()),
            state: Some(session.state()),
            settings: Some(session.settings()),
            statistics: Some(session.statistics()),
        })
    }

    /// Write bytes; optionally flush afterwards. Flush problems never fail a
    /// write that already succeeded, and a failed write skips the flush.
    pub async fn write(
        &self,
        port_name: String,
        session_id: String,
        data: Vec<u8>,
        flush: bool,
    ) -> Result<Response, Error> {
        Self::require(&port_name, "port_name")?;
        Self::require(&session_id, "session_id")?;

        let session_id = match Self::parse_session(&session_id) {
            Ok(id) => id,
            Err(e) => return Ok(Self::write_failed(e)),
        };

        let manager = self.manager();
        let name = port_name.clone();
        let result = self
            .blocking(move || manager.write(&name, session_id, &data))
            .await?;

        let written = match result {
            Ok(n) => n,
            Err(e) => return Ok(Self::write_failed(e)),
        };

        if flush {
            let manager = self.manager();
            let name = port_name.clone();
            if let Ok(Err(e)) = self.blocking(move || manager.flush(&name, session_id)).await {
                debug!(%port_name, %e, "Post-write flush failed, ignoring");
            }
        }

        Ok(Response::Wrote {
            success: true,
            bytes_written: written as u32,
            message: "data written successfully".into(),
        })
    }

    fn write_failed(e: Error) -> Response {
        Response::Wrote {
            success: false,
            bytes_written: 0,
            message: e.to_string(),
        }
    }

    /// Read up to `max_bytes`, optionally bounded by a request-level timeout.
    ///
    /// The timeout races a timer against the blocking read; on expiry the read
    /// is abandoned, not cancelled, so it may still consume bytes from the
    /// device buffer that no response reports.
    pub async fn read(
        &self,
        port_name: String,
        session_id: String,
        max_bytes: i64,
        timeout_ms: u64,
    ) -> Result<Response, Error> {
        Self::require(&port_name, "port_name")?;
        Self::require(&session_id, "session_id")?;

        let session_id = match Self::parse_session(&session_id) {
            Ok(id) => id,
            Err(e) => return Ok(Self::read_failed(e)),
        };

        let max_bytes = if max_bytes <= 0 {
            DEFAULT_MAX_BYTES
        } else {
            max_bytes as usize
        };

        let manager = self.manager();
        let name = port_name.clone();
        let read = self.blocking(move || manager.read(&name, session_id, max_bytes));

        let result = if timeout_ms > 0 {
            let deadline = Duration::from_millis(timeout_ms) + READ_TIMEOUT_GRACE;
            match tokio::time::timeout(deadline, read).await {
                Ok(result) => result?,
                Err(_) => return Ok(Self::read_failed(Error::ReadTimeout)),
            }
        } else {
            read.await?
        };

        Ok(match result {
            Ok(data) => Response::ReadResult {
                success: true,
                bytes_read: data.len() as u32,
                data,
                message: "data read successfully".into(),
            },
            Err(e) => Self::read_failed(e),
        })
    }

    fn read_failed(e: Error) -> Response {
        Response::ReadResult {
            success: false,
            data: Vec::new(),
            bytes_read: 0,
            message: e.to_string(),
        }
    }

    /// Start (or join) the stream for a port and subscribe to it.
    ///
    /// One reader serves all subscribers of a port; it is created on the first
    /// subscription and torn down with the last one, or when the port closes.
    pub fn stream_read(
        &self,
        port_name: String,
        session_id: String,
        chunk_size: i64,
        include_timestamps: bool,
    ) -> Result<StreamSubscription, Error> {
        Self::require(&port_name, "port_name")?;
        Self::require(&session_id, "session_id")?;
        let session_id = Self::parse_session(&session_id)?;

        let chunk_size = if chunk_size <= 0 {
            0
        } else {
            chunk_size as usize
        };

        let mut readers = self.inner.readers.lock().expect("lock poisoned");

        let reader = match readers.get(&port_name) {
            Some(reader) if reader.is_running() => Arc::clone(reader),
            _ => {
                let reader = Arc::new(StreamReader::new(
                    self.manager(),
                    &port_name,
                    session_id,
                    chunk_size,
                ));

                // Tied to agent shutdown, not to any single client: other
                // subscribers keep streaming when the first one leaves.
                reader
                    .start(self.inner.shutdown.child_token())
                    .map_err(|e| match e {
                        e @ (Error::PortNotOpen(_) | Error::InvalidSession | Error::PortClosed) => e,
                        e => Error::Internal(format!("failed to start reader: {e}")),
                    })?;

                readers.insert(port_name.clone(), Arc::clone(&reader));
                reader
            }
        };

        let (subscriber, events) = reader.subscribe();
        info!(%port_name, subscribers = reader.subscriber_count(), "Stream subscription added");

        Ok(StreamSubscription {
            port_name,
            include_timestamps,
            events,
            subscriber,
        })
    }

    /// Drop one stream subscription; the port's reader stops once nobody is
    /// left listening.
    pub fn release_stream(&self, subscription: StreamSubscription) {
        let mut readers = self.inner.readers.lock().expect("lock poisoned");

        if let Some(reader) = readers.get(&subscription.port_name) {
            reader.unsubscribe(subscription.subscriber);

            if reader.subscriber_count() == 0 {
                reader.stop();
                readers.remove(&subscription.port_name);
                debug!(port_name = %subscription.port_name, "Last subscriber left, reader stopped");
            }
        }
    }

    /// Stop and remove the reader for a port, if any.
    pub fn stop_reader(&self, port_name: &str) {
        if let Some(reader) = self
            .inner
            .readers
            .lock()
            .expect("lock poisoned")
            .remove(port_name)
        {
            reader.stop();
            debug!(%port_name, "Reader stopped");
        }
    }

    /// Turn a reader event into a wire chunk.
    pub fn chunk_from_event(port_name: &str, event: &DataEvent, include_timestamps: bool) -> DataChunk {
        DataChunk {
            port_name: port_name.to_string(),
            data: event.data.clone(),
            sequence: event.sequence,
            timestamp: include_timestamps
                .then(|| event.timestamp.timestamp_nanos_opt().unwrap_or_default()),
        }
    }

    /// Write one chunk of a client stream, resolving the session from the
    /// chunk's port name.
    pub async fn write_chunk(&self, chunk: DataChunk) -> Result<usize, Error> {
        Self::require(&chunk.port_name, "port_name")?;

        let session = self
            .inner
            .manager
            .get_session(&chunk.port_name)
            .ok_or_else(|| Error::PortNotOpen(chunk.port_name.clone()))?;

        let manager = self.manager();
        let session_id = session.id();
        self.blocking(move || manager.write(&chunk.port_name, session_id, &chunk.data))
            .await?
    }

    /// Apply new settings to an open port.
    pub async fn configure_port(
        &self,
        port_name: String,
        session_id: String,
        settings: PortSettings,
    ) -> Result<Response, Error> {
        Self::require(&port_name, "port_name")?;
        Self::require(&session_id, "session_id")?;

        let session_id = match Self::parse_session(&session_id) {
            Ok(id) => id,
            Err(e) => {
                return Ok(Response::Configured {
                    success: false,
                    message: e.to_string(),
                })
            }
        };

        let manager = self.manager();
        let result = self
            .blocking(move || manager.configure(&port_name, session_id, settings))
            .await?;

        Ok(match result {
            Ok(()) => Response::Configured {
                success: true,
                message: "port configured successfully".into(),
            },
            Err(e) => Response::Configured {
                success: false,
                message: e.to_string(),
            },
        })
    }

    /// The settings currently applied to an open port.
    pub async fn get_port_config(&self, port_name: String) -> Result<PortSettings, Error> {
        Self::require(&port_name, "port_name")?;

        let session = self.inner.manager.get_status(&port_name)?;
        Ok(session.settings())
    }

    /// Liveness check.
    pub fn ping(&self, message: String) -> Response {
        Response::Pong {
            message: if message.is_empty() {
                "pong".into()
            } else {
                message
            },
            server_time: Utc::now().timestamp(),
        }
    }

    /// Version, platform and configuration of this agent.
    pub fn agent_info(&self) -> AgentInfo {
        AgentInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            // Stamped by release builds; dev builds fall back.
            build_commit: option_env!("SERIAL_BRIDGE_COMMIT")
                .unwrap_or("none")
                .to_string(),
            build_date: option_env!("SERIAL_BRIDGE_BUILD_DATE")
                .unwrap_or("unknown")
                .to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            uptime_seconds: (Utc::now() - self.inner.started_at).num_seconds(),
            features: [
                "websocket",
                "port-scan",
                "port-lock",
                "streaming",
                "bidirectional-streaming",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            address: self.inner.config.server.address.clone(),
            tls_enabled: self.inner.config.tls.enabled,
            max_connections: self.inner.config.server.max_connections,
        }
    }

    /// Stop every reader and close every session. Runs on agent shutdown.
    pub fn close_all(&self) {
        self.inner.shutdown.cancel();

        let readers: Vec<Arc<StreamReader>> = self
            .inner
            .readers
            .lock()
            .expect("lock poisoned")
            .drain()
            .map(|(_, reader)| reader)
            .collect();
        for reader in readers {
            reader.stop();
        }

        self.inner.manager.close_all();

        if !self.inner.manager.list_open_ports().is_empty() {
            warn!("Sessions survived close_all; this is a bug");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::mock::LoopbackOpener;

    fn facade() -> Facade {
        let mut config = Config::default();
        config.serial.defaults.read_timeout_ms = 10;
        config.serial.allow_shared_access = false;

        let manager = Arc::new(SessionManager::new(
            Box::new(LoopbackOpener::new()),
            config.serial.allow_shared_access,
            config.serial.defaults.clone(),
        ));
        let scanner = Arc::new(
            Scanner::new(&config.serial.exclude_patterns, Arc::clone(&manager)).unwrap(),
        );

        Facade::new(manager, scanner, config)
    }

    async fn open(facade: &Facade, port: &str) -> String {
        match facade
            .open_port(port.into(), None, "facade-test".into(), true)
            .await
            .unwrap()
        {
            Response::Opened {
                success: true,
                session_id: Some(id),
                ..
            } => id,
            other => panic!("open failed: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_port_name_is_a_transport_error() {
        let facade = facade();

        let result = facade
            .open_port(String::new(), None, String::new(), false)
            .await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn exclusive_collision_reports_locked_in_the_body() {
        let facade = facade();
        let _session = open(&facade, "loop0").await;

        let second = facade
            .open_port("loop0".into(), None, "b".into(), false)
            .await
            .unwrap();

        assert_eq!(
            second,
            Response::Opened {
                success: false,
                session_id: None,
                message: "port is locked by another client".into(),
            }
        );
    }

    #[tokio::test]
    async fn close_with_wrong_id_fails_in_the_body() {
        let facade = facade();
        let session = open(&facade, "loop0").await;

        let wrong = facade
            .close_port("loop0".into(), "wrong".into())
            .await
            .unwrap();
        assert_eq!(
            wrong,
            Response::Closed {
                success: false,
                message: "invalid session ID".into(),
            }
        );

        let right = facade.close_port("loop0".into(), session).await.unwrap();
        assert_eq!(
            right,
            Response::Closed {
                success: true,
                message: "port closed successfully".into(),
            }
        );
    }

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let facade = facade();
        let session = open(&facade, "loop0").await;

        let wrote = facade
            .write("loop0".into(), session.clone(), vec![0x48, 0x49], true)
            .await
            .unwrap();
        assert_eq!(
            wrote,
            Response::Wrote {
                success: true,
                bytes_written: 2,
                message: "data written successfully".into(),
            }
        );

        match facade
            .read("loop0".into(), session, 16, 500)
            .await
            .unwrap()
        {
            Response::ReadResult {
                success: true,
                data,
                bytes_read,
                ..
            } => {
                assert_eq!(data, vec![0x48, 0x49]);
                assert_eq!(bytes_read, 2);
            }
            other => panic!("read failed: {other}"),
        }
    }

    #[tokio::test]
    async fn nonpositive_max_bytes_normalizes_to_default() {
        let facade = facade();
        let session = open(&facade, "loop0").await;

        facade
            .write("loop0".into(), session.clone(), b"abc".to_vec(), false)
            .await
            .unwrap();

        match facade.read("loop0".into(), session, 0, 0).await.unwrap() {
            Response::ReadResult { success: true, data, .. } => assert_eq!(data, b"abc".to_vec()),
            other => panic!("read failed: {other}"),
        }
    }

    #[tokio::test]
    async fn status_reports_not_open_without_a_session() {
        let facade = facade();

        let status = facade.get_port_status("loop0".into()).await.unwrap();
        assert_eq!(status, PortStatus::not_open("loop0"));
    }

    #[tokio::test]
    async fn reconfigure_preserves_the_session() {
        let facade = facade();
        let session = open(&facade, "/dev/ttyUSB0").await;

        let settings = PortSettings {
            baud_rate: 115_200,
            read_timeout_ms: 10,
            ..Default::default()
        };
        let configured = facade
            .configure_port("/dev/ttyUSB0".into(), session.clone(), settings.clone())
            .await
            .unwrap();
        assert_eq!(
            configured,
            Response::Configured {
                success: true,
                message: "port configured successfully".into(),
            }
        );

        assert_eq!(
            facade.get_port_config("/dev/ttyUSB0".into()).await.unwrap(),
            settings
        );

        let status = facade.get_port_status("/dev/ttyUSB0".into()).await.unwrap();
        assert_eq!(status.session_id, Some(session));
    }

    #[tokio::test]
    async fn stream_readers_are_shared_per_port() {
        let facade = facade();
        let session = open(&facade, "loop0").await;

        let first = facade
            .stream_read("loop0".into(), session.clone(), 16, false)
            .unwrap();
        let second = facade
            .stream_read("loop0".into(), session, 16, false)
            .unwrap();

        {
            let readers = facade.inner.readers.lock().unwrap();
            assert_eq!(readers.len(), 1);
            assert_eq!(readers.get("loop0").unwrap().subscriber_count(), 2);
        }

        facade.release_stream(first);
        {
            let readers = facade.inner.readers.lock().unwrap();
            assert_eq!(readers.get("loop0").unwrap().subscriber_count(), 1);
        }

        facade.release_stream(second);
        assert!(facade.inner.readers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_chunk_resolves_the_session_from_the_port() {
        let facade = facade();
        let session = open(&facade, "loop0").await;

        let n = facade
            .write_chunk(DataChunk {
                port_name: "loop0".into(),
                data: b"bidi".to_vec(),
                sequence: 1,
                timestamp: None,
            })
            .await
            .unwrap();
        assert_eq!(n, 4);

        match facade.read("loop0".into(), session, 16, 0).await.unwrap() {
            Response::ReadResult { data, .. } => assert_eq!(data, b"bidi".to_vec()),
            other => panic!("read failed: {other}"),
        }
    }

    #[tokio::test]
    async fn write_chunk_without_a_session_is_a_transport_error() {
        let facade = facade();

        let result = facade
            .write_chunk(DataChunk {
                port_name: "closed".into(),
                data: vec![1],
                sequence: 1,
                timestamp: None,
            })
            .await;

        assert!(matches!(result, Err(Error::PortNotOpen(_))));
    }

    #[tokio::test]
    async fn ping_defaults_to_pong() {
        let facade = facade();

        match facade.ping(String::new()) {
            Response::Pong { message, .. } => assert_eq!(message, "pong"),
            other => panic!("wrong response: {other}"),
        }
    }

    #[tokio::test]
    async fn close_all_stops_readers_and_sessions() {
        let facade = facade();
        let session = open(&facade, "loop0").await;

        let mut subscription = facade
            .stream_read("loop0".into(), session, 16, false)
            .unwrap();

        facade.close_all();

        assert!(facade.manager().list_open_ports().is_empty());
        assert!(subscription.events.recv().await.is_none());
    }
}
