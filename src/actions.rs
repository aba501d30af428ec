use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::{
    error,
    serial::manager::{SessionState, StatisticsSnapshot},
    serial::scanner::PortInfo,
    serial::settings::PortSettings,
};

/// A chunk of port data on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChunk {
    /// Which port the bytes belong to.
    pub port_name: String,
    /// The payload.
    pub data: Vec<u8>,
    /// Reader sequence number; gaps mean drops, never reordering.
    #[serde(default)]
    pub sequence: u32,
    /// Nanoseconds since the Unix epoch; present when timestamps were
    /// requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Requests a client can make of the agent.
#[derive(Debug, Serialize, Deserialize)]
pub enum Request {
    /// Enumerate detected ports.
    ListPorts {
        /// Drop ports that already have an open session.
        #[serde(default)]
        only_available: bool,
    },

    /// A fresh snapshot of one port.
    GetPortInfo {
        /// The port to look up.
        port_name: String,
    },

    /// Open a port and create a session for it.
    OpenPort {
        /// The port to open.
        port_name: String,
        /// Settings to apply; the agent defaults apply when omitted.
        #[serde(default)]
        settings: Option<PortSettings>,
        /// Caller identity; `default-client` when empty.
        #[serde(default)]
        client_id: String,
        /// Refuse any other open of this port while the session lives.
        #[serde(default)]
        exclusive: bool,
    },

    /// Close a session, verifying ownership.
    ClosePort {
        /// The port to close.
        port_name: String,
        /// The id returned by the open.
        session_id: String,
    },

    /// Status of one port, including settings and statistics when open.
    GetPortStatus {
        /// The port to inspect.
        port_name: String,
    },

    /// Write bytes to an open port.
    Write {
        /// The port to write to.
        port_name: String,
        /// The id returned by the open.
        session_id: String,
        /// Bytes to put on the wire.
        data: Vec<u8>,
        /// Discard driver buffers after a successful write.
        #[serde(default)]
        flush: bool,
    },

    /// Read up to `max_bytes` from an open port.
    Read {
        /// The port to read from.
        port_name: String,
        /// The id returned by the open.
        session_id: String,
        /// Read cap; `<= 0` means 1024.
        #[serde(default)]
        max_bytes: i64,
        /// Request-level timeout; `0` relies on the driver timeout alone.
        #[serde(default)]
        timeout_ms: u64,
    },

    /// Start streaming inbound bytes as [`Response::Chunk`] frames.
    StreamRead {
        /// The port to stream from.
        port_name: String,
        /// The id returned by the open.
        session_id: String,
        /// Per-read chunk cap; `<= 0` means 1024.
        #[serde(default)]
        chunk_size: i64,
        /// Attach timestamps to each chunk.
        #[serde(default)]
        include_timestamps: bool,
    },

    /// Stop streaming a port on this connection.
    StopStream {
        /// The port whose stream should end.
        port_name: String,
    },

    /// One chunk of a client-side write stream. The session is resolved from
    /// the chunk's port name; combined with [`Request::StreamRead`] this forms
    /// a bidirectional stream.
    WriteChunk(DataChunk),

    /// Finish a write stream and ask for the summary.
    EndWriteStream,

    /// Apply new settings to an open port.
    ConfigurePort {
        /// The port to reconfigure.
        port_name: String,
        /// The id returned by the open.
        session_id: String,
        /// The new settings.
        settings: PortSettings,
    },

    /// The settings currently applied to an open port.
    GetPortConfig {
        /// The port to inspect.
        port_name: String,
    },

    /// Liveness check.
    Ping {
        /// Echoed back; `pong` when empty.
        #[serde(default)]
        message: String,
    },

    /// Version, platform and configuration of the agent.
    GetAgentInfo,
}

impl Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::ListPorts { only_available } => {
                write!(f, "list ports (only available: {only_available})")
            }
            Request::GetPortInfo { port_name } => write!(f, "port info: {port_name}"),
            Request::OpenPort {
                port_name,
                client_id,
                exclusive,
                ..
            } => write!(f, "open: {port_name} for `{client_id}` (exclusive: {exclusive})"),
            Request::ClosePort { port_name, .. } => write!(f, "close: {port_name}"),
            Request::GetPortStatus { port_name } => write!(f, "status: {port_name}"),
            Request::Write {
                port_name, data, ..
            } => write!(f, "write: {port_name}, {} byte(s)", data.len()),
            Request::Read {
                port_name,
                max_bytes,
                ..
            } => write!(f, "read: {port_name}, up to {max_bytes} byte(s)"),
            Request::StreamRead { port_name, .. } => write!(f, "stream read: {port_name}"),
            Request::StopStream { port_name } => write!(f, "stop stream: {port_name}"),
            Request::WriteChunk(chunk) => {
                write!(f, "chunk: {}, {} byte(s)", chunk.port_name, chunk.data.len())
            }
            Request::EndWriteStream => write!(f, "end write stream"),
            Request::ConfigurePort { port_name, .. } => write!(f, "configure: {port_name}"),
            Request::GetPortConfig { port_name } => write!(f, "port config: {port_name}"),
            Request::Ping { .. } => write!(f, "ping"),
            Request::GetAgentInfo => write!(f, "agent info"),
        }
    }
}

impl Request {
    /// Turn a request into serialized json.
    pub fn serialize(&self) -> String {
        serde_json::to_string(self).expect("a request serializes cleanly")
    }

    /// An example of opening a port exclusively.
    pub fn example_open_port() -> Self {
        Request::OpenPort {
            port_name: "/dev/ttyUSB0".into(),
            settings: Some(PortSettings::default()),
            client_id: "my-client".into(),
            exclusive: true,
        }
    }

    /// An example of writing a few bytes and flushing.
    pub fn example_write() -> Self {
        Request::Write {
            port_name: "/dev/ttyUSB0".into(),
            session_id: "11111111-2222-3333-4444-555555555555".into(),
            data: b"AT\r\n".to_vec(),
            flush: true,
        }
    }

    /// An example of starting a timestamped stream.
    pub fn example_stream_read() -> Self {
        Request::StreamRead {
            port_name: "/dev/ttyUSB0".into(),
            session_id: "11111111-2222-3333-4444-555555555555".into(),
            chunk_size: 1024,
            include_timestamps: true,
        }
    }

    /// An example chunk of a write stream.
    pub fn example_chunk() -> Self {
        Request::WriteChunk(DataChunk {
            port_name: "/dev/ttyUSB0".into(),
            data: b"hello".to_vec(),
            sequence: 1,
            timestamp: None,
        })
    }
}

/// Everything known about one port's session, or the fact that it has none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortStatus {
    /// The port this status describes.
    pub port_name: String,
    /// Whether a session holds the port.
    pub is_open: bool,
    /// Whether that session is exclusive.
    #[serde(default)]
    pub is_locked: bool,
    /// Client id of the owning session, when open.
    #[serde(default)]
    pub locked_by: String,
    /// Session id, when open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Lifecycle state, when open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<SessionState>,
    /// Applied settings, when open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<PortSettings>,
    /// Transfer statistics, when open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<StatisticsSnapshot>,
}

impl PortStatus {
    /// Status for a port with no session.
    pub fn not_open(port_name: &str) -> Self {
        Self {
            port_name: port_name.to_string(),
            is_open: false,
            is_locked: false,
            locked_by: String::new(),
            session_id: None,
            state: None,
            settings: None,
            statistics: None,
        }
    }
}

/// Version, platform and configuration of a running agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Crate version.
    pub version: String,
    /// Commit the agent was built from; `none` for dev builds.
    pub build_commit: String,
    /// When the agent was built; `unknown` for dev builds.
    pub build_date: String,
    /// Operating system the agent runs on.
    pub os: String,
    /// CPU architecture the agent runs on.
    pub arch: String,
    /// Seconds since the agent started.
    pub uptime_seconds: i64,
    /// Capabilities this build supports.
    pub features: Vec<String>,
    /// Listen address.
    pub address: String,
    /// Whether TLS termination is configured.
    pub tls_enabled: bool,
    /// Connection cap.
    pub max_connections: u32,
}

/// Responses the agent sends to connected clients.
///
/// Most arrive directly after the request that caused them; `Chunk` frames are
/// asynchronous and interleave freely once a stream is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// Result of [`Request::ListPorts`].
    Ports(Vec<PortInfo>),

    /// Result of [`Request::GetPortInfo`].
    Port(PortInfo),

    /// Result of [`Request::OpenPort`].
    Opened {
        /// Whether a session was created.
        success: bool,
        /// The new session's id, on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Human-readable outcome.
        message: String,
    },

    /// Result of [`Request::ClosePort`].
    Closed {
        /// Whether the session was closed.
        success: bool,
        /// Human-readable outcome.
        message: String,
    },

    /// Result of [`Request::GetPortStatus`].
    Status(PortStatus),

    /// Result of [`Request::Write`].
    Wrote {
        /// Whether the write succeeded.
        success: bool,
        /// Bytes the driver accepted.
        bytes_written: u32,
        /// Human-readable outcome.
        message: String,
    },

    /// Result of [`Request::Read`].
    ReadResult {
        /// Whether the read succeeded.
        success: bool,
        /// The bytes read; empty on timeout.
        data: Vec<u8>,
        /// Length of `data`.
        bytes_read: u32,
        /// Human-readable outcome.
        message: String,
    },

    /// A stream is now running; chunks follow asynchronously.
    StreamStarted {
        /// The streamed port.
        port_name: String,
    },

    /// One chunk of streamed inbound data.
    Chunk(DataChunk),

    /// A stream ended, either on request or because the connection that owned
    /// it went away.
    StreamStopped {
        /// The previously streamed port.
        port_name: String,
    },

    /// Result of [`Request::EndWriteStream`].
    StreamWriteComplete {
        /// Whether the whole stream was written.
        success: bool,
        /// Total payload bytes accepted by the driver.
        total_bytes_written: u64,
        /// Number of chunks processed.
        chunks_processed: u32,
        /// Human-readable outcome.
        message: String,
    },

    /// Result of [`Request::ConfigurePort`].
    Configured {
        /// Whether the settings were applied.
        success: bool,
        /// Human-readable outcome.
        message: String,
    },

    /// Result of [`Request::GetPortConfig`].
    Settings(PortSettings),

    /// Result of [`Request::Ping`].
    Pong {
        /// The echoed message.
        message: String,
        /// Agent wall-clock, seconds since the Unix epoch.
        server_time: i64,
    },

    /// Result of [`Request::GetAgentInfo`].
    Agent(AgentInfo),
}

impl Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Response::Ports(ports) => write!(f, "{} port(s)", ports.len()),
            Response::Port(info) => write!(f, "port {}", info.name),
            Response::Opened {
                success,
                session_id,
                ..
            } => write!(
                f,
                "opened: {success}, session: {}",
                session_id.as_deref().unwrap_or("-")
            ),
            Response::Closed { success, .. } => write!(f, "closed: {success}"),
            Response::Status(status) => {
                write!(f, "status {}: open={}", status.port_name, status.is_open)
            }
            Response::Wrote { bytes_written, .. } => write!(f, "wrote {bytes_written} byte(s)"),
            Response::ReadResult { bytes_read, .. } => write!(f, "read {bytes_read} byte(s)"),
            Response::StreamStarted { port_name } => write!(f, "streaming {port_name}"),
            Response::Chunk(chunk) => write!(
                f,
                "chunk #{} from {}: {} byte(s)",
                chunk.sequence,
                chunk.port_name,
                chunk.data.len()
            ),
            Response::StreamStopped { port_name } => write!(f, "stream stopped: {port_name}"),
            Response::StreamWriteComplete {
                total_bytes_written,
                chunks_processed,
                ..
            } => write!(
                f,
                "write stream done: {total_bytes_written} byte(s) in {chunks_processed} chunk(s)"
            ),
            Response::Configured { success, .. } => write!(f, "configured: {success}"),
            Response::Settings(settings) => write!(f, "settings: {settings}"),
            Response::Pong { message, .. } => write!(f, "pong: {message}"),
            Response::Agent(info) => write!(f, "agent v{}", info.version),
        }
    }
}

/// A fallible response frame.
pub type ResponseResult = Result<Response, error::Error>;
