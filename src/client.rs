//! A small client for the agent's websocket surface. Used by the integration
//! tests and handy for tooling built on top of the agent.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error};

use crate::{
    actions::{DataChunk, Request, Response, ResponseResult},
    error::Error,
    serial::settings::PortSettings,
};

struct Client {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,

    /// Direct replies to requests end up here.
    responses: mpsc::UnboundedSender<ResponseResult>,

    /// Asynchronous stream chunks are demultiplexed here.
    chunks: mpsc::UnboundedSender<DataChunk>,

    requests: mpsc::UnboundedReceiver<Request>,
}

impl Client {
    async fn run(self) {
        let (mut ws_tx, mut ws_rx) = self.stream.split();

        let mut requests = self.requests;
        let requests_handle = tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                if let Err(e) = ws_tx
                    .send(tungstenite::Message::Text(request.serialize()))
                    .await
                {
                    error!(%e, "Could not send request to agent");
                    break;
                }
            }
        });

        let responses = self.responses;
        let chunks = self.chunks;
        let receive_handle = tokio::spawn(async move {
            while let Some(Ok(message)) = ws_rx.next().await {
                let tungstenite::Message::Text(text) = message else {
                    continue;
                };

                let frame: ResponseResult = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(%e, %text, "Could not deserialize frame");
                        continue;
                    }
                };

                let routed = match frame {
                    Ok(Response::Chunk(chunk)) => chunks.send(chunk).is_ok(),
                    other => responses.send(other).is_ok(),
                };
                if !routed {
                    break;
                }
            }
        });

        tokio::select! {
            _ = requests_handle => debug!("Request loop returned"),
            _ = receive_handle => debug!("Receive loop returned"),
        }
    }
}

/// A connected client: send [`Request`]s, await their responses, and drain
/// stream chunks independently of the request/response flow.
pub struct ClientHandle {
    requests: mpsc::UnboundedSender<Request>,
    responses: mpsc::UnboundedReceiver<ResponseResult>,
    chunks: mpsc::UnboundedReceiver<DataChunk>,
}

impl ClientHandle {
    /// Connect to an agent on the given address and port.
    pub async fn new(address: &str, port: u16) -> Result<Self, Error> {
        let (stream, _) =
            tokio_tungstenite::connect_async(format!("ws://{address}:{port}/ws")).await?;

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();

        let client = Client {
            stream,
            responses: response_tx,
            chunks: chunk_tx,
            requests: request_rx,
        };

        tokio::spawn(async move { client.run().await });

        Ok(Self {
            requests: request_tx,
            responses: response_rx,
            chunks: chunk_rx,
        })
    }

    /// Send a request without waiting for anything back.
    pub fn send(&self, request: Request) -> Result<(), Error> {
        self.requests
            .send(request)
            .map_err(|e| Error::Transport(e.to_string()))
    }

    /// The next non-chunk frame from the agent.
    pub async fn next_response(&mut self) -> Result<Response, Error> {
        self.responses
            .recv()
            .await
            .ok_or_else(|| Error::Transport("connection closed".into()))?
    }

    /// The next stream chunk, or `None` once the connection is gone.
    pub async fn next_chunk(&mut self) -> Option<DataChunk> {
        self.chunks.recv().await
    }

    /// Send a request and await its direct response.
    pub async fn request(&mut self, request: Request) -> Result<Response, Error> {
        self.send(request)?;
        self.next_response().await
    }

    /// Open a port and return the new session id.
    pub async fn open_port(
        &mut self,
        port_name: &str,
        settings: Option<PortSettings>,
        exclusive: bool,
    ) -> Result<String, Error> {
        let response = self
            .request(Request::OpenPort {
                port_name: port_name.into(),
                settings,
                client_id: String::new(),
                exclusive,
            })
            .await?;

        match response {
            Response::Opened {
                success: true,
                session_id: Some(session_id),
                ..
            } => Ok(session_id),
            Response::Opened { message, .. } => Err(Error::Internal(message)),
            other => Err(Error::Internal(format!("unexpected response: {other}"))),
        }
    }

    /// Close a port.
    pub async fn close_port(&mut self, port_name: &str, session_id: &str) -> Result<(), Error> {
        let response = self
            .request(Request::ClosePort {
                port_name: port_name.into(),
                session_id: session_id.into(),
            })
            .await?;

        match response {
            Response::Closed { success: true, .. } => Ok(()),
            Response::Closed { message, .. } => Err(Error::Internal(message)),
            other => Err(Error::Internal(format!("unexpected response: {other}"))),
        }
    }

    /// Write bytes and return how many the agent accepted.
    pub async fn write(
        &mut self,
        port_name: &str,
        session_id: &str,
        data: &[u8],
    ) -> Result<u32, Error> {
        let response = self
            .request(Request::Write {
                port_name: port_name.into(),
                session_id: session_id.into(),
                data: data.to_vec(),
                flush: false,
            })
            .await?;

        match response {
            Response::Wrote {
                success: true,
                bytes_written,
                ..
            } => Ok(bytes_written),
            Response::Wrote { message, .. } => Err(Error::Internal(message)),
            other => Err(Error::Internal(format!("unexpected response: {other}"))),
        }
    }

    /// Start streaming a port; chunks arrive via [`ClientHandle::next_chunk`].
    pub async fn stream_read(&mut self, port_name: &str, session_id: &str) -> Result<(), Error> {
        let response = self
            .request(Request::StreamRead {
                port_name: port_name.into(),
                session_id: session_id.into(),
                chunk_size: 0,
                include_timestamps: false,
            })
            .await?;

        match response {
            Response::StreamStarted { .. } => Ok(()),
            other => Err(Error::Internal(format!("unexpected response: {other}"))),
        }
    }
}
