//! Handles incoming websockets: one read task dispatching requests, one write
//! task serialising response frames, and per-connection stream bookkeeping.

use std::collections::HashMap;

use axum::{
    extract::{ws::Message, WebSocketUpgrade},
    response::IntoResponse,
    Extension, TypedHeader,
};
use futures::{sink::Sink, stream::Stream, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    actions::{Request, Response, ResponseResult},
    error::Error,
    facade::{Facade, StreamSubscription},
};

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    user_agent: Option<TypedHeader<headers::UserAgent>>,
    Extension(facade): Extension<Facade>,
) -> impl IntoResponse {
    if let Some(TypedHeader(user_agent)) = user_agent {
        debug!("`{}` connected", user_agent.as_str());
    }

    ws.on_upgrade(|socket| handle_sink_stream(socket, facade))
}

/// Per-connection state the read task maintains.
#[derive(Default)]
struct ConnectionState {
    /// Cancellation for each stream this connection subscribed to, by port.
    streams: HashMap<String, CancellationToken>,

    /// Running totals of the connection's write stream.
    stream_bytes_written: u64,
    stream_chunks_processed: u32,
}

/// Forward reader events to the client as chunk frames until the stream is
/// cancelled, the reader stops, or the client goes away.
///
/// Transient errors are skipped; a fatal error ends the stream. The
/// subscription is handed back so the caller can release it.
async fn forward_chunks(
    port_name: &str,
    include_timestamps: bool,
    mut subscription: StreamSubscription,
    sender: &mpsc::UnboundedSender<ResponseResult>,
    cancelled: CancellationToken,
) -> StreamSubscription {
    loop {
        let event = tokio::select! {
            _ = cancelled.cancelled() => break,
            event = subscription.events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        if let Some(e) = &event.error {
            if e.is_fatal_for_streaming() {
                break;
            }
            continue;
        }

        let chunk = Facade::chunk_from_event(port_name, &event, include_timestamps);
        if sender.send(Ok(Response::Chunk(chunk))).is_err() {
            debug!(%port_name, "Client gone, ending stream");
            break;
        }
    }

    subscription
}

async fn handle_request(
    request: Request,
    facade: &Facade,
    state: &mut ConnectionState,
    sender: &mpsc::UnboundedSender<ResponseResult>,
) -> Option<ResponseResult> {
    match request {
        Request::ListPorts { only_available } => Some(
            facade
                .list_ports(only_available)
                .await
                .map(Response::Ports),
        ),
        Request::GetPortInfo { port_name } => {
            Some(facade.get_port_info(port_name).await.map(Response::Port))
        }
        Request::OpenPort {
            port_name,
            settings,
            client_id,
            exclusive,
        } => Some(
            facade
                .open_port(port_name, settings, client_id, exclusive)
                .await,
        ),
        Request::ClosePort {
            port_name,
            session_id,
        } => {
            // The facade stops the port's reader; our forwarder just needs to
            // let go of its subscription.
            if let Some(cancel) = state.streams.remove(&port_name) {
                cancel.cancel();
            }
            Some(facade.close_port(port_name, session_id).await)
        }
        Request::GetPortStatus { port_name } => Some(
            facade
                .get_port_status(port_name)
                .await
                .map(Response::Status),
        ),
        Request::Write {
            port_name,
            session_id,
            data,
            flush,
        } => Some(facade.write(port_name, session_id, data, flush).await),
        Request::Read {
            port_name,
            session_id,
            max_bytes,
            timeout_ms,
        } => Some(
            facade
                .read(port_name, session_id, max_bytes, timeout_ms)
                .await,
        ),
        Request::StreamRead {
            port_name,
            session_id,
            chunk_size,
            include_timestamps,
        } => {
            if state.streams.contains_key(&port_name) {
                return Some(Err(Error::InvalidArgument(format!(
                    "already streaming {port_name} on this connection"
                ))));
            }

            match facade.stream_read(
                port_name.clone(),
                session_id,
                chunk_size,
                include_timestamps,
            ) {
                Ok(subscription) => {
                    let cancel = CancellationToken::new();
                    state.streams.insert(port_name.clone(), cancel.clone());

                    let facade = facade.clone();
                    let sender = sender.clone();
                    let name = port_name.clone();
                    tokio::spawn(async move {
                        let subscription = forward_chunks(
                            &name,
                            include_timestamps,
                            subscription,
                            &sender,
                            cancel,
                        )
                        .await;

                        facade.release_stream(subscription);
                        let _ = sender.send(Ok(Response::StreamStopped { port_name: name }));
                    });

                    Some(Ok(Response::StreamStarted { port_name }))
                }
                Err(e) => Some(Err(e)),
            }
        }
        Request::StopStream { port_name } => match state.streams.remove(&port_name) {
            Some(cancel) => {
                // The forwarder replies with `StreamStopped` once it let go.
                cancel.cancel();
                None
            }
            // Nothing streaming; still answer so stops stay idempotent.
            None => Some(Ok(Response::StreamStopped { port_name })),
        },
        Request::WriteChunk(chunk) => match facade.write_chunk(chunk).await {
            Ok(written) => {
                state.stream_bytes_written += written as u64;
                state.stream_chunks_processed += 1;
                None
            }
            Err(e) => Some(Err(e)),
        },
        Request::EndWriteStream => {
            let response = Response::StreamWriteComplete {
                success: true,
                total_bytes_written: state.stream_bytes_written,
                chunks_processed: state.stream_chunks_processed,
                message: "stream completed successfully".into(),
            };
            state.stream_bytes_written = 0;
            state.stream_chunks_processed = 0;
            Some(Ok(response))
        }
        Request::ConfigurePort {
            port_name,
            session_id,
            settings,
        } => Some(
            facade
                .configure_port(port_name, session_id, settings)
                .await,
        ),
        Request::GetPortConfig { port_name } => Some(
            facade
                .get_port_config(port_name)
                .await
                .map(Response::Settings),
        ),
        Request::Ping { message } => Some(Ok(facade.ping(message))),
        Request::GetAgentInfo => Some(Ok(Response::Agent(facade.agent_info()))),
    }
}

pub(crate) async fn read<S>(
    mut receiver: S,
    sender: mpsc::UnboundedSender<ResponseResult>,
    facade: Facade,
) where
    S: Unpin,
    S: Stream<Item = Result<Message, axum::Error>>,
{
    let mut state = ConnectionState::default();

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(request_text) => {
                let reply = match serde_json::from_str::<'_, Request>(&request_text) {
                    Ok(request) => {
                        debug!(%request, "Client request");
                        handle_request(request, &facade, &mut state, &sender).await
                    }
                    Err(e) => {
                        debug!(%e, "Client sent a bad request");
                        Some(Err(Error::BadJson(request_text)))
                    }
                };

                if let Some(reply) = reply {
                    if sender.send(reply).is_err() {
                        break;
                    }
                }
            }
            Message::Binary(_) => {
                debug!("client sent binary data, ignoring");
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => {
                debug!("client disconnected");
            }
        }
    }

    // Connection gone: the forwarders release their subscriptions, and the
    // port readers stop once their last subscriber is gone.
    for (port_name, cancel) in state.streams.drain() {
        debug!(%port_name, "Connection closed, releasing stream");
        cancel.cancel();
    }
}

pub(crate) async fn write(
    mut sender: impl Sink<Message> + Unpin,
    mut receiver: mpsc::UnboundedReceiver<ResponseResult>,
) {
    while let Some(response) = receiver.recv().await {
        let response = match serde_json::to_string(&response) {
            Ok(response) => response,
            Err(e) => {
                warn!(%e, "Could not serialize response");
                continue;
            }
        };

        if sender.send(Message::Text(response)).await.is_err() {
            debug!("client disconnected");
            return;
        }
    }
}

pub(crate) async fn handle_sink_stream<S>(stream: S, facade: Facade)
where
    S: Stream<Item = Result<Message, axum::Error>>,
    S: Sink<Message>,
    S: Send,
    S: 'static,
{
    let (stream_sender, stream_receiver) = stream.split();

    let (response_sender, response_receiver) = mpsc::unbounded_channel::<ResponseResult>();

    tokio::spawn(write(stream_sender, response_receiver));
    tokio::spawn(read(stream_receiver, response_sender, facade));
}
