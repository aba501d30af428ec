#![allow(dead_code)]

use std::time::Duration;

use axum::http::StatusCode;
use color_eyre::Result;
use futures::{SinkExt, StreamExt};
use serial_bridge::{
    actions::{Request, Response, ResponseResult},
    config::Config,
    mock::LoopbackOpener,
    server,
};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::info;

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A config suited to loopback-backed tests: short driver timeouts, no
/// hotplug watcher.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.serial.scan_interval_secs = 0;
    config.serial.defaults.read_timeout_ms = 20;
    config
}

pub async fn start_server_with(config: Config) -> Result<u16> {
    let (port_tx, port_rx) = oneshot::channel();

    tokio::spawn(async move {
        server::run_any_port_with(config, Box::new(LoopbackOpener::new()), port_tx).await
    });

    let port = port_rx
        .await
        .expect("Server should reply with allocated port");

    Ok(port)
}

pub async fn connect(port: u16) -> Result<WsClient> {
    info!("Connecting to server on port {port}");
    let (stream, http_response) =
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/ws")).await?;

    assert_eq!(http_response.status(), StatusCode::SWITCHING_PROTOCOLS);

    Ok(stream)
}

pub async fn start_server_and_connect() -> Result<WsClient> {
    let port = start_server_with(test_config()).await?;
    connect(port).await
}

pub async fn receive(client: &mut WsClient) -> Result<ResponseResult> {
    let response = timeout(Duration::from_secs(5), client.next())
        .await?
        .ok_or_else(|| color_eyre::eyre::eyre!("Stream closed"))??;

    let response = response.to_text()?;
    let response = serde_json::from_str(response)?;

    Ok(response)
}

pub async fn send_raw(client: &mut WsClient, to_send: String) -> Result<ResponseResult> {
    client.send(tungstenite::Message::Text(to_send)).await?;
    receive(client).await
}

pub async fn send_receive(client: &mut WsClient, request: &Request) -> Result<ResponseResult> {
    send_raw(client, request.serialize()).await
}

pub async fn open_port_as(
    client: &mut WsClient,
    port_name: &str,
    client_id: &str,
    exclusive: bool,
) -> Result<Response> {
    Ok(send_receive(
        client,
        &Request::OpenPort {
            port_name: port_name.into(),
            settings: None,
            client_id: client_id.into(),
            exclusive,
        },
    )
    .await??)
}

/// Open a port exclusively and return the session id.
pub async fn open_port(client: &mut WsClient, port_name: &str) -> Result<String> {
    match open_port_as(client, port_name, "test-client", true).await? {
        Response::Opened {
            success: true,
            session_id: Some(session_id),
            ..
        } => Ok(session_id),
        other => Err(color_eyre::eyre::eyre!("open failed: {other}")),
    }
}
