#![allow(dead_code)]

use std::time::Duration;

use axum::http::StatusCode;
use color_eyre::Result;
use futures::{SinkExt, StreamExt};
use senso_bridge::config::Config;
use senso_bridge::protocol::{Command, Message};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn start_server() -> u16 {
    start_server_with_config(Config {
        test_mode: true,
        ..Config::default()
    })
    .await
}

pub async fn start_server_with_config(config: Config) -> u16 {
    let (port_tx, port_rx) = oneshot::channel();

    tokio::spawn(async move { senso_bridge::server::run_any_port(config, port_tx).await });
    port_rx
        .await
        .expect("Server should reply with allocated port")
}

pub async fn connect(port: u16, path: &str, subprotocol: Option<&str>) -> Result<Client> {
    let mut request = format!("ws://127.0.0.1:{port}{path}").into_client_request()?;
    if let Some(subprotocol) = subprotocol {
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, subprotocol.parse()?);
    }

    let (stream, http_response) = tokio_tungstenite::connect_async(request).await?;
    assert_eq!(http_response.status(), StatusCode::SWITCHING_PROTOCOLS);

    Ok(stream)
}

pub async fn send_command(client: &mut Client, command: &Command) -> Result<()> {
    let text = serde_json::to_string(command)?;
    client.send(WsMessage::Text(text)).await?;
    Ok(())
}

/// Receive the next text message, skipping any binary frames.
pub async fn receive_message(client: &mut Client) -> Result<Message> {
    loop {
        let frame = timeout(Duration::from_secs(5), client.next())
            .await?
            .ok_or_else(|| color_eyre::eyre::eyre!("Stream closed"))??;

        if let WsMessage::Text(text) = frame {
            return Ok(serde_json::from_str(&text)?);
        }
    }
}

/// Expect silence on the socket for a little while.
pub async fn expect_no_message(client: &mut Client) {
    let silence = timeout(Duration::from_millis(500), client.next()).await;
    assert!(silence.is_err(), "Expected no further messages");
}

pub async fn register_mock(
    port: u16,
    name: &str,
    vid: &str,
    manufacturer: &str,
    product: &str,
    serial: &str,
) -> u32 {
    let response = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/flex/mock/"))
        .json(&serde_json::json!({
            "name": name,
            "vid": vid,
            "pid": "0486",
            "bcdDevice": "0277",
            "serialNumber": serial,
            "manufacturer": manufacturer,
            "product": product,
        }))
        .send()
        .await
        .expect("Mock registration should succeed");

    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let body: serde_json::Value = response.json().await.expect("Registration returns JSON");
    body["id"].as_u64().expect("Registration returns an id") as u32
}
