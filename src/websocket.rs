//! Per-endpoint WebSocket hub.
//!
//! Each device endpoint upgrades here, attaches to the session's `rx` and
//! broadcast topics, and dispatches client commands to its [`DeviceBackend`].
//! Binary frames from the device go out as WebSocket binary; protocol
//! messages go out as JSON text. The underlying connection permits one
//! writer at a time, so all writes go through a shared, deadline-guarded
//! sink.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::header::SEC_WEBSOCKET_PROTOCOL;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Extension;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::Error;
use crate::protocol::{Broadcast, Command, Message};
use crate::session::{Payload, SessionBroker, TOPIC_BROADCAST, TOPIC_RX, TOPIC_TX};

/// Subprotocol a client offers to keep the session from auto-connecting.
pub const MANUAL_CONNECT_PROTOCOL: &str = "manual-connect";

/// Writes must complete within this window or the connection is torn down;
/// a stalled client must never hold up a device reader.
const WRITE_DEADLINE: Duration = Duration::from_millis(50);

/// What a device session offers to its websocket hub.
#[async_trait]
pub trait DeviceBackend: Send + Sync + 'static {
    /// The session's current status message.
    async fn status(&self) -> Message;

    /// Connect to the device at `address`.
    async fn connect(&self, address: &str) -> Result<(), Error>;

    /// Drop the current device connection. Idempotent.
    async fn disconnect(&self);

    /// Browse for devices, yielding one `Discovered` message per entry
    /// until the duration elapses and the channel closes.
    async fn discover(&self, duration: Duration) -> mpsc::Receiver<Message>;

    /// Account for a new subscriber. `manual` is set when the client offered
    /// the manual-connect subprotocol.
    fn register_subscriber(&self, manual: bool);

    /// Account for a subscriber that went away.
    fn deregister_subscriber(&self);

    /// Whether a firmware update is in flight.
    fn is_updating(&self) -> bool;

    /// Run a firmware update, reporting progress and the final outcome
    /// through `progress`.
    async fn update_firmware(
        &self,
        serial_number: String,
        image: String,
        progress: mpsc::Sender<Message>,
    );
}

/// Everything a websocket endpoint needs: the session's broker and backend.
pub struct WsHub<B> {
    backend: Arc<B>,
    broker: SessionBroker,
}

impl<B> Clone for WsHub<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            broker: self.broker.clone(),
        }
    }
}

impl<B: DeviceBackend> WsHub<B> {
    /// Tie a backend to its session broker.
    pub fn new(backend: B, broker: SessionBroker) -> Self {
        Self {
            backend: Arc::new(backend),
            broker,
        }
    }
}

/// Upgrade handler for a device endpoint.
pub async fn ws_handler<B: DeviceBackend>(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Extension(hub): Extension<WsHub<B>>,
) -> impl IntoResponse {
    let manual = headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .map(|offered| {
            offered
                .split(',')
                .any(|protocol| protocol.trim() == MANUAL_CONNECT_PROTOCOL)
        })
        .unwrap_or(false);

    ws.protocols([MANUAL_CONNECT_PROTOCOL])
        .on_upgrade(move |socket| {
            handle_socket(socket, hub, manual).instrument(info_span!("ws", manual))
        })
}

/// Serializes writes to the socket and applies the write deadline.
struct MessageWriter {
    sink: Arc<Mutex<SplitSink<WebSocket, WsMessage>>>,
}

impl Clone for MessageWriter {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
        }
    }
}

impl MessageWriter {
    fn new(sink: SplitSink<WebSocket, WsMessage>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    async fn send(&self, message: WsMessage) -> Result<(), ()> {
        let mut sink = self.sink.lock().await;

        match timeout(WRITE_DEADLINE, sink.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                debug!(error = %e, "WebSocket write failed");
                Err(())
            }
            Err(_) => {
                warn!("WebSocket write deadline exceeded");
                Err(())
            }
        }
    }

    async fn send_binary(&self, frame: bytes::Bytes) -> Result<(), ()> {
        self.send(WsMessage::Binary(frame.to_vec())).await
    }

    async fn send_message(&self, message: &Message) -> Result<(), ()> {
        let text = serde_json::to_string(message).expect("Messages serialize");
        self.send(WsMessage::Text(text)).await
    }

    async fn send_broadcast(&self, message: Message) -> Result<(), ()> {
        let text = serde_json::to_string(&Broadcast { message }).expect("Broadcasts serialize");
        self.send(WsMessage::Text(text)).await
    }
}

async fn handle_socket<B: DeviceBackend>(socket: WebSocket, hub: WsHub<B>, manual: bool) {
    info!("WebSocket connection opened");

    hub.backend.register_subscriber(manual);

    let (sink, stream) = socket.split();
    let writer = MessageWriter::new(sink);
    let conn_cancel = CancellationToken::new();

    let rx = hub.broker.subscribe(TOPIC_RX);
    let broadcasts = hub.broker.subscribe(TOPIC_BROADCAST);

    let write_task = tokio::spawn(
        write_loop(
            conn_cancel.clone(),
            hub.broker.clone(),
            rx,
            broadcasts,
            writer.clone(),
        )
        .in_current_span(),
    );

    read_loop(&hub, &writer, &conn_cancel, stream).await;

    conn_cancel.cancel();
    let _ = write_task.await;
    hub.backend.deregister_subscriber();

    info!("WebSocket connection closed");
}

/// Copy device frames and broadcasts onto the socket until cancelled or a
/// write fails.
async fn write_loop(
    cancel: CancellationToken,
    broker: SessionBroker,
    mut rx: crate::broker::Subscription<Payload>,
    mut broadcasts: crate::broker::Subscription<Payload>,
    writer: MessageWriter,
) {
    loop {
        let sent = tokio::select! {
            _ = cancel.cancelled() => break,

            payload = rx.recv() => match payload {
                Some(Payload::Frame(frame)) => writer.send_binary(frame).await,
                Some(Payload::Message(message)) => writer.send_message(&message).await,
                None => break,
            },

            payload = broadcasts.recv() => match payload {
                Some(Payload::Message(message)) => writer.send_broadcast(message).await,
                Some(Payload::Frame(_)) => Ok(()),
                None => break,
            },
        };

        if sent.is_err() {
            // A failed or expired write tears the connection down; the read
            // loop observes the cancellation.
            cancel.cancel();
            break;
        }
    }

    broker.unsubscribe(&rx);
    broker.unsubscribe(&broadcasts);
}

async fn read_loop<B: DeviceBackend>(
    hub: &WsHub<B>,
    writer: &MessageWriter,
    cancel: &CancellationToken,
    mut stream: SplitStream<WebSocket>,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return,
            message = stream.next() => message,
        };

        let Some(Ok(message)) = message else { return };

        match message {
            WsMessage::Binary(frame) => {
                if hub.backend.is_updating() {
                    debug!("Ignoring device command during firmware update");
                    continue;
                }

                hub.broker.try_publish(TOPIC_TX, Payload::Frame(frame.into()));
            }

            WsMessage::Text(text) => {
                let command = match serde_json::from_str::<Command>(&text) {
                    Ok(command) => command,
                    Err(e) => {
                        warn!(raw = %text, error = %e, "Can not decode command");
                        continue;
                    }
                };

                // While updating, only the commands that cannot disturb the
                // device are honored.
                if hub.backend.is_updating()
                    && !matches!(command, Command::GetStatus | Command::Discover { .. })
                {
                    debug!(?command, "Ignoring command during firmware update");
                    continue;
                }

                dispatch_command(hub, writer, command).await;
            }

            WsMessage::Close(_) => {
                debug!("Client disconnected");
                return;
            }

            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
        }
    }
}

async fn dispatch_command<B: DeviceBackend>(
    hub: &WsHub<B>,
    writer: &MessageWriter,
    command: Command,
) {
    debug!(?command, "Received command");

    match command {
        Command::GetStatus => {
            let status = hub.backend.status().await;
            let _ = writer.send_message(&status).await;
        }

        Command::Connect { address } => {
            if let Err(e) = hub.backend.connect(&address).await {
                warn!(%address, error = %e, "Connect failed");
            }
        }

        Command::Disconnect => hub.backend.disconnect().await,

        Command::Discover { duration } => {
            let mut entries = hub
                .backend
                .discover(Duration::from_secs(duration))
                .await;

            let writer = writer.clone();
            tokio::spawn(
                async move {
                    while let Some(message) = entries.recv().await {
                        if writer.send_message(&message).await.is_err() {
                            return;
                        }
                    }
                    debug!("Discovery finished");
                }
                .in_current_span(),
            );
        }

        Command::UpdateFirmware {
            serial_number,
            image,
        } => {
            let (progress_tx, mut progress_rx) = mpsc::channel(8);

            {
                let writer = writer.clone();
                tokio::spawn(
                    async move {
                        while let Some(message) = progress_rx.recv().await {
                            if writer.send_message(&message).await.is_err() {
                                return;
                            }
                        }
                    }
                    .in_current_span(),
                );
            }

            let backend = Arc::clone(&hub.backend);
            tokio::spawn(
                async move {
                    backend
                        .update_firmware(serial_number, image, progress_tx)
                        .await;
                }
                .in_current_span(),
            );
        }
    }
}
