//! RFID reader endpoint.
//!
//! The RFID session is by far the simplest one: a single broker topic
//! carrying identified-token messages to every subscriber. Card polling
//! starts with the first subscriber and stops with the last. The smart-card
//! plumbing itself lives behind [`poll_smart_card`]; this module only owns
//! the fan-out and the HTTP surface.

use std::sync::{Arc, Mutex as StdMutex};

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use crate::broker::Broker;

const TOPIC_TOKENS: &str = "rfid-tokens";

const WRITE_DEADLINE: Duration = Duration::from_millis(50);

/// A message sent to RFID subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum RfidMessage {
    /// A card was identified.
    Identified {
        /// The token read from the card.
        token: String,
    },
}

/// Handle to the RFID session singleton.
#[derive(Clone)]
pub struct RfidHandle {
    shared: Arc<Shared>,
}

struct Shared {
    broker: Broker<RfidMessage>,
    cancel: CancellationToken,
    polling: StdMutex<Polling>,
}

#[derive(Default)]
struct Polling {
    subscriber_count: usize,
    cancel: Option<CancellationToken>,
}

impl RfidHandle {
    /// Create the session under the given cancellation scope.
    pub fn new(cancel: CancellationToken) -> Self {
        let shared = Arc::new(Shared {
            broker: Broker::new(2),
            cancel: cancel.clone(),
            polling: StdMutex::new(Polling::default()),
        });

        {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                shared.cancel.cancelled().await;
                shared.broker.shutdown();
            });
        }

        Self { shared }
    }

    /// Names of the attached card readers.
    pub fn readers(&self) -> Vec<String> {
        // The PC/SC integration reports readers here once attached.
        Vec::new()
    }

    fn ensure_polling(&self) {
        let mut polling = self.shared.polling.lock().expect("Polling lock poisoned");

        if polling.cancel.is_none() {
            let cancel = self.shared.cancel.child_token();
            polling.cancel = Some(cancel.clone());

            let broker = self.shared.broker.clone();
            tokio::spawn(
                poll_smart_card(cancel, move |token| {
                    broker.try_publish(TOPIC_TOKENS, RfidMessage::Identified { token });
                })
                .instrument(info_span!("rfid-polling")),
            );
        }

        polling.subscriber_count += 1;
    }

    fn deregister_subscriber(&self) {
        let mut polling = self.shared.polling.lock().expect("Polling lock poisoned");

        polling.subscriber_count = polling.subscriber_count.saturating_sub(1);
        if polling.subscriber_count == 0 {
            if let Some(cancel) = polling.cancel.take() {
                debug!("Last RFID subscriber left, stopping polling");
                cancel.cancel();
            }
        }
    }
}

/// Poll attached smart-card readers and feed identified tokens into
/// `on_token`.
///
/// This is the seam to the PC/SC layer; without it no tokens are produced
/// and the task idles until cancelled.
async fn poll_smart_card(cancel: CancellationToken, _on_token: impl Fn(String) + Send + 'static) {
    cancel.cancelled().await;
}

pub(crate) async fn readers(Extension(handle): Extension<RfidHandle>) -> impl IntoResponse {
    #[derive(Serialize)]
    struct Readers {
        readers: Vec<String>,
    }

    Json(Readers {
        readers: handle.readers(),
    })
}

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(handle): Extension<RfidHandle>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, handle).instrument(info_span!("rfid-ws")))
}

async fn handle_socket(socket: WebSocket, handle: RfidHandle) {
    info!("WebSocket connection opened");

    handle.ensure_polling();

    let mut tokens = handle.shared.broker.subscribe(TOPIC_TOKENS);
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            message = tokens.recv() => {
                let Some(message) = message else { break };
                let text = serde_json::to_string(&message).expect("Messages serialize");

                match timeout(WRITE_DEADLINE, sink.send(WsMessage::Text(text))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }

            // Clients have nothing to say on this endpoint; reads only
            // track the connection's liveness.
            message = stream.next() => match message {
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    handle.shared.broker.unsubscribe(&tokens);
    handle.deregister_subscriber();

    info!("WebSocket connection closed");
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn identified_wire_format() {
        let message = RfidMessage::Identified {
            token: "cafe".into(),
        };

        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"type":"Identified","token":"cafe"}"#
        );
    }

    #[tokio::test]
    async fn polling_stops_with_the_last_subscriber() {
        let handle = RfidHandle::new(CancellationToken::new());

        handle.ensure_polling();
        handle.ensure_polling();

        let first_cancel = handle
            .shared
            .polling
            .lock()
            .unwrap()
            .cancel
            .clone()
            .expect("Polling should be running");

        handle.deregister_subscriber();
        assert!(!first_cancel.is_cancelled());

        handle.deregister_subscriber();
        assert!(first_cancel.is_cancelled());

        // A returning subscriber restarts polling.
        handle.ensure_polling();
        assert!(handle.shared.polling.lock().unwrap().cancel.is_some());
    }
}
