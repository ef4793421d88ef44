//! The Flex device session.
//!
//! Owns the currently connected Flex mat: opens the serial port, selects the
//! framer for the device family, broadcasts status transitions and runs the
//! auto-connect scheduler. At most one device is connected at a time;
//! connection changes are serialized by a mutex.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::broker::Broker;
use crate::enumerator::{conceal_passthru, DeviceEnumerator, DeviceFamily, MatchedDevice};
use crate::error::Error;
use crate::protocol::{DeviceInfo, Message};
use crate::session::{broadcast, SessionBroker, TOPIC_TX};
use crate::websocket::DeviceBackend;

pub(crate) mod passthru;
pub(crate) mod sensing_tex;
pub(crate) mod sensitronics;

/// How often the scheduler scans for devices while none is connected.
const AUTO_CONNECT_PERIOD: Duration = Duration::from_secs(2);

const BAUD_RATE: u32 = 115_200;

/// Handle to the Flex session singleton.
#[derive(Clone)]
pub struct FlexHandle {
    shared: Arc<Shared>,
}

struct Shared {
    broker: SessionBroker,
    enumerator: DeviceEnumerator,
    cancel: CancellationToken,
    state: Mutex<ConnectionState>,
    subscribers: StdMutex<Subscribers>,
}

#[derive(Default)]
struct ConnectionState {
    current: Option<MatchedDevice>,
    conn_cancel: Option<CancellationToken>,

    /// Increases with every connection, so a stale teardown can recognize
    /// that a newer connection has taken over.
    conn_seq: u64,
}

#[derive(Default)]
struct Subscribers {
    count: usize,
    auto_connect: bool,
}

impl FlexHandle {
    /// Create the session under the given cancellation scope.
    ///
    /// The session owns its broker and shuts it down when the scope ends.
    /// The auto-connect scheduler starts immediately but stays idle until a
    /// non-manual subscriber registers.
    pub fn new(cancel: CancellationToken, enumerator: DeviceEnumerator) -> Self {
        let shared = Arc::new(Shared {
            broker: Broker::new(crate::broker::SUBSCRIBER_CAPACITY),
            enumerator,
            cancel: cancel.clone(),
            state: Mutex::new(ConnectionState::default()),
            subscribers: StdMutex::new(Subscribers::default()),
        });

        {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                shared.cancel.cancelled().await;
                shared.broker.shutdown();
            });
        }

        {
            let shared = Arc::clone(&shared);
            tokio::spawn(auto_connect_loop(shared).instrument(info_span!("flex-auto-connect")));
        }

        Self { shared }
    }

    /// The session's broker, for attaching websocket subscribers.
    pub fn broker(&self) -> SessionBroker {
        self.shared.broker.clone()
    }

    /// Connect to a specific matched device.
    pub async fn connect_device(&self, device: MatchedDevice) -> Result<(), Error> {
        connect_device(&self.shared, device).await
    }

    /// Cancel the current connection, if any. Idempotent.
    pub async fn disconnect(&self) {
        self.shared.disconnect().await
    }
}

impl Shared {
    fn status_message(device: &MatchedDevice) -> Message {
        Message::connected(
            device.info.path.clone(),
            DeviceInfo::Flex {
                usb_device: conceal_passthru(&device.info),
            },
        )
    }

    async fn teardown(&self, seq: u64) {
        let mut state = self.state.lock().await;

        // A newer connection has taken over; nothing to clean up.
        if state.conn_seq != seq {
            return;
        }

        state.conn_cancel = None;
        if state.current.take().is_some() {
            info!("Disconnected from serial port");
            broadcast(&self.broker, Message::disconnected());
        }
    }

    async fn disconnect(&self) {
        let mut state = self.state.lock().await;

        if let Some(cancel) = state.conn_cancel.take() {
            info!("Disconnecting from serial port");
            cancel.cancel();
        }

        if state.current.take().is_some() {
            broadcast(&self.broker, Message::disconnected());
        }
    }

    fn scheduler_armed(&self) -> bool {
        let subscribers = self.subscribers.lock().expect("Subscriber lock poisoned");
        subscribers.auto_connect && subscribers.count > 0
    }
}

async fn connect_device(shared: &Arc<Shared>, device: MatchedDevice) -> Result<(), Error> {
    let mut state = shared.state.lock().await;

    // Connecting to the already-connected device is a no-op.
    if state.current.as_ref() == Some(&device) {
        return Ok(());
    }

    if let Some(cancel) = state.conn_cancel.take() {
        cancel.cancel();
    }

    info!(path = %device.info.path, family = ?device.family, "Attempting to connect with serial port");
    let port = tokio_serial::new(&device.info.path, BAUD_RATE)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .open_native_async()
        .map_err(|source| Error::PortOpen {
            path: device.info.path.clone(),
            source,
        })?;

    state.conn_seq += 1;
    let seq = state.conn_seq;
    let conn_cancel = shared.cancel.child_token();
    state.conn_cancel = Some(conn_cancel.clone());
    state.current = Some(device.clone());

    broadcast(&shared.broker, Shared::status_message(&device));

    let shared = Arc::clone(shared);
    let commands = shared.broker.subscribe(TOPIC_TX);
    let broker = shared.broker.clone();
    let span = info_span!("framer", path = %device.info.path);

    tokio::spawn(
        async move {
            match device.family {
                DeviceFamily::SensingTex => {
                    sensing_tex::run(port, conn_cancel, commands, broker).await
                }
                DeviceFamily::Sensitronics => {
                    sensitronics::run(port, conn_cancel, commands, broker).await
                }
                DeviceFamily::Passthru => passthru::run(port, conn_cancel, commands, broker).await,
            }

            // The port is closed by dropping; the rest of the teardown runs
            // exactly once, whether we were cancelled or the port went away.
            shared.teardown(seq).await;
        }
        .instrument(span),
    );

    Ok(())
}

/// Scan for matching devices every tick and connect to the first that
/// accepts, as long as no device is connected and no subscriber asked for
/// manual connection handling.
async fn auto_connect_loop(shared: Arc<Shared>) {
    let mut ticker = interval(AUTO_CONNECT_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if !shared.scheduler_armed() {
            continue;
        }

        if shared.state.lock().await.current.is_some() {
            continue;
        }

        for device in shared.enumerator.matching_devices() {
            match connect_device(&shared, device).await {
                Ok(()) => break,
                Err(e) => debug!(error = %e, "Auto-connect attempt failed"),
            }
        }
    }
}

#[async_trait]
impl DeviceBackend for FlexHandle {
    async fn status(&self) -> Message {
        let state = self.shared.state.lock().await;
        match &state.current {
            Some(device) => Shared::status_message(device),
            None => Message::disconnected(),
        }
    }

    async fn connect(&self, address: &str) -> Result<(), Error> {
        let device = self
            .shared
            .enumerator
            .device_at(address)
            .ok_or_else(|| Error::NoSuchDevice(address.to_string()))?;

        connect_device(&self.shared, device).await
    }

    async fn disconnect(&self) {
        self.shared.disconnect().await
    }

    async fn discover(&self, duration: Duration) -> mpsc::Receiver<Message> {
        // Discovery for Flex is a snapshot of the current enumeration; the
        // channel closes as soon as it is drained.
        let devices = if duration.is_zero() {
            Vec::new()
        } else {
            self.shared.enumerator.matching_devices()
        };

        let (tx, rx) = mpsc::channel(devices.len().max(1));
        for device in devices {
            let message = Message::discovered(DeviceInfo::Flex {
                usb_device: conceal_passthru(&device.info),
            });
            if tx.try_send(message).is_err() {
                break;
            }
        }

        rx
    }

    fn register_subscriber(&self, manual: bool) {
        let mut subscribers = self
            .shared
            .subscribers
            .lock()
            .expect("Subscriber lock poisoned");

        subscribers.count += 1;

        // Last subscriber wins: a later non-manual client re-arms the
        // scheduler even if an earlier one opted out.
        subscribers.auto_connect = !manual;
        debug!(
            count = subscribers.count,
            auto_connect = subscribers.auto_connect,
            "Flex subscriber registered"
        );
    }

    fn deregister_subscriber(&self) {
        let disconnect = {
            let mut subscribers = self
                .shared
                .subscribers
                .lock()
                .expect("Subscriber lock poisoned");

            subscribers.count = subscribers.count.saturating_sub(1);
            debug!(count = subscribers.count, "Flex subscriber deregistered");

            if subscribers.count == 0 {
                subscribers.auto_connect = false;
                true
            } else {
                false
            }
        };

        if disconnect {
            let handle = self.clone();
            tokio::spawn(async move { handle.disconnect().await });
        }
    }

    fn is_updating(&self) -> bool {
        false
    }

    async fn update_firmware(
        &self,
        _serial_number: String,
        _image: String,
        progress: mpsc::Sender<Message>,
    ) {
        warn!("Firmware update requested for Flex, which has no update path");
        let _ = progress
            .send(Message::FirmwareUpdateFailure {
                message: "Firmware updates are not supported for Flex devices".into(),
            })
            .await;
    }
}
