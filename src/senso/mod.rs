//! The Senso device session.
//!
//! A Senso exposes two TCP channels on the same host: a data channel pushing
//! measurement frames and a control channel answering commands. Both feed
//! the session's `rx` topic; only the control channel transmits. Each
//! channel reconnects on its own with exponential backoff, and the control
//! channel doubles as the liveness monitor.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::broker::Broker;
use crate::error::Error;
use crate::firmware::{self, UpdateState};
use crate::protocol::{DeviceInfo, Message, ServiceEntry};
use crate::session::{broadcast, Payload, SessionBroker, TOPIC_NO_TX, TOPIC_RX, TOPIC_TX};
use crate::websocket::DeviceBackend;

pub(crate) mod packet;

/// TCP port of the measurement data channel.
pub const DATA_PORT: u16 = 55568;

/// TCP port of the control channel.
pub const CONTROL_PORT: u16 = 55567;

/// The mDNS service a Senso announces itself under.
pub const SERVICE_TYPE: &str = "_sensoControl._tcp.local.";

/// Idle time on the control channel before a liveness probe is sent.
const IDLE_PROBE_PERIOD: Duration = Duration::from_secs(5);

/// How long the probe may go unanswered before both channels are torn down.
const PROBE_DEADLINE: Duration = Duration::from_secs(2);

/// The data channel is brought up this long before the control channel.
const CONTROL_START_DELAY: Duration = Duration::from_secs(1);

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Handle to the Senso session singleton.
#[derive(Clone)]
pub struct SensoHandle {
    shared: Arc<Shared>,
}

struct Shared {
    broker: SessionBroker,
    cancel: CancellationToken,
    state: Mutex<ConnectionState>,
    updating: UpdateState,
    data_port: u16,
    control_port: u16,
}

#[derive(Default)]
struct ConnectionState {
    address: Option<String>,
    conn_cancel: Option<CancellationToken>,
}

enum Exit {
    Cancelled,
    LivenessExpired,
}

impl SensoHandle {
    /// Create the session under the given cancellation scope.
    pub fn new(cancel: CancellationToken) -> Self {
        Self::with_ports(cancel, DATA_PORT, CONTROL_PORT)
    }

    /// Create a session talking to non-standard ports. Tests use this to
    /// run against local listeners.
    pub fn with_ports(cancel: CancellationToken, data_port: u16, control_port: u16) -> Self {
        let shared = Arc::new(Shared {
            broker: Broker::new(crate::broker::SUBSCRIBER_CAPACITY),
            cancel: cancel.clone(),
            state: Mutex::new(ConnectionState::default()),
            updating: UpdateState::default(),
            data_port,
            control_port,
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

    /// The session's broker, for attaching websocket subscribers.
    pub fn broker(&self) -> SessionBroker {
        self.shared.broker.clone()
    }

    /// Connect to the Senso at `address`, dropping any current connection.
    pub async fn connect_to(&self, address: &str) -> Result<(), Error> {
        // A device mid-update must not be disturbed by a new connection.
        if self.shared.updating.is_updating() {
            return Err(Error::Firmware(
                "A firmware update is in progress".to_string(),
            ));
        }

        let mut state = self.shared.state.lock().await;

        if let Some(cancel) = state.conn_cancel.take() {
            info!("Disconnecting from Senso");
            cancel.cancel();
        }

        info!(address, "Attempting to connect with Senso");
        state.address = Some(address.to_string());

        let conn_cancel = self.shared.cancel.child_token();
        state.conn_cancel = Some(conn_cancel.clone());

        broadcast(
            &self.shared.broker,
            Message::Status {
                address: state.address.clone(),
                device: None,
            },
        );

        let shared = Arc::clone(&self.shared);
        let address = address.to_string();
        tokio::spawn(
            run_connection(shared, conn_cancel, address).instrument(info_span!("senso-connection")),
        );

        Ok(())
    }
}

impl Shared {
    async fn disconnect(&self) {
        let mut state = self.state.lock().await;

        if let Some(cancel) = state.conn_cancel.take() {
            info!("Disconnecting from Senso");
            cancel.cancel();
            state.address = None;
            broadcast(&self.broker, Message::disconnected());
        }
    }
}

/// Keep both channels of one connection alive until cancelled.
///
/// The channels are recreated together whenever the liveness probe goes
/// unanswered; everything else is handled by the per-channel reconnect
/// loops.
async fn run_connection(shared: Arc<Shared>, cancel: CancellationToken, address: String) {
    let data_addr = format!("{}:{}", address, shared.data_port);
    let control_addr = format!("{}:{}", address, shared.control_port);

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let pair = cancel.child_token();

        let data_task = {
            let pair = pair.clone();
            let broker = shared.broker.clone();
            let addr = data_addr.clone();
            // The data channel subscribes to a topic nothing publishes to:
            // outbound traffic belongs to the control channel alone.
            let commands = shared.broker.subscribe(TOPIC_NO_TX);
            tokio::spawn(
                async move { tcp_channel(pair, addr, commands, false, broker).await }
                    .instrument(info_span!("channel", kind = "data")),
            )
        };

        tokio::select! {
            _ = pair.cancelled() => {}
            _ = sleep(CONTROL_START_DELAY) => {}
        }

        let commands = shared.broker.subscribe(TOPIC_TX);
        let exit = tcp_channel(
            pair.clone(),
            control_addr.clone(),
            commands,
            true,
            shared.broker.clone(),
        )
        .instrument(info_span!("channel", kind = "control"))
        .await;

        pair.cancel();
        let _ = data_task.await;

        match exit {
            Exit::Cancelled => return,
            Exit::LivenessExpired => {
                warn!("Senso went silent, reconnecting both channels");
            }
        }
    }
}

/// One persistent TCP channel.
///
/// Reconnects with exponential backoff, publishes everything it reads to the
/// `rx` topic and writes subscribed commands verbatim. With `liveness` set,
/// an idle period triggers a status request with a hard response deadline.
async fn tcp_channel(
    cancel: CancellationToken,
    addr: String,
    mut commands: crate::broker::Subscription<Payload>,
    liveness: bool,
    broker: SessionBroker,
) -> Exit {
    let mut backoff = INITIAL_BACKOFF;

    'reconnect: loop {
        if cancel.is_cancelled() {
            return Exit::Cancelled;
        }

        debug!(%addr, "Connecting");
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Exit::Cancelled,
            connected = TcpStream::connect(&addr) => match connected {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(%addr, error = %e, "Connection failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => return Exit::Cancelled,
                        _ = sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue 'reconnect;
                }
            }
        };

        info!(%addr, "Connected");
        backoff = INITIAL_BACKOFF;

        let (mut read_half, mut write_half) = stream.into_split();
        let mut buf = vec![0u8; 4096];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Exit::Cancelled,

                command = commands.recv() => {
                    let data = match command {
                        Some(Payload::Frame(data)) => data,
                        Some(Payload::Message(_)) => continue,
                        // The topic closes when the session's broker
                        // shuts down.
                        None => return Exit::Cancelled,
                    };

                    if let Err(e) = write_half.write_all(&data).await {
                        warn!(error = %e, "Write failed");
                        continue 'reconnect;
                    }
                }

                read = timeout(IDLE_PROBE_PERIOD, tokio::io::AsyncReadExt::read(&mut read_half, &mut buf)) => match read {
                    Ok(Ok(0)) => {
                        warn!("Peer closed the connection");
                        continue 'reconnect;
                    }
                    Ok(Ok(n)) => {
                        if liveness {
                            packet::log_response(&buf[..n]);
                        }
                        broker.try_publish(TOPIC_RX, Payload::Frame(Bytes::copy_from_slice(&buf[..n])));
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "Read failed");
                        continue 'reconnect;
                    }
                    Err(_idle) => {
                        if !liveness {
                            continue;
                        }

                        debug!("Channel idle, probing");
                        if let Err(e) = write_half.write_all(&packet::get_status_probe()).await {
                            warn!(error = %e, "Probe write failed");
                            continue 'reconnect;
                        }

                        match timeout(PROBE_DEADLINE, tokio::io::AsyncReadExt::read(&mut read_half, &mut buf)).await {
                            Ok(Ok(0)) => {
                                warn!("Peer closed the connection");
                                continue 'reconnect;
                            }
                            Ok(Ok(n)) => {
                                packet::log_response(&buf[..n]);
                                broker.try_publish(TOPIC_RX, Payload::Frame(Bytes::copy_from_slice(&buf[..n])));
                            }
                            Ok(Err(e)) => {
                                warn!(error = %e, "Read failed");
                                continue 'reconnect;
                            }
                            Err(_deadline) => {
                                warn!("No response to status probe");
                                return Exit::LivenessExpired;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Browse for Senso services for the given duration.
///
/// The channel closes when the duration elapses; a zero duration closes it
/// without emitting anything.
pub(crate) fn browse_services(duration: Duration) -> mpsc::Receiver<ServiceEntry> {
    let (tx, rx) = mpsc::channel(16);

    if duration.is_zero() {
        return rx;
    }

    tokio::spawn(async move {
        let daemon = match ServiceDaemon::new() {
            Ok(daemon) => daemon,
            Err(e) => {
                warn!(error = %e, "Could not start mDNS daemon");
                return;
            }
        };

        let events = match daemon.browse(SERVICE_TYPE) {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "Could not browse for Senso services");
                return;
            }
        };

        let deadline = Instant::now() + duration;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match timeout(remaining, events.recv_async()).await {
                Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                    let entry = service_entry(&info);
                    debug!(name = %entry.name, "Discovered Senso");
                    if tx.send(entry).await.is_err() {
                        break;
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => break,
            }
        }

        let _ = daemon.stop_browse(SERVICE_TYPE);
        let _ = daemon.shutdown();
    });

    rx
}

fn service_entry(info: &mdns_sd::ServiceInfo) -> ServiceEntry {
    let mut addr_ipv4 = Vec::new();
    let mut addr_ipv6 = Vec::new();
    for address in info.get_addresses() {
        match address {
            std::net::IpAddr::V4(address) => addr_ipv4.push(*address),
            std::net::IpAddr::V6(address) => addr_ipv6.push(*address),
        }
    }

    ServiceEntry {
        name: info.get_fullname().to_string(),
        hostname: info.get_hostname().to_string(),
        port: info.get_port(),
        text: info
            .get_properties()
            .iter()
            .map(|property| format!("{}={}", property.key(), property.val_str()))
            .collect(),
        addr_ipv4,
        addr_ipv6,
    }
}

#[async_trait]
impl DeviceBackend for SensoHandle {
    async fn status(&self) -> Message {
        let state = self.shared.state.lock().await;
        Message::Status {
            address: state.address.clone(),
            device: None,
        }
    }

    async fn connect(&self, address: &str) -> Result<(), Error> {
        self.connect_to(address).await
    }

    async fn disconnect(&self) {
        self.shared.disconnect().await
    }

    async fn discover(&self, duration: Duration) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(16);
        let mut services = browse_services(duration);

        tokio::spawn(async move {
            while let Some(entry) = services.recv().await {
                let message = Message::discovered(DeviceInfo::Senso { tcp_device: entry });
                if tx.send(message).await.is_err() {
                    return;
                }
            }
        });

        rx
    }

    fn register_subscriber(&self, _manual: bool) {
        // Senso connections are always explicit; there is no scheduler to
        // arm or disarm.
    }

    fn deregister_subscriber(&self) {}

    fn is_updating(&self) -> bool {
        self.shared.updating.is_updating()
    }

    async fn update_firmware(
        &self,
        serial_number: String,
        image: String,
        progress: mpsc::Sender<Message>,
    ) {
        info!("Processing firmware update request");

        let Some(_guard) = self.shared.updating.try_begin() else {
            let _ = progress
                .send(Message::FirmwareUpdateFailure {
                    message: "A firmware update is already in progress".into(),
                })
                .await;
            return;
        };

        let _ = progress
            .send(Message::FirmwareUpdateProgress {
                message: "Disconnecting from the Senso".into(),
            })
            .await;
        self.shared.disconnect().await;

        let image = match firmware::decode_image(&image) {
            Ok(image) => image,
            Err(e) => {
                let message = format!("Error decoding base64 string: {e}");
                warn!("{message}");
                let _ = progress
                    .send(Message::FirmwareUpdateFailure { message })
                    .await;
                return;
            }
        };

        let (progress_tx, mut progress_rx) = mpsc::channel(8);
        let forwarder = {
            let progress = progress.clone();
            tokio::spawn(async move {
                while let Some(message) = progress_rx.recv().await {
                    let _ = progress
                        .send(Message::FirmwareUpdateProgress { message })
                        .await;
                }
            })
        };

        let outcome = firmware::update_by_serial(&serial_number, &image, &progress_tx).await;
        drop(progress_tx);
        let _ = forwarder.await;

        match outcome {
            Ok(()) => {
                let _ = progress
                    .send(Message::FirmwareUpdateSuccess {
                        message: "Firmware successfully transmitted".into(),
                    })
                    .await;
            }
            Err(e) => {
                let message = format!("Failed to update firmware: {e}");
                warn!("{message}");
                let _ = progress
                    .send(Message::FirmwareUpdateFailure { message })
                    .await;
            }
        }
    }
}
