//! Transparent framer for passthru devices.
//!
//! Bytes are forwarded exactly as read, in chunks of up to 2048 bytes.
//! Useful for recording raw serial data and for replaying recordings, where
//! the replayed device impersonates whatever was captured.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::Subscription;
use crate::session::{Payload, SessionBroker, TOPIC_RX};

/// Largest chunk handed to clients in one frame. A generous upper bound on
/// any single message of the framed device families.
const MAX_CHUNK: usize = 2048;

/// Drive a passthru device until cancelled or the transport fails.
pub(crate) async fn run<S>(
    io: S,
    cancel: CancellationToken,
    mut commands: Subscription<Payload>,
    broker: SessionBroker,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    info!("Passthru handler started");

    let (read_half, mut write_half) = tokio::io::split(io);

    let reader_cancel = cancel.child_token();
    let mut reader_task = tokio::spawn(read_from_port(reader_cancel.clone(), read_half, broker));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                reader_cancel.cancel();
                let _ = (&mut reader_task).await;
                return;
            }

            _ = &mut reader_task => {
                return;
            }

            command = commands.recv() => {
                let data = match command {
                    Some(Payload::Frame(data)) => data,
                    Some(Payload::Message(_)) => continue,
                    None => return,
                };

                if let Err(e) = write_half.write_all(&data).await {
                    warn!(error = %e, "Failed to write command to serial port");
                    return;
                }
                debug!(bytes = data.len(), "Wrote binary command to serial out");
            }
        }
    }
}

async fn read_from_port<R>(cancel: CancellationToken, mut reader: R, broker: SessionBroker)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; MAX_CHUNK];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Stopping reader: cancelled");
                return;
            }

            read = reader.read(&mut chunk) => match read {
                Ok(0) => {
                    debug!("Serial port closed");
                    return;
                }
                Ok(n) => broker.try_publish(TOPIC_RX, Payload::Frame(Bytes::copy_from_slice(&chunk[..n]))),
                Err(e) => {
                    warn!(error = %e, "Error reading from serial port");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::{timeout, Duration};

    use super::*;
    use crate::broker::Broker;
    use crate::session::TOPIC_TX;

    #[tokio::test]
    async fn chunks_pass_through_unparsed() {
        let (mut device, driver) = tokio::io::duplex(4096);
        let broker: SessionBroker = Broker::new(32);
        let mut rx = broker.subscribe(TOPIC_RX);
        let commands = broker.subscribe(TOPIC_TX);
        let cancel = CancellationToken::new();

        tokio::spawn(run(driver, cancel.clone(), commands, broker.clone()));

        // Arbitrary bytes, no framing expected.
        device.write_all(b"anything goes \xFF\x00").await.unwrap();

        let Some(Payload::Frame(frame)) = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("No chunk emitted")
        else {
            panic!("Expected a frame")
        };
        assert_eq!(&frame[..], &b"anything goes \xFF\x00"[..]);

        // Writes go out verbatim, nothing is written at startup.
        broker.try_publish(TOPIC_TX, Payload::Frame(Bytes::from_static(b"reply")));
        let mut buf = [0u8; 5];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        cancel.cancel();
    }
}
