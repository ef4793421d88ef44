//! Framer for Sensitronics pressure mat controllers.
//!
//! The controller speaks a TLV framing:
//!
//! ```text
//! 0xFF  type(u8)  length(u16 little-endian)  body(length bytes)
//! ```
//!
//! Records are forwarded to clients verbatim, header included. The stream
//! has no resynchronization marker beyond `0xFF` in first position, so a
//! misaligned stream terminates the connection and the session retries.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::Subscription;
use crate::session::{Payload, SessionBroker, TOPIC_RX};

const HEADER_START_MARKER: u8 = 0xFF;
const HEADER_SIZE: usize = 4;

const START_MEASUREMENT_CMD: &[u8] = b"S\n";

/// Drive a Sensitronics device until cancelled or the transport fails.
pub(crate) async fn run<S>(
    io: S,
    cancel: CancellationToken,
    mut commands: Subscription<Payload>,
    broker: SessionBroker,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(io);

    if let Err(e) = write_half.write_all(START_MEASUREMENT_CMD).await {
        warn!(error = %e, "Failed to write start message to serial port");
        return;
    }

    let reader_cancel = cancel.child_token();
    let mut reader_task = tokio::spawn(read_from_port(
        reader_cancel.clone(),
        BufReader::new(read_half),
        broker,
    ));

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
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Stopping reader: cancelled");
                return;
            }

            record = read_record(&mut reader) => match record {
                Ok(record) => broker.try_publish(TOPIC_RX, Payload::Frame(record.into())),
                Err(e) => {
                    warn!(error = %e, "Error reading from serial port");
                    return;
                }
            }
        }
    }
}

/// Read one complete TLV record, header included.
pub(crate) async fn read_record<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let marker = reader.read_u8().await?;
    if marker != HEADER_START_MARKER {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("expected header start marker {HEADER_START_MARKER:#04X}, got {marker:#04X}"),
        ));
    }

    let record_type = reader.read_u8().await?;

    let mut length = [0u8; 2];
    reader.read_exact(&mut length).await?;
    let body_length = u16::from_le_bytes(length) as usize;

    let mut record = vec![0u8; HEADER_SIZE + body_length];
    record[0] = marker;
    record[1] = record_type;
    record[2] = length[0];
    record[3] = length[1];
    reader.read_exact(&mut record[HEADER_SIZE..]).await?;

    Ok(record)
}

#[cfg(test)]
mod tests {
    use rand::Rng;
    use tokio::time::{timeout, Duration};

    use super::*;
    use crate::broker::Broker;
    use crate::session::TOPIC_TX;

    fn random_record(rng: &mut impl Rng) -> Vec<u8> {
        let body_length = rng.gen_range(0..200u16);
        let mut record = vec![HEADER_START_MARKER, rng.gen()];
        record.extend_from_slice(&body_length.to_le_bytes());
        record.extend((0..body_length).map(|_| rng.gen::<u8>()));
        record
    }

    #[tokio::test]
    async fn chunked_records_come_out_whole_and_in_order() {
        let mut rng = rand::thread_rng();

        let records: Vec<Vec<u8>> = (0..30).map(|_| random_record(&mut rng)).collect();
        let mut wire: Vec<u8> = records.iter().flatten().copied().collect();

        let (mut device, driver) = tokio::io::duplex(8192);
        let broker: SessionBroker = Broker::new(64);
        let mut rx = broker.subscribe(TOPIC_RX);
        let commands = broker.subscribe(TOPIC_TX);
        let cancel = CancellationToken::new();

        tokio::spawn(run(driver, cancel.clone(), commands, broker.clone()));

        // The framer announces itself before any record is read.
        let mut start = [0u8; 2];
        device.read_exact(&mut start).await.unwrap();
        assert_eq!(&start, b"S\n");

        // Transmit in arbitrary chunks of 1..=15 bytes. Records already
        // written stay readable even after the device end closes.
        tokio::spawn(async move {
            while !wire.is_empty() {
                let n = rand::thread_rng().gen_range(1..=15).min(wire.len());
                let chunk: Vec<u8> = wire.drain(..n).collect();
                device.write_all(&chunk).await.unwrap();
            }
        });

        for expected in &records {
            let Some(Payload::Frame(frame)) = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("No record emitted")
            else {
                panic!("Expected a frame")
            };
            assert_eq!(&frame[..], &expected[..]);
        }

        cancel.cancel();
    }

    #[tokio::test]
    async fn misaligned_stream_terminates_the_reader() {
        let (mut reader, mut writer) = tokio::io::duplex(64);

        writer.write_all(&[0x00, 0x01, 0x02]).await.unwrap();

        let err = read_record(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn record_with_empty_body_round_trips() {
        let (mut reader, mut writer) = tokio::io::duplex(64);

        writer
            .write_all(&[HEADER_START_MARKER, 0x07, 0x00, 0x00])
            .await
            .unwrap();

        let record = read_record(&mut reader).await.unwrap();
        assert_eq!(record, vec![HEADER_START_MARKER, 0x07, 0x00, 0x00]);
    }
}
