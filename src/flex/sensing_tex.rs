//! Framer for SensingTex pressure mat controllers.
//!
//! The controller pushes sets of samples framed as
//!
//! ```text
//! 'N' '\n' length_msb length_lsb          // sample count, big-endian
//! 'P' '\n' sample_1 .. sample_length
//! ```
//!
//! A sample is 3 bytes in 8-bit mode (row, column, pressure) and 4 bytes in
//! 12-bit mode (row, column, pressure as big-endian u16). Only the
//! concatenated sample bytes are emitted; markers and length never reach
//! clients.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::Subscription;
use crate::session::{Payload, SessionBroker, TOPIC_RX};

const HEADER_START_MARKER: u8 = b'N';
const BODY_START_MARKER: u8 = b'P';

const BITDEPTH_8_CMD: &[u8] = b"UL\n";
const BITDEPTH_12_CMD: &[u8] = b"UM\n";

/// Row, column and pressure value, one byte each.
const BYTES_PER_SAMPLE_8BIT: usize = 3;

/// Same, but the pressure value is a big-endian u16. The vendor calls this
/// "12 bit" although observed values go somewhat beyond 2^12-1.
const BYTES_PER_SAMPLE_12BIT: usize = 4;

/// For Flex v4 this causes the firmware to push data continuously; for
/// Flex v5 it requests a single frame, so it doubles as the per-frame poll.
const START_MEASUREMENT_CMD: &[u8] = b"S\n";

fn bitdepth_command(command: &[u8]) -> Option<usize> {
    if command == BITDEPTH_8_CMD {
        Some(BYTES_PER_SAMPLE_8BIT)
    } else if command == BITDEPTH_12_CMD {
        Some(BYTES_PER_SAMPLE_12BIT)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitHeader,
    HeaderStart,
    LenMsb,
    LenLsb,
    WaitBody,
    BodyStart,
    BodyBytes,
    Unexpected,
}

/// Byte-level parser for the sample set framing.
///
/// Any byte that does not fit the grammar sends the parser to
/// [`State::Unexpected`], which it only leaves by consuming the next header
/// start marker. No error is surfaced; the stream resynchronizes silently.
#[derive(Debug)]
pub(crate) struct SampleParser {
    state: State,
    bytes_per_sample: usize,
    len_msb: u8,
    samples_left: usize,
    bytes_left: usize,
    buf: Vec<u8>,
}

impl SampleParser {
    pub(crate) fn new(bytes_per_sample: usize) -> Self {
        Self {
            state: State::WaitHeader,
            bytes_per_sample,
            len_msb: 0,
            samples_left: 0,
            bytes_left: 0,
            buf: Vec::new(),
        }
    }

    /// Feed one byte. Returns a complete set of sample bytes when the byte
    /// finished a frame.
    pub(crate) fn push(&mut self, input: u8) -> Option<Vec<u8>> {
        use State::*;

        match (self.state, input) {
            (WaitHeader, HEADER_START_MARKER) => self.state = HeaderStart,
            (HeaderStart, b'\n') => self.state = LenMsb,
            (LenMsb, msb) => {
                self.len_msb = msb;
                self.state = LenLsb;
            }
            (LenLsb, lsb) => {
                self.samples_left = u16::from_be_bytes([self.len_msb, lsb]) as usize;
                // An empty set carries nothing worth emitting.
                self.state = if self.samples_left == 0 {
                    WaitHeader
                } else {
                    WaitBody
                };
            }
            (WaitBody, BODY_START_MARKER) => self.state = BodyStart,
            (BodyStart, b'\n') => {
                self.state = BodyBytes;
                self.buf.clear();
                self.bytes_left = self.bytes_per_sample;
            }
            (BodyBytes, byte) => {
                self.buf.push(byte);
                self.bytes_left -= 1;

                if self.bytes_left == 0 {
                    self.samples_left -= 1;

                    if self.samples_left == 0 {
                        self.state = WaitHeader;
                        return Some(std::mem::take(&mut self.buf));
                    }

                    self.bytes_left = self.bytes_per_sample;
                }
            }
            (Unexpected, HEADER_START_MARKER) => self.state = HeaderStart,
            _ => self.state = Unexpected,
        }

        None
    }
}

/// Drive a SensingTex device until cancelled or the transport fails.
///
/// Starts in 8-bit mode. Outbound commands are forwarded verbatim, except
/// the bitdepth commands `UL\n`/`UM\n`: when one changes the sample width,
/// the inner reader is stopped and restarted so no read straddles the mode
/// switch.
pub(crate) async fn run<S>(
    io: S,
    cancel: CancellationToken,
    mut commands: Subscription<Payload>,
    broker: SessionBroker,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(io);
    let writer = Arc::new(Mutex::new(write_half));

    // 8-bit depth by default, for backwards compatibility.
    if let Err(e) = writer.lock().await.write_all(BITDEPTH_8_CMD).await {
        warn!(error = %e, "Failed to select initial bitdepth");
        return;
    }
    let mut bytes_per_sample = BYTES_PER_SAMPLE_8BIT;

    let mut reader_cancel = cancel.child_token();
    let mut reader_task = tokio::spawn(read_from_port(
        reader_cancel.clone(),
        BufReader::new(read_half),
        bytes_per_sample,
        Arc::clone(&writer),
        broker.clone(),
    ));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                reader_cancel.cancel();
                let _ = (&mut reader_task).await;
                return;
            }

            _ = &mut reader_task => {
                // The reader stopped on its own, so the transport is gone.
                return;
            }

            command = commands.recv() => {
                let data = match command {
                    Some(Payload::Frame(data)) => data,
                    // Only binary commands travel this topic.
                    Some(Payload::Message(_)) => continue,
                    None => return,
                };

                match bitdepth_command(&data) {
                    Some(new_bytes_per_sample) if new_bytes_per_sample != bytes_per_sample => {
                        info!(
                            old = bytes_per_sample,
                            new = new_bytes_per_sample,
                            "Bytes per sample changed, restarting reader"
                        );

                        debug!("Stopping reader and waiting for it to finish");
                        reader_cancel.cancel();
                        let reader = match (&mut reader_task).await {
                            Ok(Some(reader)) => reader,
                            // The reader died on a transport error while we
                            // were asking it to stop.
                            _ => return,
                        };
                        debug!("Reader stopped");

                        if let Err(e) = writer.lock().await.write_all(&data).await {
                            warn!(error = %e, "Failed to write new bitdepth");
                            return;
                        }

                        // Discard everything read in the old mode.
                        let mut read_half = reader.into_inner();
                        drain_input(&mut read_half).await;

                        bytes_per_sample = new_bytes_per_sample;
                        reader_cancel = cancel.child_token();
                        reader_task = tokio::spawn(read_from_port(
                            reader_cancel.clone(),
                            BufReader::new(read_half),
                            bytes_per_sample,
                            Arc::clone(&writer),
                            broker.clone(),
                        ));
                    }

                    // The device is already in this mode.
                    Some(_) => {}

                    None => {
                        if let Err(e) = writer.lock().await.write_all(&data).await {
                            warn!(error = %e, "Failed to write command to serial port");
                            return;
                        }
                        debug!(bytes = data.len(), "Wrote binary command to serial out");
                    }
                }
            }
        }
    }
}

/// Read sample sets until cancelled (returning the reader for reuse) or the
/// transport fails (returning `None`).
async fn read_from_port<S>(
    cancel: CancellationToken,
    mut reader: BufReader<ReadHalf<S>>,
    bytes_per_sample: usize,
    writer: Arc<Mutex<WriteHalf<S>>>,
    broker: SessionBroker,
) -> Option<BufReader<ReadHalf<S>>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut parser = SampleParser::new(bytes_per_sample);

    if let Err(e) = writer.lock().await.write_all(START_MEASUREMENT_CMD).await {
        warn!(error = %e, "Failed to write start message to serial port");
        return None;
    }

    loop {
        let input = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Stopping reader: cancelled");
                return Some(reader);
            }

            input = reader.read_u8() => match input {
                Ok(input) => input,
                Err(e) => {
                    warn!(error = %e, "Error reading from serial port");
                    return None;
                }
            }
        };

        if let Some(frame) = parser.push(input) {
            broker.try_publish(TOPIC_RX, Payload::Frame(frame.into()));

            // Request the next set. Optional for Flex v4, mandatory for v5.
            if let Err(e) = writer.lock().await.write_all(START_MEASUREMENT_CMD).await {
                warn!(error = %e, "Failed to write poll message to serial port");
                return None;
            }
        }
    }
}

/// Throw away whatever the device sent before a mode switch took effect.
async fn drain_input<R: AsyncRead + Unpin>(reader: &mut R) {
    let mut scratch = [0u8; 256];
    while let Ok(Ok(n)) = timeout(Duration::from_millis(5), reader.read(&mut scratch)).await {
        if n == 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::broker::Broker;
    use crate::session::TOPIC_TX;

    fn feed(parser: &mut SampleParser, bytes: &[u8]) -> Vec<Vec<u8>> {
        bytes.iter().filter_map(|&b| parser.push(b)).collect()
    }

    #[test]
    fn eight_bit_frames_emit_sample_bytes_only() {
        let mut parser = SampleParser::new(BYTES_PER_SAMPLE_8BIT);

        for i in 0..24u8 {
            let wire = [
                b'N', b'\n', 0, 2, b'P', b'\n',
                i, 1, 2 * i + 1,
                1, i, 3 * i + 1,
            ];
            let frames = feed(&mut parser, &wire);
            assert_eq!(frames, vec![vec![i, 1, 2 * i + 1, 1, i, 3 * i + 1]]);
        }
    }

    #[test]
    fn twelve_bit_frames_are_four_bytes_per_sample() {
        let mut parser = SampleParser::new(BYTES_PER_SAMPLE_12BIT);

        let i = 200u16;
        let p1 = (2 * i + 1).to_be_bytes();
        let p2 = (3 * i + 1).to_be_bytes();
        let wire = [
            b'N', b'\n', 0, 2, b'P', b'\n',
            7, 1, p1[0], p1[1],
            1, 7, p2[0], p2[1],
        ];

        let frames = feed(&mut parser, &wire);
        assert_eq!(frames, vec![vec![7, 1, p1[0], p1[1], 1, 7, p2[0], p2[1]]]);
    }

    #[test]
    fn sample_count_is_big_endian() {
        let mut parser = SampleParser::new(BYTES_PER_SAMPLE_8BIT);

        // 0x0101 = 257 samples.
        let mut wire = vec![b'N', b'\n', 1, 1, b'P', b'\n'];
        wire.extend(std::iter::repeat(0xAB).take(257 * 3));

        let frames = feed(&mut parser, &wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 257 * 3);
    }

    #[test]
    fn noise_emits_nothing_and_recovers_on_next_header() {
        let mut parser = SampleParser::new(BYTES_PER_SAMPLE_8BIT);

        assert!(feed(&mut parser, b"garbage bytes without any frame").is_empty());

        // The 'N' inside the noise re-arms the parser, so a clean frame
        // afterwards parses.
        let frames = feed(
            &mut parser,
            &[b'N', b'\n', 0, 1, b'P', b'\n', 9, 9, 9],
        );
        assert_eq!(frames, vec![vec![9, 9, 9]]);
    }

    #[test]
    fn empty_sample_set_emits_nothing() {
        let mut parser = SampleParser::new(BYTES_PER_SAMPLE_8BIT);
        assert!(feed(&mut parser, &[b'N', b'\n', 0, 0]).is_empty());

        let frames = feed(&mut parser, &[b'N', b'\n', 0, 1, b'P', b'\n', 1, 2, 3]);
        assert_eq!(frames, vec![vec![1, 2, 3]]);
    }

    async fn expect_read(device: &mut tokio::io::DuplexStream, expected: &[u8]) {
        let mut buf = vec![0u8; expected.len()];
        timeout(Duration::from_secs(5), device.read_exact(&mut buf))
            .await
            .expect("Device read timed out")
            .expect("Device read failed");
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn frames_flow_to_the_rx_topic() {
        let (mut device, driver) = tokio::io::duplex(4096);
        let broker: SessionBroker = Broker::new(32);
        let mut rx = broker.subscribe(TOPIC_RX);
        let commands = broker.subscribe(TOPIC_TX);
        let cancel = CancellationToken::new();

        tokio::spawn(run(driver, cancel.clone(), commands, broker.clone()));

        expect_read(&mut device, b"UL\nS\n").await;

        for i in 0..24u8 {
            device
                .write_all(&[
                    b'N', b'\n', 0, 2, b'P', b'\n',
                    i, 1, 2 * i + 1,
                    1, i, 3 * i + 1,
                ])
                .await
                .unwrap();

            let frame = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("No frame emitted")
                .expect("Topic closed");
            let Payload::Frame(frame) = frame else {
                panic!("Expected a frame")
            };
            assert_eq!(frame, vec![i, 1, 2 * i + 1, 1, i, 3 * i + 1]);

            // The per-frame poll.
            expect_read(&mut device, b"S\n").await;
        }

        cancel.cancel();
    }

    #[tokio::test]
    async fn mode_switch_restarts_the_reader() {
        let (mut device, driver) = tokio::io::duplex(4096);
        let broker: SessionBroker = Broker::new(32);
        let mut rx = broker.subscribe(TOPIC_RX);
        let commands = broker.subscribe(TOPIC_TX);
        let cancel = CancellationToken::new();

        tokio::spawn(run(driver, cancel.clone(), commands, broker.clone()));

        expect_read(&mut device, b"UL\nS\n").await;

        // Client asks for 12-bit mode while the reader is blocked on a read.
        broker.try_publish(TOPIC_TX, Payload::Frame(Bytes::from_static(b"UM\n")));

        // The device sees the mode switch, then the restarted reader's
        // start command. Only then may it send 12-bit frames.
        expect_read(&mut device, b"UM\nS\n").await;

        for i in 0..4u16 {
            let p1 = (2 * i + 1).to_be_bytes();
            let p2 = (3 * i + 1).to_be_bytes();
            device
                .write_all(&[
                    b'N', b'\n', 0, 2, b'P', b'\n',
                    i as u8, 1, p1[0], p1[1],
                    1, i as u8, p2[0], p2[1],
                ])
                .await
                .unwrap();

            let Some(Payload::Frame(frame)) = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("No frame emitted")
            else {
                panic!("Expected a frame")
            };

            assert_eq!(frame.len(), 8);
            assert_eq!(&frame[2..4], &p1);
            assert_eq!(&frame[6..8], &p2);

            expect_read(&mut device, b"S\n").await;
        }

        // Asking for the mode we are already in does not touch the wire.
        broker.try_publish(TOPIC_TX, Payload::Frame(Bytes::from_static(b"UM\n")));
        broker.try_publish(TOPIC_TX, Payload::Frame(Bytes::from_static(b"X\n")));
        expect_read(&mut device, b"X\n").await;

        cancel.cancel();
    }

    #[tokio::test]
    async fn non_bitdepth_commands_are_forwarded_verbatim() {
        let (mut device, driver) = tokio::io::duplex(4096);
        let broker: SessionBroker = Broker::new(32);
        let commands = broker.subscribe(TOPIC_TX);
        let cancel = CancellationToken::new();

        tokio::spawn(run(driver, cancel.clone(), commands, broker.clone()));

        expect_read(&mut device, b"UL\nS\n").await;

        broker.try_publish(TOPIC_TX, Payload::Frame(Bytes::from_static(b"Q\n")));
        expect_read(&mut device, b"Q\n").await;

        cancel.cancel();
    }
}
