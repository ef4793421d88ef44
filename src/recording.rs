//! The raw-capture recording format.
//!
//! A recording is a UTF-8 text file with one record per line:
//!
//! ```text
//! <sleep_ms>,<base64_payload>
//! ```
//!
//! The recorder captures what a passthru framer emits; the replayer plays a
//! recording back into a virtual TTY, sleeping between records so timing
//! resembles the original device.

use std::fmt::Write as _;
use std::time::Instant;

use base64::Engine;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, Duration};

use crate::error::Error;

/// One line of a recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Milliseconds to wait before writing the payload.
    pub sleep_ms: u64,

    /// The raw bytes that went over the wire.
    pub payload: Vec<u8>,
}

impl Record {
    /// Parse a single `<sleep_ms>,<base64_payload>` line.
    pub fn parse(line: &str) -> Result<Self, Error> {
        let (sleep_ms, payload) = line.split_once(',').ok_or_else(|| {
            Error::Recording(format!("Line without separator: `{line}`"))
        })?;

        let sleep_ms = sleep_ms
            .trim()
            .parse::<u64>()
            .map_err(|e| Error::Recording(format!("Bad sleep value `{sleep_ms}`: {e}")))?;

        let payload = base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(Error::ImageDecode)?;

        Ok(Self { sleep_ms, payload })
    }

    /// Render the record as one line, without trailing newline.
    pub fn to_line(&self) -> String {
        format!(
            "{},{}",
            self.sleep_ms,
            base64::engine::general_purpose::STANDARD.encode(&self.payload)
        )
    }
}

/// Parse a whole recording. Empty lines are skipped.
pub fn parse_recording(contents: &str) -> Result<Vec<Record>, Error> {
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(Record::parse)
        .collect()
}

/// Render records into the recording file format.
pub fn format_recording(records: &[Record]) -> String {
    let mut out = String::new();
    for record in records {
        let _ = writeln!(out, "{}", record.to_line());
    }
    out
}

/// Captures raw device frames into [`Record`]s, timestamping the gaps
/// between them so a replay resembles the original device's pacing.
#[derive(Debug, Default)]
pub struct Recorder {
    last: Option<Instant>,
    records: Vec<Record>,
}

impl Recorder {
    /// An empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture one frame. The first frame carries no delay.
    pub fn push(&mut self, payload: &[u8]) {
        let now = Instant::now();
        let sleep_ms = self
            .last
            .map(|last| now.duration_since(last).as_millis() as u64)
            .unwrap_or(0);
        self.last = Some(now);

        self.records.push(Record {
            sleep_ms,
            payload: payload.to_vec(),
        });
    }

    /// The captured records.
    pub fn finish(self) -> Vec<Record> {
        self.records
    }
}

/// Write a recording to `out`, honoring each record's delay.
///
/// A `speed` of 2.0 halves every delay, 0.5 doubles it. Payloads are
/// written unmodified.
pub async fn replay<W>(records: &[Record], speed: f64, out: &mut W) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    for record in records {
        if record.sleep_ms > 0 && speed > 0.0 {
            let scaled = Duration::from_millis((record.sleep_ms as f64 / speed) as u64);
            sleep(scaled).await;
        }

        out.write_all(&record.payload).await?;
    }

    out.flush().await?;
    Ok(())
}
