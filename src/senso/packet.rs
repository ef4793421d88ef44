//! Encoding and decoding of Senso control-channel blocks.
//!
//! Control traffic is framed as an 8-byte packet header followed by blocks.
//! The driver only ever writes one block itself, the status request used as
//! a liveness probe, and only inspects one, the standard response block that
//! answers every command.

use tracing::warn;

/// Size of the packet header preceding all blocks.
pub const HEADER_SIZE: usize = 8;

/// Block type of a status request.
pub const BLOCK_TYPE_GET_STATUS: u16 = 0x00D0;

/// High bit of a block type, set when the block is a response.
pub const RESPONSE_BIT: u16 = 0x8000;

const STD_RESPONSE_PAYLOAD: usize = 12;

/// The status request written as a liveness probe: a zeroed header followed
/// by a single `(size = 1, blockType = GET_STATUS)` block.
pub fn get_status_probe() -> [u8; HEADER_SIZE + 4] {
    let mut probe = [0u8; HEADER_SIZE + 4];
    probe[HEADER_SIZE..HEADER_SIZE + 2].copy_from_slice(&1u16.to_le_bytes());
    probe[HEADER_SIZE + 2..].copy_from_slice(&BLOCK_TYPE_GET_STATUS.to_le_bytes());
    probe
}

/// The packet header of a control response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version.
    pub version: u8,

    /// Number of blocks following the header.
    pub num_blocks: u8,
}

/// The standard response block answering a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdResponse {
    /// Block type with the response bit still set.
    pub block_type: u16,

    /// Return code of the command.
    pub return_code: u32,

    /// Device status word. The high bit signals a device-side problem.
    pub status: u32,

    /// Error word, zero when the command succeeded.
    pub error: u32,
}

impl StdResponse {
    /// Which command this block responds to.
    pub fn request_type(&self) -> u16 {
        self.block_type & !RESPONSE_BIT
    }

    /// Whether the device reported a problem.
    pub fn indicates_problem(&self) -> bool {
        self.error != 0 || self.status & 0x8000_0000 != 0
    }
}

fn u16_at(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Decode a control response, if `bytes` holds a complete one.
///
/// Inbound traffic that is not a well-formed response (partial reads,
/// unrelated blocks) yields `None` and is passed through untouched.
pub fn parse_response(bytes: &[u8]) -> Option<(Header, StdResponse)> {
    if bytes.len() < HEADER_SIZE + 4 + STD_RESPONSE_PAYLOAD {
        return None;
    }

    let header = Header {
        version: bytes[0],
        num_blocks: bytes[1],
    };

    let block_type = u16_at(bytes, HEADER_SIZE + 2);
    if block_type & RESPONSE_BIT == 0 {
        return None;
    }

    let payload = HEADER_SIZE + 4;
    Some((
        header,
        StdResponse {
            block_type,
            return_code: u32_at(bytes, payload),
            status: u32_at(bytes, payload + 4),
            error: u32_at(bytes, payload + 8),
        },
    ))
}

/// Log a response that reports a problem. Responses never change session
/// state either way.
pub fn log_response(bytes: &[u8]) {
    if let Some((_, response)) = parse_response(bytes) {
        if response.indicates_problem() {
            warn!(
                request_type = format_args!("{:#06X}", response.request_type()),
                return_code = response.return_code,
                status = format_args!("{:#010X}", response.status),
                error = response.error,
                "Senso reported a problem"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn response_bytes(block_type: u16, return_code: u32, status: u32, error: u32) -> Vec<u8> {
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[0] = 2; // version
        bytes[1] = 1; // one block
        bytes.extend_from_slice(&(STD_RESPONSE_PAYLOAD as u16).to_le_bytes());
        bytes.extend_from_slice(&block_type.to_le_bytes());
        bytes.extend_from_slice(&return_code.to_le_bytes());
        bytes.extend_from_slice(&status.to_le_bytes());
        bytes.extend_from_slice(&error.to_le_bytes());
        bytes
    }

    #[test]
    fn probe_layout() {
        let probe = get_status_probe();

        assert_eq!(probe.len(), 12);
        assert_eq!(&probe[..8], &[0; 8]);
        assert_eq!(&probe[8..10], &[0x01, 0x00]);
        assert_eq!(&probe[10..], &[0xD0, 0x00]);
    }

    #[test]
    fn response_round_trips() {
        let bytes = response_bytes(BLOCK_TYPE_GET_STATUS | RESPONSE_BIT, 0, 0x0000_0001, 0);

        let (header, response) = parse_response(&bytes).expect("Should parse");
        assert_eq!(header, Header { version: 2, num_blocks: 1 });
        assert_eq!(response.request_type(), BLOCK_TYPE_GET_STATUS);
        assert!(!response.indicates_problem());
    }

    #[test]
    fn error_and_status_high_bit_indicate_problems() {
        let bytes = response_bytes(BLOCK_TYPE_GET_STATUS | RESPONSE_BIT, 0, 0, 7);
        assert!(parse_response(&bytes).unwrap().1.indicates_problem());

        let bytes = response_bytes(BLOCK_TYPE_GET_STATUS | RESPONSE_BIT, 0, 0x8000_0000, 0);
        assert!(parse_response(&bytes).unwrap().1.indicates_problem());
    }

    #[test]
    fn non_responses_are_ignored() {
        // Too short.
        assert_eq!(parse_response(&[0u8; 10]), None);

        // Response bit not set.
        let bytes = response_bytes(BLOCK_TYPE_GET_STATUS, 0, 0, 0);
        assert_eq!(parse_response(&bytes), None);
    }
}
