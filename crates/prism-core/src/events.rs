//! Wire records and the dispatch task handed to the parsing stage
//!
//! Both transports deliver the same fixed-size record:
//!
//! | offset | size | field                                  |
//! |--------|------|----------------------------------------|
//! | 0      | 4    | direction (u32 LE, 0 egress, 1 ingress) |
//! | 4      | 4000 | payload buffer                         |
//! | 4004   | 4    | payload length (u32 LE)                |

use prism_ebpf_common::{
    DIRECTION_OFFSET, ETH_HLEN, EVENT_SIZE, IPV4_HLEN, LENGTH_OFFSET, MAX_DATA_SIZE,
    PAYLOAD_OFFSET, TCP_HLEN,
};
use std::fmt;
use thiserror::Error;

pub use prism_ebpf_common::Direction;

/// Reasons a raw record is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("record too short: got {got} bytes, need {need}")]
    Truncated { got: usize, need: usize },

    #[error("unknown direction tag {0}")]
    UnknownDirection(u32),

    #[error("payload length {0} exceeds buffer capacity {cap}", cap = MAX_DATA_SIZE)]
    LengthOutOfRange(u32),
}

/// One captured frame, owned by whichever stage holds it.
///
/// `payload` is a prefix of the link-layer frame starting at the Ethernet
/// header. It is not guaranteed to contain a complete HTTP message.
#[derive(Clone, PartialEq, Eq)]
pub struct DispatchTask {
    pub direction: Direction,
    pub payload: Vec<u8>,
}

impl DispatchTask {
    /// Decode one raw record.
    ///
    /// Records longer than the wire size are accepted; trailing bytes are
    /// ignored (perf samples may carry alignment padding).
    pub fn decode(record: &[u8]) -> Result<Self, DecodeError> {
        if record.len() < EVENT_SIZE {
            return Err(DecodeError::Truncated {
                got: record.len(),
                need: EVENT_SIZE,
            });
        }

        let raw_direction = read_u32_le(record, DIRECTION_OFFSET);
        let direction =
            Direction::from_raw(raw_direction).ok_or(DecodeError::UnknownDirection(raw_direction))?;

        let length = read_u32_le(record, LENGTH_OFFSET);
        if length as usize > MAX_DATA_SIZE {
            return Err(DecodeError::LengthOutOfRange(length));
        }

        let start = PAYLOAD_OFFSET;
        let end = start + length as usize;
        Ok(Self {
            direction,
            payload: record[start..end].to_vec(),
        })
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// TCP segment payload, located by walking the IPv4 and TCP header
    /// lengths. `None` if the captured prefix ends inside the headers or a
    /// header length is below its 20-byte minimum.
    pub fn segment_data(&self) -> Option<&[u8]> {
        let ip = self.payload.get(ETH_HLEN..)?;
        let ihl = usize::from(ip.first()? & 0x0f) * 4;
        if ihl < IPV4_HLEN {
            return None;
        }
        let tcp = ip.get(ihl..)?;
        let doff = usize::from(tcp.get(12)? >> 4) * 4;
        if doff < TCP_HLEN {
            return None;
        }
        tcp.get(doff..)
    }

    /// Short human-readable rendering of the segment data for debug logs
    pub fn preview(&self) -> String {
        let data = self.segment_data().unwrap_or(&self.payload);
        format_data_preview(data)
    }
}

impl fmt::Debug for DispatchTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTask")
            .field("direction", &self.direction)
            .field("len", &self.payload.len())
            .finish()
    }
}

fn read_u32_le(record: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&record[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

/// Printable text is quoted, anything else is shown as hex
fn format_data_preview(data: &[u8]) -> String {
    if data.is_empty() {
        return String::from("(no data)");
    }

    let data_slice = &data[..data.len().min(200)];
    let printable_count = data_slice
        .iter()
        .filter(|&&b| (0x20..0x7f).contains(&b) || b == b'\n' || b == b'\r')
        .count();

    if printable_count > data_slice.len() * 8 / 10 {
        let s = String::from_utf8_lossy(data_slice);
        let preview: String = s
            .chars()
            .take(100)
            .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
            .collect();
        format!(
            "\"{}{}\"",
            preview,
            if data.len() > 100 { "..." } else { "" }
        )
    } else {
        let hex: String = data_slice
            .iter()
            .take(32)
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ");
        format!("[{}{}]", hex, if data.len() > 32 { " ..." } else { "" })
    }
}

/// Build a raw record the way the probe lays it out
#[cfg(test)]
pub(crate) fn encode_record(direction: u32, payload: &[u8], length: u32) -> Vec<u8> {
    let mut record = vec![0u8; EVENT_SIZE];
    record[DIRECTION_OFFSET..DIRECTION_OFFSET + 4].copy_from_slice(&direction.to_le_bytes());
    let n = payload.len().min(MAX_DATA_SIZE);
    record[PAYLOAD_OFFSET..PAYLOAD_OFFSET + n].copy_from_slice(&payload[..n]);
    record[LENGTH_OFFSET..LENGTH_OFFSET + 4].copy_from_slice(&length.to_le_bytes());
    record
}
