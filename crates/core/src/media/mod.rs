//! Access units and their mapping onto device packets.
//!
//! The device reassembles each H.264 access unit from a burst of
//! fixed-size packets. Every packet carries an 11-byte [`header::ChunkHeader`]
//! followed by a slice of the access unit:
//!
//! - **total_size** (32-bit): length of the whole access unit, the same in
//!   every packet of the burst.
//! - **chunk_index** (24-bit): position of the slice, contiguous from 0.
//! - **chunk_len** (16-bit): valid payload bytes; the rest is zero padding.
//!
//! There is no acknowledgement and no retransmission. Packets must reach
//! the endpoint in chunk order or the reassembled frame is corrupt.
//!
//! | Module | Role |
//! |--------|------|
//! | [`header`] | Header serialization and parsing |
//! | [`packetizer`] | Access unit → packet burst |
//! | [`annexb`] | NAL scanning and access-unit boundaries |

pub mod annexb;
pub mod header;
pub mod packetizer;

pub use header::ChunkHeader;
pub use packetizer::{Chunks, Packet, Packetizer};

/// One complete H.264 Annex B access unit (a single displayed frame).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    data: Vec<u8>,
}

impl AccessUnit {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Vec<u8>> for AccessUnit {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<&[u8]> for AccessUnit {
    fn from(data: &[u8]) -> Self {
        Self::new(data.to_vec())
    }
}

impl AsRef<[u8]> for AccessUnit {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}
