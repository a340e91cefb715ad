use crate::config::ProtocolConfig;
use crate::error::{Result, StreamError};

use super::header::{ChunkHeader, HEADER_LEN, MAX_CHUNK_INDEX};

/// One fixed-size packet ready for the bulk-out endpoint.
///
/// Always exactly `packet_size` bytes: header, `chunk_len` payload bytes,
/// then zero padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    header: ChunkHeader,
    bytes: Box<[u8]>,
}

impl Packet {
    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    /// The valid payload bytes, without padding.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..HEADER_LEN + self.header.chunk_len as usize]
    }

    /// The full wire buffer, header and padding included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// Maps an access unit onto the device's fixed-size chunk packets.
///
/// The access unit is cut into consecutive slices of at most `max_payload`
/// bytes. Slice `n` travels in a packet whose header carries the full
/// access-unit length, `chunk_index = n` and the slice length:
///
/// ```text
/// access unit (1000 bytes), max_payload = 501
///
///   [ 0 .. 501 )    -> chunk 0, chunk_len 501
///   [ 501 .. 1000 ) -> chunk 1, chunk_len 499, 2 bytes zero padding
/// ```
///
/// There is no terminator packet: an access unit whose length is a
/// multiple of `max_payload` ends on a full chunk, and an empty access unit
/// produces no packets at all.
#[derive(Debug, Clone)]
pub struct Packetizer {
    config: ProtocolConfig,
}

impl Packetizer {
    /// Create a packetizer after validating the framing parameters.
    pub fn new(config: ProtocolConfig) -> Result<Self> {
        config.validate()?;
        tracing::debug!(
            report_id = format_args!("{:#04X}", config.report_id),
            command = format_args!("{:#04X}", config.command),
            packet_size = config.packet_size,
            max_payload = config.max_payload,
            "packetizer created"
        );
        Ok(Self { config })
    }

    /// Number of packets an access unit of `len` bytes needs.
    pub fn chunk_count(&self, len: usize) -> usize {
        len.div_ceil(self.config.max_payload)
    }

    /// Start packetizing `access_unit`.
    ///
    /// Size checks happen here, before any packet is produced, so a failing
    /// access unit never leaves a partial burst behind. The returned
    /// iterator is lazy; calling `packetize` again restarts from chunk 0.
    pub fn packetize<'a>(&'a self, access_unit: &'a [u8]) -> Result<Chunks<'a>> {
        let total_size = u32::try_from(access_unit.len()).map_err(|_| {
            StreamError::FrameTooLarge {
                len: access_unit.len(),
            }
        })?;

        let chunks = self.chunk_count(access_unit.len());
        if chunks > MAX_CHUNK_INDEX as usize + 1 {
            return Err(StreamError::ChunkIndexOverflow { chunks });
        }

        Ok(Chunks {
            config: &self.config,
            data: access_unit,
            total_size,
            bytes_sent: 0,
            chunk_index: 0,
        })
    }
}

/// Lazy, in-order sequence of packets for one access unit.
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    config: &'a ProtocolConfig,
    data: &'a [u8],
    total_size: u32,
    bytes_sent: usize,
    chunk_index: u32,
}

impl Iterator for Chunks<'_> {
    type Item = Packet;

    fn next(&mut self) -> Option<Packet> {
        if self.bytes_sent >= self.data.len() {
            return None;
        }

        let remaining = self.data.len() - self.bytes_sent;
        let chunk_len = remaining.min(self.config.max_payload);

        let header = ChunkHeader {
            report_id: self.config.report_id,
            command: self.config.command,
            total_size: self.total_size,
            chunk_index: self.chunk_index,
            chunk_len: chunk_len as u16,
        };

        let mut bytes = vec![0u8; self.config.packet_size].into_boxed_slice();
        header.write_to(&mut bytes);
        bytes[HEADER_LEN..HEADER_LEN + chunk_len]
            .copy_from_slice(&self.data[self.bytes_sent..self.bytes_sent + chunk_len]);

        self.bytes_sent += chunk_len;
        self.chunk_index += 1;

        Some(Packet { header, bytes })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.data.len() - self.bytes_sent).div_ceil(self.config.max_payload);
        (left, Some(left))
    }
}

impl ExactSizeIterator for Chunks<'_> {}
