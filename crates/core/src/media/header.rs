/// Length of the fixed chunk header in bytes.
pub const HEADER_LEN: usize = 11;

/// Largest value the 24-bit `chunk_index` field can hold.
pub const MAX_CHUNK_INDEX: u32 = (1 << 24) - 1;

/// Fixed chunk header prefixed to every packet.
///
/// ```text
///  0        1        2                 6            9        11
/// +--------+--------+-----------------+------------+--------+--------------
/// | report | cmd    | total_size (32) | index (24) | len(16)| payload ...
/// +--------+--------+-----------------+------------+--------+--------------
/// ```
///
/// All multi-byte fields are big-endian. `total_size` repeats the length of
/// the whole access unit in every chunk so the device can size its
/// reassembly buffer from any packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub report_id: u8,
    pub command: u8,
    pub total_size: u32,
    /// Only the low 24 bits are on the wire.
    pub chunk_index: u32,
    pub chunk_len: u16,
}

impl ChunkHeader {
    /// Serialize into the first [`HEADER_LEN`] bytes of `buf`.
    ///
    /// `buf` must be at least [`HEADER_LEN`] long and `chunk_index` must not
    /// exceed [`MAX_CHUNK_INDEX`]; the packetizer checks both up front.
    pub fn write_to(&self, buf: &mut [u8]) {
        debug_assert!(self.chunk_index <= MAX_CHUNK_INDEX);
        buf[0] = self.report_id;
        buf[1] = self.command;
        buf[2..6].copy_from_slice(&self.total_size.to_be_bytes());
        buf[6..9].copy_from_slice(&self.chunk_index.to_be_bytes()[1..]);
        buf[9..11].copy_from_slice(&self.chunk_len.to_be_bytes());
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        self.write_to(&mut header);
        header
    }

    /// Parse a header from the start of a packet. Returns `None` when the
    /// buffer is shorter than [`HEADER_LEN`].
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            report_id: buf[0],
            command: buf[1],
            total_size: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            chunk_index: u32::from_be_bytes([0, buf[6], buf[7], buf[8]]),
            chunk_len: u16::from_be_bytes([buf[9], buf[10]]),
        })
    }
}
