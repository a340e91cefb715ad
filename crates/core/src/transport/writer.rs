use std::io::Write;

use crate::error::Result;

use super::Sink;

/// Sink that appends every packet to a [`Write`] implementation.
///
/// Useful for capturing the exact wire stream to a file, or for dry runs
/// against [`std::io::sink`]. Packets are written back to back with no
/// extra framing, exactly as the device would see them.
#[derive(Debug)]
pub struct WriterSink<W: Write> {
    writer: W,
    packets_written: u64,
}

impl<W: Write> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            packets_written: 0,
        }
    }

    pub fn packets_written(&self) -> u64 {
        self.packets_written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Sink for WriterSink<W> {
    fn send(&mut self, packet: &[u8]) -> Result<()> {
        self.writer.write_all(packet)?;
        self.packets_written += 1;
        Ok(())
    }
}
