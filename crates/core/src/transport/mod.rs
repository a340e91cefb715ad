//! Packet delivery to the display.
//!
//! The device protocol is write-only: packets go out on a bulk endpoint and
//! nothing comes back. A [`Sink`] therefore only reports whether the local
//! transport accepted the write:
//!
//! - **USB** ([`usb`]): bulk-out writes to the display's endpoint.
//! - **Writer** ([`writer`]): any [`std::io::Write`], for capture files and
//!   dry runs.
//! - **Capture** ([`CaptureSink`]): in-memory record of every packet.

pub mod usb;
pub mod writer;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

pub use usb::UsbTransport;
pub use writer::WriterSink;

/// Destination for fixed-size packets.
///
/// `send` writes the whole buffer or returns an error; it never retries.
/// Callers decide whether a failed write ends the session.
pub trait Sink {
    fn send(&mut self, packet: &[u8]) -> Result<()>;
}

impl<S: Sink + ?Sized> Sink for &mut S {
    fn send(&mut self, packet: &[u8]) -> Result<()> {
        (**self).send(packet)
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn send(&mut self, packet: &[u8]) -> Result<()> {
        (**self).send(packet)
    }
}

/// Records every packet it receives.
///
/// Clones share the same record, so a test can hand one clone to the
/// pacing loop and inspect another.
#[derive(Debug, Clone, Default)]
pub struct CaptureSink {
    packets: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every packet sent so far, in send order.
    pub fn packets(&self) -> Vec<Vec<u8>> {
        self.packets.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.lock().is_empty()
    }

    pub fn clear(&self) {
        self.packets.lock().clear();
    }
}

impl Sink for CaptureSink {
    fn send(&mut self, packet: &[u8]) -> Result<()> {
        self.packets.lock().push(packet.to_vec());
        Ok(())
    }
}
