//! Producers of access units for the pacing loop.
//!
//! A [`FrameSource`] is a finite, ordered sequence of access units with a
//! nominal frame rate. The pacing loop drains it, calls
//! [`restart`](FrameSource::restart) and drains it again, forever.
//!
//! - [`AnnexBFile`]: an H.264 elementary stream on disk, re-read on every
//!   restart.
//! - [`MemorySource`]: a fixed list of access units.

pub mod file;
pub mod memory;

use crate::error::Result;
use crate::media::AccessUnit;

pub use file::AnnexBFile;
pub use memory::MemorySource;

pub trait FrameSource {
    /// Nominal frames per second, if the source knows it.
    fn frame_rate(&self) -> Option<f64>;

    /// Next access unit, or `None` once the sequence is exhausted.
    fn next_frame(&mut self) -> Result<Option<AccessUnit>>;

    /// Rewind to the first access unit.
    fn restart(&mut self) -> Result<()>;
}

impl<S: FrameSource + ?Sized> FrameSource for &mut S {
    fn frame_rate(&self) -> Option<f64> {
        (**self).frame_rate()
    }

    fn next_frame(&mut self) -> Result<Option<AccessUnit>> {
        (**self).next_frame()
    }

    fn restart(&mut self) -> Result<()> {
        (**self).restart()
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn frame_rate(&self) -> Option<f64> {
        (**self).frame_rate()
    }

    fn next_frame(&mut self) -> Result<Option<AccessUnit>> {
        (**self).next_frame()
    }

    fn restart(&mut self) -> Result<()> {
        (**self).restart()
    }
}
