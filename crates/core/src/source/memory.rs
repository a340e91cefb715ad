use crate::error::Result;
use crate::media::AccessUnit;

use super::FrameSource;

/// Frame source over a fixed list of access units.
#[derive(Debug, Clone)]
pub struct MemorySource {
    frames: Vec<AccessUnit>,
    frame_rate: Option<f64>,
    position: usize,
    restarts: u64,
}

impl MemorySource {
    pub fn new(frames: Vec<AccessUnit>, frame_rate: Option<f64>) -> Self {
        Self {
            frames,
            frame_rate,
            position: 0,
            restarts: 0,
        }
    }

    /// How many times [`restart`](FrameSource::restart) has been called.
    pub fn restarts(&self) -> u64 {
        self.restarts
    }
}

impl FrameSource for MemorySource {
    fn frame_rate(&self) -> Option<f64> {
        self.frame_rate
    }

    fn next_frame(&mut self) -> Result<Option<AccessUnit>> {
        let frame = self.frames.get(self.position).cloned();
        if frame.is_some() {
            self.position += 1;
        }
        Ok(frame)
    }

    fn restart(&mut self) -> Result<()> {
        self.position = 0;
        self.restarts += 1;
        Ok(())
    }
}
