use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::error::{Result, StreamError};
use crate::media::AccessUnit;
use crate::media::annexb;

use super::FrameSource;

/// Frame source over an H.264 Annex B elementary stream file.
///
/// Raw `.h264` streams carry no reliable container timing, so the frame
/// rate is supplied by whoever produced the file. Every
/// [`restart`](FrameSource::restart) re-reads the file from disk.
#[derive(Debug)]
pub struct AnnexBFile {
    path: PathBuf,
    frame_rate: Option<f64>,
    data: Vec<u8>,
    units: Vec<Range<usize>>,
    next: usize,
}

impl AnnexBFile {
    pub fn open(path: impl AsRef<Path>, frame_rate: Option<f64>) -> Result<Self> {
        let mut source = Self {
            path: path.as_ref().to_path_buf(),
            frame_rate,
            data: Vec::new(),
            units: Vec::new(),
            next: 0,
        };
        source.load()?;
        Ok(source)
    }

    /// Access units found in the most recent read of the file.
    pub fn access_unit_count(&self) -> usize {
        self.units.len()
    }

    fn load(&mut self) -> Result<()> {
        self.data = fs::read(&self.path).map_err(|e| {
            StreamError::Source(format!("cannot read {}: {e}", self.path.display()))
        })?;
        self.units = annexb::split_access_units(&self.data);
        self.next = 0;

        tracing::debug!(
            path = %self.path.display(),
            bytes = self.data.len(),
            access_units = self.units.len(),
            "elementary stream loaded"
        );
        Ok(())
    }
}

impl FrameSource for AnnexBFile {
    fn frame_rate(&self) -> Option<f64> {
        self.frame_rate
    }

    fn next_frame(&mut self) -> Result<Option<AccessUnit>> {
        let Some(range) = self.units.get(self.next) else {
            return Ok(None);
        };
        let unit = AccessUnit::from(&self.data[range.clone()]);
        self.next += 1;
        Ok(Some(unit))
    }

    fn restart(&mut self) -> Result<()> {
        self.load()
    }
}
