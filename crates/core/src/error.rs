//! Error types for the streaming engine.

use std::fmt;

/// Errors that can occur while packetizing and streaming to a device.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Setup**: [`DeviceUnavailable`](Self::DeviceUnavailable),
///   [`InvalidConfig`](Self::InvalidConfig),
///   [`InvalidFrameRate`](Self::InvalidFrameRate). Fatal before streaming.
/// - **Transport**: [`Usb`](Self::Usb), [`Io`](Self::Io),
///   [`ShortWrite`](Self::ShortWrite). Counted and logged by the pacing
///   loop, fatal only through [`TooManyWriteFailures`](Self::TooManyWriteFailures).
/// - **Packetization**: [`FrameTooLarge`](Self::FrameTooLarge),
///   [`ChunkIndexOverflow`](Self::ChunkIndexOverflow). The frame is skipped.
/// - **Source**: [`Source`](Self::Source), [`EmptySource`](Self::EmptySource).
///   Terminate the streaming session.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Underlying I/O error (file source, writer sink).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// libusb reported an error on the device handle.
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// No device with the configured identity could be found or opened.
    #[error("device {vendor_id:04x}:{product_id:04x} unavailable: {reason}")]
    DeviceUnavailable {
        vendor_id: u16,
        product_id: u16,
        reason: String,
    },

    /// The transport accepted fewer bytes than the packet holds.
    #[error("short write: {written} of {expected} bytes accepted")]
    ShortWrite { written: usize, expected: usize },

    /// The pacing loop hit its consecutive write failure threshold.
    #[error("{0} consecutive packet writes failed")]
    TooManyWriteFailures(u64),

    /// Access unit length does not fit the 32-bit `total_size` field.
    #[error("access unit of {len} bytes exceeds the 32-bit size field")]
    FrameTooLarge { len: usize },

    /// Access unit would need more chunks than the 24-bit index can address.
    #[error("access unit needs {chunks} chunks, more than the 24-bit chunk index allows")]
    ChunkIndexOverflow { chunks: usize },

    /// The frame source failed mid-stream (decode/read failure).
    #[error("frame source error: {0}")]
    Source(String),

    /// A full pass over the frame source yielded no access units.
    #[error("frame source produced no access units")]
    EmptySource,

    /// Source frame rate is missing, zero, negative or not finite.
    #[error("invalid frame rate: {0:?}")]
    InvalidFrameRate(Option<f64>),

    /// Configuration values are inconsistent.
    #[error("invalid configuration: {kind}")]
    InvalidConfig { kind: ConfigErrorKind },
}

/// Specific kind of configuration failure.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigErrorKind {
    /// Header size differs from the fixed 11-byte layout.
    HeaderSize(usize),
    /// `max_payload` is zero.
    EmptyPayload,
    /// `max_payload` does not fit between the header and the packet end.
    PayloadTooLarge { max_payload: usize, available: usize },
    /// `max_payload` does not fit the 16-bit `chunk_len` field.
    PayloadExceedsLengthField(usize),
    /// Speed multiplier is negative or not finite.
    SpeedMultiplier(f64),
    /// `max_loops` is `Some(0)`.
    ZeroLoops,
}

impl fmt::Display for ConfigErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeaderSize(size) => write!(f, "header size must be 11 bytes, got {size}"),
            Self::EmptyPayload => write!(f, "max payload must be at least 1 byte"),
            Self::PayloadTooLarge {
                max_payload,
                available,
            } => write!(
                f,
                "max payload {max_payload} exceeds the {available} bytes left after the header"
            ),
            Self::PayloadExceedsLengthField(size) => {
                write!(f, "max payload {size} does not fit the 16-bit length field")
            }
            Self::SpeedMultiplier(speed) => {
                write!(f, "speed multiplier must be finite and >= 0, got {speed}")
            }
            Self::ZeroLoops => write!(f, "loop limit must be at least 1"),
        }
    }
}

impl StreamError {
    pub(crate) fn config(kind: ConfigErrorKind) -> Self {
        Self::InvalidConfig { kind }
    }
}

/// Convenience alias for `Result<T, StreamError>`.
pub type Result<T> = std::result::Result<T, StreamError>;
