pub mod config;
pub mod error;
pub mod media;
pub mod source;
pub mod stream;
pub mod transport;

pub use config::{Config, DeviceConfig, ProtocolConfig, StreamConfig};
pub use error::{Result, StreamError};
pub use media::{AccessUnit, Packet, Packetizer};
pub use source::{AnnexBFile, FrameSource, MemorySource};
pub use stream::{CancelToken, StreamReport, Streamer};
pub use transport::{CaptureSink, Sink, UsbTransport, WriterSink};
