use std::time::Duration;

use crate::error::{ConfigErrorKind, Result, StreamError};
use crate::media::header::HEADER_LEN;

/// Report id used by the shared-config firmware generation ("control/video").
pub const REPORT_ID_CONTROL_VIDEO: u8 = 0x02;
/// Report id used by the video-only firmware generation.
pub const REPORT_ID_VIDEO_ONLY: u8 = 0x03;
/// Command byte identifying an H.264 payload chunk.
pub const CMD_SEND_H264: u8 = 0x0D;

/// Wire framing parameters shared by every packet of a session.
///
/// Firmware generations disagree on the report id, so it is data here
/// rather than a constant baked into the packetizer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolConfig {
    /// Header byte 0: protocol channel selector.
    pub report_id: u8,
    /// Header byte 1: command identifier.
    pub command: u8,
    /// Size of the fixed header. Must be 11.
    pub header_size: usize,
    /// Size of every packet on the wire, header included.
    pub packet_size: usize,
    /// Maximum payload bytes per packet.
    pub max_payload: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            report_id: REPORT_ID_CONTROL_VIDEO,
            command: CMD_SEND_H264,
            header_size: HEADER_LEN,
            packet_size: 512,
            max_payload: 501,
        }
    }
}

impl ProtocolConfig {
    /// Check that the sizes describe a layout the header can encode.
    pub fn validate(&self) -> Result<()> {
        if self.header_size != HEADER_LEN {
            return Err(StreamError::config(ConfigErrorKind::HeaderSize(
                self.header_size,
            )));
        }
        if self.max_payload == 0 {
            return Err(StreamError::config(ConfigErrorKind::EmptyPayload));
        }
        let available = self.packet_size.saturating_sub(self.header_size);
        if self.max_payload > available {
            return Err(StreamError::config(ConfigErrorKind::PayloadTooLarge {
                max_payload: self.max_payload,
                available,
            }));
        }
        if self.max_payload > u16::MAX as usize {
            return Err(StreamError::config(
                ConfigErrorKind::PayloadExceedsLengthField(self.max_payload),
            ));
        }
        Ok(())
    }
}

/// USB identity and endpoint of the target display.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Interface carrying the bulk-out endpoint.
    pub interface: u8,
    /// Bulk-out endpoint address.
    pub endpoint: u8,
    /// Upper bound on a single bulk write. `Duration::ZERO` waits forever.
    pub write_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0x0416,
            product_id: 0x7395,
            interface: 1,
            endpoint: 0x02,
            write_timeout: Duration::from_millis(1000),
        }
    }
}

/// Pacing loop behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Multiplier applied to the frame interval; higher is slower, 0 disables pacing.
    pub speed_multiplier: f64,
    /// Stop after this many complete passes over the source. `None` loops forever.
    pub max_loops: Option<u64>,
    /// Abort the session after this many consecutive failed writes.
    /// `None` keeps streaming regardless.
    pub max_consecutive_write_failures: Option<u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            speed_multiplier: 1.0,
            max_loops: None,
            max_consecutive_write_failures: None,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.speed_multiplier.is_finite() || self.speed_multiplier < 0.0 {
            return Err(StreamError::config(ConfigErrorKind::SpeedMultiplier(
                self.speed_multiplier,
            )));
        }
        if self.max_loops == Some(0) {
            return Err(StreamError::config(ConfigErrorKind::ZeroLoops));
        }
        Ok(())
    }
}

/// Everything a session needs, bundled for callers that load it in one place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub protocol: ProtocolConfig,
    pub device: DeviceConfig,
    pub stream: StreamConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.protocol.validate()?;
        self.stream.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_device_firmware() {
        let p = ProtocolConfig::default();
        assert_eq!(p.report_id, 0x02);
        assert_eq!(p.command, 0x0D);
        assert_eq!(p.header_size, 11);
        assert_eq!(p.packet_size, 512);
        assert_eq!(p.max_payload, 501);
        assert!(p.validate().is_ok());

        let d = DeviceConfig::default();
        assert_eq!((d.vendor_id, d.product_id), (0x0416, 0x7395));
        assert_eq!(d.endpoint, 0x02);
        assert_eq!(d.interface, 1);
    }

    #[test]
    fn rejects_header_size_other_than_eleven() {
        let p = ProtocolConfig {
            header_size: 12,
            ..Default::default()
        };
        match p.validate() {
            Err(StreamError::InvalidConfig { kind }) => {
                assert_eq!(kind, ConfigErrorKind::HeaderSize(12))
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rejects_payload_overflowing_packet() {
        let p = ProtocolConfig {
            max_payload: 502,
            ..Default::default()
        };
        assert!(matches!(
            p.validate(),
            Err(StreamError::InvalidConfig {
                kind: ConfigErrorKind::PayloadTooLarge {
                    max_payload: 502,
                    available: 501
                }
            })
        ));
    }

    #[test]
    fn rejects_zero_payload() {
        let p = ProtocolConfig {
            max_payload: 0,
            ..Default::default()
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn rejects_payload_beyond_length_field() {
        let p = ProtocolConfig {
            packet_size: 70_000,
            max_payload: 65_536,
            ..Default::default()
        };
        assert!(matches!(
            p.validate(),
            Err(StreamError::InvalidConfig {
                kind: ConfigErrorKind::PayloadExceedsLengthField(65_536)
            })
        ));
    }

    #[test]
    fn smaller_payload_is_allowed() {
        let p = ProtocolConfig {
            max_payload: 100,
            ..Default::default()
        };
        assert!(p.validate().is_ok());
    }

    #[test]
    fn speed_multiplier_bounds() {
        for bad in [-0.5, f64::NAN, f64::INFINITY] {
            let s = StreamConfig {
                speed_multiplier: bad,
                ..Default::default()
            };
            assert!(s.validate().is_err(), "{bad} should be rejected");
        }
        for good in [0.0, 0.5, 1.0, 2.0] {
            let s = StreamConfig {
                speed_multiplier: good,
                ..Default::default()
            };
            assert!(s.validate().is_ok(), "{good} should be accepted");
        }
    }

    #[test]
    fn loop_limit_must_be_positive() {
        let zero = StreamConfig {
            max_loops: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            zero.validate(),
            Err(StreamError::InvalidConfig {
                kind: ConfigErrorKind::ZeroLoops
            })
        ));
        let one = StreamConfig {
            max_loops: Some(1),
            ..Default::default()
        };
        assert!(one.validate().is_ok());
    }
}
