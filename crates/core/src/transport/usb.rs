use std::time::Duration;

use rusb::{DeviceHandle, GlobalContext, UsbContext};

use crate::config::DeviceConfig;
use crate::error::{Result, StreamError};

use super::Sink;

/// Bulk-out transport to the display over libusb.
///
/// The connection is opened once and held for the lifetime of the value.
/// Kernel-driver detachment and interface claiming are best effort: the
/// firmware accepts bulk writes without them on some hosts, so failures
/// are logged and streaming proceeds. The interface is released on drop.
pub struct UsbTransport {
    handle: DeviceHandle<GlobalContext>,
    interface: u8,
    endpoint: u8,
    timeout: Duration,
    claimed: bool,
}

impl UsbTransport {
    /// Find the device by vendor/product id and prepare its interface.
    pub fn open(config: &DeviceConfig) -> Result<Self> {
        let unavailable = |reason: String| StreamError::DeviceUnavailable {
            vendor_id: config.vendor_id,
            product_id: config.product_id,
            reason,
        };

        let devices = GlobalContext::default()
            .devices()
            .map_err(|e| unavailable(format!("cannot enumerate USB devices: {e}")))?;

        let device = devices
            .iter()
            .find(|device| {
                device.device_descriptor().is_ok_and(|desc| {
                    desc.vendor_id() == config.vendor_id && desc.product_id() == config.product_id
                })
            })
            .ok_or_else(|| unavailable("device not found".to_string()))?;

        let handle = device
            .open()
            .map_err(|e| unavailable(format!("cannot open device: {e}")))?;

        match handle.kernel_driver_active(config.interface) {
            Ok(true) => match handle.detach_kernel_driver(config.interface) {
                Ok(()) => tracing::debug!(interface = config.interface, "kernel driver detached"),
                Err(e) => tracing::warn!(
                    interface = config.interface,
                    error = %e,
                    "failed to detach kernel driver"
                ),
            },
            Ok(false) | Err(rusb::Error::NotSupported) => {}
            Err(e) => tracing::warn!(
                interface = config.interface,
                error = %e,
                "cannot query kernel driver state"
            ),
        }

        let claimed = match handle.claim_interface(config.interface) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    interface = config.interface,
                    error = %e,
                    "failed to claim interface"
                );
                false
            }
        };

        tracing::info!(
            vendor_id = format_args!("{:#06x}", config.vendor_id),
            product_id = format_args!("{:#06x}", config.product_id),
            bus = device.bus_number(),
            address = device.address(),
            endpoint = format_args!("{:#04x}", config.endpoint),
            "device initialized"
        );

        Ok(Self {
            handle,
            interface: config.interface,
            endpoint: config.endpoint,
            timeout: config.write_timeout,
            claimed,
        })
    }
}

impl Sink for UsbTransport {
    fn send(&mut self, packet: &[u8]) -> Result<()> {
        let written = self.handle.write_bulk(self.endpoint, packet, self.timeout)?;
        if written != packet.len() {
            return Err(StreamError::ShortWrite {
                written,
                expected: packet.len(),
            });
        }
        Ok(())
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        if self.claimed {
            if let Err(e) = self.handle.release_interface(self.interface) {
                tracing::debug!(interface = self.interface, error = %e, "release interface failed");
            }
        }
    }
}
