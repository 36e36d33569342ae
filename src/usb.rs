use crate::device_ids::{self, UsbId};
use crate::protocol::Transport;
use crate::session::{Connector, DeviceError};
use log::{debug, warn};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::fmt::Display;
use std::time::Duration;

const IN_ENDPOINT: u8 = 0x81;
const OUT_ENDPOINT: u8 = 0x01;
const CONFIGURATION: u8 = 1;
const INTERFACE: u8 = 0;

/// Restricts which bootloader to use when several are attached. Unset fields match anything.
#[derive(Copy, Clone, Debug, Default)]
pub struct DeviceFilter {
    pub bus: Option<u8>,
    pub address: Option<u8>,
}

impl DeviceFilter {
    fn matches(&self, bus: u8, address: u8) -> bool {
        self.bus.is_none_or(|b| b == bus) && self.address.is_none_or(|a| a == address)
    }
}

/// A bootloader seen on the bus.
#[derive(Copy, Clone, Debug)]
pub struct FoundDevice {
    pub bus: u8,
    pub address: u8,
    pub id: UsbId,
}

impl Display for FoundDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Bus {:03} Device {:03}: ID {}", self.bus, self.address, self.id)
    }
}

/// Finds bootloaders through libusb.
pub struct UsbConnector {
    context: Context,
    filter: DeviceFilter,
}

impl UsbConnector {
    pub fn new(filter: DeviceFilter) -> Result<Self, DeviceError> {
        Ok(Self {
            context: Context::new().map_err(DeviceError::Enumeration)?,
            filter,
        })
    }

    /// All attached bootloaders that pass the filter.
    pub fn list(&self) -> Result<Vec<FoundDevice>, DeviceError> {
        Ok(self
            .candidates()?
            .into_iter()
            .map(|(_, found)| found)
            .collect())
    }

    fn candidates(&self) -> Result<Vec<(Device<Context>, FoundDevice)>, DeviceError> {
        let devices = self.context.devices().map_err(DeviceError::Enumeration)?;
        let mut found = Vec::new();

        for device in devices.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(d) => d,
                Err(e) => {
                    debug!(
                        "Skipping device {:03}:{:03}: {e}",
                        device.bus_number(),
                        device.address()
                    );
                    continue;
                }
            };

            let info = FoundDevice {
                bus: device.bus_number(),
                address: device.address(),
                id: UsbId {
                    vid: descriptor.vendor_id(),
                    pid: descriptor.product_id(),
                },
            };

            if device_ids::is_bootloader(info.id) && self.filter.matches(info.bus, info.address) {
                found.push((device, info));
            }
        }

        Ok(found)
    }
}

impl Connector for UsbConnector {
    type Handle = UsbBootloader;

    fn connect(&mut self) -> Result<UsbBootloader, DeviceError> {
        let mut candidates = self.candidates()?.into_iter();

        match (candidates.next(), candidates.next()) {
            (None, _) => Err(DeviceError::NotFound),
            (Some(_), Some(_)) => Err(DeviceError::MultipleDevices),
            (Some((device, info)), None) => {
                debug!("Opening {info}");
                UsbBootloader::open(&device)
            }
        }
    }
}

/// An opened bootloader with its interface claimed. Dropping it releases the interface and
/// closes the device.
pub struct UsbBootloader {
    handle: DeviceHandle<Context>,
}

impl UsbBootloader {
    fn open(device: &Device<Context>) -> Result<Self, DeviceError> {
        let mut handle = device.open().map_err(DeviceError::OpenFailed)?;

        // Not supported everywhere; claiming will report the real problem if a driver is bound.
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            debug!("Kernel driver auto-detach unavailable: {e}");
        }

        handle
            .set_active_configuration(CONFIGURATION)
            .map_err(DeviceError::OpenFailed)?;
        handle
            .claim_interface(INTERFACE)
            .map_err(DeviceError::ClaimFailed)?;

        Ok(Self { handle })
    }
}

impl Transport for UsbBootloader {
    fn write_packet(&mut self, packet: &[u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.write_bulk(OUT_ENDPOINT, packet, timeout)
    }

    fn read_packet(&mut self, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.read_bulk(IN_ENDPOINT, buf, timeout)
    }
}

impl Drop for UsbBootloader {
    fn drop(&mut self) {
        match self.handle.release_interface(INTERFACE) {
            Ok(()) => debug!("Released bootloader interface"),
            // Expected after a reset: the bootloader has already left the bus.
            Err(rusb::Error::NoDevice) => debug!("Bootloader gone before release"),
            Err(e) => warn!("Could not release bootloader interface: {e}"),
        }
    }
}
