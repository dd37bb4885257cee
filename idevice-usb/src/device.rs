// Jackson Coxson

//! The device handle: owns the USB backend and the mux transport, and is
//! the factory for logical connections.

use log::debug;

use crate::mux::{MuxConnection, MuxTransport};
use crate::usb::{self, UsbDeviceInfo};
use crate::DeviceError;

/// An opened device. At most one live handle should exist per physical
/// device; the claimed interface enforces that on most hosts.
#[derive(Debug)]
pub struct UsbDevice {
    udid: String,
    transport: MuxTransport,
    _handle: nusb::Device,
}

impl UsbDevice {
    /// Opens a device by UDID, or the first one found when `udid` is
    /// `None`.
    ///
    /// A supplied UDID must be 40 hex digits; anything else is rejected as
    /// `InvalidArg` before touching the bus.
    pub async fn open(udid: Option<&str>) -> Result<Self, DeviceError> {
        let udid = match udid {
            Some(u) => {
                if u.len() != 40 || !u.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Err(DeviceError::InvalidArg);
                }
                Some(u.to_ascii_lowercase())
            }
            None => None,
        };
        let devices = usb::list_devices().await?;
        let info = match &udid {
            Some(u) => devices.into_iter().find(|d| &d.udid() == u),
            None => devices.into_iter().next(),
        }
        .ok_or(DeviceError::NoDevice)?;
        Self::open_device(info).await
    }

    /// Opens a device at an explicit (bus, address) location.
    pub async fn open_at(bus: u8, address: u8) -> Result<Self, DeviceError> {
        let info = usb::list_devices()
            .await?
            .into_iter()
            .find(|d| d.bus_number() == bus && d.address() == address)
            .ok_or(DeviceError::NoDevice)?;
        Self::open_device(info).await
    }

    /// Opens an enumerated device and starts its mux transport.
    pub async fn open_device(info: UsbDeviceInfo) -> Result<Self, DeviceError> {
        let udid = info.udid();
        let backend = usb::UsbBackend::open(&info).await?;
        debug!("opened device {udid}");
        let transport = MuxTransport::start(Box::new(backend.input), Box::new(backend.output));
        Ok(Self {
            udid,
            transport,
            _handle: backend.device,
        })
    }

    pub fn udid(&self) -> &str {
        &self.udid
    }

    /// Opens a logical connection to a TCP-like port on the device.
    pub async fn connect(&self, port: u16) -> Result<MuxConnection, DeviceError> {
        self.transport.connect(port).await
    }

    /// Closes the device: live connections are forcibly reset, residual
    /// bulk-in data is drained and the interface released.
    pub async fn close(mut self) {
        debug!("closing device {}", self.udid);
        self.transport.shutdown().await;
    }
}
