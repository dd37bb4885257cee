// Jackson Coxson

//! USB backend adapter: finds devices in the documented ID range, claims
//! the mux interface and performs the version handshake, handing a pair of
//! bulk endpoint halves to the transport.

use std::time::Duration;

use log::{debug, trace, warn};
use nusb::io::{EndpointRead, EndpointWrite};
use nusb::transfer::{Bulk, Direction, In, Out};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::mux::packet::{VersionHeader, VERSION_HEADER_SIZE};
use crate::DeviceError;

pub const APPLE_VENDOR_ID: u16 = 0x05ac;
pub const PRODUCT_ID_FIRST: u16 = 0x1290;
pub const PRODUCT_ID_LAST: u16 = 0x1293;

const USB_CONFIGURATION: u8 = 3;
const USB_INTERFACE: u8 = 1;
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);
const ENDPOINT_BUFFER: usize = 4096;

/// An attached device found by enumeration, not yet opened.
#[derive(Clone, Debug)]
pub struct UsbDeviceInfo {
    pub(crate) info: nusb::DeviceInfo,
}

impl UsbDeviceInfo {
    /// The 40-hex-digit UDID the device reports as its USB serial.
    pub fn udid(&self) -> String {
        self.info.serial_number().unwrap_or_default().to_lowercase()
    }

    pub fn bus_number(&self) -> u8 {
        self.info.busnum()
    }

    pub fn address(&self) -> u8 {
        self.info.device_address()
    }

    pub fn product_id(&self) -> u16 {
        self.info.product_id()
    }
}

/// Scans USB busses for devices in the documented vendor/product range.
pub async fn list_devices() -> Result<Vec<UsbDeviceInfo>, DeviceError> {
    let devices = nusb::list_devices()
        .await
        .map_err(|e| DeviceError::MuxError(format!("usb enumeration failed: {e}")))?;
    Ok(devices
        .filter(|d| {
            d.vendor_id() == APPLE_VENDOR_ID
                && (PRODUCT_ID_FIRST..=PRODUCT_ID_LAST).contains(&d.product_id())
        })
        .map(|info| UsbDeviceInfo { info })
        .collect())
}

/// An opened and claimed backend: the two bulk halves plus the device
/// handle that keeps them alive.
pub(crate) struct UsbBackend {
    pub(crate) device: nusb::Device,
    pub(crate) input: EndpointRead<Bulk>,
    pub(crate) output: EndpointWrite<Bulk>,
}

impl UsbBackend {
    /// Opens the device, claims the mux interface and completes the version
    /// handshake.
    ///
    /// Sets configuration 3 first; if that fails a kernel driver is likely
    /// bound to the interface, so it is detached and the configuration set
    /// retried once. Stale bulk-in data from a previous session is drained
    /// before the handshake.
    pub(crate) async fn open(info: &UsbDeviceInfo) -> Result<Self, DeviceError> {
        let device = info.info.open().await.map_err(open_err)?;
        if let Err(e) = device.set_configuration(USB_CONFIGURATION).await {
            debug!("set_configuration returned {e}, detaching kernel driver and retrying");
            if let Err(e) = device.detach_kernel_driver(USB_INTERFACE) {
                debug!("detach_kernel_driver returned {e}");
            }
            device
                .set_configuration(USB_CONFIGURATION)
                .await
                .map_err(open_err)?;
        }

        let (in_address, out_address) = bulk_endpoint_addresses(&device)?;
        let interface = device.claim_interface(USB_INTERFACE).await.map_err(open_err)?;
        let input = interface
            .endpoint::<Bulk, In>(in_address)
            .map_err(open_err)?;
        let output = interface
            .endpoint::<Bulk, Out>(out_address)
            .map_err(open_err)?;
        let mut input = input.reader(ENDPOINT_BUFFER);
        let mut output = output.writer(ENDPOINT_BUFFER);

        drain(&mut input).await;
        version_handshake(&mut input, &mut output).await?;

        Ok(Self {
            device,
            input,
            output,
        })
    }
}

fn open_err<E: std::fmt::Display>(e: E) -> DeviceError {
    warn!("usb open failed: {e}");
    DeviceError::NoDevice
}

/// Finds the bulk IN/OUT endpoint addresses of interface 1 in
/// configuration 3.
fn bulk_endpoint_addresses(device: &nusb::Device) -> Result<(u8, u8), DeviceError> {
    let config = device
        .configurations()
        .find(|c| c.configuration_value() == USB_CONFIGURATION)
        .ok_or_else(|| {
            warn!("device has no configuration {USB_CONFIGURATION}");
            DeviceError::NoDevice
        })?;
    let interface = config
        .interface_alt_settings()
        .find(|i| i.interface_number() == USB_INTERFACE && i.alternate_setting() == 0)
        .ok_or_else(|| {
            warn!("configuration {USB_CONFIGURATION} has no interface {USB_INTERFACE}");
            DeviceError::NoDevice
        })?;

    let mut input = None;
    let mut output = None;
    for endpoint in interface.endpoints() {
        match endpoint.direction() {
            Direction::In => input = Some(endpoint.address()),
            Direction::Out => output = Some(endpoint.address()),
        }
    }
    match (input, output) {
        (Some(input), Some(output)) => Ok((input, output)),
        _ => {
            warn!("mux interface is missing a bulk endpoint pair");
            Err(DeviceError::NoDevice)
        }
    }
}

/// Reads and discards pending bulk-in data until the pipe goes quiet.
/// Used right after claiming the interface and again when closing.
pub(crate) async fn drain<R: AsyncRead + Unpin>(input: &mut R) {
    let mut scratch = [0u8; 512];
    loop {
        match tokio::time::timeout(DRAIN_TIMEOUT, input.read(&mut scratch)).await {
            Ok(Ok(0)) | Err(_) => return,
            Ok(Ok(n)) => trace!("discarded {n} residual bytes"),
            Ok(Err(e)) => {
                debug!("drain read returned {e}");
                return;
            }
        }
    }
}

/// Writes the version header and checks the device's echo.
async fn version_handshake<R, W>(input: &mut R, output: &mut W) -> Result<(), DeviceError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    output.write_all(&VersionHeader::CURRENT.encode()).await?;
    output.flush().await?;

    let mut echo = [0u8; VERSION_HEADER_SIZE];
    input.read_exact(&mut echo).await?;
    let echo = VersionHeader::parse(&echo);
    if echo != VersionHeader::CURRENT {
        warn!(
            "device answered version handshake with {}.{}",
            echo.major, echo.minor
        );
        return Err(DeviceError::BadHeader);
    }
    debug!("device speaks mux version {}.{}", echo.major, echo.minor);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handshake_accepts_matching_echo() {
        let (host, device) = tokio::io::duplex(1 << 12);
        let (mut input, mut output) = tokio::io::split(host);
        let echo_task = tokio::spawn(async move {
            let (mut din, mut dout) = tokio::io::split(device);
            let mut buf = [0u8; VERSION_HEADER_SIZE];
            din.read_exact(&mut buf).await.unwrap();
            assert_eq!(VersionHeader::parse(&buf), VersionHeader::CURRENT);
            dout.write_all(&buf).await.unwrap();
        });
        version_handshake(&mut input, &mut output).await.unwrap();
        echo_task.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_rejects_other_versions() {
        let (host, device) = tokio::io::duplex(1 << 12);
        let (mut input, mut output) = tokio::io::split(host);
        let echo_task = tokio::spawn(async move {
            let (mut din, mut dout) = tokio::io::split(device);
            let mut buf = [0u8; VERSION_HEADER_SIZE];
            din.read_exact(&mut buf).await.unwrap();
            let bogus = VersionHeader { major: 2, minor: 1 };
            dout.write_all(&bogus.encode()).await.unwrap();
        });
        match version_handshake(&mut input, &mut output).await {
            Err(DeviceError::BadHeader) => {}
            other => panic!("expected BadHeader, got {other:?}"),
        }
        echo_task.await.unwrap();
    }

    #[tokio::test]
    async fn drain_discards_stale_bytes() {
        let (host, mut device) = tokio::io::duplex(1 << 12);
        let (mut input, _output) = tokio::io::split(host);
        device.write_all(&[0xab; 700]).await.unwrap();
        drain(&mut input).await;
        // the next read sees only fresh data
        device.write_all(b"fresh").await.unwrap();
        let mut buf = [0u8; 5];
        input.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"fresh");
    }
}
