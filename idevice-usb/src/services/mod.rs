// Jackson Coxson

//! Service clients layered on the core channel. Each one is a thin
//! request/response adapter: lockdown hands out a port, the device handle
//! opens a mux connection to it, and the client brings its own framing.

pub mod afc;
pub mod notification_proxy;

use crate::lockdown::LockdownClient;
use crate::pair_record::PairRecord;
use crate::{DeviceConnection, DeviceError, UsbDevice};

/// A client for a lockdown-started service.
pub trait ServiceClient: Sized {
    /// Service name as lockdownd knows it.
    fn service_name() -> &'static str;

    fn from_connection(connection: DeviceConnection) -> Self;
}

/// Starts a service via lockdown and connects to the returned port,
/// running the TLS upgrade first when the device asks for one.
pub async fn connect_service<S: ServiceClient>(
    device: &UsbDevice,
    lockdown: &mut LockdownClient,
    pair_record: Option<&PairRecord>,
) -> Result<S, DeviceError> {
    let handle = lockdown.start_service(S::service_name()).await?;
    let socket = device.connect(handle.port).await?;
    let mut connection = DeviceConnection::new(Box::new(socket), lockdown.connection.label());
    if handle.requires_tls {
        let record = pair_record.ok_or(DeviceError::InvalidPairRecord)?;
        connection.start_tls(record).await?;
    }
    Ok(S::from_connection(connection))
}
