// Jackson Coxson

//! Lockdown control channel: session negotiation, pairing, the in-band TLS
//! upgrade and service discovery.
//!
//! Every request is an XML plist dict with a `Request` key; responses echo
//! it and either carry the result or an `Error` string.

use std::time::Duration;

use log::{debug, warn};
use plist::Value;

use crate::pair_record::{PairRecord, PairRecordStore};
use crate::{ca, DeviceConnection, DeviceError, ReadWrite, UsbDevice};

/// TCP-like destination port lockdownd listens on.
pub const LOCKDOWN_PORT: u16 = 62078;

const PAIR_DIALOG_RETRIES: u32 = 20;
const PAIR_DIALOG_DELAY: Duration = Duration::from_secs(1);

/// Where lockdown said a started service lives.
#[derive(Clone, Debug)]
pub struct ServiceHandle {
    pub name: String,
    pub port: u16,
    /// The caller must TLS-upgrade the service connection before any
    /// traffic when set.
    pub requires_tls: bool,
}

/// Client for the lockdown control channel.
///
/// Request/response pairs are atomic per instance: the `&mut self` methods
/// serialize callers naturally, and an instance shared between tasks goes
/// behind one mutex.
pub struct LockdownClient {
    pub connection: DeviceConnection,
    session_id: Option<String>,
}

impl LockdownClient {
    /// Connects over the device's mux transport and performs the QueryType
    /// handshake.
    pub async fn connect(device: &UsbDevice) -> Result<Self, DeviceError> {
        let socket = device.connect(LOCKDOWN_PORT).await?;
        Self::from_socket(Box::new(socket), "idevice-usb").await
    }

    /// Builds a client over an established stream and performs the
    /// QueryType handshake.
    pub async fn from_socket(
        socket: Box<dyn ReadWrite>,
        label: impl Into<String>,
    ) -> Result<Self, DeviceError> {
        let mut client = Self {
            connection: DeviceConnection::new(socket, label),
            session_id: None,
        };
        client.query_type().await?;
        Ok(client)
    }

    fn base_request(&self, request: &str) -> plist::Dictionary {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.connection.label().to_owned().into());
        req.insert("Request".into(), request.into());
        req
    }

    /// Verifies the peer actually is lockdownd. Anything but the canonical
    /// type string is fatal.
    pub async fn query_type(&mut self) -> Result<String, DeviceError> {
        let req = self.base_request("QueryType");
        self.connection.send_plist(Value::Dictionary(req)).await?;
        let res = self.connection.read_plist().await?;
        match res.get("Type").and_then(|t| t.as_string()) {
            Some("com.apple.mobile.lockdown") => Ok("com.apple.mobile.lockdown".to_string()),
            Some(other) => {
                warn!("port {LOCKDOWN_PORT} answered QueryType with {other}");
                Err(DeviceError::InvalidService)
            }
            None => Err(DeviceError::InvalidService),
        }
    }

    /// Retrieves a value from the device, optionally under a domain. With
    /// no key the whole domain dictionary comes back.
    pub async fn get_value(
        &mut self,
        key: Option<&str>,
        domain: Option<&str>,
    ) -> Result<Value, DeviceError> {
        let mut req = self.base_request("GetValue");
        if let Some(key) = key {
            req.insert("Key".into(), key.into());
        }
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        self.connection.send_plist(Value::Dictionary(req)).await?;
        let res = self.connection.read_plist().await?;
        res.get("Value")
            .cloned()
            .ok_or_else(|| DeviceError::Unknown("response carried no Value".to_string()))
    }

    /// Sets a value on the device.
    pub async fn set_value(
        &mut self,
        key: impl Into<String>,
        value: Value,
        domain: Option<&str>,
    ) -> Result<(), DeviceError> {
        let key = key.into();
        let mut req = self.base_request("SetValue");
        req.insert("Key".into(), key.into());
        req.insert("Value".into(), value);
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        self.connection.send_plist(Value::Dictionary(req)).await?;
        self.connection.read_plist().await?;
        Ok(())
    }

    /// Starts a session. When the device asks for SSL the TLS handshake
    /// runs immediately over the same mux connection, and everything after
    /// this call is encrypted until `stop_session`.
    pub async fn start_session(&mut self, record: &PairRecord) -> Result<(), DeviceError> {
        let mut req = self.base_request("StartSession");
        req.insert("HostID".into(), record.host_id.clone().into());
        req.insert("SystemBUID".into(), record.system_buid.clone().into());
        self.connection.send_plist(Value::Dictionary(req)).await?;

        let res = self.connection.read_plist().await?;
        let session_id = res
            .get("SessionID")
            .and_then(|s| s.as_string())
            .map(ToOwned::to_owned)
            .ok_or_else(|| {
                DeviceError::Unknown("StartSession response carried no SessionID".to_string())
            })?;
        let enable_ssl = res
            .get("EnableSessionSSL")
            .and_then(|b| b.as_boolean())
            .unwrap_or(false);

        if enable_ssl {
            self.connection.start_tls(record).await?;
            debug!("lockdown session {session_id} secured");
        } else {
            debug!("lockdown session {session_id} started without SSL");
        }
        self.session_id = Some(session_id);
        Ok(())
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Stops the current session. The TLS session is torn down with a
    /// close-notify and the connection reverts to plaintext.
    pub async fn stop_session(&mut self) -> Result<(), DeviceError> {
        let Some(session_id) = self.session_id.clone() else {
            return Ok(());
        };
        let mut req = self.base_request("StopSession");
        req.insert("SessionID".into(), session_id.into());
        self.connection.send_plist(Value::Dictionary(req)).await?;
        self.connection.read_plist().await?;
        self.connection.stop_tls().await?;
        self.session_id = None;
        Ok(())
    }

    /// Asks lockdownd to start a service, returning the port to connect to
    /// and whether that connection needs a TLS upgrade of its own.
    pub async fn start_service(
        &mut self,
        name: impl Into<String>,
    ) -> Result<ServiceHandle, DeviceError> {
        let name = name.into();
        let mut req = self.base_request("StartService");
        req.insert("Service".into(), name.clone().into());
        self.connection.send_plist(Value::Dictionary(req)).await?;
        let res = self.connection.read_plist().await?;

        let port = res
            .get("Port")
            .and_then(|p| p.as_unsigned_integer())
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p != 0)
            .ok_or_else(|| {
                warn!("StartService response carried no usable port");
                DeviceError::Unknown("StartService response carried no usable port".to_string())
            })?;
        let requires_tls = res
            .get("EnableServiceSSL")
            .and_then(|b| b.as_boolean())
            // over USB the key is usually absent entirely
            .unwrap_or(false);

        debug!("service {name} started on port {port} (tls: {requires_tls})");
        Ok(ServiceHandle {
            name,
            port,
            requires_tls,
        })
    }

    /// First-time pairing. Fetches the device's public key, generates the
    /// host identity and submits the pair record; while the trust dialog
    /// is up on the device the request is retried once per second.
    ///
    /// The returned record is not persisted here; use
    /// [`LockdownClient::pair_with_store`] for that.
    pub async fn pair(
        &mut self,
        host_id: impl Into<String>,
        system_buid: impl Into<String>,
    ) -> Result<PairRecord, DeviceError> {
        let host_id = host_id.into();
        let system_buid = system_buid.into();

        let public_key = self.get_value(Some("DevicePublicKey"), None).await?;
        let public_key = public_key
            .as_data()
            .map(|d| d.to_vec())
            .ok_or_else(|| DeviceError::Unknown("DevicePublicKey was not data".to_string()))?;

        let identity = ca::generate_certificates(&public_key)?;

        let mut record_dict = plist::Dictionary::new();
        record_dict.insert(
            "DeviceCertificate".into(),
            Value::Data(identity.device_certificate.clone()),
        );
        record_dict.insert(
            "HostCertificate".into(),
            Value::Data(identity.host_certificate.clone()),
        );
        record_dict.insert(
            "RootCertificate".into(),
            Value::Data(identity.root_certificate.clone()),
        );
        record_dict.insert("HostID".into(), host_id.clone().into());
        record_dict.insert("SystemBUID".into(), system_buid.clone().into());

        let mut req = self.base_request("Pair");
        req.insert("PairRecord".into(), Value::Dictionary(record_dict));
        req.insert("ProtocolVersion".into(), "2".into());

        let mut attempt = 0;
        loop {
            self.connection
                .send_plist(Value::Dictionary(req.clone()))
                .await?;
            match self.connection.read_plist().await {
                Ok(_) => break,
                Err(DeviceError::PairingDialogResponsePending)
                    if attempt < PAIR_DIALOG_RETRIES =>
                {
                    attempt += 1;
                    debug!("pairing dialog pending, retry {attempt}/{PAIR_DIALOG_RETRIES}");
                    tokio::time::sleep(PAIR_DIALOG_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(PairRecord {
            device_certificate: identity.device_certificate,
            host_certificate: identity.host_certificate,
            root_certificate: identity.root_certificate,
            host_private_key: identity.host_private_key,
            root_private_key: identity.root_private_key,
            host_id,
            system_buid,
            device_public_key: Some(public_key),
        })
    }

    /// Pairs with a freshly minted HostID and the store's SystemBUID, then
    /// persists the record keyed by the device's UDID.
    pub async fn pair_with_store(
        &mut self,
        store: &dyn PairRecordStore,
        udid: &str,
    ) -> Result<PairRecord, DeviceError> {
        let host_id = uuid::Uuid::new_v4().to_string();
        let system_buid = store.system_buid()?;
        let record = self.pair(host_id, system_buid).await?;
        store.save(udid, &record)?;
        Ok(record)
    }

    /// Best-effort StopSession, then FIN-closes the connection.
    pub async fn close(mut self) {
        if self.session_id.is_some() {
            if let Err(e) = self.stop_session().await {
                debug!("stop session on close failed: {e}");
            }
        }
        if let Err(e) = self.connection.close().await {
            debug!("lockdown close failed: {e}");
        }
    }
}
