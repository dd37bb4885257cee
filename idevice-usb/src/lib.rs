#![doc = include_str!("../README.md")]
// Jackson Coxson

pub mod ca;
pub mod device;
pub mod lockdown;
pub mod mux;
pub mod pair_record;
pub mod services;
mod tls;
pub mod usb;

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use log::{debug, error};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

pub use device::UsbDevice;
pub use lockdown::LockdownClient;
pub use mux::MuxConnection;
pub use pair_record::{FilePairRecordStore, PairRecord, PairRecordStore};

/// A trait combining all required characteristics for a device communication
/// stream.
///
/// Both `MuxConnection` and the TLS stream wrapped around it implement this,
/// so the framing above never cares whether the session is secured.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug> ReadWrite for T {}

/// Read half of a bulk-endpoint backend.
pub trait BulkIn: AsyncRead + Unpin + Send {}
impl<T: AsyncRead + Unpin + Send> BulkIn for T {}

/// Write half of a bulk-endpoint backend.
pub trait BulkOut: AsyncWrite + Unpin + Send {}
impl<T: AsyncWrite + Unpin + Send> BulkOut for T {}

/// Upper bound for a single framed plist message. Frames claiming more than
/// this are rejected before any allocation happens.
pub const MAX_MESSAGE_SIZE: u32 = 1 << 24;

/// The transport under a logical connection: either the raw mux stream or
/// the TLS session running on top of it after `StartSession`.
#[derive(Debug)]
enum Transport {
    Plain(Box<dyn ReadWrite>),
    Tls(Box<tokio_rustls::client::TlsStream<Box<dyn ReadWrite>>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A logical connection to the device carrying length-prefixed plist
/// messages.
///
/// This is the framing shared by lockdown and every service client: a
/// big-endian u32 payload length followed by XML or binary plist bytes.
#[derive(Debug)]
pub struct DeviceConnection {
    transport: Option<Transport>,
    label: String,
}

impl DeviceConnection {
    /// Wraps an established stream.
    ///
    /// # Arguments
    /// * `socket` - The established connection, usually a `MuxConnection`
    /// * `label` - Identifier included in lockdown requests
    pub fn new(socket: Box<dyn ReadWrite>, label: impl Into<String>) -> Self {
        Self {
            transport: Some(Transport::Plain(socket)),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// True once `start_tls` has completed and traffic is encrypted.
    pub fn is_secured(&self) -> bool {
        matches!(self.transport, Some(Transport::Tls(_)))
    }

    fn transport(&mut self) -> Result<&mut Transport, DeviceError> {
        self.transport
            .as_mut()
            .ok_or_else(|| DeviceError::MuxError("connection is closed".to_string()))
    }

    /// Sends a plist message, XML-encoded and length-prefixed.
    pub async fn send_plist(&mut self, message: plist::Value) -> Result<(), DeviceError> {
        debug!("Sending plist: {message:?}");
        let mut payload = Vec::new();
        message.to_writer_xml(&mut payload)?;
        self.send_framed(&payload).await
    }

    /// Sends a plist message in the binary `bplist00` encoding.
    pub async fn send_binary_plist(&mut self, message: plist::Value) -> Result<(), DeviceError> {
        debug!("Sending binary plist: {message:?}");
        let mut payload = Vec::new();
        message.to_writer_binary(&mut payload)?;
        self.send_framed(&payload).await
    }

    async fn send_framed(&mut self, payload: &[u8]) -> Result<(), DeviceError> {
        if payload.len() > MAX_MESSAGE_SIZE as usize {
            return Err(DeviceError::PlistError(format!(
                "{} byte message exceeds the frame cap",
                payload.len()
            )));
        }
        let transport = self.transport()?;
        transport
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await?;
        transport.write_all(payload).await?;
        transport.flush().await?;
        Ok(())
    }

    /// Reads one framed plist message and parses it as a dictionary.
    ///
    /// Accepts both XML and binary payloads. A top-level `Error` string is
    /// mapped onto the error enum before the caller sees the message.
    pub async fn read_plist(&mut self) -> Result<plist::Dictionary, DeviceError> {
        let transport = self.transport()?;
        let mut len_buf = [0u8; 4];
        transport.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_MESSAGE_SIZE {
            return Err(DeviceError::PlistError(format!(
                "peer announced a {len} byte message, over the frame cap"
            )));
        }
        let mut payload = vec![0u8; len as usize];
        transport.read_exact(&mut payload).await?;
        let message: plist::Dictionary = plist::from_bytes(&payload)?;
        debug!("Received plist: {message:?}");

        if let Some(e) = message.get("Error").and_then(|e| e.as_string()) {
            return Err(DeviceError::from_lockdown_error(e));
        }
        Ok(message)
    }

    /// Sends raw bytes without framing. Service clients with their own
    /// headers (AFC) use this.
    pub async fn send_raw(&mut self, message: &[u8]) -> Result<(), DeviceError> {
        let transport = self.transport()?;
        transport.write_all(message).await?;
        transport.flush().await?;
        Ok(())
    }

    /// Reads exactly `len` bytes.
    pub async fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, DeviceError> {
        let transport = self.transport()?;
        let mut buf = vec![0; len];
        transport.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Upgrades the connection to TLS using the pairing credentials.
    ///
    /// The mux connection underneath keeps running; its seq/ack continue to
    /// advance on the ciphertext.
    pub async fn start_tls(&mut self, record: &PairRecord) -> Result<(), DeviceError> {
        if CryptoProvider::get_default().is_none() {
            if let Err(e) =
                CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider())
            {
                // Another thread may have won the race; nothing to do here.
                error!("Failed to set crypto provider: {e:?}");
            }
        }
        let socket = match self.transport.take() {
            Some(Transport::Plain(s)) => s,
            Some(secured @ Transport::Tls(_)) => {
                self.transport = Some(secured);
                return Err(DeviceError::SslError(
                    "session is already secured".to_string(),
                ));
            }
            None => return Err(DeviceError::MuxError("connection is closed".to_string())),
        };

        let config = tls::client_config(record)?;
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let stream = connector
            .connect(ServerName::try_from("Device").unwrap(), socket)
            .await
            .map_err(|e| DeviceError::SslError(e.to_string()))?;
        self.transport = Some(Transport::Tls(Box::new(stream)));
        Ok(())
    }

    /// Tears the TLS session down with a close-notify and reverts to the
    /// plaintext stream.
    pub async fn stop_tls(&mut self) -> Result<(), DeviceError> {
        match self.transport.take() {
            Some(Transport::Tls(mut stream)) => {
                let (_, conn) = stream.get_mut();
                conn.send_close_notify();
                if let Err(e) = stream.flush().await {
                    debug!("close-notify write failed: {e}");
                }
                let (socket, _) = stream.into_inner();
                self.transport = Some(Transport::Plain(socket));
                Ok(())
            }
            other => {
                self.transport = other;
                Ok(())
            }
        }
    }

    /// Shuts the stream down. On a mux connection this FIN-closes it.
    pub async fn close(&mut self) -> Result<(), DeviceError> {
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown().await?;
        }
        Ok(())
    }
}

/// Error surface for the whole crate. One enum, not per-layer.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DeviceError {
    #[error("invalid argument")]
    InvalidArg,
    #[error("no matching device attached")]
    NoDevice,
    #[error("peer closed before enough data arrived")]
    NotEnoughData,
    #[error("device answered the version handshake with a bad header")]
    BadHeader,
    #[error("operation timed out")]
    Timeout,
    #[error("mux transport failure: {0}")]
    MuxError(String),
    #[error("plist encode/decode failure: {0}")]
    PlistError(String),
    #[error("ssl failure: {0}")]
    SslError(String),
    #[error("pairing dialog response pending on the device")]
    PairingDialogResponsePending,
    #[error("pair record is missing or malformed")]
    InvalidPairRecord,
    #[error("device is password protected")]
    PasswordProtected,
    #[error("service is invalid or unknown to lockdown")]
    InvalidService,
    #[error("unknown error `{0}` returned from device")]
    Unknown(String),
}

impl From<io::Error> for DeviceError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::UnexpectedEof => Self::NotEnoughData,
            _ => Self::MuxError(e.to_string()),
        }
    }
}

impl From<plist::Error> for DeviceError {
    fn from(e: plist::Error) -> Self {
        Self::PlistError(e.to_string())
    }
}

impl From<rustls::Error> for DeviceError {
    fn from(e: rustls::Error) -> Self {
        Self::SslError(e.to_string())
    }
}

impl From<rustls::pki_types::pem::Error> for DeviceError {
    fn from(_: rustls::pki_types::pem::Error) -> Self {
        Self::InvalidPairRecord
    }
}

impl From<tokio::time::error::Elapsed> for DeviceError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}

impl DeviceError {
    /// Maps a lockdown `Error` string onto the enum. Strings without a
    /// matching variant keep their original text.
    pub(crate) fn from_lockdown_error(e: &str) -> Self {
        match e {
            "PairingDialogResponsePending" => Self::PairingDialogResponsePending,
            "PasswordProtected" | "DeviceLocked" => Self::PasswordProtected,
            "InvalidHostID" | "InvalidPairRecord" => Self::InvalidPairRecord,
            "InvalidService" | "MissingService" => Self::InvalidService,
            other => Self::Unknown(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (DeviceConnection, tokio::io::DuplexStream) {
        let (host, peer) = tokio::io::duplex(1 << 20);
        (DeviceConnection::new(Box::new(host), "test"), peer)
    }

    fn sample_dict() -> plist::Dictionary {
        let mut dict = plist::Dictionary::new();
        dict.insert("Request".into(), "QueryType".into());
        dict.insert("Count".into(), 7.into());
        dict.insert("Flag".into(), true.into());
        dict.insert(
            "Blob".into(),
            plist::Value::Data(vec![0x00, 0xff, 0x42, 0x13]),
        );
        dict
    }

    #[tokio::test]
    async fn xml_roundtrip() {
        let (mut a, peer) = pipe();
        let mut b = DeviceConnection::new(Box::new(peer), "peer");
        let dict = sample_dict();
        a.send_plist(plist::Value::Dictionary(dict.clone()))
            .await
            .unwrap();
        let got = b.read_plist().await.unwrap();
        assert_eq!(got, dict);
    }

    #[tokio::test]
    async fn binary_roundtrip() {
        let (mut a, peer) = pipe();
        let mut b = DeviceConnection::new(Box::new(peer), "peer");
        let dict = sample_dict();
        a.send_binary_plist(plist::Value::Dictionary(dict.clone()))
            .await
            .unwrap();
        let got = b.read_plist().await.unwrap();
        assert_eq!(got, dict);
    }

    #[tokio::test]
    async fn chunked_arrival() {
        use tokio::io::AsyncWriteExt;

        let (mut conn, mut peer) = pipe();
        let mut payload = Vec::new();
        plist::Value::Dictionary(sample_dict())
            .to_writer_xml(&mut payload)
            .unwrap();
        let mut framed = (payload.len() as u32).to_be_bytes().to_vec();
        framed.extend_from_slice(&payload);

        // Deliver the frame one byte at a time; the reader must still
        // recover the message once everything has arrived.
        let writer = tokio::spawn(async move {
            for b in framed {
                peer.write_all(&[b]).await.unwrap();
                peer.flush().await.unwrap();
            }
            peer
        });
        let got = conn.read_plist().await.unwrap();
        assert_eq!(got, sample_dict());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut conn, mut peer) = pipe();
        peer.write_all(&(MAX_MESSAGE_SIZE + 1).to_be_bytes())
            .await
            .unwrap();
        match conn.read_plist().await {
            Err(DeviceError::PlistError(_)) => {}
            other => panic!("expected PlistError, got {other:?}"),
        }
    }

    /// Drives the TLS bridge against a real rustls server holding the
    /// device identity minted by `ca`, then checks that `stop_tls` sends
    /// close-notify and hands the plaintext stream back.
    #[tokio::test]
    async fn tls_bridge_secures_and_reverts() {
        use rsa::pkcs1::EncodeRsaPublicKey;
        use rsa::pkcs8::{EncodePrivateKey, LineEnding};
        use rsa::{RsaPrivateKey, RsaPublicKey};
        use rustls::pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer};

        if CryptoProvider::get_default().is_none() {
            let _ =
                CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider());
        }

        let device_key = RsaPrivateKey::new(&mut rsa::rand_core::OsRng, 2048).unwrap();
        let device_public = RsaPublicKey::from(&device_key)
            .to_pkcs1_pem(LineEnding::LF)
            .unwrap();
        let identity = crate::ca::generate_certificates(device_public.as_bytes()).unwrap();
        let record = PairRecord {
            device_certificate: identity.device_certificate.clone(),
            host_certificate: identity.host_certificate,
            root_certificate: identity.root_certificate,
            host_private_key: identity.host_private_key,
            root_private_key: identity.root_private_key,
            host_id: "f81d4fae-7dec-41d0-a765-00a0c91e6bf6".to_string(),
            system_buid: "7b49ceeb-bacf-4bfd-b842-4ad9bca8df27".to_string(),
            device_public_key: None,
        };

        let device_cert =
            CertificateDer::from_pem_slice(&identity.device_certificate).unwrap();
        let device_key_der = PrivateKeyDer::from_pem_slice(
            device_key
                .to_pkcs8_pem(LineEnding::LF)
                .unwrap()
                .as_bytes(),
        )
        .unwrap();
        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![device_cert], device_key_der)
            .unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

        let (host, peer) = tokio::io::duplex(1 << 20);
        let mut conn = DeviceConnection::new(Box::new(host), "tls-test");

        let device_task = tokio::spawn(async move {
            let mut stream = acceptor.accept(peer).await.unwrap();
            // one framed plist over the secured stream
            let mut len = [0u8; 4];
            stream.read_exact(&mut len).await.unwrap();
            let mut payload = vec![0u8; u32::from_be_bytes(len) as usize];
            stream.read_exact(&mut payload).await.unwrap();
            let req: plist::Dictionary = plist::from_bytes(&payload).unwrap();
            assert_eq!(
                req.get("Request").and_then(|r| r.as_string()),
                Some("GetValue")
            );

            let mut res = plist::Dictionary::new();
            res.insert("Request".into(), "GetValue".into());
            res.insert("Value".into(), "secured".into());
            let mut out = Vec::new();
            plist::Value::Dictionary(res).to_writer_xml(&mut out).unwrap();
            stream
                .write_all(&(out.len() as u32).to_be_bytes())
                .await
                .unwrap();
            stream.write_all(&out).await.unwrap();
            stream.flush().await.unwrap();

            // the host's stop_tls must arrive as a clean close-notify
            let mut probe = [0u8; 1];
            let n = stream.read(&mut probe).await.unwrap();
            assert_eq!(n, 0);
        });

        conn.start_tls(&record).await.unwrap();
        assert!(conn.is_secured());

        let mut req = plist::Dictionary::new();
        req.insert("Request".into(), "GetValue".into());
        conn.send_plist(plist::Value::Dictionary(req)).await.unwrap();
        let res = conn.read_plist().await.unwrap();
        assert_eq!(res.get("Value").and_then(|v| v.as_string()), Some("secured"));

        conn.stop_tls().await.unwrap();
        assert!(!conn.is_secured());
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn device_error_strings_map() {
        let (mut conn, peer) = pipe();
        let mut dev = DeviceConnection::new(Box::new(peer), "dev");
        let mut res = plist::Dictionary::new();
        res.insert("Request".into(), "Pair".into());
        res.insert("Error".into(), "PairingDialogResponsePending".into());
        dev.send_plist(plist::Value::Dictionary(res)).await.unwrap();
        match conn.read_plist().await {
            Err(DeviceError::PairingDialogResponsePending) => {}
            other => panic!("expected pending error, got {other:?}"),
        }

        let mut res = plist::Dictionary::new();
        res.insert("Error".into(), "SomethingNovel".into());
        dev.send_plist(plist::Value::Dictionary(res)).await.unwrap();
        match conn.read_plist().await {
            Err(DeviceError::Unknown(s)) => assert_eq!(s, "SomethingNovel"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }
}
