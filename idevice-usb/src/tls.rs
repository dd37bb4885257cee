// Jackson Coxson
//
// The device presents the self-signed certificate minted at pairing time,
// so chain and name verification can never succeed; trust was established
// when the user accepted the pairing dialog. Handshake signatures are
// still checked against the crypto provider's algorithms.

use std::sync::Arc;

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider,
        WebPkiSupportedAlgorithms},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct,
};

use crate::pair_record::PairRecord;
use crate::DeviceError;

/// Accepts the pinned-by-pairing peer certificate as-is while leaving
/// signature verification to the provider.
#[derive(Debug)]
pub(crate) struct PairedDeviceVerifier {
    supported: WebPkiSupportedAlgorithms,
}

impl PairedDeviceVerifier {
    fn new(supported: WebPkiSupportedAlgorithms) -> Self {
        Self { supported }
    }
}

impl ServerCertVerifier for PairedDeviceVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.supported.supported_schemes()
    }
}

/// Builds the client config for a lockdown or service TLS session: client
/// auth with the pair record's host identity, peer chain verification
/// waved through.
pub(crate) fn client_config(record: &PairRecord) -> Result<ClientConfig, DeviceError> {
    let provider = CryptoProvider::get_default()
        .ok_or_else(|| DeviceError::SslError("no default crypto provider".to_string()))?;
    let verifier = PairedDeviceVerifier::new(provider.signature_verification_algorithms);

    let private_key = record.host_private_key_der()?;
    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(vec![record.host_certificate_der()?], private_key)
        .map_err(|e| DeviceError::SslError(e.to_string()))?;
    config.resumption = rustls::client::Resumption::disabled();
    Ok(config)
}
