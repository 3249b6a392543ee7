//! TLS upgrade support.
//!
//! Direct Connect does not use the web PKI: hubs and clients present
//! self-signed certificates and trust is pinned by *keyprint*, the
//! SHA-256 fingerprint of the certificate. The verifier here accepts any
//! chain, records the end-entity fingerprint for the session layer, and
//! rejects only when a pinned fingerprint does not match.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};

use crate::error::{NetError, Result};

/// SHA-256 fingerprint of a DER certificate.
#[must_use]
pub fn cert_fingerprint(der: &[u8]) -> [u8; 32] {
    Sha256::digest(der).into()
}

/// The client's own certificate and key, presented on TLS peer and hub
/// connections so the remote side can pin us.
pub struct ClientIdentity {
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
}

impl ClientIdentity {
    /// Generate a fresh self-signed identity.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Conn`] if certificate generation fails.
    pub fn generate(common_name: &str) -> Result<Self> {
        let certified = rcgen::generate_simple_self_signed(vec![common_name.to_owned()])
            .map_err(|e| NetError::Conn(format!("certificate generation: {e}").into()))?;
        let cert = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));
        Ok(Self { cert, key })
    }

    /// Load from DER blobs (persisted identity).
    #[must_use]
    pub fn from_der(cert: Vec<u8>, pkcs8_key: Vec<u8>) -> Self {
        Self {
            cert: CertificateDer::from(cert),
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pkcs8_key)),
        }
    }

    /// Our own keyprint, announced in `INF` on TLS hubs.
    #[must_use]
    pub fn keyprint(&self) -> [u8; 32] {
        cert_fingerprint(self.cert.as_ref())
    }

    /// Certificate DER bytes.
    #[must_use]
    pub fn cert_der(&self) -> &[u8] {
        self.cert.as_ref()
    }
}

/// Shared slot the verifier deposits the observed fingerprint into.
pub type FingerprintSlot = Arc<Mutex<Option<[u8; 32]>>>;

#[derive(Debug)]
struct PinVerifier {
    pin: Option<[u8; 32]>,
    seen: FingerprintSlot,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let fp = cert_fingerprint(end_entity.as_ref());
        if let Ok(mut seen) = self.seen.lock() {
            *seen = Some(fp);
        }
        match self.pin {
            Some(pin) if pin != fp => Err(rustls::Error::General(
                "certificate does not match pinned keyprint".into(),
            )),
            _ => Ok(ServerCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// TLS configuration factory shared by all connections.
pub struct TlsSetup {
    identity: Option<Arc<ClientIdentity>>,
}

impl TlsSetup {
    /// Build a setup, optionally presenting a client identity.
    #[must_use]
    pub fn new(identity: Option<Arc<ClientIdentity>>) -> Self {
        Self { identity }
    }

    /// Build a per-connection client config.
    ///
    /// Returns the config plus the slot that will hold the server
    /// certificate's fingerprint after the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Conn`] when the client certificate is
    /// rejected by rustls.
    pub fn client_config(
        &self,
        pin: Option<[u8; 32]>,
    ) -> Result<(Arc<ClientConfig>, FingerprintSlot)> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let seen: FingerprintSlot = Arc::new(Mutex::new(None));
        let verifier = Arc::new(PinVerifier {
            pin,
            seen: Arc::clone(&seen),
            provider,
        });
        let builder = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier);
        let config = match &self.identity {
            Some(id) => builder
                .with_client_auth_cert(vec![id.cert.clone()], id.key.clone_key())
                .map_err(|e| NetError::Conn(format!("client certificate: {e}").into()))?,
            None => builder.with_no_client_auth(),
        };
        Ok((Arc::new(config), seen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_generates_and_fingerprints() {
        let id = ClientIdentity::generate("driftdc").unwrap();
        let kp = id.keyprint();
        assert_ne!(kp, [0u8; 32]);
        // Fingerprint is a pure function of the DER bytes.
        assert_eq!(kp, cert_fingerprint(id.cert_der()));
        let reloaded = ClientIdentity::from_der(id.cert_der().to_vec(), Vec::new());
        assert_eq!(reloaded.keyprint(), kp);
    }

    #[test]
    fn configs_build_with_and_without_identity() {
        let setup = TlsSetup::new(None);
        let (cfg, slot) = setup.client_config(Some([9u8; 32])).unwrap();
        assert!(slot.lock().unwrap().is_none());
        drop(cfg);

        let id = Arc::new(ClientIdentity::generate("driftdc").unwrap());
        let setup = TlsSetup::new(Some(id));
        assert!(setup.client_config(None).is_ok());
    }
}
