//! Link identity and the secure datagram session.
//!
//! Each tunnel owns a self-signed X.509 identity; its SHA-512 fingerprint
//! is the `FPR` the controller hands to the peer. The QUIC session over the
//! nominated path is authenticated by pinning that fingerprint: the
//! controlling side connects as the client and verifies the peer's
//! certificate digest, the controlled side serves its own identity.
//! Ethernet frames ride QUIC unreliable datagrams.

use anyhow::{Context as AnyhowContext, Result};
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{AsyncUdpSocket, ClientConfig, Endpoint, EndpointConfig, Runtime, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use sha2::{Digest, Sha512};
use std::sync::Arc;
use std::time::Duration;

/// Keepalive cadence for the secure session.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Server name presented on the wire; authentication rests on the pinned
/// fingerprint, not on name resolution.
pub const SESSION_SERVER_NAME: &str = "vlink.peer";

/// Ensure rustls has a process-default crypto provider.
pub fn ensure_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// A self-signed identity and its SHA-512 certificate fingerprint.
pub struct LinkIdentity {
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
    pub fingerprint: String,
}

impl LinkIdentity {
    /// Generate a fresh identity named after its owner (node id ‖ tunnel
    /// id).
    pub fn generate(name: &str) -> Result<Self> {
        ensure_crypto_provider();
        let san = if name.is_empty() {
            SESSION_SERVER_NAME.to_string()
        } else {
            name.to_string()
        };
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec![san])
                .context("failed to generate the link identity certificate")?;
        let cert_der = cert.der().to_vec();
        let key_der = key_pair.serialize_der();
        let fingerprint = cert_fingerprint_hex(&cert_der);
        Ok(Self {
            cert_der,
            key_der,
            fingerprint,
        })
    }

    /// Server-side session config presenting this identity.
    pub fn server_config(&self) -> Result<ServerConfig> {
        ensure_crypto_provider();
        let cert_chain = vec![CertificateDer::from(self.cert_der.clone())];
        let key = PrivatePkcs8KeyDer::from(self.key_der.clone());
        let mut config = ServerConfig::with_single_cert(cert_chain, key.into())
            .context("invalid link identity for the secure session")?;
        if let Some(transport) = Arc::get_mut(&mut config.transport) {
            tune_transport(transport);
        }
        Ok(config)
    }
}

/// SHA-512 digest of the certificate's DER encoding, as lowercase hex.
pub fn cert_fingerprint_hex(cert_der: &[u8]) -> String {
    let digest = Sha512::digest(cert_der);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

fn tune_transport(transport: &mut quinn::TransportConfig) {
    transport.max_concurrent_uni_streams(0_u8.into());
    transport.max_concurrent_bidi_streams(0_u8.into());
    transport.max_idle_timeout(None);
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    transport.datagram_receive_buffer_size(Some(1 << 16));
    transport.datagram_send_buffer_size(1 << 16);
}

/// Build the serving endpoint over the nominated path.
pub fn server_endpoint(
    socket: Arc<dyn AsyncUdpSocket>,
    server_config: ServerConfig,
) -> Result<Endpoint> {
    let runtime: Arc<dyn Runtime> = Arc::new(quinn::TokioRuntime);
    Endpoint::new_with_abstract_socket(
        EndpointConfig::default(),
        Some(server_config),
        socket,
        runtime,
    )
    .context("failed to create the secure session server endpoint")
}

/// Build the connecting endpoint over the nominated path, pinning the
/// peer's certificate fingerprint.
pub fn client_endpoint(
    socket: Arc<dyn AsyncUdpSocket>,
    expected_fingerprint: &str,
) -> Result<Endpoint> {
    ensure_crypto_provider();
    let runtime: Arc<dyn Runtime> = Arc::new(quinn::TokioRuntime);
    let mut endpoint =
        Endpoint::new_with_abstract_socket(EndpointConfig::default(), None, socket, runtime)
            .context("failed to create the secure session client endpoint")?;
    let verifier = FingerprintVerifier::new(expected_fingerprint);
    let rustls_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    let quic_config = QuicClientConfig::try_from(rustls_config)
        .context("failed to build the secure session client config")?;
    let mut client_config = ClientConfig::new(Arc::new(quic_config));
    let mut transport = quinn::TransportConfig::default();
    tune_transport(&mut transport);
    client_config.transport_config(Arc::new(transport));
    endpoint.set_default_client_config(client_config);
    Ok(endpoint)
}

#[derive(Debug)]
struct FingerprintVerifier {
    expected: String,
    crypto: Arc<rustls::crypto::CryptoProvider>,
}

impl FingerprintVerifier {
    fn new(expected: &str) -> Arc<Self> {
        Arc::new(Self {
            expected: expected.to_lowercase(),
            crypto: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        })
    }

    fn matches(&self, cert: &CertificateDer<'_>) -> bool {
        cert_fingerprint_hex(cert.as_ref()) == self.expected
    }
}

impl rustls::client::danger::ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        if !self.matches(end_entity) {
            return Err(rustls::Error::General(
                "peer certificate fingerprint mismatch".into(),
            ));
        }
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.crypto.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.crypto.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.crypto
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_fingerprint_is_sha512_hex() {
        let identity = LinkIdentity::generate("node1tunnelA").unwrap();
        assert_eq!(identity.fingerprint.len(), 128);
        assert!(identity
            .fingerprint
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(
            identity.fingerprint,
            cert_fingerprint_hex(&identity.cert_der)
        );
    }

    #[test]
    fn test_identities_are_unique() {
        let a = LinkIdentity::generate("node1tunnelA").unwrap();
        let b = LinkIdentity::generate("node1tunnelA").unwrap();
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_server_config_builds() {
        let identity = LinkIdentity::generate("node2tunnelB").unwrap();
        assert!(identity.server_config().is_ok());
    }
}
