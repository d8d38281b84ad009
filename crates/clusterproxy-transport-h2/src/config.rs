//! HTTP/2 + TLS settings for the agent RPC

use clusterproxy_transport::tls::{crypto_provider, load_certs, load_private_key, load_root_store};
use clusterproxy_transport::{TransportError, TransportResult};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use std::path::PathBuf;
use std::sync::Arc;

const ALPN_H2: &[u8] = b"h2";

#[derive(Debug, Clone)]
pub struct H2Config {
    /// Server certificate chain (PEM), required on the hub side
    pub server_cert_path: Option<PathBuf>,

    /// Server private key (PEM), required on the hub side
    pub server_key_path: Option<PathBuf>,

    /// CA bundle the agent trusts; the webpki roots are used when unset
    pub ca_cert_path: Option<PathBuf>,

    /// Set to false to accept any hub certificate (development only)
    pub verify_server_cert: bool,

    pub initial_window_size: u32,
    pub initial_connection_window_size: u32,
    pub max_concurrent_streams: u32,
    pub max_frame_size: u32,
}

impl Default for H2Config {
    fn default() -> Self {
        Self {
            server_cert_path: None,
            server_key_path: None,
            ca_cert_path: None,
            verify_server_cert: true,
            initial_window_size: 1024 * 1024,            // 1MB
            initial_connection_window_size: 4 * 1024 * 1024,
            max_concurrent_streams: 100,
            max_frame_size: 16 * 1024, // 16KB (HTTP/2 default)
        }
    }
}

impl H2Config {
    /// Hub-side configuration serving the given certificate
    pub fn server(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            server_cert_path: Some(cert_path.into()),
            server_key_path: Some(key_path.into()),
            max_concurrent_streams: 1000,
            ..Default::default()
        }
    }

    /// Agent-side configuration trusting `ca_cert_path` (or the webpki roots)
    pub fn client(ca_cert_path: Option<PathBuf>) -> Self {
        Self {
            ca_cert_path,
            ..Default::default()
        }
    }

    /// Disable hub certificate verification (INSECURE)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.verify_server_cert = false;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.initial_window_size == 0 || self.initial_connection_window_size == 0 {
            return Err(TransportError::ConfigurationError(
                "Initial window size must be > 0".to_string(),
            ));
        }
        // RFC 9113 §6.5.2
        if !(16_384..=16_777_215).contains(&self.max_frame_size) {
            return Err(TransportError::ConfigurationError(format!(
                "Max frame size {} out of range",
                self.max_frame_size
            )));
        }
        Ok(())
    }

    pub(crate) fn server_builder(&self) -> h2::server::Builder {
        let mut builder = h2::server::Builder::new();
        builder
            .initial_window_size(self.initial_window_size)
            .initial_connection_window_size(self.initial_connection_window_size)
            .max_concurrent_streams(self.max_concurrent_streams)
            .max_frame_size(self.max_frame_size);
        builder
    }

    pub(crate) fn client_builder(&self) -> h2::client::Builder {
        let mut builder = h2::client::Builder::new();
        builder
            .initial_window_size(self.initial_window_size)
            .initial_connection_window_size(self.initial_connection_window_size)
            .max_frame_size(self.max_frame_size);
        builder
    }

    pub fn build_tls_connector(&self) -> TransportResult<tokio_rustls::TlsConnector> {
        let builder = rustls::ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::TlsError(format!("Invalid TLS versions: {}", e)))?;

        let mut client_crypto = if self.verify_server_cert {
            let roots = load_root_store(self.ca_cert_path.as_deref())?;
            builder.with_root_certificates(roots).with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        };

        client_crypto.alpn_protocols = vec![ALPN_H2.to_vec()];

        Ok(tokio_rustls::TlsConnector::from(Arc::new(client_crypto)))
    }

    pub fn build_tls_acceptor(&self) -> TransportResult<tokio_rustls::TlsAcceptor> {
        let cert_path = self.server_cert_path.as_ref().ok_or_else(|| {
            TransportError::ConfigurationError("Server cert path required".to_string())
        })?;
        let key_path = self.server_key_path.as_ref().ok_or_else(|| {
            TransportError::ConfigurationError("Server key path required".to_string())
        })?;

        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;

        let mut server_crypto = rustls::ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::TlsError(format!("Invalid TLS versions: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;

        server_crypto.alpn_protocols = vec![ALPN_H2.to_vec()];

        Ok(tokio_rustls::TlsAcceptor::from(Arc::new(server_crypto)))
    }
}

#[derive(Debug)]
struct SkipVerification {
    schemes: Vec<rustls::SignatureScheme>,
}

impl SkipVerification {
    fn new() -> Arc<Self> {
        let schemes = crypto_provider()
            .signature_verification_algorithms
            .supported_schemes();
        Arc::new(Self { schemes })
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}
