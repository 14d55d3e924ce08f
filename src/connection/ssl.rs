//! Per-connection TLS session holder.
//!
//! An [`SslSession`] stays [`SslState::Unused`] for plain protocols. For
//! encrypted ones the first handshake loads trust anchors, the optional
//! client certificate and the optional randomness source; a load failure is
//! a [`TransferError::TlsConfig`]. A failed handshake leaves the session in
//! [`SslState::Failed`], which keeps the connection out of the pool.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{CertificateError, ClientConfig, RootCertStore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument, warn};

use crate::error::TransferError;
use crate::protocol::Protocol;
use crate::target::hex_digest;

use super::Stream;

/// Minimum TLS protocol version to negotiate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TlsVersion {
    /// TLS 1.2 or newer.
    #[default]
    #[serde(rename = "tls1.2")]
    Tls12,
    /// TLS 1.3 only.
    #[serde(rename = "tls1.3")]
    Tls13,
}

/// Encrypted-channel settings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct SslConfig {
    /// Verify the peer certificate chain and host name.
    pub verify_peer: bool,
    /// PEM file with extra trust anchors.
    pub ca_file: Option<PathBuf>,
    /// Directory of PEM files with extra trust anchors.
    pub ca_path: Option<PathBuf>,
    /// PEM client certificate chain.
    pub client_cert: Option<PathBuf>,
    /// PEM client private key (defaults to `client_cert` when unset).
    pub client_key: Option<PathBuf>,
    /// File that must be readable as a randomness source.
    pub random_file: Option<PathBuf>,
    /// Lowest acceptable protocol version.
    pub min_version: TlsVersion,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            verify_peer: true,
            ca_file: None,
            ca_path: None,
            client_cert: None,
            client_key: None,
            random_file: None,
            min_version: TlsVersion::Tls12,
        }
    }
}

/// Hex SHA-256 identity of an [`SslConfig`], used in reuse matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SslFingerprint(String);

impl SslFingerprint {
    /// Hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl SslConfig {
    /// Fingerprint over every field that affects the negotiated channel.
    #[must_use]
    pub fn fingerprint(&self) -> SslFingerprint {
        fn path_bytes(path: Option<&PathBuf>) -> Vec<u8> {
            path.map(|p| p.to_string_lossy().into_owned().into_bytes())
                .unwrap_or_default()
        }

        let mut hasher = Sha256::new();
        hasher.update([u8::from(self.verify_peer)]);
        for path in [
            &self.ca_file,
            &self.ca_path,
            &self.client_cert,
            &self.client_key,
            &self.random_file,
        ] {
            hasher.update(path_bytes(path.as_ref()));
            hasher.update([0u8]);
        }
        hasher.update([match self.min_version {
            TlsVersion::Tls12 => 12u8,
            TlsVersion::Tls13 => 13u8,
        }]);
        SslFingerprint(hex_digest(&hasher.finalize()))
    }
}

/// Lifecycle of a connection's TLS session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslState {
    /// No TLS on this connection, or not yet attempted.
    Unused,
    /// Handshake in progress.
    Handshaking,
    /// Handshake completed.
    Established,
    /// Configuration load or handshake failed.
    Failed,
    /// Session shut down.
    Closed,
}

/// TLS session state bound to one connection.
#[derive(Debug)]
pub struct SslSession {
    enabled: bool,
    state: SslState,
    config: Option<Arc<ClientConfig>>,
    verify_result: i64,
}

impl SslSession {
    /// Creates the holder for a protocol; only encrypted protocols use it.
    #[must_use]
    pub fn for_protocol(protocol: Protocol) -> Self {
        Self {
            enabled: protocol.is_encrypted(),
            state: SslState::Unused,
            config: None,
            verify_result: 0,
        }
    }

    /// True when the connection's protocol runs over TLS.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SslState {
        self.state
    }

    /// Certificate verification result of the last handshake (0 = ok).
    #[must_use]
    pub fn verify_result(&self) -> i64 {
        self.verify_result
    }

    /// Wraps `tcp` in TLS towards `host`.
    ///
    /// # Errors
    ///
    /// [`TransferError::TlsConfig`] if trust anchors, client certificate or
    /// randomness source fail to load; [`TransferError::TlsHandshake`] if the
    /// handshake fails.
    #[instrument(skip(self, config, tcp), fields(host = %host))]
    pub async fn handshake(
        &mut self,
        config: &SslConfig,
        protocol: Protocol,
        host: &str,
        tcp: TcpStream,
    ) -> Result<Stream, TransferError> {
        let client_config = match &self.config {
            Some(existing) => Arc::clone(existing),
            None => match build_client_config(config, protocol).await {
                Ok(built) => {
                    let built = Arc::new(built);
                    self.config = Some(Arc::clone(&built));
                    built
                }
                Err(error) => {
                    self.state = SslState::Failed;
                    return Err(error);
                }
            },
        };

        let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
            self.state = SslState::Failed;
            TransferError::TlsConfig {
                protocol,
                reason: format!("invalid server name '{host}': {e}"),
            }
        })?;

        self.state = SslState::Handshaking;
        let connector = TlsConnector::from(client_config);
        match connector.connect(server_name, tcp).await {
            Ok(tls) => {
                self.state = SslState::Established;
                self.verify_result = 0;
                debug!("TLS session established");
                Ok(Stream::Tls(Box::new(tls)))
            }
            Err(error) => {
                self.state = SslState::Failed;
                self.verify_result = verify_result_code(&error);
                warn!(verify_result = self.verify_result, error = %error, "TLS handshake failed");
                Err(TransferError::TlsHandshake {
                    host: host.to_string(),
                    protocol,
                    verify_result: self.verify_result,
                    reason: error.to_string(),
                })
            }
        }
    }

    /// Wraps a secondary (data) socket with the configuration loaded for the
    /// primary handshake.
    ///
    /// # Errors
    ///
    /// Fails when the primary session is not established or the handshake
    /// fails.
    pub(crate) async fn wrap_secondary(
        &self,
        host: &str,
        tcp: TcpStream,
    ) -> std::io::Result<Stream> {
        let Some(client_config) = self.config.as_ref().filter(|_| self.state == SslState::Established)
        else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "primary TLS session is not established",
            ));
        };
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let tls = TlsConnector::from(Arc::clone(client_config))
            .connect(server_name, tcp)
            .await?;
        Ok(Stream::Tls(Box::new(tls)))
    }

    /// Marks the session closed. The stream itself is shut down by its owner.
    pub fn close(&mut self) {
        if self.state != SslState::Unused {
            self.state = SslState::Closed;
        }
        self.config = None;
    }
}

async fn build_client_config(
    config: &SslConfig,
    protocol: Protocol,
) -> Result<ClientConfig, TransferError> {
    let tls_config_error = |reason: String| TransferError::TlsConfig { protocol, reason };

    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(ca_file) = &config.ca_file {
        for cert in read_certs(ca_file).await.map_err(&tls_config_error)? {
            root_store
                .add(cert)
                .map_err(|e| tls_config_error(format!("bad CA cert in {}: {e}", ca_file.display())))?;
        }
    }

    if let Some(ca_path) = &config.ca_path {
        let mut entries = tokio::fs::read_dir(ca_path)
            .await
            .map_err(|e| tls_config_error(format!("cannot read CA dir {}: {e}", ca_path.display())))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| tls_config_error(format!("cannot read CA dir {}: {e}", ca_path.display())))?
        {
            let path = entry.path();
            let is_pem = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| matches!(ext, "pem" | "crt"));
            if !is_pem {
                continue;
            }
            for cert in read_certs(&path).await.map_err(&tls_config_error)? {
                // Directories may hold unrelated certs; skip the ones rustls rejects.
                if let Err(e) = root_store.add(cert) {
                    debug!(path = %path.display(), error = %e, "Skipping CA cert");
                }
            }
        }
    }

    if let Some(random_file) = &config.random_file {
        let seed = tokio::fs::read(random_file).await.map_err(|e| {
            tls_config_error(format!(
                "cannot read random file {}: {e}",
                random_file.display()
            ))
        })?;
        if seed.is_empty() {
            return Err(tls_config_error(format!(
                "random file {} is empty",
                random_file.display()
            )));
        }
    }

    let versions: &[&'static rustls::SupportedProtocolVersion] = match config.min_version {
        TlsVersion::Tls12 => &[&rustls::version::TLS13, &rustls::version::TLS12],
        TlsVersion::Tls13 => &[&rustls::version::TLS13],
    };
    let builder = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(versions)
    .map_err(|e| tls_config_error(format!("unsupported protocol versions: {e}")))?
    .with_root_certificates(root_store);

    let mut client_config = match &config.client_cert {
        Some(cert_path) => {
            let certs = read_certs(cert_path).await.map_err(&tls_config_error)?;
            let key_path = config.client_key.as_ref().unwrap_or(cert_path);
            let key = read_private_key(key_path).await.map_err(&tls_config_error)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| tls_config_error(format!("client certificate rejected: {e}")))?
        }
        None => builder.with_no_client_auth(),
    };

    if !config.verify_peer {
        warn!("TLS certificate verification disabled - insecure!");
        client_config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertVerifier));
    }

    Ok(client_config)
}

async fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, String> {
    let pem = tokio::fs::read(path)
        .await
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut Cursor::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("bad PEM in {}: {e}", path.display()))?;
    if certs.is_empty() {
        return Err(format!("no certificates in {}", path.display()));
    }
    Ok(certs)
}

async fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, String> {
    let pem = tokio::fs::read(path)
        .await
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    rustls_pemfile::private_key(&mut Cursor::new(pem))
        .map_err(|e| format!("bad PEM in {}: {e}", path.display()))?
        .ok_or_else(|| format!("no private key in {}", path.display()))
}

/// Maps a handshake failure to a numeric verification result.
///
/// Codes follow the classic X.509 verification numbering; 0 means the
/// failure was not a certificate problem.
fn verify_result_code(error: &std::io::Error) -> i64 {
    let Some(rustls_error) = error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    else {
        return 0;
    };
    match rustls_error {
        rustls::Error::InvalidCertificate(cert_error) => certificate_error_code(cert_error),
        _ => 0,
    }
}

fn certificate_error_code(error: &CertificateError) -> i64 {
    match error {
        CertificateError::BadSignature => 7,
        CertificateError::NotValidYet => 9,
        CertificateError::Expired => 10,
        CertificateError::UnknownIssuer => 20,
        CertificateError::Revoked => 23,
        CertificateError::NotValidForName => 62,
        _ => 1,
    }
}

#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
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
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}
