//! TLS configuration
//!
//! Builders for client and server contexts. Every OpenSSL call that can fail
//! surfaces as a [`TlsError`] from the builder method that made it.

use openssl::pkey::PKey;
use openssl::ssl::{SslContext, SslContextBuilder, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509;
use std::net::TcpStream;

/// TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    /// Parse TLS version from string (case-insensitive)
    pub fn from_str(s: &str) -> Result<Self, TlsError> {
        match s.to_uppercase().as_str() {
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }

    pub fn to_openssl_version(&self) -> SslVersion {
        match self {
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("ALPN negotiation failed")]
    AlpnFailed,
}

/// TLS configuration (immutable after building)
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) ctx: SslContext,
    pub(crate) is_server: bool,
    /// SNI override; the destination host is used otherwise
    pub(crate) servername: Option<String>,
    pub(crate) verify_peer: bool,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("is_server", &self.is_server)
            .field("servername", &self.servername)
            .field("verify_peer", &self.verify_peer)
            .finish()
    }
}

impl TlsConfig {
    pub fn client() -> Result<ClientConfigBuilder, TlsError> {
        ClientConfigBuilder::new()
    }

    pub fn server() -> Result<ServerConfigBuilder, TlsError> {
        ServerConfigBuilder::new()
    }

    /// Client handshake, offering `alpn` protocols in preference order
    pub fn connect(
        &self,
        stream: TcpStream,
        host: &str,
        alpn: &[&str],
    ) -> Result<super::TlsSessionOps, TlsError> {
        if self.is_server {
            return Err(TlsError::InvalidConfig(
                "Cannot use server config for client connection".to_string(),
            ));
        }
        super::session::TlsSessionOps::connect(stream, self, host, alpn)
    }

    /// Server handshake
    pub fn accept(&self, stream: TcpStream) -> Result<super::TlsSessionOps, TlsError> {
        if !self.is_server {
            return Err(TlsError::InvalidConfig(
                "Cannot use client config for server accept".to_string(),
            ));
        }
        super::session::TlsSessionOps::accept(stream, self)
    }
}

/// ALPN wire format: each protocol prefixed by its length
pub(crate) fn encode_alpn(protocols: &[&str]) -> Result<Vec<u8>, TlsError> {
    let mut wire = Vec::new();
    for proto in protocols {
        let len = u8::try_from(proto.len())
            .map_err(|_| TlsError::InvalidConfig(format!("ALPN protocol too long: {}", proto)))?;
        wire.push(len);
        wire.extend_from_slice(proto.as_bytes());
    }
    Ok(wire)
}

fn set_version_range(
    ctx_builder: &mut SslContextBuilder,
    min: TlsVersion,
    max: TlsVersion,
) -> Result<(), TlsError> {
    ctx_builder.set_min_proto_version(Some(min.to_openssl_version()))?;
    ctx_builder.set_max_proto_version(Some(max.to_openssl_version()))?;
    Ok(())
}

/// Client configuration builder
pub struct ClientConfigBuilder {
    ctx_builder: SslContextBuilder,
    servername: Option<String>,
    verify_peer: bool,
}

impl ClientConfigBuilder {
    fn new() -> Result<Self, TlsError> {
        let mut ctx_builder = SslContextBuilder::new(SslMethod::tls_client())?;
        ctx_builder.set_default_verify_paths()?;
        ctx_builder.set_verify(SslVerifyMode::PEER);

        Ok(ClientConfigBuilder {
            ctx_builder,
            servername: None,
            verify_peer: true,
        })
    }

    /// Pin the TLS version (both min and max)
    pub fn version(mut self, version: TlsVersion) -> Result<Self, TlsError> {
        set_version_range(&mut self.ctx_builder, version, version)?;
        Ok(self)
    }

    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Result<Self, TlsError> {
        set_version_range(&mut self.ctx_builder, min, max)?;
        Ok(self)
    }

    /// Trust an extra CA certificate (PEM)
    pub fn root_certificate_pem(mut self, pem: &[u8]) -> Result<Self, TlsError> {
        let cert = X509::from_pem(pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load CA certificate: {}", e)))?;
        self.ctx_builder.cert_store_mut().add_cert(cert)?;
        Ok(self)
    }

    /// Override the SNI name and the name the certificate is checked against
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.servername = Some(name.into());
        self
    }

    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self.ctx_builder.set_verify(if verify {
            SslVerifyMode::PEER
        } else {
            SslVerifyMode::NONE
        });
        self
    }

    pub fn build(self) -> Result<TlsConfig, TlsError> {
        Ok(TlsConfig {
            ctx: self.ctx_builder.build(),
            is_server: false,
            servername: self.servername,
            verify_peer: self.verify_peer,
        })
    }
}

/// Server configuration builder
///
/// Falls back to the built-in self-signed certificate when no certificate
/// is given.
pub struct ServerConfigBuilder {
    ctx_builder: SslContextBuilder,
    has_cert: bool,
}

impl ServerConfigBuilder {
    fn new() -> Result<Self, TlsError> {
        Ok(ServerConfigBuilder {
            ctx_builder: SslContextBuilder::new(SslMethod::tls_server())?,
            has_cert: false,
        })
    }

    pub fn version(mut self, version: TlsVersion) -> Result<Self, TlsError> {
        set_version_range(&mut self.ctx_builder, version, version)?;
        Ok(self)
    }

    /// Protocols this server accepts, in its order of preference
    pub fn alpn(mut self, protocols: &[&str]) -> Result<Self, TlsError> {
        let ours: Vec<Vec<u8>> = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();

        self.ctx_builder.set_alpn_select_callback(move |_ssl, client_protos| {
            for proto in &ours {
                let mut pos = 0;
                while pos < client_protos.len() {
                    let len = client_protos[pos] as usize;
                    pos += 1;
                    let Some(candidate) = client_protos.get(pos..pos + len) else {
                        break;
                    };
                    if candidate == proto.as_slice() {
                        return Ok(candidate);
                    }
                    pos += len;
                }
            }
            Err(openssl::ssl::AlpnError::NOACK)
        });

        Ok(self)
    }

    /// Certificate and private key from one PEM bundle
    pub fn cert_pem(mut self, pem: &[u8]) -> Result<Self, TlsError> {
        let cert = X509::from_pem(pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load certificate: {}", e)))?;
        self.ctx_builder.set_certificate(&cert)?;

        let key = PKey::private_key_from_pem(pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load private key: {}", e)))?;
        self.ctx_builder.set_private_key(&key)?;

        self.has_cert = true;
        Ok(self)
    }

    pub fn build(mut self) -> Result<TlsConfig, TlsError> {
        if !self.has_cert {
            self = self.cert_pem(super::builtin_cert::BUILTIN_CERT.as_bytes())?;
        }

        Ok(TlsConfig {
            ctx: self.ctx_builder.build(),
            is_server: true,
            servername: None,
            verify_peer: false,
        })
    }
}
