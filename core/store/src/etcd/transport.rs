//! HTTP transport construction.
//!
//! A transport is built once per connection configuration and owned by the
//! client that uses it. TLS material is loaded eagerly so that a missing or
//! malformed file fails configuration instead of the first request.

use reqwest::{Client, ClientBuilder};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use etcdform_common::{Error, Result};

use super::config::Scheme;

const USER_AGENT: &str = concat!("etcdform/", env!("CARGO_PKG_VERSION"));

/// Timeouts and proxy policy of the HTTP transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    /// TCP connect timeout.
    pub dial_timeout: Duration,
    /// TCP keep-alive interval for pooled connections.
    pub keep_alive: Duration,
    /// TLS handshake budget, added to the dial timeout for HTTPS.
    pub tls_handshake_timeout: Duration,
    /// Honour `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY`.
    pub proxy_from_env: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(30),
            tls_handshake_timeout: Duration::from_secs(10),
            proxy_from_env: true,
        }
    }
}

/// Paths to PEM-encoded TLS material.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub insecure_skip_verify: bool,
}

impl TlsFiles {
    pub fn is_configured(&self) -> bool {
        self.cert_file.is_some() || self.key_file.is_some() || self.ca_file.is_some()
    }
}

/// Loaded TLS material for an HTTPS transport.
#[derive(Clone, Default)]
pub struct TlsContext {
    /// DER-encoded client certificate chain; empty without client auth.
    client_certificates: Vec<Vec<u8>>,
    /// DER-encoded custom root CAs; empty means the built-in roots.
    root_certificates: Vec<Vec<u8>>,
    identity_pem: Option<Vec<u8>>,
    insecure_skip_verify: bool,
}

impl TlsContext {
    /// Load TLS material from disk.
    ///
    /// The client identity is loaded only when both certificate and key are
    /// configured; with only one of them client authentication is skipped.
    ///
    /// # Errors
    /// - Unreadable file
    /// - File without any PEM certificate (certificate and CA files)
    /// - File without a private key (key file)
    pub fn load(files: &TlsFiles) -> Result<Self> {
        let mut context = TlsContext {
            insecure_skip_verify: files.insecure_skip_verify,
            ..Default::default()
        };

        match (&files.cert_file, &files.key_file) {
            (Some(cert_file), Some(key_file)) => {
                let cert_pem = read_pem_file(cert_file, "client certificate")?;
                context.client_certificates = parse_certificates(&cert_pem, cert_file)?;

                let key_pem = read_pem_file(key_file, "client key")?;
                check_private_key(&key_pem, key_file)?;

                let mut identity = cert_pem;
                identity.push(b'\n');
                identity.extend_from_slice(&key_pem);
                context.identity_pem = Some(identity);
            }
            (Some(_), None) | (None, Some(_)) => {
                warn!("client certificate and key must be configured together, client authentication disabled");
            }
            (None, None) => {}
        }

        if let Some(ca_file) = &files.ca_file {
            let ca_pem = read_pem_file(ca_file, "CA certificate")?;
            context.root_certificates = parse_certificates(&ca_pem, ca_file)?;
        }

        Ok(context)
    }

    pub fn client_certificates(&self) -> &[Vec<u8>] {
        &self.client_certificates
    }

    pub fn root_certificates(&self) -> &[Vec<u8>] {
        &self.root_certificates
    }

    pub fn has_client_identity(&self) -> bool {
        self.identity_pem.is_some()
    }

    pub fn insecure_skip_verify(&self) -> bool {
        self.insecure_skip_verify
    }

    fn apply(&self, mut builder: ClientBuilder) -> Result<ClientBuilder> {
        if let Some(pem) = &self.identity_pem {
            let identity = reqwest::Identity::from_pem(pem)
                .map_err(|e| Error::Tls(format!("invalid client identity: {}", e)))?;
            builder = builder.identity(identity);
        }

        for der in &self.root_certificates {
            let certificate = reqwest::Certificate::from_der(der)
                .map_err(|e| Error::Tls(format!("invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(certificate);
        }

        if self.insecure_skip_verify {
            warn!("server certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(builder)
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("client_certificates", &self.client_certificates.len())
            .field("root_certificates", &self.root_certificates.len())
            .field("client_identity", &self.identity_pem.is_some())
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .finish()
    }
}

fn read_pem_file(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| Error::Tls(format!("cannot read {} {}: {}", what, path.display(), e)))
}

fn parse_certificates(pem: &[u8], path: &Path) -> Result<Vec<Vec<u8>>> {
    let mut reader = pem;
    let certificates = rustls_pemfile::certs(&mut reader)
        .map(|cert| cert.map(|der| der.as_ref().to_vec()))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::Tls(format!("invalid PEM in {}: {}", path.display(), e)))?;

    if certificates.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certificates)
}

fn check_private_key(pem: &[u8], path: &Path) -> Result<()> {
    let mut reader = pem;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Tls(format!("invalid PEM in {}: {}", path.display(), e)))?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", path.display())))?;
    Ok(())
}

/// HTTP transport shared by every request of a client.
#[derive(Debug, Clone)]
pub struct Transport {
    scheme: Scheme,
    settings: TransportSettings,
    tls: Option<TlsContext>,
    http: Client,
}

impl Transport {
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// TLS material, present for HTTPS transports only.
    pub fn tls(&self) -> Option<&TlsContext> {
        self.tls.as_ref()
    }

    /// Pooled HTTP client. Safe for concurrent use.
    pub fn http(&self) -> &Client {
        &self.http
    }
}

/// Builder for [`Transport`].
#[derive(Debug, Clone)]
pub struct TransportBuilder {
    scheme: Scheme,
    settings: TransportSettings,
    tls_files: TlsFiles,
}

impl TransportBuilder {
    pub fn new(scheme: Scheme) -> Self {
        Self {
            scheme,
            settings: TransportSettings::default(),
            tls_files: TlsFiles::default(),
        }
    }

    pub fn settings(mut self, settings: TransportSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn tls_files(mut self, tls_files: TlsFiles) -> Self {
        self.tls_files = tls_files;
        self
    }

    /// Build the transport.
    ///
    /// # Errors
    /// - TLS material cannot be loaded (HTTPS only)
    /// - The HTTP client cannot be constructed
    pub fn build(self) -> Result<Transport> {
        let tls = match self.scheme {
            Scheme::Http => {
                if self.tls_files.is_configured() {
                    debug!("TLS files are ignored by a plain http transport");
                }
                None
            }
            Scheme::Https => Some(TlsContext::load(&self.tls_files)?),
        };

        let connect_timeout = match self.scheme {
            Scheme::Http => self.settings.dial_timeout,
            Scheme::Https => self.settings.dial_timeout + self.settings.tls_handshake_timeout,
        };

        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(connect_timeout)
            .tcp_keepalive(self.settings.keep_alive);

        if !self.settings.proxy_from_env {
            builder = builder.no_proxy();
        }
        if let Some(context) = &tls {
            builder = context.apply(builder)?;
        }

        let http = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP transport: {}", e)))?;

        Ok(Transport {
            scheme: self.scheme,
            settings: self.settings,
            tls,
            http,
        })
    }
}
