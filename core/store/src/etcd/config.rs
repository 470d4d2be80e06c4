//! Connection configuration and the store client factory.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use url::Url;

use etcdform_common::{Error, Result, Secret};

use super::client::{Credentials, EtcdClient};
use super::transport::{TlsFiles, TransportBuilder, TransportSettings};

/// Endpoint list used when none is configured.
pub const DEFAULT_ENDPOINTS: &str = "127.0.0.1:2379";

/// Per-request header timeout. An unresponsive endpoint must not stall
/// a whole reconciliation.
pub const HEADER_TIMEOUT_PER_REQUEST: Duration = Duration::from_secs(1);

/// URL scheme used to reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = Error;

    /// Only the exact lowercase names are accepted.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(Error::Config(format!(
                "only schemes http and https are supported, got '{}'",
                other
            ))),
        }
    }
}

/// Split a comma-separated endpoint list and prefix each element with the
/// scheme.
///
/// Elements that already carry the same scheme are kept as they are, so
/// normalizing an already normalized list is a no-op.
///
/// # Errors
/// - Empty list or empty element
/// - Element carrying a different scheme
/// - Element that does not parse as a URL with a host and no path
pub fn normalize_endpoints(endpoints: &str, scheme: Scheme) -> Result<Vec<String>> {
    let mut normalized = Vec::new();

    for raw in endpoints.split(',') {
        let endpoint = raw.trim();
        if endpoint.is_empty() {
            return Err(Error::Config(format!(
                "empty endpoint in endpoint list '{}'",
                endpoints
            )));
        }

        let candidate = match endpoint.split_once("://") {
            Some((prefix, _)) if prefix == scheme.as_str() => endpoint.to_string(),
            Some((prefix, _)) => {
                return Err(Error::Config(format!(
                    "endpoint '{}' uses scheme '{}' but the provider scheme is '{}'",
                    endpoint, prefix, scheme
                )));
            }
            None => format!("{}://{}", scheme, endpoint),
        };

        let url = Url::parse(&candidate)
            .map_err(|e| Error::Config(format!("invalid endpoint '{}': {}", endpoint, e)))?;
        if url.host_str().is_none() {
            return Err(Error::Config(format!("endpoint '{}' has no host", endpoint)));
        }
        if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
            return Err(Error::Config(format!(
                "endpoint '{}' must be host:port without a path",
                endpoint
            )));
        }

        normalized.push(candidate.trim_end_matches('/').to_string());
    }

    Ok(normalized)
}

/// Connection configuration for an etcd cluster.
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    /// Comma-separated `host:port` list.
    pub endpoints: String,
    pub scheme: Scheme,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_cert_file: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<Secret>,
    /// Disable server certificate verification. Independent of client
    /// certificate configuration.
    pub insecure_skip_verify: bool,
    pub header_timeout: Duration,
    pub transport: TransportSettings,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: DEFAULT_ENDPOINTS.to_string(),
            scheme: Scheme::Http,
            cert_file: None,
            key_file: None,
            ca_cert_file: None,
            username: None,
            password: None,
            insecure_skip_verify: false,
            header_timeout: HEADER_TIMEOUT_PER_REQUEST,
            transport: TransportSettings::default(),
        }
    }
}

impl EtcdConfig {
    pub fn new(endpoints: impl Into<String>, scheme: Scheme) -> Self {
        Self {
            endpoints: endpoints.into(),
            scheme,
            ..Default::default()
        }
    }

    pub fn with_client_cert(mut self, cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        self.cert_file = Some(cert_file.into());
        self.key_file = Some(key_file.into());
        self
    }

    pub fn with_ca_cert(mut self, ca_cert_file: impl Into<PathBuf>) -> Self {
        self.ca_cert_file = Some(ca_cert_file.into());
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(Secret::new(password));
        self
    }

    pub fn with_insecure_skip_verify(mut self, skip: bool) -> Self {
        self.insecure_skip_verify = skip;
        self
    }

    pub fn with_header_timeout(mut self, timeout: Duration) -> Self {
        self.header_timeout = timeout;
        self
    }

    /// Normalized endpoint URLs.
    pub fn endpoint_urls(&self) -> Result<Vec<String>> {
        normalize_endpoints(&self.endpoints, self.scheme)
    }

    pub fn tls_files(&self) -> TlsFiles {
        TlsFiles {
            cert_file: self.cert_file.clone(),
            key_file: self.key_file.clone(),
            ca_file: self.ca_cert_file.clone(),
            insecure_skip_verify: self.insecure_skip_verify,
        }
    }

    /// Basic-auth credentials, only when both username and password are set.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some(Credentials {
                    username: username.clone(),
                    password: password.clone(),
                })
            }
            _ => None,
        }
    }

    /// Build a client bound to every configured endpoint.
    ///
    /// # Errors
    /// - Invalid endpoint list
    /// - TLS material that cannot be loaded
    /// - HTTP transport construction failure
    pub fn client(&self) -> Result<EtcdClient> {
        let endpoints = self.endpoint_urls()?;
        info!(endpoints = ?endpoints, scheme = %self.scheme, "etcd configured with endpoints");

        let transport = TransportBuilder::new(self.scheme)
            .settings(self.transport.clone())
            .tls_files(self.tls_files())
            .build()?;

        let mut client = EtcdClient::new(&endpoints, transport)?.with_header_timeout(self.header_timeout);
        if let Some(credentials) = self.credentials() {
            client = client.with_credentials(credentials);
        }
        Ok(client)
    }
}
