//! Provider configuration decoding.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

use etcdform_common::{Error, Result};
use etcdform_store::etcd::DEFAULT_ENDPOINTS;
use etcdform_store::{EtcdConfig, Scheme};

/// Provider options as written by the user.
///
/// Every option is optional; empty strings mean "not set". The password
/// only lives here until it is moved into a zeroizing secret.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderConfig {
    pub scheme: String,
    pub endpoints: String,
    pub username: String,
    pub password: String,
    pub keyfile: String,
    pub certfile: String,
    pub cacertfile: String,
    pub insecure_skip_verify: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            scheme: Scheme::Http.to_string(),
            endpoints: DEFAULT_ENDPOINTS.to_string(),
            username: String::new(),
            password: String::new(),
            keyfile: String::new(),
            certfile: String::new(),
            cacertfile: String::new(),
            insecure_skip_verify: false,
        }
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("scheme", &self.scheme)
            .field("endpoints", &self.endpoints)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("keyfile", &self.keyfile)
            .field("certfile", &self.certfile)
            .field("cacertfile", &self.cacertfile)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .finish()
    }
}

fn non_empty_path(value: &str) -> Option<PathBuf> {
    (!value.is_empty()).then(|| PathBuf::from(value))
}

impl ProviderConfig {
    /// Decode from a JSON object. `null` yields the defaults.
    ///
    /// # Errors
    /// - `Config` for unknown options or mistyped values
    pub fn from_value(value: Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value)
            .map_err(|e| Error::Config(format!("invalid provider configuration: {}", e)))
    }

    /// Convert into a connection configuration.
    ///
    /// # Errors
    /// - `Config` for a scheme other than `http` or `https`
    /// - `Config` for a malformed endpoint list
    pub fn to_etcd_config(&self) -> Result<EtcdConfig> {
        let scheme: Scheme = self.scheme.parse()?;
        let mut config = EtcdConfig::new(self.endpoints.clone(), scheme)
            .with_insecure_skip_verify(self.insecure_skip_verify);

        config.cert_file = non_empty_path(&self.certfile);
        config.key_file = non_empty_path(&self.keyfile);
        config.ca_cert_file = non_empty_path(&self.cacertfile);
        if !self.username.is_empty() && !self.password.is_empty() {
            config = config.with_credentials(self.username.clone(), self.password.clone());
        }

        config.endpoint_urls()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = ProviderConfig::from_value(Value::Null).unwrap();
        assert_eq!(config, ProviderConfig::default());

        let etcd = config.to_etcd_config().unwrap();
        assert_eq!(etcd.scheme, Scheme::Http);
        assert_eq!(etcd.endpoint_urls().unwrap(), vec!["http://127.0.0.1:2379"]);
        assert!(etcd.credentials().is_none());
        assert!(etcd.cert_file.is_none());
    }

    #[test]
    fn test_full_configuration() {
        let config = ProviderConfig::from_value(json!({
            "scheme": "https",
            "endpoints": "10.0.0.1:2379,10.0.0.2:2379",
            "username": "root",
            "password": "secret",
            "certfile": "/etc/etcd/client.pem",
            "keyfile": "/etc/etcd/client-key.pem",
            "cacertfile": "/etc/etcd/ca.pem",
        }))
        .unwrap();

        let etcd = config.to_etcd_config().unwrap();
        assert_eq!(etcd.scheme, Scheme::Https);
        assert_eq!(etcd.cert_file, Some(PathBuf::from("/etc/etcd/client.pem")));
        assert_eq!(etcd.ca_cert_file, Some(PathBuf::from("/etc/etcd/ca.pem")));
        assert_eq!(etcd.credentials().unwrap().username, "root");
        assert!(!etcd.insecure_skip_verify);
    }

    #[test]
    fn test_username_without_password_is_ignored() {
        let config = ProviderConfig::from_value(json!({"username": "root"})).unwrap();
        assert!(config.to_etcd_config().unwrap().credentials().is_none());
    }

    #[test]
    fn test_unsupported_scheme_is_fatal() {
        let config = ProviderConfig::from_value(json!({"scheme": "ftp"})).unwrap();
        let err = config.to_etcd_config().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_unknown_option_is_rejected() {
        let err = ProviderConfig::from_value(json!({"endpoint": "a:1"})).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_password_is_redacted() {
        let config = ProviderConfig {
            password: "hunter2".to_string(),
            ..Default::default()
        };
        assert!(!format!("{:?}", config).contains("hunter2"));
    }
}
