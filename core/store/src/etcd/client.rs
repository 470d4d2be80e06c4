//! Keys API client over HTTP with endpoint failover.

use async_trait::async_trait;
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use etcdform_common::{Error, KeyPath, Result, Secret};

use super::config::HEADER_TIMEOUT_PER_REQUEST;
use super::transport::Transport;
use crate::keys::{
    error_for_code, DeleteOptions, GetOptions, KeysApi, KeysResponse, PrevExist, SetOptions,
};

const INDEX_HEADER: &str = "X-Etcd-Index";

/// Basic-auth credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Secret,
}

/// Error body returned by the store on a failed request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdErrorBody {
    error_code: u32,
    message: String,
    #[serde(default)]
    cause: String,
    #[serde(default)]
    #[allow(dead_code)]
    index: u64,
}

/// Client for the etcd v2 keys API.
///
/// Cloning is cheap and clones share the connection pool. Requests are
/// tried against each endpoint in order. An endpoint that refuses the
/// connection is skipped; one that does not answer within the header
/// timeout is skipped for reads only, writes then fail with `Timeout`.
#[derive(Debug, Clone)]
pub struct EtcdClient {
    endpoints: Arc<Vec<Url>>,
    transport: Arc<Transport>,
    header_timeout: Duration,
    credentials: Option<Arc<Credentials>>,
}

impl EtcdClient {
    /// Create a client over already normalized endpoint URLs.
    ///
    /// # Errors
    /// - Empty endpoint list
    /// - Endpoint that is not a URL of the transport's scheme
    pub fn new(endpoints: &[String], transport: Transport) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::Config("at least one endpoint is required".to_string()));
        }

        let mut urls = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let url = Url::parse(endpoint)
                .map_err(|e| Error::Config(format!("invalid endpoint '{}': {}", endpoint, e)))?;
            if url.scheme() != transport.scheme().as_str() {
                return Err(Error::Config(format!(
                    "endpoint '{}' does not match transport scheme '{}'",
                    endpoint,
                    transport.scheme()
                )));
            }
            urls.push(url);
        }

        Ok(Self {
            endpoints: Arc::new(urls),
            transport: Arc::new(transport),
            header_timeout: HEADER_TIMEOUT_PER_REQUEST,
            credentials: None,
        })
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(Arc::new(credentials));
        self
    }

    pub fn with_header_timeout(mut self, timeout: Duration) -> Self {
        self.header_timeout = timeout;
        self
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints
            .iter()
            .map(|url| url.as_str().trim_end_matches('/').to_string())
            .collect()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn header_timeout(&self) -> Duration {
        self.header_timeout
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    fn keys_url(&self, endpoint: &Url, path: &KeyPath) -> Result<Url> {
        let mut url = endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("endpoint '{}' cannot carry a path", endpoint)))?
            .pop_if_empty()
            .extend(["v2", "keys"])
            .extend(path.components());
        Ok(url)
    }

    async fn execute(
        &self,
        method: Method,
        path: &KeyPath,
        query: &[(&str, String)],
        form: Option<&[(&str, String)]>,
    ) -> Result<KeysResponse> {
        let mut last_error = None;

        for endpoint in self.endpoints.iter() {
            let url = self.keys_url(endpoint, path)?;
            let mut request = self.transport.http().request(method.clone(), url);
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(form) = form {
                request = request.form(form);
            }
            if let Some(credentials) = &self.credentials {
                request = request.basic_auth(&credentials.username, Some(credentials.password.expose()));
            }

            // A write that reached an endpoint may have been applied there,
            // so it is only resent when the connection was never made.
            let resendable = method == Method::GET;

            match tokio::time::timeout(self.header_timeout, request.send()).await {
                Ok(Ok(response)) => return self.handle_response(path, response).await,
                Ok(Err(e)) => {
                    let error = Error::Network(format!("{}: {}", endpoint, e));
                    if !resendable && !e.is_connect() {
                        warn!(endpoint = %endpoint, error = %e, "etcd write failed after sending");
                        return Err(error);
                    }
                    warn!(endpoint = %endpoint, error = %e, "etcd endpoint unreachable, trying next");
                    last_error = Some(error);
                }
                Err(_) => {
                    let error = Error::Timeout(format!(
                        "{} did not answer within {:?}",
                        endpoint, self.header_timeout
                    ));
                    if !resendable {
                        warn!(endpoint = %endpoint, timeout = ?self.header_timeout, "etcd write timed out");
                        return Err(error);
                    }
                    warn!(endpoint = %endpoint, timeout = ?self.header_timeout, "etcd endpoint timed out, trying next");
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Network("no endpoint available".to_string())))
    }

    async fn handle_response(&self, path: &KeyPath, response: Response) -> Result<KeysResponse> {
        let status = response.status();
        let index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let body = response
            .text()
            .await
            .map_err(|e| Error::Network(format!("failed to read response body: {}", e)))?;

        if status.is_success() {
            let mut parsed: KeysResponse = serde_json::from_str(&body)?;
            parsed.index = index;
            return Ok(parsed);
        }

        if let Ok(error) = serde_json::from_str::<EtcdErrorBody>(&body) {
            debug!(code = error.error_code, cause = %error.cause, "etcd returned an error");
            return Err(error_for_code(error.error_code, &error.message, &error.cause));
        }

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Authentication(format!(
                "{} rejected the credentials: {}",
                path,
                body.trim()
            ))),
            _ => Err(Error::Store {
                code: u32::from(status.as_u16()),
                message: body.trim().to_string(),
                cause: path.to_string(),
            }),
        }
    }
}

#[async_trait]
impl KeysApi for EtcdClient {
    fn name(&self) -> &str {
        "etcd"
    }

    async fn get(&self, path: &KeyPath, opts: &GetOptions) -> Result<KeysResponse> {
        debug!(path = %path, recursive = opts.recursive, "get");
        let mut query = Vec::new();
        if opts.recursive {
            query.push(("recursive", "true".to_string()));
        }
        if opts.sorted {
            query.push(("sorted", "true".to_string()));
        }
        self.execute(Method::GET, path, &query, None).await
    }

    async fn set(
        &self,
        path: &KeyPath,
        value: Option<&str>,
        opts: &SetOptions,
    ) -> Result<KeysResponse> {
        debug!(path = %path, dir = opts.dir, prev_exist = ?opts.prev_exist, prev_index = ?opts.prev_index, "set");

        let mut query = Vec::new();
        match opts.prev_exist {
            PrevExist::Any => {}
            PrevExist::MustExist => query.push(("prevExist", "true".to_string())),
            PrevExist::MustNotExist => query.push(("prevExist", "false".to_string())),
        }
        if let Some(prev_index) = opts.prev_index {
            query.push(("prevIndex", prev_index.to_string()));
        }

        let mut form = Vec::new();
        if opts.dir {
            form.push(("dir", "true".to_string()));
        } else if let Some(value) = value {
            form.push(("value", value.to_string()));
        }
        if let Some(ttl) = opts.ttl {
            form.push(("ttl", ttl.to_string()));
        }

        self.execute(Method::PUT, path, &query, Some(form.as_slice())).await
    }

    async fn delete(&self, path: &KeyPath, opts: &DeleteOptions) -> Result<KeysResponse> {
        debug!(path = %path, recursive = opts.recursive, prev_index = ?opts.prev_index, "delete");

        let mut query = Vec::new();
        if let Some(prev_index) = opts.prev_index {
            query.push(("prevIndex", prev_index.to_string()));
        }
        if opts.dir {
            query.push(("dir", "true".to_string()));
        }
        if opts.recursive {
            query.push(("recursive", "true".to_string()));
        }

        self.execute(Method::DELETE, path, &query, None).await
    }
}
