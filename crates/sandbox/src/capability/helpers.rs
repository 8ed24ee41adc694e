//! Host helpers exposed to guests through `$helpers`.
//!
//! Guests never get a socket or a file handle. HTTP goes through an
//! [`HttpProxy`] owned by the host, and binary attachments are
//! materialized through a [`BinaryStore`] only when the guest asks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::HelperConfig;
use crate::record::BinaryHandle;

/// Failure of a host helper call; surfaced to the guest as a thrown error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum HelperError {
    /// The helper is switched off for this sandbox.
    #[error("the {0} helper is disabled")]
    Disabled(&'static str),

    /// The helper request was malformed.
    #[error("invalid helper request: {0}")]
    InvalidRequest(String),

    /// The outbound HTTP call failed.
    #[error("http request failed: {0}")]
    Http(String),

    /// No attachment or stored content matched.
    #[error("binary data not found: {0}")]
    BinaryNotFound(String),
}

/// Outbound HTTP request issued by a guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    /// HTTP method; defaults to `GET`.
    #[serde(default = "default_method")]
    pub method: String,
    /// Absolute URL.
    pub url: String,
    /// Request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Query parameters.
    #[serde(default)]
    pub qs: BTreeMap<String, String>,
    /// JSON body.
    #[serde(default)]
    pub body: Option<Value>,
    /// Per-request timeout in milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn default_method() -> String {
    "GET".to_owned()
}

/// Response handed back to the guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response headers with valid UTF-8 values.
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON body, or the body as a string when it is not JSON.
    pub body: Value,
}

/// Performs HTTP requests on behalf of guests.
#[async_trait]
pub trait HttpProxy: Send + Sync {
    /// Sends `request` and returns the response.
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, HelperError>;
}

/// [`HttpProxy`] backed by a shared `reqwest` client.
#[derive(Debug, Clone, Default)]
pub struct ReqwestHttpProxy {
    client: reqwest::Client,
}

impl ReqwestHttpProxy {
    /// Proxy using `client`.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpProxy for ReqwestHttpProxy {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, HelperError> {
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| HelperError::InvalidRequest(format!("invalid method: {e}")))?;

        let url = reqwest::Url::parse_with_params(&request.url, &request.qs)
            .map_err(|e| HelperError::InvalidRequest(format!("invalid url: {e}")))?;

        let mut builder = self.client.request(method, url);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(Duration::from_millis(timeout));
        }

        tracing::debug!(url = %request.url, method = %request.method, "guest http request");

        let response = builder
            .send()
            .await
            .map_err(|e| HelperError::Http(e.to_string()))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_owned())))
            .collect();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| HelperError::Http(format!("failed to read response body: {e}")))?;
        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Out-of-band storage for binary attachment content.
pub trait BinaryStore: Send + Sync {
    /// Reads the content behind `handle`.
    fn read(&self, handle: &BinaryHandle) -> Result<Bytes, HelperError>;

    /// Stores `bytes` and returns a handle to them.
    fn write(&self, bytes: Bytes) -> BinaryHandle;
}

/// [`BinaryStore`] keeping everything in memory.
#[derive(Debug, Default)]
pub struct InMemoryBinaryStore {
    blobs: DashMap<BinaryHandle, Bytes>,
}

impl InMemoryBinaryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl BinaryStore for InMemoryBinaryStore {
    fn read(&self, handle: &BinaryHandle) -> Result<Bytes, HelperError> {
        self.blobs
            .get(handle)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| HelperError::BinaryNotFound(handle.as_str().to_owned()))
    }

    fn write(&self, bytes: Bytes) -> BinaryHandle {
        let handle = BinaryHandle(Uuid::new_v4().to_string());
        self.blobs.insert(handle.clone(), bytes);
        handle
    }
}

/// Helpers one invocation may use.
#[derive(Clone, Default)]
pub struct HostHelpers {
    pub(crate) http: Option<Arc<dyn HttpProxy>>,
    pub(crate) binary_store: Option<Arc<dyn BinaryStore>>,
    pub(crate) binary: bool,
    pub(crate) encoding: bool,
}

impl HostHelpers {
    /// Applies the config switches to the host's proxy and store.
    ///
    /// A disabled helper drops its backing object, so the guest cannot
    /// reach it even through the raw host bindings.
    pub fn from_config(
        config: &HelperConfig,
        http: Option<Arc<dyn HttpProxy>>,
        binary_store: Option<Arc<dyn BinaryStore>>,
    ) -> Self {
        Self {
            http: http.filter(|_| config.http),
            binary_store: binary_store.filter(|_| config.binary),
            binary: config.binary,
            encoding: config.encoding,
        }
    }

    /// Which helpers are usable.
    pub fn flags(&self) -> HelperFlags {
        HelperFlags {
            http: self.http.is_some(),
            binary: self.binary,
            encoding: self.encoding,
        }
    }
}

impl std::fmt::Debug for HostHelpers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostHelpers")
            .field("flags", &self.flags())
            .field("binary_store", &self.binary_store.is_some())
            .finish()
    }
}

/// Transport-safe summary of [`HostHelpers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperFlags {
    /// `$helpers.httpRequest` is usable.
    pub http: bool,
    /// `$helpers.getBinaryDataBuffer` is usable.
    pub binary: bool,
    /// `$helpers.base64Encode` and `base64Decode` are usable.
    pub encoding: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct NoopProxy;

    #[async_trait]
    impl HttpProxy for NoopProxy {
        async fn request(&self, _request: HttpRequest) -> Result<HttpResponse, HelperError> {
            Err(HelperError::Http("unreachable".into()))
        }
    }

    #[test]
    fn in_memory_store_round_trips_bytes() {
        let store = InMemoryBinaryStore::new();
        let handle = store.write(Bytes::from_static(b"%PDF"));
        assert_eq!(store.read(&handle).unwrap(), Bytes::from_static(b"%PDF"));
    }

    #[test]
    fn in_memory_store_reports_missing_handle() {
        let store = InMemoryBinaryStore::new();
        let err = store.read(&BinaryHandle("nope".into())).unwrap_err();
        assert_eq!(err, HelperError::BinaryNotFound("nope".into()));
    }

    #[test]
    fn disabled_http_helper_drops_the_proxy() {
        let config = HelperConfig {
            http: false,
            ..HelperConfig::default()
        };
        let helpers = HostHelpers::from_config(&config, Some(Arc::new(NoopProxy)), None);
        assert!(helpers.http.is_none());
        assert_eq!(
            helpers.flags(),
            HelperFlags {
                http: false,
                binary: true,
                encoding: true
            }
        );
    }

    #[test]
    fn enabled_http_helper_without_proxy_is_unusable() {
        let config = HelperConfig {
            http: true,
            ..HelperConfig::default()
        };
        assert!(!HostHelpers::from_config(&config, None, None).flags().http);
    }

    #[test]
    fn http_request_defaults() {
        let request: HttpRequest =
            serde_json::from_value(serde_json::json!({ "url": "http://localhost/x" })).unwrap();
        assert_eq!(request.method, "GET");
        assert!(request.headers.is_empty());
        assert_eq!(request.body, None);
    }
}
