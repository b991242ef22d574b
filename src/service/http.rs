//! # HTTP Short-Link Transport
//!
//! Every handshake and business request is a single POST. [`HttpTransport`] is
//! the seam: [`ReqwestTransport`] talks to the real endpoints, tests substitute an
//! in-process mock.

use crate::config::ClientConfig;
use crate::error::{ProtocolError, Result};
use crate::session::ProxyConfig;
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// One-shot POST of an opaque body, returning the response body
pub trait HttpTransport: Send + Sync {
    fn post<'a>(
        &'a self,
        host: &'a str,
        path: &'a str,
        body: Vec<u8>,
        proxy: Option<&'a ProxyConfig>,
    ) -> BoxFuture<'a, Result<Vec<u8>>>;
}

fn map_reqwest_error(err: reqwest::Error) -> ProtocolError {
    if err.is_timeout() {
        ProtocolError::Timeout
    } else {
        ProtocolError::Http(err.to_string())
    }
}

/// [`HttpTransport`] over `reqwest`.
///
/// A proxy is a property of a `reqwest::Client`, so one client is kept per
/// distinct proxy URL.
pub struct ReqwestTransport {
    scheme: String,
    user_agent: String,
    timeout: Duration,
    direct: reqwest::Client,
    proxied: Mutex<HashMap<String, reqwest::Client>>,
}

impl ReqwestTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let scheme = config.endpoints.scheme.clone();
        let user_agent = config.protocol.user_agent.clone();
        let timeout = config.transport.http_timeout;
        let direct = Self::build_client(&user_agent, timeout, None)?;
        Ok(Self {
            scheme,
            user_agent,
            timeout,
            direct,
            proxied: Mutex::new(HashMap::new()),
        })
    }

    fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
        headers
    }

    fn build_client(
        user_agent: &str,
        timeout: Duration,
        proxy: Option<&ProxyConfig>,
    ) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .default_headers(Self::default_headers())
            .user_agent(user_agent)
            .timeout(timeout);
        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy.url())
                .map_err(|e| ProtocolError::ConfigError(format!("invalid proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        builder
            .build()
            .map_err(|e| ProtocolError::ConfigError(format!("http client: {e}")))
    }

    fn client_for(&self, proxy: Option<&ProxyConfig>) -> Result<reqwest::Client> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };
        let url = proxy.url();
        let mut clients = self.proxied.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(&url) {
            return Ok(client.clone());
        }
        let client = Self::build_client(&self.user_agent, self.timeout, Some(proxy))?;
        clients.insert(url, client.clone());
        Ok(client)
    }

    #[instrument(skip(self, body, proxy), fields(body_len = body.len(), proxied = proxy.is_some()))]
    async fn post_inner(
        &self,
        host: &str,
        path: &str,
        body: Vec<u8>,
        proxy: Option<&ProxyConfig>,
    ) -> Result<Vec<u8>> {
        let client = self.client_for(proxy)?;
        let url = format!("{}://{}{}", self.scheme, host, path);

        let response = client
            .post(&url)
            .body(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            warn!(%url, %status, "Non-success HTTP status");
            return Err(ProtocolError::Http(format!("{url} returned {status}")));
        }

        let bytes = response.bytes().await.map_err(map_reqwest_error)?;
        debug!(%url, response_len = bytes.len(), "HTTP exchange complete");
        Ok(bytes.to_vec())
    }
}

impl HttpTransport for ReqwestTransport {
    fn post<'a>(
        &'a self,
        host: &'a str,
        path: &'a str,
        body: Vec<u8>,
        proxy: Option<&'a ProxyConfig>,
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        self.post_inner(host, path, body, proxy).boxed()
    }
}
