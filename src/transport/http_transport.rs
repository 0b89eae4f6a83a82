use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use http::HeaderValue;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::auth::bearer_header_value;
use crate::config::TransportConfig;
use crate::error::RelayError;

use super::{UpstreamRequest, UpstreamResponse, UpstreamTransport};

const PARSED_URL_CACHE_MAX_ENTRIES: usize = 64;

fn build_reqwest_client(config: &TransportConfig) -> Result<reqwest::Client, RelayError> {
    let pool_idle_timeout = if config.http_pool_idle_timeout_secs == 0 {
        None
    } else {
        Some(Duration::from_secs(config.http_pool_idle_timeout_secs))
    };
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(config.http_pool_max_idle_per_host)
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(config.connect_timeout))
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(config.timeout));

    if let Some(proxy_url) = config.proxy.as_deref() {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| RelayError::Config(format!("Invalid proxy URL: {err}")))?;
        builder = builder.no_proxy().proxy(proxy);
    } else if !config.http_use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| RelayError::Transport(format!("Failed to build HTTP client: {err}")))
}

/// reqwest-backed [`UpstreamTransport`].
pub struct HttpTransport {
    client: reqwest::Client,
    user_agent: HeaderValue,
    parsed_url_cache: RwLock<FxHashMap<String, Arc<url::Url>>>,
}

impl HttpTransport {
    /// Build a pooled client from the transport settings.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] for an invalid proxy URL or user agent
    /// and [`RelayError::Transport`] when the client cannot be built.
    pub fn new(config: &TransportConfig) -> Result<Self, RelayError> {
        let user_agent = HeaderValue::from_str(&config.user_agent)
            .map_err(|err| RelayError::Config(format!("Invalid user agent: {err}")))?;
        Ok(Self {
            client: build_reqwest_client(config)?,
            user_agent,
            parsed_url_cache: RwLock::new(FxHashMap::default()),
        })
    }

    fn parsed_url(&self, url: &str) -> Result<Arc<url::Url>, RelayError> {
        if let Some(cached) = self.parsed_url_cache.read().get(url) {
            return Ok(cached.clone());
        }

        let parsed = url::Url::parse(url)
            .map_err(|e| RelayError::Config(format!("Invalid upstream URL '{url}': {e}")))?;

        let mut cache = self.parsed_url_cache.write();
        if let Some(existing) = cache.get(url) {
            return Ok(existing.clone());
        }
        if cache.len() >= PARSED_URL_CACHE_MAX_ENTRIES {
            cache.clear();
        }
        let parsed = Arc::new(parsed);
        cache.insert(url.to_string(), parsed.clone());
        Ok(parsed)
    }
}

#[async_trait::async_trait]
impl UpstreamTransport for HttpTransport {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, RelayError> {
        let url = self.parsed_url(&request.url)?;
        let mut outbound = reqwest::Request::new(http::Method::POST, url.as_ref().clone());
        let headers = outbound.headers_mut();
        headers.insert(AUTHORIZATION, bearer_header_value(&request.bearer)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        headers.insert(USER_AGENT, self.user_agent.clone());
        *outbound.body_mut() = Some(reqwest::Body::from(request.body));

        let response = self.client.execute(outbound).await.map_err(|err| {
            tracing::debug!(url = %request.url, error = %err, "upstream request failed before response");
            RelayError::Transport(err.to_string())
        })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| RelayError::Transport(err.to_string())))
            .boxed();
        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}
