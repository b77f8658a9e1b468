use std::time::Duration;

use huddle_sync_core::config::RemoteConfig;
use huddle_sync_core::model::RequestContext;
use reqwest::Client;
use reqwest::RequestBuilder;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) const TENANT_HEADER: &str = "X-Tenant-Id";
pub(crate) const USER_HEADER: &str = "X-User-Id";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),

    #[error("invalid base URL: {0:?}")]
    InvalidBaseUrl(String),
}

/// Base URL, credentials and the shared connection pool.
#[derive(Debug, Clone)]
pub struct Backend {
    client: Client,
    base_url: String,
    access_token: Option<String>,
}

impl Backend {
    pub fn new(config: &RemoteConfig) -> Result<Self, ClientError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ClientError::InvalidBaseUrl(config.base_url.clone()));
        }
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url,
            access_token: config.access_token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Request carrying the tenant and identity headers.
    pub(crate) fn scoped(&self, method: reqwest::Method, path: &str, ctx: &RequestContext) -> RequestBuilder {
        self.authorize(self.client.request(method, self.url(path)))
            .timeout(REQUEST_TIMEOUT)
            .header(TENANT_HEADER, ctx.tenant_id.as_str())
            .header(USER_HEADER, ctx.user_id.as_str())
    }

    /// Long-lived request without a total timeout, for event streams.
    pub(crate) fn streaming(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.get(self.url(path)))
    }

    pub(crate) fn post(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.post(self.url(path)))
            .timeout(REQUEST_TIMEOUT)
    }
}
