use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;

/// Routing header Appwrite uses to select the project.
pub const PROJECT_HEADER: &str = "X-Appwrite-Project";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// An outbound request, without credentials. The requester adds those.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl GatewayRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: String) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: Some(body),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub body: String,
}

impl GatewayResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode a 2xx JSON body, failing on any other status.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        if !self.is_success() {
            anyhow::bail!("HTTP {}: {}", self.status, truncate(&self.body, 200));
        }
        serde_json::from_str(&self.body)
            .with_context(|| format!("malformed response body: {}", truncate(&self.body, 200)))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Anything that can issue a request on behalf of the logged-in session.
///
/// The race logic only depends on this capability, never on how the
/// session was obtained.
pub trait AuthenticatedRequester: Send + Sync + 'static {
    fn execute(
        &self,
        request: GatewayRequest,
    ) -> impl Future<Output = Result<GatewayResponse>> + Send;
}

/// Production requester: a reqwest client carrying the browser session
/// cookie and user agent on every request.
pub struct SessionGateway {
    client: reqwest::Client,
}

impl SessionGateway {
    pub fn new(cookie: &str, user_agent: &str, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut cookie_value =
            HeaderValue::from_str(cookie).context("session cookie is not a valid header value")?;
        cookie_value.set_sensitive(true);
        headers.insert(COOKIE, cookie_value);
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(user_agent).context("invalid user agent")?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl AuthenticatedRequester for SessionGateway {
    async fn execute(&self, request: GatewayRequest) -> Result<GatewayResponse> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name {name:?}"))?;
            builder = builder.header(name, value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let resp = builder
            .send()
            .await
            .with_context(|| format!("request to {} failed", request.url))?;
        let status = resp.status().as_u16();
        let body = resp.text().await.context("failed to read response body")?;
        Ok(GatewayResponse { status, body })
    }
}
