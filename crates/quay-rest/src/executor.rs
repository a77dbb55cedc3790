//! Rate-limited REST request executor.
//!
//! One executor serves one REST surface (base URL + rate limit). A call goes
//! through these steps, in order:
//!
//! 1. Join the path onto the base URL (or the call's override).
//! 2. Let the [`UrlBuilder`] finish the URL (query parameters by default).
//! 3. Wait for a [`RateGate`] permit; refusal is `RateLimitTimeout`.
//! 4. Build a [`PreparedRequest`] with the standard and exchange headers.
//! 5. Run the call's [`SignHook`], after admission so nonces stay fresh.
//! 6. Send under a hard deadline covering both headers and body.
//! 7. Classify: 200 and 201 succeed, anything else is `Api` or `Status`.
//!
//! No step retries.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use quay_core::config::RestConfig;
use reqwest::Method;
use reqwest::header::{ACCEPT_LANGUAGE, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use tracing::{error, info};
use url::Url;
use uuid::Uuid;

use crate::error::RestError;
use crate::observer::{RequestInfo, RequestObserver};
use crate::payload::Payload;
use crate::rate_gate::RateGate;

/// A request after URL building and header assembly, just before signing.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
}

/// Exchange-specific signing, applied after rate admission.
pub trait SignHook: Send + Sync {
    fn sign(&self, request: &mut PreparedRequest, payload: &Payload) -> anyhow::Result<()>;
}

impl<F> SignHook for F
where
    F: Fn(&mut PreparedRequest, &Payload) -> anyhow::Result<()> + Send + Sync,
{
    fn sign(&self, request: &mut PreparedRequest, payload: &Payload) -> anyhow::Result<()> {
        self(request, payload)
    }
}

/// Final URL construction hook.
pub trait UrlBuilder: Send + Sync {
    fn build_url(&self, url: Url, payload: &Payload, method: &Method) -> anyhow::Result<Url>;
}

/// Appends the payload as a query string for GET and DELETE; leaves other
/// methods untouched (their payload becomes the body).
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultUrlBuilder;

impl UrlBuilder for DefaultUrlBuilder {
    fn build_url(&self, mut url: Url, payload: &Payload, method: &Method) -> anyhow::Result<Url> {
        if payload.is_empty() || !carries_query(method) {
            return Ok(url);
        }
        let extra = payload.to_query_string();
        let query = match url.query() {
            Some(existing) if !existing.is_empty() => format!("{existing}&{extra}"),
            _ => extra,
        };
        url.set_query(Some(&query));
        Ok(url)
    }
}

/// Methods whose parameters travel in the URL query rather than the body.
pub fn carries_query(method: &Method) -> bool {
    *method == Method::GET || *method == Method::DELETE || *method == Method::HEAD
}

/// One call through the executor.
pub struct RestCall<'a> {
    pub method: Method,
    pub path: String,
    /// Replaces the executor's base URL for this call.
    pub base_url: Option<String>,
    pub payload: Payload,
    pub sign: Option<&'a dyn SignHook>,
    /// Per-call deadline; the executor default when `None`.
    pub timeout: Option<Duration>,
    /// Longest wait for a rate permit; indefinite when `None`.
    pub rate_wait: Option<Duration>,
}

impl<'a> RestCall<'a> {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            base_url: None,
            payload: Payload::new(),
            sign: None,
            timeout: None,
            rate_wait: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn signed(mut self, hook: &'a dyn SignHook) -> Self {
        self.sign = Some(hook);
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn rate_wait(mut self, wait: Duration) -> Self {
        self.rate_wait = Some(wait);
        self
    }
}

/// A successful (200/201) response.
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub received_at: Instant,
}

impl RestResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RestError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Map a finished exchange to success or the matching error.
fn classify(status: u16, headers: HeaderMap, body: Bytes) -> Result<RestResponse, RestError> {
    match status {
        200 | 201 => Ok(RestResponse { status, headers, body, received_at: Instant::now() }),
        _ if body.iter().all(u8::is_ascii_whitespace) => Err(RestError::Status { status }),
        _ => Err(RestError::Api { status, body: String::from_utf8_lossy(&body).into_owned() }),
    }
}

/// `base` + `/` + `path`, with exactly one slash between them.
fn join_url(base: &str, path: &str) -> Result<Url, RestError> {
    let joined = format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'));
    Url::parse(&joined).map_err(|e| RestError::InvalidUrl(format!("{joined}: {e}")))
}

/// Builder for [`RequestExecutor`].
pub struct RequestExecutorBuilder {
    base_url: String,
    gate: Arc<RateGate>,
    client: Option<reqwest::Client>,
    timeout: Duration,
    user_agent: String,
    content_type: String,
    accept_language: String,
    headers: Vec<(String, String)>,
    url_builder: Arc<dyn UrlBuilder>,
    observers: Vec<Arc<dyn RequestObserver>>,
}

impl RequestExecutorBuilder {
    /// Use this HTTP client instead of a fresh one.
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn user_agent(mut self, v: impl Into<String>) -> Self {
        self.user_agent = v.into();
        self
    }

    pub fn content_type(mut self, v: impl Into<String>) -> Self {
        self.content_type = v.into();
        self
    }

    pub fn accept_language(mut self, v: impl Into<String>) -> Self {
        self.accept_language = v.into();
        self
    }

    /// Exchange-specific header sent on every call.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn url_builder(mut self, builder: Arc<dyn UrlBuilder>) -> Self {
        self.url_builder = builder;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn RequestObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> Result<RequestExecutor, RestError> {
        if self.timeout.is_zero() {
            return Err(RestError::Config("request timeout must be > 0".into()));
        }
        Url::parse(&self.base_url).map_err(|e| RestError::InvalidUrl(format!("{}: {e}", self.base_url)))?;

        let mut headers = HeaderMap::new();
        insert_header(&mut headers, USER_AGENT.as_str(), &self.user_agent)?;
        insert_header(&mut headers, CONTENT_TYPE.as_str(), &self.content_type)?;
        insert_header(&mut headers, ACCEPT_LANGUAGE.as_str(), &self.accept_language)?;
        for (name, value) in &self.headers {
            insert_header(&mut headers, name, value)?;
        }

        let client = match self.client {
            Some(c) => c,
            None => reqwest::Client::builder()
                .build()
                .map_err(|e| RestError::Config(format!("http client: {e}")))?,
        };

        Ok(RequestExecutor {
            client,
            gate: self.gate,
            base_url: self.base_url,
            headers,
            json_body: self.content_type.contains("json"),
            timeout: self.timeout,
            url_builder: self.url_builder,
            observers: self.observers,
        })
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), RestError> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| RestError::Config(format!("bad header name {name}: {e}")))?;
    let value =
        HeaderValue::from_str(value).map_err(|e| RestError::Config(format!("bad header value for {name}: {e}")))?;
    headers.insert(name, value);
    Ok(())
}

/// Executes calls against one REST surface.
pub struct RequestExecutor {
    client: reqwest::Client,
    gate: Arc<RateGate>,
    base_url: String,
    headers: HeaderMap,
    json_body: bool,
    timeout: Duration,
    url_builder: Arc<dyn UrlBuilder>,
    observers: Vec<Arc<dyn RequestObserver>>,
}

impl RequestExecutor {
    pub fn builder(base_url: impl Into<String>, gate: Arc<RateGate>) -> RequestExecutorBuilder {
        RequestExecutorBuilder {
            base_url: base_url.into(),
            gate,
            client: None,
            timeout: Duration::from_secs(30),
            user_agent: concat!("quay/", env!("CARGO_PKG_VERSION")).into(),
            content_type: "application/x-www-form-urlencoded".into(),
            accept_language: "en-US,en;q=0.5".into(),
            headers: Vec::new(),
            url_builder: Arc::new(DefaultUrlBuilder),
            observers: Vec::new(),
        }
    }

    /// Builder preloaded from `config`, with a fresh gate. Must be called from
    /// within a tokio runtime.
    pub fn builder_from_config(config: &RestConfig) -> Result<RequestExecutorBuilder, RestError> {
        let gate = RateGate::new(config.rate_limit.capacity, config.rate_limit.window())?;
        let mut builder = Self::builder(config.base_url.clone(), Arc::new(gate))
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .content_type(config.content_type.clone())
            .accept_language(config.accept_language.clone());
        for (name, value) in &config.extra_headers {
            builder = builder.header(name.clone(), value.clone());
        }
        Ok(builder)
    }

    /// Build the gate and executor described by `config`.
    pub fn from_config(config: &RestConfig) -> Result<Self, RestError> {
        let executor = Self::builder_from_config(config)?.build()?;
        info!(
            "[rest] {} ({} per {:?}, timeout {:?})",
            executor.base_url,
            executor.gate.capacity(),
            executor.gate.window(),
            executor.timeout
        );
        Ok(executor)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn gate(&self) -> &Arc<RateGate> {
        &self.gate
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one call. See the module docs for the step order.
    pub async fn execute(&self, call: RestCall<'_>) -> Result<RestResponse, RestError> {
        let info = RequestInfo { id: Uuid::new_v4(), method: call.method.clone(), path: call.path.clone() };
        let started = Instant::now();
        self.notify(|o| o.on_begin(&info));

        let result = self.run(&call).await;

        let elapsed = started.elapsed();
        match &result {
            Ok(resp) => self.notify(|o| o.on_finish(&info, resp.status, elapsed)),
            Err(e) => self.notify(|o| o.on_error(&info, e, elapsed)),
        }
        result
    }

    /// GET `path` with `payload` as the query and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str, payload: Payload) -> Result<T, RestError> {
        self.execute(RestCall::get(path).payload(payload)).await?.json()
    }

    async fn run(&self, call: &RestCall<'_>) -> Result<RestResponse, RestError> {
        let base = call.base_url.as_deref().unwrap_or(&self.base_url);
        let url = join_url(base, &call.path)?;
        let url = self
            .url_builder
            .build_url(url, &call.payload, &call.method)
            .map_err(|e| RestError::InvalidUrl(format!("{e:#}")))?;

        if !self.gate.acquire(call.rate_wait).await {
            return Err(if self.gate.is_closed() { RestError::Closed } else { RestError::RateLimitTimeout });
        }

        let mut request = PreparedRequest {
            method: call.method.clone(),
            url,
            headers: self.headers.clone(),
            body: self.encode_body(call),
            timeout: call.timeout.unwrap_or(self.timeout),
        };
        if let Some(hook) = call.sign {
            hook.sign(&mut request, &call.payload).map_err(RestError::Sign)?;
        }

        self.send(request).await
    }

    fn encode_body(&self, call: &RestCall<'_>) -> Option<Vec<u8>> {
        if call.payload.is_empty() || carries_query(&call.method) {
            return None;
        }
        let body = if self.json_body { call.payload.to_json_body() } else { call.payload.to_query_string() };
        Some(body.into_bytes())
    }

    async fn send(&self, request: PreparedRequest) -> Result<RestResponse, RestError> {
        let deadline = request.timeout;
        let mut builder = self.client.request(request.method, request.url).headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let exchange = async {
            let resp = builder.send().await?;
            let status = resp.status().as_u16();
            let headers = resp.headers().clone();
            let body = resp.bytes().await?;
            Ok::<_, reqwest::Error>((status, headers, body))
        };

        let (status, headers, body) = match tokio::time::timeout(deadline, exchange).await {
            Ok(Ok(parts)) => parts,
            Ok(Err(e)) if e.is_timeout() => return Err(RestError::RequestTimeout(deadline)),
            Ok(Err(e)) => return Err(RestError::Transport(e)),
            Err(_) => return Err(RestError::RequestTimeout(deadline)),
        };
        classify(status, headers, body)
    }

    fn notify(&self, f: impl Fn(&dyn RequestObserver)) {
        for observer in &self.observers {
            if std::panic::catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))).is_err() {
                error!("[rest] request observer panicked");
            }
        }
    }
}
