use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Method;
use url::Url;

use crate::error::BoxError;
use crate::{
    AbortSignal, Error, Hooks, RequestMode, ResponseType, Result, RetryPolicy, ReqwestTransport,
    Transport,
};

/// Methods with a generated shortcut.
pub const REQUEST_METHODS: [Method; 6] = [
    Method::DELETE,
    Method::GET,
    Method::HEAD,
    Method::PATCH,
    Method::POST,
    Method::PUT,
];

/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Serializes a JSON body.
pub type JsonEncoder =
    Arc<dyn Fn(&serde_json::Value) -> std::result::Result<Vec<u8>, BoxError> + Send + Sync>;

/// Parses a JSON response body.
pub type JsonDecoder =
    Arc<dyn Fn(&str) -> std::result::Result<serde_json::Value, BoxError> + Send + Sync>;

/// Per-attempt deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    After(Duration),
    /// No deadline; only explicit cancellation stops an attempt.
    Disabled,
}

impl Default for Timeout {
    fn default() -> Self {
        Self::After(DEFAULT_TIMEOUT)
    }
}

impl From<Duration> for Timeout {
    fn from(value: Duration) -> Self {
        Self::After(value)
    }
}

/// Call configuration. Every field is optional; unset fields fall back to
/// instance defaults and then to built-in defaults.
#[derive(Clone, Default)]
pub struct Options {
    /// Transport override. Defaults to a shared [`ReqwestTransport`].
    pub transport: Option<Arc<dyn Transport>>,
    /// Defaults to `GET`, or to the method of a prior request target.
    pub method: Option<Method>,
    /// Merged per name over the instance headers.
    pub headers: HeaderMap,
    /// Non-empty lists replace the instance lists.
    pub hooks: Hooks,
    /// Prepended to string targets with exactly one `/` in between.
    pub prefix: Option<String>,
    /// Absolute URL string targets are resolved against.
    pub base_url: Option<String>,
    /// Origin of the execution context, used to flag cross-origin failures.
    pub origin: Option<String>,
    /// Request mode; only `Cors` requests can be flagged cross-origin.
    pub mode: Option<RequestMode>,
    /// Replaces the instance policy as a whole.
    pub retry: Option<RetryPolicy>,
    /// Encoder for the `json` shortcut. Defaults to `serde_json`.
    pub stringify_json: Option<JsonEncoder>,
    /// Decoder for JSON bodies, including buffered HTTP-failure bodies.
    pub parse_json: Option<JsonDecoder>,
    /// When `false`, non-2xx responses are returned instead of failing.
    pub throw_http_errors: Option<bool>,
    /// Body representation to read; also picks the default `Accept`.
    pub response_type: Option<ResponseType>,
    /// Per-attempt deadline, 30 seconds unless set.
    pub timeout: Option<Timeout>,
    /// Per-call cancellation signal.
    pub signal: Option<AbortSignal>,
    /// Raw request body. Overwritten by `json` when both are set.
    pub body: Option<Bytes>,
    /// JSON body shortcut; sets `Content-Type: application/json` unless the
    /// call already set a content type.
    pub json: Option<serde_json::Value>,
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("transport", &self.transport.as_ref().map(|_| "<custom>"))
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("hooks", &self.hooks)
            .field("prefix", &self.prefix)
            .field("base_url", &self.base_url)
            .field("origin", &self.origin)
            .field("mode", &self.mode)
            .field("retry", &self.retry)
            .field("throw_http_errors", &self.throw_http_errors)
            .field("response_type", &self.response_type)
            .field("timeout", &self.timeout)
            .field("signal", &self.signal)
            .field("body", &self.body.as_ref().map(Bytes::len))
            .field("json", &self.json)
            .finish_non_exhaustive()
    }
}

impl Options {
    /// An empty option bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Layers `overrides` on top of `self`.
    ///
    /// Set fields of `overrides` win. Header maps merge per name, with the
    /// override's values replacing the base's. Hook lists of the override
    /// replace the base's lists when non-empty.
    pub fn merge(mut self, overrides: Options) -> Self {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if overrides.$field.is_some() {
                    self.$field = overrides.$field;
                })*
            };
        }

        let mut previous = None;
        for (name, value) in overrides.headers {
            match name {
                Some(name) => {
                    self.headers.insert(name.clone(), value);
                    previous = Some(name);
                }
                None => {
                    if let Some(name) = &previous {
                        self.headers.append(name.clone(), value);
                    }
                }
            }
        }
        if !overrides.hooks.before_request.is_empty() {
            self.hooks.before_request = overrides.hooks.before_request;
        }
        if !overrides.hooks.after_response.is_empty() {
            self.hooks.after_response = overrides.hooks.after_response;
        }

        take!(
            transport,
            method,
            prefix,
            base_url,
            origin,
            mode,
            retry,
            stringify_json,
            parse_json,
            throw_http_errors,
            response_type,
            timeout,
            signal,
            body,
            json,
        );
        self
    }
}

fn default_transport() -> Arc<dyn Transport> {
    static TRANSPORT: OnceLock<Arc<dyn Transport>> = OnceLock::new();
    Arc::clone(TRANSPORT.get_or_init(|| Arc::new(ReqwestTransport::new())))
}

fn default_encoder() -> JsonEncoder {
    Arc::new(|value| serde_json::to_vec(value).map_err(BoxError::from))
}

fn default_decoder() -> JsonDecoder {
    Arc::new(|text| serde_json::from_str(text).map_err(BoxError::from))
}

fn parse_url(url: String) -> Result<Url> {
    Url::parse(&url).map_err(|source| Error::InvalidUrl { url, source })
}

/// Options resolved once per call. Read-only once the call starts.
#[derive(Clone)]
pub struct EffectiveOptions {
    pub transport: Arc<dyn Transport>,
    pub method: Option<Method>,
    pub headers: HeaderMap,
    pub hooks: Hooks,
    pub prefix: String,
    pub base_url: Option<Url>,
    pub origin: Option<Url>,
    /// Request mode; only `Cors` requests can be flagged cross-origin.
    pub mode: Option<RequestMode>,
    pub retry: RetryPolicy,
    pub stringify_json: JsonEncoder,
    pub parse_json: JsonDecoder,
    pub throw_http_errors: bool,
    pub response_type: Option<ResponseType>,
    pub timeout: Timeout,
    pub signal: Option<AbortSignal>,
    pub body: Option<Bytes>,
    pub json: Option<serde_json::Value>,
}

impl fmt::Debug for EffectiveOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectiveOptions")
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("hooks", &self.hooks)
            .field("prefix", &self.prefix)
            .field("base_url", &self.base_url)
            .field("origin", &self.origin)
            .field("retry", &self.retry)
            .field("throw_http_errors", &self.throw_http_errors)
            .field("response_type", &self.response_type)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl EffectiveOptions {
    /// Fills every unset field with its built-in default.
    pub fn resolve(options: Options) -> Result<Self> {
        Ok(Self {
            transport: options.transport.unwrap_or_else(default_transport),
            method: options.method,
            headers: options.headers,
            hooks: options.hooks,
            prefix: options.prefix.unwrap_or_default(),
            base_url: options.base_url.map(parse_url).transpose()?,
            origin: options.origin.map(parse_url).transpose()?,
            mode: options.mode,
            retry: options.retry.unwrap_or_default(),
            stringify_json: options.stringify_json.unwrap_or_else(default_encoder),
            parse_json: options.parse_json.unwrap_or_else(default_decoder),
            throw_http_errors: options.throw_http_errors.unwrap_or(true),
            response_type: options.response_type,
            timeout: options.timeout.unwrap_or_default(),
            signal: options.signal,
            body: options.body,
            json: options.json,
        })
    }

    /// Encodes the JSON shortcut into the body and fills `Content-Type` and
    /// `Accept` when the caller left them unset.
    pub(crate) fn normalize_body_and_headers(&mut self) -> Result<()> {
        if let Some(json) = &self.json {
            let encoded = (self.stringify_json)(json).map_err(Error::Json)?;
            self.body = Some(Bytes::from(encoded));
            if !self.headers.contains_key(CONTENT_TYPE) {
                self.headers
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
        }
        if let Some(accept) = self.response_type.and_then(ResponseType::accept_type) {
            if !self.headers.contains_key(ACCEPT) {
                self.headers.insert(ACCEPT, HeaderValue::from_static(accept));
            }
        }
        Ok(())
    }
}
