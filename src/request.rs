use bytes::Bytes;
use reqwest::{header::HeaderMap, Method};
use url::Url;

use crate::{AbortSignal, EffectiveOptions, Error, Result};

/// Cross-origin policy of a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RequestMode {
    #[default]
    Cors,
    NoCors,
    SameOrigin,
}

/// What a call is aimed at: a URL or path, or a prior request to reuse.
#[derive(Clone, Debug)]
pub enum Target {
    Url(String),
    Request(Request),
}

impl Target {
    /// URL of the target, as given.
    pub fn url(&self) -> &str {
        match self {
            Self::Url(url) => url,
            Self::Request(request) => request.url(),
        }
    }
}

impl From<&str> for Target {
    fn from(value: &str) -> Self {
        Self::Url(value.to_owned())
    }
}

impl From<String> for Target {
    fn from(value: String) -> Self {
        Self::Url(value)
    }
}

impl From<&String> for Target {
    fn from(value: &String) -> Self {
        Self::Url(value.clone())
    }
}

impl From<Url> for Target {
    fn from(value: Url) -> Self {
        Self::Url(value.into())
    }
}

impl From<Request> for Target {
    fn from(value: Request) -> Self {
        Self::Request(value)
    }
}

/// Request descriptor handed to the transport, built fresh for each attempt.
#[derive(Clone, Debug)]
pub struct Request {
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Option<Bytes>,
    mode: RequestMode,
    signal: Option<AbortSignal>,
}

impl Request {
    /// A descriptor with no headers, body or signal.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::default(),
            signal: None,
        }
    }

    /// Replaces the headers.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Sets the request mode.
    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Attaches a cancellation signal.
    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The target as given, after prefix and base URL resolution.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The request body, if any.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// The request mode.
    pub fn mode(&self) -> RequestMode {
        self.mode
    }

    /// The per-call cancellation signal.
    pub fn signal(&self) -> Option<&AbortSignal> {
        self.signal.as_ref()
    }

    /// Builds the descriptor for one attempt. Options override the fields of
    /// a prior request; headers always come from the options, which were
    /// seeded from the prior request when the call set none.
    pub(crate) fn for_attempt(target: &Target, options: &EffectiveOptions) -> Self {
        let (url, prior) = match target {
            Target::Url(url) => (url.clone(), None),
            Target::Request(request) => (request.url.clone(), Some(request)),
        };
        let method = options
            .method
            .clone()
            .or_else(|| prior.map(|request| request.method.clone()))
            .unwrap_or(Method::GET);
        Self {
            method,
            url,
            headers: options.headers.clone(),
            body: options
                .body
                .clone()
                .or_else(|| prior.and_then(|request| request.body.clone())),
            mode: options
                .mode
                .or_else(|| prior.map(|request| request.mode))
                .unwrap_or_default(),
            signal: options
                .signal
                .clone()
                .or_else(|| prior.and_then(|request| request.signal.clone())),
        }
    }
}

/// Joins `prefix` and `input` with exactly one `/` between them.
pub(crate) fn join_prefix(prefix: &str, input: &str) -> String {
    if prefix.is_empty() {
        return input.to_owned();
    }
    let mut joined = String::with_capacity(prefix.len() + input.len() + 1);
    joined.push_str(prefix);
    if !joined.ends_with('/') {
        joined.push('/');
    }
    joined.push_str(input.trim_start_matches('/'));
    joined
}

/// Applies the configured prefix and base URL to a string target.
/// Prior requests pass through untouched.
pub(crate) fn normalize_target(target: Target, options: &EffectiveOptions) -> Result<Target> {
    let Target::Url(input) = target else {
        return Ok(target);
    };
    let joined = join_prefix(&options.prefix, &input);
    match &options.base_url {
        Some(base) => base
            .join(&joined)
            .map(|url| Target::Url(url.into()))
            .map_err(|source| Error::InvalidUrl {
                url: joined,
                source,
            }),
        None => Ok(Target::Url(joined)),
    }
}
