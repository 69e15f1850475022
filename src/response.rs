use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::error::{classify, BoxError};
use crate::options::JsonDecoder;
use crate::signal::{AnySignal, TimeoutSignal};
use crate::{
    AbortReason, AbortSignal, EffectiveOptions, Error, Request, Result, TransportError,
};

/// Stream of body chunks produced by a transport.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, BoxError>> + Send>>;

/// A body representation a call may ask for instead of the raw response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResponseType {
    Bytes,
    Text,
    Json,
    Blob,
    FormData,
}

impl ResponseType {
    /// Every response type, in shortcut order.
    pub const ALL: [ResponseType; 5] = [
        ResponseType::Blob,
        ResponseType::Bytes,
        ResponseType::FormData,
        ResponseType::Json,
        ResponseType::Text,
    ];

    /// `Accept` value sent when the call did not set one.
    pub fn accept_type(self) -> Option<&'static str> {
        match self {
            Self::FormData => Some("multipart/form-data"),
            Self::Json => Some("application/json"),
            Self::Text => Some("text/*"),
            Self::Bytes | Self::Blob => None,
        }
    }
}

enum Body {
    Empty,
    Buffered(Bytes),
    // Only here so `Response` is `Sync`; taken apart before reading.
    Stream(Mutex<ByteStream>),
    Used,
}

/// Keeps an attempt's cancellation in force until its streamed body has
/// been read or dropped.
struct BodyGuard {
    signal: AbortSignal,
    request: Request,
    options: Arc<EffectiveOptions>,
    _merged: AnySignal,
    _timeout: Option<TimeoutSignal>,
}

impl BodyGuard {
    fn abort_error(&self, reason: AbortReason) -> Error {
        classify(
            TransportError::Aborted(reason),
            self.request.clone(),
            &self.options,
        )
    }
}

/// A response whose body can be read exactly once.
pub struct Response {
    status: StatusCode,
    status_text: String,
    headers: HeaderMap,
    url: String,
    body: Body,
    guard: Option<Box<BodyGuard>>,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .field("body_used", &self.body_used())
            .finish()
    }
}

impl Response {
    /// Creates a response with a fully buffered body.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
            headers: HeaderMap::new(),
            url: String::new(),
            body: if body.is_empty() {
                Body::Empty
            } else {
                Body::Buffered(body)
            },
            guard: None,
        }
    }

    /// Creates a response whose body is read lazily from `stream`.
    pub fn from_stream(status: StatusCode, stream: ByteStream) -> Self {
        Self {
            body: Body::Stream(Mutex::new(stream)),
            ..Self::new(status, Bytes::new())
        }
    }

    /// Overrides the reason phrase.
    pub fn with_status_text(mut self, status_text: impl Into<String>) -> Self {
        self.status_text = status_text.into();
        self
    }

    /// Sets the final URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Sets one header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces all headers.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// The status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The reason phrase, empty when unknown.
    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    /// Whether the status is within 200-299.
    pub fn is_ok(&self) -> bool {
        self.status.is_success()
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The final URL, after redirects.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The `Content-Type` header, if it is valid text.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    /// Whether the body has already been consumed.
    pub fn body_used(&self) -> bool {
        matches!(self.body, Body::Used)
    }

    /// Ties a streamed body to the attempt's signal: reads fail with an
    /// abort or timeout error once it fires. Buffered bodies release the
    /// signal right away.
    pub(crate) fn guard_body(
        mut self,
        merged: Option<AnySignal>,
        timeout: Option<TimeoutSignal>,
        request: &Request,
        options: &Arc<EffectiveOptions>,
    ) -> Self {
        if let (Body::Stream(_), Some(merged)) = (&self.body, merged) {
            self.guard = Some(Box::new(BodyGuard {
                signal: merged.signal().clone(),
                request: request.clone(),
                options: Arc::clone(options),
                _merged: merged,
                _timeout: timeout,
            }));
        }
        self
    }

    /// Reads the whole body. Fails with [`Error::BodyUsed`] on a second read.
    ///
    /// A streamed body is still bound to the cancellation of the attempt
    /// that produced it; aborting or timing out fails the read with
    /// [`Error::Abort`] or [`Error::Timeout`].
    pub async fn bytes(&mut self) -> Result<Bytes> {
        let guard = self.guard.take();
        match std::mem::replace(&mut self.body, Body::Used) {
            Body::Used => Err(Error::BodyUsed),
            Body::Empty => Ok(Bytes::new()),
            Body::Buffered(bytes) => Ok(bytes),
            Body::Stream(stream) => {
                let stream = stream.into_inner().unwrap_or_else(PoisonError::into_inner);
                match guard {
                    None => collect(stream).await,
                    Some(guard) => tokio::select! {
                        biased;
                        reason = guard.signal.aborted() => Err(guard.abort_error(reason)),
                        bytes = collect(stream) => bytes,
                    },
                }
            }
        }
    }

    /// Reads the body as UTF-8, replacing invalid sequences.
    pub async fn text(&mut self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Reads the body and decodes it as JSON.
    pub async fn json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| Error::Json(Box::new(err)))
    }

    /// Reads the body together with its content type.
    pub async fn blob(&mut self) -> Result<Blob> {
        let content_type = self.content_type().map(str::to_owned);
        let bytes = self.bytes().await?;
        Ok(Blob {
            bytes,
            content_type,
        })
    }

    /// Reads an `application/x-www-form-urlencoded` body. Other content
    /// types fail with [`Error::UnsupportedFormData`].
    pub async fn form_data(&mut self) -> Result<FormData> {
        let content_type = self.content_type().map(str::to_owned);
        let is_urlencoded = content_type.as_deref().is_some_and(|value| {
            value
                .split(';')
                .next()
                .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/x-www-form-urlencoded"))
        });
        if !is_urlencoded {
            return Err(Error::UnsupportedFormData { content_type });
        }
        let bytes = self.bytes().await?;
        Ok(FormData::parse(&bytes))
    }

    pub(crate) async fn json_value_with(&mut self, decoder: &JsonDecoder) -> Result<serde_json::Value> {
        let text = self.text().await?;
        decoder(&text).map_err(Error::Json)
    }
}

async fn collect(mut stream: ByteStream) -> Result<Bytes> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk.map_err(Error::Body)?);
    }
    Ok(buffer.freeze())
}

/// Raw bytes together with their content type.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Blob {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

/// Decoded form fields, in body order. Names may repeat.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FormData {
    entries: Vec<(String, String)>,
}

impl FormData {
    fn parse(body: &[u8]) -> Self {
        Self {
            entries: url::form_urlencoded::parse(body).into_owned().collect(),
        }
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Every value for `name`, in body order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// All fields as `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Number of fields, counting repeats.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the form has no fields.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of a call: the raw response, or the representation it asked for.
#[derive(Debug)]
pub enum Output {
    Response(Response),
    Bytes(Bytes),
    Text(String),
    Json(serde_json::Value),
    Blob(Blob),
    FormData(FormData),
}

impl Output {
    /// Consumes `response` into the representation named by `response_type`.
    pub(crate) async fn read(
        mut response: Response,
        response_type: Option<ResponseType>,
        decoder: &JsonDecoder,
    ) -> Result<Self> {
        Ok(match response_type {
            None => Self::Response(response),
            Some(ResponseType::Bytes) => Self::Bytes(response.bytes().await?),
            Some(ResponseType::Text) => Self::Text(response.text().await?),
            Some(ResponseType::Json) => Self::Json(response.json_value_with(decoder).await?),
            Some(ResponseType::Blob) => Self::Blob(response.blob().await?),
            Some(ResponseType::FormData) => Self::FormData(response.form_data().await?),
        })
    }

    /// The raw response, when no response type was requested.
    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::Response(response) => Some(response),
            _ => None,
        }
    }

    /// The decoded JSON value, for [`ResponseType::Json`].
    pub fn into_json(self) -> Option<serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    /// The text body, for [`ResponseType::Text`].
    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// The raw body, for [`ResponseType::Bytes`].
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}
