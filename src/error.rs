use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use reqwest::StatusCode;

use crate::{AbortReason, EffectiveOptions, Request, Response};

/// Boxed error used for causes reported by collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Network-layer failure kinds a transport can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Host name did not resolve.
    Dns,
    /// Connection could not be established or was reset.
    Connect,
    /// The target cannot be addressed at all: no scheme, or one the
    /// transport does not speak. Never retried.
    UnknownScheme,
    Other,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::UnknownScheme => "unknown scheme",
            Self::Other => "other",
        };
        f.write_str(text)
    }
}

/// Failure reported by a [`Transport`](crate::Transport).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The signal handed to the transport was aborted.
    #[error("request aborted: {0}")]
    Aborted(AbortReason),
    /// The transport's own deadline elapsed.
    #[error("request timed out")]
    TimedOut,
    #[error("network error ({kind})")]
    Network {
        kind: NetworkErrorKind,
        #[source]
        source: Option<BoxError>,
    },
    /// Anything else. Surfaced to the caller unchanged.
    #[error("{0}")]
    Other(#[source] BoxError),
}

impl TransportError {
    /// Network failure of `kind` caused by `source`.
    pub fn network(kind: NetworkErrorKind, source: impl Into<BoxError>) -> Self {
        Self::Network {
            kind,
            source: Some(source.into()),
        }
    }
}

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The request was cancelled through its signal.
    #[error(transparent)]
    Abort(Box<AbortError>),
    /// The per-attempt deadline elapsed.
    #[error(transparent)]
    Timeout(Box<TimeoutError>),
    /// Connectivity, name resolution or cross-origin failure.
    #[error(transparent)]
    Network(Box<NetworkError>),
    /// A response arrived with a status outside 200-299.
    #[error(transparent)]
    Http(Box<HttpError>),
    /// Unrecognized transport failure, passed through as is.
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[source] BoxError),
    #[error("failed to read response body: {0}")]
    Body(#[source] BoxError),
    /// The response body was already consumed.
    #[error("response body already used")]
    BodyUsed,
    #[error("hook failed: {0}")]
    Hook(#[source] BoxError),
    #[error("cannot read body with content type {content_type:?} as form data")]
    UnsupportedFormData { content_type: Option<String> },
}

impl Error {
    /// Short name of the failure class, e.g. `"HTTPError"`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Abort(_) => "AbortError",
            Self::Timeout(_) => "TimeoutError",
            Self::Network(_) => "NetworkError",
            Self::Http(_) => "HTTPError",
            Self::Transport(_) => "TransportError",
            Self::InvalidUrl { .. } => "InvalidUrlError",
            Self::Json(_) => "JsonError",
            Self::Body(_) | Self::BodyUsed => "BodyError",
            Self::Hook(_) => "HookError",
            Self::UnsupportedFormData { .. } => "FormDataError",
        }
    }

    /// The request that failed, for the typed failures.
    pub fn request(&self) -> Option<&Request> {
        self.failure().map(|failure| &failure.request)
    }

    /// The options the failing call ran with, for the typed failures.
    pub fn options(&self) -> Option<&EffectiveOptions> {
        self.failure().map(|failure| failure.options.as_ref())
    }

    /// Response status, for HTTP failures.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Http(error) => Some(error.status()),
            _ => None,
        }
    }

    /// Whether the call was cancelled through its signal.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Abort(_))
    }

    /// Whether an attempt ran past its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Whether the target could not be reached.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Whether a non-2xx response was received.
    pub fn is_http(&self) -> bool {
        matches!(self, Self::Http(_))
    }

    fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Abort(error) => Some(&error.failure),
            Self::Timeout(error) => Some(&error.failure),
            Self::Network(error) => Some(&error.failure),
            Self::Http(error) => Some(&error.failure),
            _ => None,
        }
    }
}

struct Failure {
    request: Request,
    options: Arc<EffectiveOptions>,
    message: String,
    cause: Option<SharedError>,
}

impl Failure {
    fn new(
        reason: &str,
        request: Request,
        options: Arc<EffectiveOptions>,
        cause: Option<SharedError>,
    ) -> Self {
        let message = format!("{reason}: {} {}", request.method(), request.url());
        Self {
            request,
            options,
            message,
            cause,
        }
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure")
            .field("message", &self.message)
            .field("request", &self.request)
            .field("cause", &self.cause)
            .finish_non_exhaustive()
    }
}

macro_rules! typed_failure {
    ($name:ident) => {
        impl $name {
            /// The request descriptor of the failing attempt.
            pub fn request(&self) -> &Request {
                &self.failure.request
            }

            /// The options the call ran with.
            pub fn options(&self) -> &EffectiveOptions {
                &self.failure.options
            }

            /// `"<reason>: <METHOD> <URL>"`.
            pub fn message(&self) -> &str {
                &self.failure.message
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.failure.message)
            }
        }

        impl std::error::Error for $name {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                self.failure
                    .cause
                    .as_deref()
                    .map(|cause| cause as &(dyn std::error::Error + 'static))
            }
        }
    };
}

/// The request was aborted through its signal.
#[derive(Debug)]
pub struct AbortError {
    failure: Failure,
    reason: AbortReason,
}

typed_failure!(AbortError);

impl AbortError {
    pub(crate) fn new(reason: AbortReason, request: Request, options: Arc<EffectiveOptions>) -> Self {
        let (text, cause) = match &reason {
            AbortReason::Message(message) if !message.is_empty() => {
                (format!("Request aborted due to {message}"), None)
            }
            AbortReason::Error(error) => ("Request aborted".to_owned(), Some(Arc::clone(error))),
            _ => ("Request aborted".to_owned(), None),
        };
        Self {
            failure: Failure::new(&text, request, options, cause),
            reason,
        }
    }

    /// The reason the signal carried.
    pub fn reason(&self) -> &AbortReason {
        &self.reason
    }
}

/// The attempt's deadline elapsed before a response arrived.
#[derive(Debug)]
pub struct TimeoutError {
    failure: Failure,
}

typed_failure!(TimeoutError);

impl TimeoutError {
    pub(crate) fn new(request: Request, options: Arc<EffectiveOptions>) -> Self {
        Self {
            failure: Failure::new("Request aborted due to timeout", request, options, None),
        }
    }
}

/// The target could not be reached.
#[derive(Debug)]
pub struct NetworkError {
    failure: Failure,
    kind: NetworkErrorKind,
    cross_origin: bool,
}

typed_failure!(NetworkError);

impl NetworkError {
    pub(crate) fn new(
        kind: NetworkErrorKind,
        source: Option<BoxError>,
        request: Request,
        options: Arc<EffectiveOptions>,
    ) -> Self {
        let cross_origin = is_cross_origin(&request, &options);
        let mut reason = String::from("Request failed due to URL or network connection");
        if kind == NetworkErrorKind::Dns {
            reason.push_str(" (IP did not resolve)");
        }
        if cross_origin {
            reason.push_str(" or CORS denied");
        }
        Self {
            failure: Failure::new(&reason, request, options, source.map(SharedError::from)),
            kind,
            cross_origin,
        }
    }

    /// What kind of network failure the transport reported.
    pub fn kind(&self) -> NetworkErrorKind {
        self.kind
    }

    /// Whether the request left the configured execution origin under
    /// CORS mode, in which case the failure may be a CORS denial.
    pub fn is_cross_origin(&self) -> bool {
        self.cross_origin
    }
}

fn is_cross_origin(request: &Request, options: &EffectiveOptions) -> bool {
    let Some(origin) = options.origin.as_ref() else {
        return false;
    };
    if request.mode() != crate::RequestMode::Cors {
        return false;
    }
    url::Url::parse(request.url())
        .map(|url| url.origin() != origin.origin())
        .unwrap_or(false)
}

/// Buffered body of a failed response.
///
/// `json` is `None` when the body is not valid JSON.
#[derive(Clone, Debug, Default)]
pub struct HttpErrorBody {
    pub bytes: Bytes,
    pub text: String,
    pub json: Option<serde_json::Value>,
}

/// A response arrived with a status outside 200-299.
///
/// Unless the call requested a response type, the body is left unread on
/// [`HttpError::response`] for the caller to consume.
#[derive(Debug)]
pub struct HttpError {
    failure: Failure,
    response: Response,
    body: Option<HttpErrorBody>,
}

typed_failure!(HttpError);

impl HttpError {
    pub(crate) fn new(request: Request, response: Response, options: Arc<EffectiveOptions>) -> Self {
        let status = format!(
            "{} {}",
            response.status().as_u16(),
            response.status_text()
        );
        let status = status.trim();
        let reason = if status.is_empty() {
            "Request failed due to an unknown error".to_owned()
        } else {
            format!("Request failed due to status code {status}")
        };
        Self {
            failure: Failure::new(&reason, request, options, None),
            response,
            body: None,
        }
    }

    /// Reads the whole body into [`HttpErrorBody`]. Decoding failures are
    /// ignored and a failed read leaves the body unset; only an abort or
    /// timeout while reading is returned.
    pub(crate) async fn buffer_body(&mut self) -> crate::Result<()> {
        let bytes = match self.response.bytes().await {
            Ok(bytes) => bytes,
            Err(error @ (Error::Abort(_) | Error::Timeout(_))) => return Err(error),
            Err(_error) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("could not buffer error response body: {}", _error);
                return Ok(());
            }
        };
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let json = (self.failure.options.parse_json)(&text).ok();
        self.body = Some(HttpErrorBody { bytes, text, json });
        Ok(())
    }

    /// Status of the failed response.
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    /// The failed response. Its body is used if it was buffered.
    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Mutable access, for reading an unbuffered body.
    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    /// Takes the failed response out of the error.
    pub fn into_response(self) -> Response {
        self.response
    }

    /// The buffered body, when the call requested a response type.
    pub fn body(&self) -> Option<&HttpErrorBody> {
        self.body.as_ref()
    }
}

/// Maps a transport failure to the error taxonomy.
pub(crate) fn classify(
    error: TransportError,
    request: Request,
    options: &Arc<EffectiveOptions>,
) -> Error {
    let options = Arc::clone(options);
    let classified = match error {
        TransportError::Aborted(AbortReason::Timeout) | TransportError::TimedOut => {
            Error::Timeout(Box::new(TimeoutError::new(request, options)))
        }
        TransportError::Aborted(reason) => {
            Error::Abort(Box::new(AbortError::new(reason, request, options)))
        }
        TransportError::Network { kind, source } => {
            Error::Network(Box::new(NetworkError::new(kind, source, request, options)))
        }
        TransportError::Other(source) => Error::Transport(source),
    };

    #[cfg(feature = "tracing")]
    tracing::debug!("classified transport failure as {}", classified.name());

    classified
}

/// Turns a non-success response into an [`HttpError`] unless the call
/// disabled that.
pub(crate) async fn check_response(
    response: Response,
    request: Request,
    options: &Arc<EffectiveOptions>,
) -> crate::Result<Response> {
    if response.is_ok() || !options.throw_http_errors {
        return Ok(response);
    }
    let mut error = HttpError::new(request, response, Arc::clone(options));
    if options.response_type.is_some() {
        error.buffer_body().await?;
    }
    Err(Error::Http(Box::new(error)))
}
