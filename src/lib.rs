//! `sky-fetch` is an async HTTP client convenience layer.
//!
//! Every call runs one pipeline: pre-request hooks, then attempts with
//! exponential backoff, each with its own merged cancellation signal
//! (caller signal OR per-attempt timeout), then post-response hooks.
//! Failures surface as one of the typed variants of [`Error`]:
//! - [`Error::Abort`]
//! - [`Error::Timeout`]
//! - [`Error::Network`]
//! - [`Error::Http`]
//!
//! ```no_run
//! # async fn demo() -> sky_fetch::Result<()> {
//! let api = sky_fetch::Sky::new().extend(sky_fetch::Options {
//!     base_url: Some("https://example.com/".to_owned()),
//!     prefix: Some("api".to_owned()),
//!     ..Default::default()
//! });
//! let item: serde_json::Value = api.get("items/1").json().await?;
//! # let _ = item;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod hooks;
mod options;
mod request;
mod response;
mod retry;
/// Cancellation signals and their merger.
pub mod signal;
mod transport;

pub use client::{delete, fetch, get, head, patch, post, put, RequestBuilder, Sky};
pub use error::{
    AbortError, BoxError, Error, HttpError, HttpErrorBody, NetworkError, NetworkErrorKind,
    TimeoutError, TransportError,
};
pub use hooks::{
    after_response_fn, before_request_fn, AfterResponse, AfterResponseFn, BeforeRequest,
    BeforeRequestFn, HookAction, Hooks,
};
pub use options::{
    EffectiveOptions, JsonDecoder, JsonEncoder, Options, Timeout, DEFAULT_TIMEOUT, REQUEST_METHODS,
};
pub use request::{Request, RequestMode, Target};
pub use response::{Blob, ByteStream, FormData, Output, Response, ResponseType};
pub use retry::{
    default_retry_methods, RetryPolicy, RetryPredicate, DEFAULT_MAX_RETRY_TIME, DEFAULT_RETRIES,
    RETRY_STATUS_CODES,
};
pub use signal::{AbortController, AbortReason, AbortSignal};
pub use transport::{ReqwestTransport, Transport};

pub use reqwest::{header, Method, StatusCode};

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
