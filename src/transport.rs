use std::error::Error as _;

use async_trait::async_trait;
use futures_util::StreamExt;

use crate::error::BoxError;
use crate::{AbortSignal, NetworkErrorKind, Request, Response, TransportError};

/// Performs the actual network exchange.
///
/// Implementations should observe `signal` and return
/// [`TransportError::Aborted`] promptly once it is aborted.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(
        &self,
        request: Request,
        signal: Option<AbortSignal>,
    ) -> Result<Response, TransportError>;
}

/// [`Transport`] backed by a `reqwest::Client`.
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    /// Uses a default `reqwest::Client`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a preconfigured client (proxies, TLS roots, pooling).
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn fetch(
        &self,
        request: Request,
        signal: Option<AbortSignal>,
    ) -> Result<Response, TransportError> {
        if let Some(reason) = signal.as_ref().and_then(AbortSignal::reason) {
            return Err(TransportError::Aborted(reason));
        }

        let url = reqwest::Url::parse(request.url())
            .map_err(|err| TransportError::network(NetworkErrorKind::UnknownScheme, err))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TransportError::network(
                NetworkErrorKind::UnknownScheme,
                format!("unknown scheme: {}", url.scheme()),
            ));
        }

        let mut builder = self
            .http
            .request(request.method().clone(), url)
            .headers(request.headers().clone());
        if let Some(body) = request.body() {
            builder = builder.body(body.clone());
        }

        let send = builder.send();
        let response = match signal {
            Some(signal) => tokio::select! {
                biased;
                reason = signal.aborted() => return Err(TransportError::Aborted(reason)),
                response = send => response,
            },
            None => send.await,
        }
        .map_err(classify_reqwest_error)?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().to_string();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(BoxError::from));

        Ok(Response::from_stream(status, Box::pin(stream))
            .with_headers(headers)
            .with_url(url))
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::TimedOut;
    }
    if err.is_builder() {
        return TransportError::network(NetworkErrorKind::UnknownScheme, err);
    }
    if err.is_connect() {
        let kind = if mentions_dns(&err) {
            NetworkErrorKind::Dns
        } else {
            NetworkErrorKind::Connect
        };
        return TransportError::network(kind, err);
    }
    if err.is_request() {
        return TransportError::network(NetworkErrorKind::Other, err);
    }
    TransportError::Other(Box::new(err))
}

fn mentions_dns(err: &reqwest::Error) -> bool {
    std::iter::successors(err.source(), |cause| (*cause).source()).any(|cause| {
        let text = cause.to_string();
        text.contains("dns error") || text.contains("failed to lookup address")
    })
}
