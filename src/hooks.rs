//! Pre-request and post-response hooks.
//!
//! Hooks never mutate shared state. A pre-request hook returns a
//! [`HookAction`] saying whether to continue, swap the target, or answer the
//! call itself; a post-response hook returns the response to continue with.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{EffectiveOptions, Response, Result, Target};

/// Outcome of a pre-request hook.
#[derive(Debug)]
pub enum HookAction {
    /// Keep the current target.
    Continue,
    /// Use this target for the rest of the call.
    Replace(Target),
    /// Skip the transport and remaining hooks; use this response.
    Respond(Response),
}

/// Runs before the first attempt of a call.
#[async_trait]
pub trait BeforeRequest: Send + Sync {
    async fn before_request(&self, target: &Target, options: &EffectiveOptions)
        -> Result<HookAction>;
}

/// Runs after a call produced a response.
#[async_trait]
pub trait AfterResponse: Send + Sync {
    async fn after_response(
        &self,
        target: &Target,
        options: &EffectiveOptions,
        response: Response,
    ) -> Result<Response>;
}

/// Hook lists, run in registration order.
#[derive(Clone, Default)]
pub struct Hooks {
    pub before_request: Vec<Arc<dyn BeforeRequest>>,
    pub after_response: Vec<Arc<dyn AfterResponse>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("before_request", &self.before_request.len())
            .field("after_response", &self.after_response.len())
            .finish()
    }
}

impl Hooks {
    /// Empty hook lists.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a pre-request hook.
    pub fn before_request(mut self, hook: impl BeforeRequest + 'static) -> Self {
        self.before_request.push(Arc::new(hook));
        self
    }

    /// Appends a post-response hook.
    pub fn after_response(mut self, hook: impl AfterResponse + 'static) -> Self {
        self.after_response.push(Arc::new(hook));
        self
    }

    /// Whether neither list has a hook.
    pub fn is_empty(&self) -> bool {
        self.before_request.is_empty() && self.after_response.is_empty()
    }
}

/// Adapter returned by [`before_request_fn`].
pub struct BeforeRequestFn<F>(F);

/// Builds a pre-request hook from an async closure over the current target.
pub fn before_request_fn<F, Fut>(hook: F) -> BeforeRequestFn<F>
where
    F: Fn(Target) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HookAction>> + Send + 'static,
{
    BeforeRequestFn(hook)
}

#[async_trait]
impl<F, Fut> BeforeRequest for BeforeRequestFn<F>
where
    F: Fn(Target) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HookAction>> + Send + 'static,
{
    async fn before_request(
        &self,
        target: &Target,
        _options: &EffectiveOptions,
    ) -> Result<HookAction> {
        (self.0)(target.clone()).await
    }
}

/// Adapter returned by [`after_response_fn`].
pub struct AfterResponseFn<F>(F);

/// Builds a post-response hook from an async closure over the response.
pub fn after_response_fn<F, Fut>(hook: F) -> AfterResponseFn<F>
where
    F: Fn(Response) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    AfterResponseFn(hook)
}

#[async_trait]
impl<F, Fut> AfterResponse for AfterResponseFn<F>
where
    F: Fn(Response) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    async fn after_response(
        &self,
        _target: &Target,
        _options: &EffectiveOptions,
        response: Response,
    ) -> Result<Response> {
        (self.0)(response).await
    }
}
