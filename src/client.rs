use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{check_response, classify};
use crate::request::normalize_target;
use crate::{
    signal, AbortSignal, AfterResponse, BeforeRequest, Blob, EffectiveOptions, Error, FormData,
    HookAction, Options, Output, Request, Response, ResponseType, Result, RetryPolicy, Target,
    Timeout, Transport,
};

#[derive(Clone, Default)]
/// A configured entry point. Cloning is cheap enough to do per task.
pub struct Sky {
    defaults: Options,
}

impl fmt::Debug for Sky {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut redacted = self.defaults.clone();
        if let Some(value) = redacted.headers.get_mut(reqwest::header::AUTHORIZATION) {
            *value = HeaderValue::from_static("<redacted>");
        }
        f.debug_struct("Sky").field("defaults", &redacted).finish()
    }
}

impl Sky {
    /// Creates an instance with built-in defaults only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an instance from `defaults`, unrelated to any other instance.
    pub fn create(defaults: Options) -> Self {
        Self { defaults }
    }

    /// Creates an instance whose defaults are this instance's defaults
    /// overlaid with `defaults`. `self` is unchanged.
    pub fn extend(&self, defaults: Options) -> Self {
        Self {
            defaults: self.defaults.clone().merge(defaults),
        }
    }

    /// Like [`Sky::extend`], computing the overlay from the current defaults.
    pub fn extend_with<F>(&self, build: F) -> Self
    where
        F: FnOnce(&Options) -> Options,
    {
        let overlay = build(&self.defaults);
        self.extend(overlay)
    }

    /// The defaults every call on this instance starts from.
    pub fn defaults(&self) -> &Options {
        &self.defaults
    }

    /// Creates an instance from environment variables.
    ///
    /// Reads (all optional):
    /// - `SKY_BASE_URL`: absolute URL targets are resolved against
    /// - `SKY_PREFIX`: path prefix for string targets
    /// - `SKY_TIMEOUT_MS`: per-attempt timeout, `0` disables it
    /// - `SKY_RETRIES`: retry budget
    ///
    /// Returns an error if a variable is set but malformed.
    pub fn from_env() -> std::result::Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Sky::from_env`], reading values through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> std::result::Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };
        let mut options = Options::default();

        if let Some(base_url) = read("SKY_BASE_URL") {
            url::Url::parse(&base_url).map_err(|err| format!("invalid SKY_BASE_URL: {err}"))?;
            options.base_url = Some(base_url);
        }
        options.prefix = read("SKY_PREFIX");
        if let Some(timeout) = read("SKY_TIMEOUT_MS") {
            let millis: u64 = timeout
                .parse()
                .map_err(|_| format!("SKY_TIMEOUT_MS is not a number: {timeout}"))?;
            options.timeout = Some(if millis == 0 {
                Timeout::Disabled
            } else {
                Timeout::After(Duration::from_millis(millis))
            });
        }
        if let Some(retries) = read("SKY_RETRIES") {
            let retries: usize = retries
                .parse()
                .map_err(|_| format!("SKY_RETRIES is not a number: {retries}"))?;
            options.retry = Some(RetryPolicy::from(retries));
        }

        Ok(Self::create(options))
    }

    /// Runs one call with `options` layered over the instance defaults.
    pub async fn fetch(&self, target: impl Into<Target>, options: Options) -> Result<Output> {
        let options = self.defaults.clone().merge(options);
        let (response, options) = execute(target.into(), options).await?;
        Output::read(response, options.response_type, &options.parse_json).await
    }

    /// Starts a call with an explicit method.
    pub fn request(&self, method: Method, target: impl Into<Target>) -> RequestBuilder {
        RequestBuilder::new(self.clone(), target.into()).method(method)
    }

    /// Starts a `GET` call.
    pub fn get(&self, target: impl Into<Target>) -> RequestBuilder {
        self.request(Method::GET, target)
    }

    /// Starts a `POST` call. Not retried on HTTP failures by default.
    pub fn post(&self, target: impl Into<Target>) -> RequestBuilder {
        self.request(Method::POST, target)
    }

    /// Starts a `PUT` call.
    pub fn put(&self, target: impl Into<Target>) -> RequestBuilder {
        self.request(Method::PUT, target)
    }

    /// Starts a `PATCH` call. Not retried on HTTP failures by default.
    pub fn patch(&self, target: impl Into<Target>) -> RequestBuilder {
        self.request(Method::PATCH, target)
    }

    /// Starts a `DELETE` call.
    pub fn delete(&self, target: impl Into<Target>) -> RequestBuilder {
        self.request(Method::DELETE, target)
    }

    /// Starts a `HEAD` call.
    pub fn head(&self, target: impl Into<Target>) -> RequestBuilder {
        self.request(Method::HEAD, target)
    }

    /// Starts a call that reads the body as `response_type`; the method may
    /// still be chosen on the builder.
    pub fn expecting(&self, response_type: ResponseType, target: impl Into<Target>) -> RequestBuilder {
        RequestBuilder::new(self.clone(), target.into()).response_type(response_type)
    }

    /// Starts a call that decodes the body as JSON and sends `Accept: application/json`.
    pub fn json(&self, target: impl Into<Target>) -> RequestBuilder {
        self.expecting(ResponseType::Json, target)
    }

    /// Starts a call that reads the body as text and sends `Accept: text/*`.
    pub fn text(&self, target: impl Into<Target>) -> RequestBuilder {
        self.expecting(ResponseType::Text, target)
    }

    /// Starts a call that reads the raw body bytes.
    pub fn bytes(&self, target: impl Into<Target>) -> RequestBuilder {
        self.expecting(ResponseType::Bytes, target)
    }

    /// Starts a call that reads the body together with its content type.
    pub fn blob(&self, target: impl Into<Target>) -> RequestBuilder {
        self.expecting(ResponseType::Blob, target)
    }

    /// Starts a call that decodes an url-encoded form body.
    pub fn form_data(&self, target: impl Into<Target>) -> RequestBuilder {
        self.expecting(ResponseType::FormData, target)
    }
}

/// Per-call configuration on top of a [`Sky`] instance.
///
/// Method and response type can be chosen in either order:
/// `sky.get(url).json::<T>()` and `sky.json(url).get().output()` run the
/// same call.
#[must_use = "a request does nothing until it is sent"]
pub struct RequestBuilder {
    sky: Sky,
    target: Target,
    options: Options,
    error: Option<Error>,
    raw: bool,
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBuilder")
            .field("target", &self.target)
            .field("options", &self.options)
            .field("error", &self.error)
            .finish()
    }
}

impl RequestBuilder {
    fn new(sky: Sky, target: Target) -> Self {
        Self {
            sky,
            target,
            options: Options::default(),
            error: None,
            raw: false,
        }
    }

    /// Sets the request method.
    pub fn method(mut self, method: Method) -> Self {
        self.options.method = Some(method);
        self
    }

    /// Uses `GET`.
    pub fn get(self) -> Self {
        self.method(Method::GET)
    }

    /// Uses `POST`.
    pub fn post(self) -> Self {
        self.method(Method::POST)
    }

    /// Uses `PUT`.
    pub fn put(self) -> Self {
        self.method(Method::PUT)
    }

    /// Uses `PATCH`.
    pub fn patch(self) -> Self {
        self.method(Method::PATCH)
    }

    /// Uses `DELETE`.
    pub fn delete(self) -> Self {
        self.method(Method::DELETE)
    }

    /// Uses `HEAD`.
    pub fn head(self) -> Self {
        self.method(Method::HEAD)
    }

    /// Selects the body representation [`RequestBuilder::output`] returns.
    pub fn response_type(mut self, response_type: ResponseType) -> Self {
        self.options.response_type = Some(response_type);
        self
    }

    /// Sets one header, replacing earlier values for `name`.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.options.headers.insert(name, value);
        self
    }

    /// Adds every header in `headers`.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.options.headers.extend(headers);
        self
    }

    /// Sets a raw request body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.options.body = Some(body.into());
        self
    }

    /// Sends `value` as a JSON body.
    pub fn json_body<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => self.options.json = Some(value),
            Err(err) => self.error = Some(Error::Json(Box::new(err))),
        }
        self
    }

    /// Per-attempt deadline. Also bounds reading a streamed body.
    pub fn timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.options.timeout = Some(timeout.into());
        self
    }

    /// Disables the per-attempt deadline.
    pub fn no_timeout(self) -> Self {
        self.timeout(Timeout::Disabled)
    }

    /// Cancels the call, including any retries, once `signal` aborts.
    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.options.signal = Some(signal);
        self
    }

    /// Replaces the retry policy. A bare number only sets the budget.
    pub fn retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.options.retry = Some(retry.into());
        self
    }

    /// Path prefix joined to string targets.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.options.prefix = Some(prefix.into());
        self
    }

    /// Absolute URL string targets are resolved against.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.options.base_url = Some(base_url.into());
        self
    }

    /// When `false`, non-2xx responses are returned instead of failing.
    pub fn throw_http_errors(mut self, throw: bool) -> Self {
        self.options.throw_http_errors = Some(throw);
        self
    }

    /// Sends through `transport` instead of the shared reqwest one.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.options.transport = Some(transport);
        self
    }

    /// Adds a pre-request hook. Hooks set per call replace the instance's.
    pub fn before_request(mut self, hook: impl BeforeRequest + 'static) -> Self {
        self.options.hooks.before_request.push(Arc::new(hook));
        self
    }

    /// Adds a post-response hook. Hooks set per call replace the instance's.
    pub fn after_response(mut self, hook: impl AfterResponse + 'static) -> Self {
        self.options.hooks.after_response.push(Arc::new(hook));
        self
    }

    /// Layers a whole option bag over what was set so far.
    pub fn options(mut self, options: Options) -> Self {
        self.options = std::mem::take(&mut self.options).merge(options);
        self
    }

    /// Runs the call and returns the response, or the representation
    /// selected with [`RequestBuilder::response_type`].
    pub async fn output(self) -> Result<Output> {
        if let Some(error) = self.error {
            return Err(error);
        }
        self.sky.fetch(self.target, self.options).await
    }

    /// Runs the call and returns the raw response, ignoring any response
    /// type set on the call or the instance.
    pub async fn send(mut self) -> Result<Response> {
        self.raw = true;
        let (response, _) = self.run().await?;
        Ok(response)
    }

    /// Runs the call and decodes the JSON body into `T`.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        let (mut response, options) = self.response_type(ResponseType::Json).run().await?;
        let value = response.json_value_with(&options.parse_json).await?;
        serde_json::from_value(value).map_err(|err| Error::Json(Box::new(err)))
    }

    /// Runs the call and reads the body as text.
    pub async fn text(self) -> Result<String> {
        let (mut response, _) = self.response_type(ResponseType::Text).run().await?;
        response.text().await
    }

    /// Runs the call and reads the raw body.
    pub async fn bytes(self) -> Result<Bytes> {
        let (mut response, _) = self.response_type(ResponseType::Bytes).run().await?;
        response.bytes().await
    }

    /// Runs the call and reads the body with its content type.
    pub async fn blob(self) -> Result<Blob> {
        let (mut response, _) = self.response_type(ResponseType::Blob).run().await?;
        response.blob().await
    }

    /// Runs the call and decodes an url-encoded form body.
    pub async fn form_data(self) -> Result<FormData> {
        let (mut response, _) = self.response_type(ResponseType::FormData).run().await?;
        response.form_data().await
    }

    async fn run(self) -> Result<(Response, Arc<EffectiveOptions>)> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let mut options = self.sky.defaults.clone().merge(self.options);
        if self.raw {
            options.response_type = None;
        }
        execute(self.target, options).await
    }
}

/// Runs the request pipeline for one logical call and returns the final
/// response together with the options it ran with.
async fn execute(target: Target, options: Options) -> Result<(Response, Arc<EffectiveOptions>)> {
    let mut options = EffectiveOptions::resolve(options)?;
    if options.headers.is_empty() {
        if let Target::Request(prior) = &target {
            options.headers = prior.headers().clone();
        }
    }
    let target = normalize_target(target, &options)?;
    options.normalize_body_and_headers()?;
    let options = Arc::new(options);

    let (target, mut response) = send_request(target, &options).await?;

    for hook in &options.hooks.after_response {
        response = hook.after_response(&target, &options, response).await?;
    }

    Ok((response, options))
}

/// Runs the pre-request hooks, then the retry loop unless a hook answered.
async fn send_request(
    mut target: Target,
    options: &Arc<EffectiveOptions>,
) -> Result<(Target, Response)> {
    for hook in &options.hooks.before_request {
        match hook.before_request(&target, options).await? {
            HookAction::Continue => {}
            HookAction::Replace(next) => target = next,
            HookAction::Respond(response) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("pre-request hook answered {} without a transport call", target.url());
                return Ok((target, response));
            }
        }
    }

    let current = &target;
    let response = options
        .retry
        .run(|_attempt| attempt(current, options))
        .await?;
    Ok((target, response))
}

/// One attempt: a fresh descriptor and a fresh merged signal. The signal is
/// released when the transport fails or returns a buffered body; a streamed
/// body keeps it until the body is read or dropped.
async fn attempt(target: &Target, options: &Arc<EffectiveOptions>) -> Result<Response> {
    let request = Request::for_attempt(target, options);
    let timeout = match options.timeout {
        Timeout::After(duration) => Some(AbortSignal::timeout(duration)),
        Timeout::Disabled => None,
    };
    let merged = signal::any(
        request
            .signal()
            .cloned()
            .into_iter()
            .chain(timeout.as_ref().map(|timeout| timeout.signal().clone())),
    );

    let result = options
        .transport
        .fetch(request.clone(), merged.as_ref().map(|merged| merged.signal().clone()))
        .await;

    let response = match result {
        Ok(response) => response.guard_body(merged, timeout, &request, options),
        Err(error) => return Err(classify(error, request, options)),
    };
    check_response(response, request, options).await
}

/// Starts a GET call on a default instance.
pub fn get(target: impl Into<Target>) -> RequestBuilder {
    Sky::new().get(target)
}

/// Starts a POST call on a default instance.
pub fn post(target: impl Into<Target>) -> RequestBuilder {
    Sky::new().post(target)
}

/// Starts a PUT call on a default instance.
pub fn put(target: impl Into<Target>) -> RequestBuilder {
    Sky::new().put(target)
}

/// Starts a PATCH call on a default instance.
pub fn patch(target: impl Into<Target>) -> RequestBuilder {
    Sky::new().patch(target)
}

/// Starts a DELETE call on a default instance.
pub fn delete(target: impl Into<Target>) -> RequestBuilder {
    Sky::new().delete(target)
}

/// Starts a HEAD call on a default instance.
pub fn head(target: impl Into<Target>) -> RequestBuilder {
    Sky::new().head(target)
}

/// Runs one call on a default instance.
pub async fn fetch(target: impl Into<Target>, options: Options) -> Result<Output> {
    Sky::new().fetch(target, options).await
}
