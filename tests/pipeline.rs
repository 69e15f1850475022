use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use serde_json::{json, Value as JsonValue};
use sky_fetch::{
    after_response_fn, before_request_fn,
    header::{ACCEPT, CONTENT_TYPE},
    AbortController, AbortReason, AbortSignal, BoxError, Error, HookAction, NetworkErrorKind, Options,
    Output, Request, Response, ResponseType, RetryPolicy, Sky, StatusCode, Target, Timeout,
    Transport, TransportError,
};

#[derive(Clone)]
enum Reply {
    Status(u16, &'static str),
    /// Body delivered as a stream of one chunk.
    Streamed(u16, &'static str),
    /// Headers arrive, the body never does.
    StalledBody(u16),
    Network(NetworkErrorKind),
    Unrecognized,
    /// Never answers; settles only when the signal aborts.
    Hang,
}

struct MockTransport {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    seen: Mutex<Vec<Request>>,
    calls: AtomicUsize,
}

impl MockTransport {
    fn new(replies: Vec<Reply>, fallback: Reply) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            fallback,
            seen: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    fn always(reply: Reply) -> Arc<Self> {
        Self::new(Vec::new(), reply)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_request(&self) -> Request {
        self.seen
            .lock()
            .expect("seen mutex must not be poisoned")
            .last()
            .cloned()
            .expect("transport must have been called")
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(
        &self,
        request: Request,
        signal: Option<AbortSignal>,
    ) -> Result<Response, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .expect("seen mutex must not be poisoned")
            .push(request.clone());

        if let Some(reason) = signal.as_ref().and_then(AbortSignal::reason) {
            return Err(TransportError::Aborted(reason));
        }

        let reply = self
            .replies
            .lock()
            .expect("reply mutex must not be poisoned")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match reply {
            Reply::Status(code, body) => {
                Ok(Response::new(status(code), body).with_url(request.url()))
            }
            Reply::Streamed(code, body) => {
                let chunks: Vec<Result<Bytes, BoxError>> =
                    vec![Ok(Bytes::from_static(body.as_bytes()))];
                Ok(Response::from_stream(status(code), Box::pin(stream::iter(chunks))))
            }
            Reply::StalledBody(code) => Ok(Response::from_stream(
                status(code),
                Box::pin(stream::pending::<Result<Bytes, BoxError>>()),
            )),
            Reply::Network(kind) => Err(TransportError::network(kind, "mock network failure")),
            Reply::Unrecognized => Err(TransportError::Other("mock oddity".into())),
            Reply::Hang => match signal {
                Some(signal) => Err(TransportError::Aborted(signal.aborted().await)),
                None => std::future::pending().await,
            },
        }
    }
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).expect("mock status must be valid")
}

fn sky_with(transport: &Arc<MockTransport>) -> Sky {
    Sky::create(Options {
        transport: Some(transport.clone()),
        retry: Some(RetryPolicy::default().min_timeout(Duration::from_millis(10))),
        ..Options::default()
    })
}

#[tokio::test]
async fn prefix_is_joined_before_the_transport_sees_the_target() {
    let transport = MockTransport::always(Reply::Status(200, "ok"));
    let sky = sky_with(&transport).extend(Options {
        prefix: Some("api/".to_owned()),
        ..Options::default()
    });

    sky.get("items/1").send().await.expect("call must succeed");

    assert_eq!(transport.last_request().url(), "api/items/1");
}

#[tokio::test]
async fn prefix_and_base_url_build_an_absolute_target() {
    let transport = MockTransport::always(Reply::Status(200, "ok"));
    let sky = sky_with(&transport).extend(Options {
        prefix: Some("api".to_owned()),
        base_url: Some("https://example.com/".to_owned()),
        ..Options::default()
    });

    sky.get("/items/1").send().await.expect("call must succeed");

    assert_eq!(transport.last_request().url(), "https://example.com/api/items/1");
}

#[tokio::test(start_paused = true)]
async fn retryable_status_exhausts_budget_then_fails_with_http_error() {
    let transport = MockTransport::always(Reply::Status(503, "busy"));
    let sky = Sky::create(Options {
        transport: Some(transport.clone()),
        ..Options::default()
    });

    let err = sky
        .get("https://example.com/flaky")
        .send()
        .await
        .expect_err("503 must fail");

    assert_eq!(err.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
    assert_eq!(
        err.to_string(),
        "Request failed due to status code 503 Service Unavailable: GET https://example.com/flaky"
    );
    assert_eq!(transport.calls(), 5);
}

#[tokio::test]
async fn http_failure_on_non_retryable_method_is_terminal() {
    let transport = MockTransport::always(Reply::Status(503, "busy"));

    let err = sky_with(&transport)
        .post("https://example.com/orders")
        .send()
        .await
        .expect_err("503 must fail");

    assert!(err.is_http());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn http_failure_on_non_retryable_status_is_terminal() {
    let transport = MockTransport::always(Reply::Status(404, "missing"));

    let err = sky_with(&transport)
        .get("https://example.com/missing")
        .send()
        .await
        .expect_err("404 must fail");

    assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn custom_retry_statuses_are_honoured() {
    let transport = MockTransport::new(
        vec![Reply::Status(404, "not yet")],
        Reply::Status(200, "there"),
    );

    let text = sky_with(&transport)
        .get("https://example.com/eventually")
        .retry(
            RetryPolicy::default()
                .min_timeout(Duration::from_millis(1))
                .status_codes([404]),
        )
        .text()
        .await
        .expect("second attempt must succeed");

    assert_eq!(text, "there");
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn already_aborted_signal_fails_with_abort() {
    let transport = MockTransport::always(Reply::Status(200, "ok"));

    let err = sky_with(&transport)
        .get("https://example.com/sleep")
        .signal(AbortSignal::aborted_with(AbortReason::Aborted))
        .send()
        .await
        .expect_err("aborted call must fail");

    assert!(err.is_abort());
    assert_eq!(err.to_string(), "Request aborted: GET https://example.com/sleep");
}

#[tokio::test]
async fn abort_reason_text_is_part_of_the_message() {
    let transport = MockTransport::always(Reply::Status(200, "ok"));

    let err = sky_with(&transport)
        .get("https://example.com/sleep")
        .signal(AbortSignal::aborted_with(AbortReason::Message(
            "lunch break".to_owned(),
        )))
        .send()
        .await
        .expect_err("aborted call must fail");

    assert_eq!(
        err.to_string(),
        "Request aborted due to lunch break: GET https://example.com/sleep"
    );
}

#[tokio::test]
async fn abort_in_flight_is_never_retried() {
    let transport = MockTransport::always(Reply::Hang);
    let controller = AbortController::new();
    let signal = controller.signal();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.abort();
    });

    let err = sky_with(&transport)
        .get("https://example.com/sleep")
        .retry(RetryPolicy::default().retries(10).min_timeout(Duration::from_millis(1)))
        .signal(signal)
        .send()
        .await
        .expect_err("aborted call must fail");

    assert!(err.is_abort());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn timeouts_are_retried_then_surface_as_timeout() {
    let transport = MockTransport::always(Reply::Hang);

    let err = sky_with(&transport)
        .get("https://example.com/slow")
        .timeout(Duration::from_millis(100))
        .retry(RetryPolicy::default().retries(2).min_timeout(Duration::from_millis(10)))
        .send()
        .await
        .expect_err("slow call must time out");

    assert!(err.is_timeout());
    assert_eq!(
        err.to_string(),
        "Request aborted due to timeout: GET https://example.com/slow"
    );
    assert_eq!(transport.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn retry_predicate_decides_for_timeouts() {
    let transport = MockTransport::always(Reply::Hang);

    let err = sky_with(&transport)
        .get("https://example.com/slow")
        .timeout(Duration::from_millis(100))
        .retry(
            RetryPolicy::default()
                .retries(5)
                .min_timeout(Duration::from_millis(10))
                .should_retry(|error| !error.is_timeout()),
        )
        .send()
        .await
        .expect_err("slow call must time out");

    assert!(err.is_timeout());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn unknown_scheme_is_fatal() {
    let transport = MockTransport::always(Reply::Network(NetworkErrorKind::UnknownScheme));

    let err = sky_with(&transport)
        .get("invalid:")
        .send()
        .await
        .expect_err("unknown scheme must fail");

    assert!(err.is_network());
    assert_eq!(
        err.to_string(),
        "Request failed due to URL or network connection: GET invalid:"
    );
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn connection_failures_are_retried() {
    let transport = MockTransport::new(
        vec![
            Reply::Network(NetworkErrorKind::Connect),
            Reply::Network(NetworkErrorKind::Dns),
        ],
        Reply::Status(200, "back"),
    );

    let text = sky_with(&transport)
        .get("https://example.com/")
        .text()
        .await
        .expect("third attempt must succeed");

    assert_eq!(text, "back");
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn unrecognized_failures_pass_through_after_retries() {
    let transport = MockTransport::always(Reply::Unrecognized);

    let err = sky_with(&transport)
        .get("https://example.com/")
        .retry(RetryPolicy::default().retries(1).min_timeout(Duration::from_millis(1)))
        .send()
        .await
        .expect_err("call must fail");

    assert!(matches!(err, Error::Transport(_)));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn json_body_is_serialized_with_content_type() {
    let transport = MockTransport::always(Reply::Status(200, "{}"));

    sky_with(&transport)
        .post("https://example.com/items")
        .json_body(&json!({"a": 1}))
        .send()
        .await
        .expect("call must succeed");

    let request = transport.last_request();
    assert_eq!(request.body().map(|body| body.as_ref()), Some(&br#"{"a":1}"#[..]));
    assert_eq!(request.headers()[CONTENT_TYPE], "application/json");
}

#[tokio::test]
async fn json_response_type_sets_accept_and_decodes() {
    let transport = MockTransport::always(Reply::Status(200, r#"{"id":1}"#));

    let value: JsonValue = sky_with(&transport)
        .get("https://example.com/items/1")
        .json()
        .await
        .expect("call must succeed");

    assert_eq!(value, json!({"id": 1}));
    assert_eq!(transport.last_request().headers()[ACCEPT], "application/json");
}

#[tokio::test]
async fn http_failure_with_response_type_buffers_the_body() {
    let transport = MockTransport::always(Reply::Status(499, r#"{"reason":"closed"}"#));

    let err = sky_with(&transport)
        .get("https://example.com/items")
        .json::<JsonValue>()
        .await
        .expect_err("499 must fail");

    let http = match err {
        Error::Http(http) => http,
        other => panic!("expected http error, got {other:?}"),
    };
    let body = http.body().expect("body must be buffered");
    assert_eq!(body.bytes.as_ref(), br#"{"reason":"closed"}"#);
    assert_eq!(body.text, r#"{"reason":"closed"}"#);
    assert_eq!(body.json, Some(json!({"reason": "closed"})));
    assert!(http.response().body_used());
}

#[tokio::test]
async fn http_failure_without_response_type_leaves_body_readable() {
    let transport = MockTransport::always(Reply::Status(404, "gone"));

    let err = sky_with(&transport)
        .get("https://example.com/items")
        .send()
        .await
        .expect_err("404 must fail");

    let mut http = match err {
        Error::Http(http) => http,
        other => panic!("expected http error, got {other:?}"),
    };
    assert!(http.body().is_none());
    assert_eq!(
        http.response_mut().text().await.expect("body must be readable"),
        "gone"
    );
}

#[tokio::test]
async fn disabled_http_errors_return_the_response() {
    let transport = MockTransport::always(Reply::Status(503, "busy"));

    let mut response = sky_with(&transport)
        .get("https://example.com/")
        .throw_http_errors(false)
        .send()
        .await
        .expect("503 must come back as a response");

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.text().await.expect("body must read"), "busy");
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn short_circuit_hook_skips_transport_and_later_hooks() {
    let transport = MockTransport::always(Reply::Status(500, "unreachable"));
    let later = Arc::new(AtomicUsize::new(0));
    let later_hits = later.clone();

    let text = sky_with(&transport)
        .get("https://example.com/cached")
        .before_request(before_request_fn(|_target| async {
            Ok::<_, Error>(HookAction::Respond(Response::new(StatusCode::OK, "cached")))
        }))
        .before_request(before_request_fn(move |_target| {
            let later_hits = later_hits.clone();
            async move {
                later_hits.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(HookAction::Continue)
            }
        }))
        .text()
        .await
        .expect("hook response must be used");

    assert_eq!(text, "cached");
    assert_eq!(transport.calls(), 0);
    assert_eq!(later.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn hooks_run_in_order_and_can_replace_the_target() {
    let transport = MockTransport::always(Reply::Status(200, "ok"));
    let order = Arc::new(Mutex::new(Vec::new()));
    let first = order.clone();
    let second = order.clone();

    sky_with(&transport)
        .get("https://example.com/original")
        .before_request(before_request_fn(move |_target| {
            let first = first.clone();
            async move {
                first.lock().expect("order mutex").push(1);
                Ok::<_, Error>(HookAction::Replace(Target::from("https://example.com/moved")))
            }
        }))
        .before_request(before_request_fn(move |target: Target| {
            let second = second.clone();
            async move {
                assert_eq!(target.url(), "https://example.com/moved");
                second.lock().expect("order mutex").push(2);
                Ok::<_, Error>(HookAction::Continue)
            }
        }))
        .send()
        .await
        .expect("call must succeed");

    assert_eq!(*order.lock().expect("order mutex"), vec![1, 2]);
    assert_eq!(transport.last_request().url(), "https://example.com/moved");
}

#[tokio::test]
async fn after_response_hooks_can_replace_the_response() {
    let transport = MockTransport::always(Reply::Status(200, "original"));

    let response = sky_with(&transport)
        .get("https://example.com/")
        .after_response(after_response_fn(|response: Response| async move {
            assert_eq!(response.status(), StatusCode::OK);
            Ok::<_, Error>(Response::new(StatusCode::CREATED, "replaced"))
        }))
        .send()
        .await
        .expect("call must succeed");

    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn hook_errors_fail_the_call() {
    let transport = MockTransport::always(Reply::Status(200, "ok"));

    let err = sky_with(&transport)
        .get("https://example.com/")
        .before_request(before_request_fn(|_target| async {
            Err::<HookAction, _>(Error::Hook("denied".into()))
        }))
        .send()
        .await
        .expect_err("hook must fail the call");

    assert!(matches!(err, Error::Hook(_)));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn output_follows_the_requested_response_type() {
    let transport = MockTransport::always(Reply::Status(200, "plain"));
    let sky = sky_with(&transport);

    let output = sky
        .text("https://example.com/")
        .get()
        .output()
        .await
        .expect("call must succeed");
    assert!(matches!(output, Output::Text(ref text) if text == "plain"));

    let output = sky
        .fetch(
            "https://example.com/",
            Options {
                response_type: Some(ResponseType::Bytes),
                ..Options::default()
            },
        )
        .await
        .expect("call must succeed");
    assert_eq!(output.into_bytes().as_deref(), Some(&b"plain"[..]));
}

#[tokio::test]
async fn merged_signals_are_released_after_each_call() {
    let transport = MockTransport::always(Reply::Status(200, "ok"));
    let sky = sky_with(&transport);
    let shutdown = AbortController::new();

    for _ in 0..50 {
        sky.get("https://example.com/")
            .signal(shutdown.signal())
            .send()
            .await
            .expect("call must succeed");
    }

    assert_eq!(shutdown.signal().listener_count(), 0);
}

#[tokio::test]
async fn disabled_timeout_passes_the_caller_signal_through() {
    let transport = MockTransport::always(Reply::Hang);
    let controller = AbortController::new();
    let signal = controller.signal();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.abort_with(AbortReason::Message("done waiting".to_owned()));
    });

    let err = sky_with(&transport)
        .get("https://example.com/forever")
        .timeout(Timeout::Disabled)
        .signal(signal)
        .send()
        .await
        .expect_err("caller abort must end the call");

    assert!(err.is_abort());
    assert!(err.to_string().contains("due to done waiting"));
}

#[tokio::test(start_paused = true)]
async fn ceiling_bounds_total_retry_time() {
    let transport = MockTransport::always(Reply::Status(503, "busy"));
    let started = tokio::time::Instant::now();

    let err = sky_with(&transport)
        .get("https://example.com/")
        .retry(
            RetryPolicy::default()
                .retries(10)
                .min_timeout(Duration::from_secs(1))
                .factor(1.0)
                .max_retry_time(Duration::from_millis(2_500)),
        )
        .send()
        .await
        .expect_err("503 must fail");

    assert!(err.is_http());
    assert_eq!(transport.calls(), 3);
    assert!(started.elapsed() <= Duration::from_millis(2_500));
}

#[tokio::test(start_paused = true)]
async fn stalled_error_body_is_bounded_by_the_timeout() {
    let transport = MockTransport::always(Reply::StalledBody(503));

    let call = sky_with(&transport)
        .get("https://example.com/stalled")
        .timeout(Duration::from_millis(100))
        .retry(RetryPolicy::disabled())
        .json::<JsonValue>();
    let err = tokio::time::timeout(Duration::from_secs(3), call)
        .await
        .expect("call must settle within its timeout")
        .expect_err("stalled body must fail");

    assert!(err.is_timeout());
    assert_eq!(
        err.to_string(),
        "Request aborted due to timeout: GET https://example.com/stalled"
    );
}

#[tokio::test(start_paused = true)]
async fn stalled_error_body_timeouts_are_retried() {
    let transport = MockTransport::new(
        vec![Reply::StalledBody(503)],
        Reply::Streamed(200, r#"{"ok":true}"#),
    );

    let value: JsonValue = sky_with(&transport)
        .get("https://example.com/stalled")
        .timeout(Duration::from_millis(100))
        .json()
        .await
        .expect("second attempt must succeed");

    assert_eq!(value, json!({"ok": true}));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn caller_abort_interrupts_a_stalled_error_body() {
    let transport = MockTransport::always(Reply::StalledBody(503));
    let controller = AbortController::new();
    let signal = controller.signal();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.abort();
    });

    let call = sky_with(&transport)
        .get("https://example.com/stalled")
        .response_type(ResponseType::Json)
        .signal(signal)
        .output();
    let err = tokio::time::timeout(Duration::from_secs(3), call)
        .await
        .expect("call must settle after the abort")
        .expect_err("aborted call must fail");

    assert!(err.is_abort());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_success_body_is_bounded_by_the_timeout() {
    let transport = MockTransport::always(Reply::StalledBody(200));

    let call = sky_with(&transport)
        .get("https://example.com/stalled")
        .timeout(Duration::from_millis(100))
        .text();
    let err = tokio::time::timeout(Duration::from_secs(3), call)
        .await
        .expect("read must settle within the timeout")
        .expect_err("stalled body must fail");

    assert!(err.is_timeout());
}

#[tokio::test]
async fn streamed_bodies_release_signals_once_read_or_dropped() {
    let transport = MockTransport::always(Reply::Streamed(200, "chunk"));
    let sky = sky_with(&transport);
    let shutdown = AbortController::new();

    let text = sky
        .get("https://example.com/")
        .signal(shutdown.signal())
        .text()
        .await
        .expect("call must succeed");
    assert_eq!(text, "chunk");
    assert_eq!(shutdown.signal().listener_count(), 0);

    let response = sky
        .get("https://example.com/")
        .signal(shutdown.signal())
        .send()
        .await
        .expect("call must succeed");
    assert_eq!(shutdown.signal().listener_count(), 1);
    drop(response);
    assert_eq!(shutdown.signal().listener_count(), 0);
}

#[tokio::test]
async fn send_ignores_an_instance_response_type() {
    let transport = MockTransport::always(Reply::Status(404, "missing"));
    let sky = Sky::create(Options {
        transport: Some(transport.clone()),
        response_type: Some(ResponseType::Json),
        ..Options::default()
    });

    let err = sky
        .get("https://example.com/missing")
        .send()
        .await
        .expect_err("404 must fail");

    let mut http = match err {
        Error::Http(http) => http,
        other => panic!("expected http error, got {other:?}"),
    };
    assert!(http.body().is_none());
    assert!(transport.last_request().headers().get(ACCEPT).is_none());
    assert_eq!(
        http.response_mut().text().await.expect("body must be readable"),
        "missing"
    );
}
