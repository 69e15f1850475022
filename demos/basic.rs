use std::time::Duration;

use serde_json::{json, Value};
use sky_fetch::{before_request_fn, AbortController, Error, HookAction, Options, RetryPolicy, Sky};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let base_url =
        std::env::var("SKY_BASE_URL").unwrap_or_else(|_| "https://httpbin.org/".to_owned());

    let api = Sky::from_env()
        .map_err(anyhow::Error::msg)?
        .extend(Options {
            base_url: Some(base_url),
            retry: Some(RetryPolicy::default().retries(2).max_retry_time(Duration::from_secs(10))),
            ..Options::default()
        });

    let echoed: Value = api.get("get").json().await?;
    println!("{echoed:#}");

    let posted: Value = api
        .post("post")
        .json_body(&json!({"name": "Kit"}))
        .before_request(before_request_fn(|target| async move {
            println!("sending {}", target.url());
            Ok::<_, Error>(HookAction::Continue)
        }))
        .json()
        .await?;
    println!("{}", posted["json"]);

    let shutdown = AbortController::new();
    let pending = tokio::spawn({
        let api = api.clone();
        let signal = shutdown.signal();
        async move { api.get("delay/5").signal(signal).send().await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.abort();

    match pending.await? {
        Ok(response) => println!("finished early with {}", response.status()),
        Err(err) if err.is_abort() => println!("{err}"),
        Err(err) => return Err(err.into()),
    }

    Ok(())
}
