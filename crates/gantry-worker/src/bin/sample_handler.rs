//! Sample handler used to exercise the worker runtime end to end.
//!
//! The request body picks the behaviour; anything unrecognised gets a greeting.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use gantry_bridge::{Completion, ExecutionContext, Handler, HandlerError, HandlerRegistry, WorkItem};
use serde_json::json;
use tracing::error;

const GREETING: &str = "Hello From Sample Handler!";

/// Shared by every invocation served by this process.
#[derive(Default)]
struct SampleHandler {
    counter: AtomicU64,
}

#[async_trait]
impl Handler for SampleHandler {
    async fn call(&self, item: &WorkItem, ctx: &ExecutionContext) -> Result<Completion, HandlerError> {
        match item.body_text().trim() {
            "consoleTest" => {
                ctx.log().info(["Hello from Console Test"]);
                Ok(Completion::empty())
            }
            "allConsoleEvents" => {
                ctx.log().info([1, 2, 3]);
                ctx.log().debug([4, 5, 6]);
                ctx.log().warn([7, 8, 9]);
                ctx.log().error([10, 11, 12]);
                Ok(Completion::empty())
            }
            "incrementCounter" => {
                let count = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Completion::raw(count))
            }
            "simpleJsonReturn" => Ok(Completion::from_json(json!({
                "body": "Hello Body",
                "statusCode": 503,
                "headers": { "X-CUSTOM-HEADER": "xcustomvalue" },
                "unauthedValue": "private",
            }))),
            "overrideRequestId" => Ok(Completion::from_json(json!({
                "requestId": "shouldNotChange",
            }))),
            "killSelfSuccess" => std::process::exit(0),
            "killSelfError" => std::process::exit(1),
            "throwException" => Err("Test Exception".into()),
            "neverRespond" => std::future::pending().await,
            "reverseText" => {
                let text = item
                    .query
                    .iter()
                    .find(|(name, _)| name == "text")
                    .map(|(_, value)| value.as_str())
                    .unwrap_or_default();
                Ok(Completion::raw(text.chars().rev().collect::<String>()))
            }
            _ => Ok(Completion::raw(GREETING)),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    gantry_bridge::init_tracing();

    let registry = HandlerRegistry::new().with("handler", SampleHandler::default());
    if let Err(e) = gantry_bridge::run(registry).await {
        error!(error = %e, "worker failed");
        std::process::exit(1);
    }
}
