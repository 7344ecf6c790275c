//! Gateway server implementation.
//!
//! Any method on any path is accepted. The request is published as a work
//! item and the caller gets whatever response the broker correlates back, or
//! the synthetic 503 once the correlation timeout passes.

use std::future::IntoFuture;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::Response;
use axum::Router;
use base64::prelude::*;
use gantry_broker::GatewayClient;
use gantry_proto::{RequestId, WorkResponse};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{GatewayConfig, LimitsConfig};
use crate::error::GatewayError;

/// Carries the caller-supplied or generated request id, in both directions.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Run the gateway until `cancel` fires, then tear down the broker client.
pub async fn run(config: GatewayConfig, cancel: CancellationToken) -> Result<(), GatewayError> {
    let broker = gantry_broker::connect(&config.broker).await?;
    let client = Arc::new(
        GatewayClient::connect(
            broker,
            &config.broker,
            config.correlation.timeout,
            config.correlation.item_ttl,
        )
        .await?,
    );
    info!(
        timeout = ?config.correlation.timeout,
        item_ttl = ?config.correlation.item_ttl,
        callback = %client.callback_channel(),
        "Broker client ready"
    );

    let app = router(Arc::clone(&client), &config.limits);

    let listener = TcpListener::bind(config.server.bind_address).await?;
    info!(address = %listener.local_addr()?, "Gateway listening");

    let shutdown = cancel.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .into_future();
    tokio::pin!(server);

    let result = tokio::select! {
        result = &mut server => result,
        () = cancel.cancelled() => {
            match tokio::time::timeout(config.server.shutdown_timeout, &mut server).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        timeout = ?config.server.shutdown_timeout,
                        "Abandoning in-flight requests"
                    );
                    Ok(())
                }
            }
        }
    };

    client.tear_down().await;
    result?;

    info!("Gateway shutdown complete");
    Ok(())
}

/// Builds the catch-all router around a connected client.
pub fn router(client: Arc<GatewayClient>, limits: &LimitsConfig) -> Router {
    Router::new()
        .fallback(forward)
        .layer(DefaultBodyLimit::max(limits.max_body_size))
        .with_state(client)
}

async fn forward(
    State(client): State<Arc<GatewayClient>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let request_id = request_id(&headers);

    let mut item = client
        .new_item(request_id.clone())
        .method(method.as_str())
        .path(uri.path());
    for (name, value) in &headers {
        match value.to_str() {
            Ok(value) => item = item.header(name.as_str(), value),
            Err(_) => debug!(header = %name, "skipping non-text header"),
        }
    }
    for (name, value) in query {
        item = item.query(name, value);
    }

    // The client re-keys an id that is already in flight.
    let response = client.process(item.body(body.to_vec()).build()).await;
    let request_id = response.request_id.clone();
    debug!(
        request_id = %request_id,
        method = %method,
        path = uri.path(),
        status = response.status_code,
        "request completed"
    );

    into_http(&request_id, response)
}

fn request_id(headers: &HeaderMap) -> RequestId {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map_or_else(RequestId::generate, RequestId::from)
}

fn into_http(request_id: &RequestId, response: WorkResponse) -> Result<Response, GatewayError> {
    let status = StatusCode::from_u16(response.status_code).map_err(|_| {
        GatewayError::InvalidResponse(format!("status code {}", response.status_code))
    })?;

    let body = if response.is_base64 {
        BASE64_STANDARD
            .decode(response.body.as_bytes())
            .map_err(|e| GatewayError::InvalidResponse(format!("body is not base64: {e}")))?
    } else {
        response.body.into_bytes()
    };

    let mut http = Response::new(Body::from(body));
    *http.status_mut() = status;

    let headers = http.headers_mut();
    for (name, value) in response.headers {
        match (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(request_id = %request_id, header = %name, "dropping invalid response header"),
        }
    }
    if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
        headers.insert(REQUEST_ID_HEADER, value);
    }

    Ok(http)
}
