// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::borrow::Cow;
use std::sync::Arc;

use axum::{
    BoxError, Extension, Json, Router,
    body::Bytes,
    error_handling::HandleErrorLayer,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use http::{HeaderMap, Method, header};
use prometheus::Registry;
use tower::{ServiceBuilder, limit::GlobalConcurrencyLimitLayer};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::errors::BatchError;
use crate::metrics_layer::{BatchOutcome, RequestMetricsLayer};
use crate::processor::BatchProcessor;
use crate::recorder::{BatchRecorder, MetricsReport};
use crate::requests::ProcessBatchRequest;
use crate::responses::{ErrorResponse, HealthResponse, ProcessBatchResponse};

pub struct AppState {
    pub processor: BatchProcessor,
    pub recorder: BatchRecorder,
}

impl AppState {
    pub fn new(processor: BatchProcessor) -> Self {
        Self {
            processor,
            recorder: BatchRecorder::new(),
        }
    }
}

/// The batch API. Requests beyond `max_concurrent_requests` in flight are shed with 503.
pub fn router(
    state: Arc<AppState>,
    registry: &Registry,
    max_concurrent_requests: usize,
) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(vec![Method::GET, Method::POST])
        .allow_headers(Any)
        .allow_origin(Any);

    Router::new()
        .route("/process-batch", post(process_batch))
        .route("/metrics", get(batch_metrics))
        .route("/health", get(health))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_error))
                .layer(RequestMetricsLayer::new(registry))
                .layer(cors)
                .load_shed()
                .layer(GlobalConcurrencyLimitLayer::new(max_concurrent_requests))
                .layer(Extension(state))
                .into_inner(),
        )
}

async fn process_batch(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(Extension<BatchOutcome>, Json<ProcessBatchResponse>), BatchError> {
    let payload = parse_batch_request(&headers, &body)?;
    let request_id = payload.request_id_or_else(|| state.recorder.next_request_id());
    let count = payload.requests_count();
    info!(%request_id, count, "Got new batch request");

    // Run the batch in its own task so a client disconnect doesn't abandon units mid-flight.
    let response = tokio::spawn(async move {
        state.recorder.start_batch(&request_id);
        match state.processor.process_batch(&request_id, count).await {
            Ok(results) => {
                let time_taken = state.recorder.end_batch(&request_id);
                Ok(ProcessBatchResponse {
                    request_id,
                    time_taken,
                    results,
                })
            }
            Err(e) => {
                state.recorder.discard_batch(&request_id);
                Err(e)
            }
        }
    })
    .await
    .map_err(BatchError::internal)??;

    info!(
        request_id = %response.request_id,
        time_taken = response.time_taken,
        "Batch request served"
    );
    let outcome = BatchOutcome::of(&response.results);
    Ok((Extension(outcome), Json(response)))
}

/// An empty body, or one not sent as JSON, asks for the defaults. A JSON body that doesn't
/// describe a batch is rejected.
fn parse_batch_request(
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<ProcessBatchRequest, BatchError> {
    if body.iter().all(u8::is_ascii_whitespace) || !is_json(headers) {
        return Ok(ProcessBatchRequest::default());
    }
    Json::<ProcessBatchRequest>::from_bytes(body)
        .map(|Json(payload)| payload)
        .map_err(|rejection| BatchError::InvalidRequest(rejection.body_text()))
}

fn is_json(headers: &HeaderMap) -> bool {
    let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    essence.eq_ignore_ascii_case("application/json")
        || (essence.starts_with("application/") && essence.ends_with("+json"))
}

async fn batch_metrics(Extension(state): Extension<Arc<AppState>>) -> Json<MetricsReport> {
    Json(state.recorder.metrics())
}

async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        api_keys: state.processor.pool().status(),
        queue_size: state.processor.queue_size(),
    })
}

impl IntoResponse for BatchError {
    fn into_response(self) -> Response {
        let status = match &self {
            BatchError::InvalidRequest(_) | BatchError::InvalidCount { .. } => {
                StatusCode::BAD_REQUEST
            }
            BatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        warn!("Failed to process request batch: {self}");
        (status, Json(ErrorResponse::from(self))).into_response()
    }
}

async fn handle_error(error: BoxError) -> impl IntoResponse {
    if error.is::<tower::load_shed::error::Overloaded>() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Cow::from("service is overloaded, please try again later"),
        );
    }

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Cow::from(format!("Unhandled internal error: {}", error)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::DEFAULT_REQUESTS_COUNT;
    use http::HeaderValue;
    use http_body_util::BodyExt;
    use serde_json::Value;

    async fn error_body(response: Response) -> (StatusCode, Value) {
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn json_headers(content_type: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        headers
    }

    #[tokio::test]
    async fn internal_errors_are_server_errors() {
        let response = BatchError::internal("task panicked").into_response();

        let (status, body) = error_body(response).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to process request batch");
        assert_eq!(body["message"], "Internal error: task panicked");
    }

    #[tokio::test]
    async fn invalid_requests_are_client_errors() {
        let response = BatchError::InvalidRequest("bad body".into()).into_response();

        let (status, body) = error_body(response).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Invalid request: bad body");
    }

    #[test]
    fn only_json_bodies_are_parsed() {
        let body = Bytes::from_static(b"not json");
        assert!(parse_batch_request(&HeaderMap::new(), &body).is_ok());
        assert!(parse_batch_request(&json_headers("text/plain"), &body).is_ok());
        assert!(matches!(
            parse_batch_request(&json_headers("application/json; charset=utf-8"), &body),
            Err(BatchError::InvalidRequest(_))
        ));
        assert!(matches!(
            parse_batch_request(&json_headers("application/merge-patch+json"), &body),
            Err(BatchError::InvalidRequest(_))
        ));

        let blank = Bytes::from_static(b"  \n");
        let payload = parse_batch_request(&json_headers("application/json"), &blank).unwrap();
        assert_eq!(payload.requests_count(), DEFAULT_REQUESTS_COUNT);
    }
}
