//! Per-route policy enforcement and the 429 response.

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use ratelab_rate_limit::{Admission, ClientContext, Rejection, RejectionBody};
use serde_json::json;

use crate::client::client_context;
use crate::state::SharedState;

/// State of a route's guard: the shared app state and the one policy the
/// route is protected by.
#[derive(Clone)]
pub struct PolicyGuard {
    pub state: SharedState,
    pub policy: &'static str,
}

/// Middleware admitting, queueing or rejecting the request under the
/// guard's policy.
pub async fn enforce_policy(State(guard): State<PolicyGuard>, request: Request, next: Next) -> Response {
    let state = &guard.state;
    let policy = guard.policy;

    let context = match request.extensions().get::<ClientContext>() {
        Some(context) => context.clone(),
        None => client_context(&state.config.forwarded_headers, &request),
    };

    let queue_timeout = state.engine.settings().queue_timeout;
    match state.engine.admit(policy, &context, queue_timeout).await {
        Ok(Admission::Admitted { waited: None }) => {
            state.metrics.record(policy, "admitted");
            next.run(request).await
        }
        Ok(Admission::Admitted {
            waited: Some(waited),
        }) => {
            state.metrics.record(policy, "queued");
            state
                .metrics
                .queue_wait
                .with_label_values(&[policy])
                .observe(waited.as_secs_f64());
            next.run(request).await
        }
        Ok(Admission::Rejected(rejection)) => {
            state.metrics.record(policy, "rejected");
            rejection_response(&rejection)
        }
        Err(e) => {
            // A route wired to a policy that does not exist is a programming
            // error; never let it through.
            tracing::error!(policy, error = %e, "rate limit policy misconfigured");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "statusCode": 500,
                    "message": "rate limiting misconfigured"
                })),
            )
                .into_response()
        }
    }
}

/// Translate a rejection into a `429 Too Many Requests` response.
///
/// The `Retry-After` header is only sent when the engine knows when the
/// window resets; the body always carries a value.
pub fn rejection_response(rejection: &Rejection) -> Response {
    let body = RejectionBody::new(rejection, Utc::now());
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();

    if let Some(secs) = rejection.retry_after_secs() {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}
