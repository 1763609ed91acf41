use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::Utc;
use ratelab_rate_limit::ClientContext;
use serde_json::json;

/// GET /api/profile/public
///
/// Shares the `normal` policy with `/api/profile/me`; anonymous callers get
/// the smaller budget.
pub async fn public_profile() -> impl IntoResponse {
    Json(json!({
        "authenticated": false,
        "user": "anonymous",
        "timestamp": Utc::now()
    }))
}

/// GET /api/profile/me
///
/// The rate limit is applied before this check, so unauthenticated callers
/// still spend from their budget.
pub async fn my_profile(Extension(context): Extension<ClientContext>) -> impl IntoResponse {
    if !context.identity.authenticated {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "statusCode": 401,
                "message": "authentication required"
            })),
        );
    }

    let user = context
        .identity
        .name
        .or(context.identity.subject)
        .unwrap_or_else(|| "unknown".to_string());

    (
        StatusCode::OK,
        Json(json!({
            "authenticated": true,
            "user": user,
            "timestamp": Utc::now()
        })),
    )
}
