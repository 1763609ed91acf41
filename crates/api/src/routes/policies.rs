use axum::extract::State;
use axum::Json;
use ratelab_rate_limit::{Limits, PolicyConfig, PolicyLimits};
use serde_json::{json, Value};

use crate::state::SharedState;

/// GET /api/policies
///
/// Lists the registered policies with their effective limits.
pub async fn list_policies(State(state): State<SharedState>) -> Json<Value> {
    let policies: Vec<Value> = state.engine.policies().map(describe).collect();
    Json(json!({ "policies": policies }))
}

fn describe(policy: &PolicyConfig) -> Value {
    let limits = |l: Limits| json!({ "permit_limit": l.permit_limit, "queue_limit": l.queue_limit });
    let (authenticated, anonymous) = match policy.limits {
        PolicyLimits::Fixed(fixed) => (limits(fixed), limits(fixed)),
        PolicyLimits::ByAuthentication {
            authenticated,
            anonymous,
        } => (limits(authenticated), limits(anonymous)),
    };

    json!({
        "name": policy.name,
        "window_ms": policy.window.as_millis() as u64,
        "queue_order": policy.queue_order,
        "partition": policy.partition,
        "authenticated": authenticated,
        "anonymous": anonymous
    })
}
