use axum::extract::State;
use axum::Json;
use serde_json::{json, Map, Value};

use crate::state::SharedState;

/// GET /api/stats
///
/// Returns admission totals, live partitions per policy and uptime.
pub async fn get_stats(State(state): State<SharedState>) -> Json<Value> {
    let uptime_secs = state.start_time.elapsed().as_secs();
    let admitted = state.metrics.total("admitted");
    let queued = state.metrics.total("queued");
    let rejected = state.metrics.total("rejected");
    let total_requests = admitted + queued + rejected;

    let requests_per_second = if uptime_secs > 0 {
        total_requests as f64 / uptime_secs as f64
    } else {
        0.0
    };

    let partitions: Map<String, Value> = state
        .engine
        .policies()
        .map(|policy| {
            let live = state.engine.partition_count(&policy.name).unwrap_or_default();
            (policy.name.clone(), json!(live))
        })
        .collect();

    Json(json!({
        "total_requests": total_requests,
        "admitted_requests": admitted,
        "queued_requests": queued,
        "rejected_requests": rejected,
        "partitions": partitions,
        "uptime_secs": uptime_secs,
        "requests_per_second": requests_per_second
    }))
}
