pub mod client;
pub mod guard;
pub mod routes;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use ratelab_common::policy_names::{GENEROUS, HIGH_THROUGHPUT, MESSAGE, MODERATE, NORMAL, STRICT};
use ratelab_common::{AppConfig, RatelabResult};

use crate::guard::PolicyGuard;
use crate::state::SharedState;

pub use state::{AppState, LimiterMetrics, SharedState as SharedStateType};

/// Build the Axum router with all application and operational routes.
///
/// Every application route is guarded by exactly one policy. A policy name
/// that is not registered fails here, at startup, rather than on the first
/// request.
pub fn build_router(state: SharedState) -> RatelabResult<Router> {
    let limited = |policy: &'static str, routes: Router<SharedState>| -> RatelabResult<Router<SharedState>> {
        state.engine.registry().resolve(policy)?;
        let policy_guard = PolicyGuard {
            state: Arc::clone(&state),
            policy,
        };
        Ok(routes.route_layer(middleware::from_fn_with_state(
            policy_guard,
            guard::enforce_policy,
        )))
    };

    let app = Router::new()
        .merge(limited(
            STRICT,
            Router::new()
                .route("/api/auth/login", post(routes::auth::login))
                .route("/api/auth/reset-password", post(routes::auth::reset_password)),
        )?)
        .merge(limited(
            MODERATE,
            Router::new().route("/api/admin/moderate", post(routes::admin::moderate)),
        )?)
        .merge(limited(
            NORMAL,
            Router::new()
                .route("/api/profile/public", get(routes::profile::public_profile))
                .route("/api/profile/me", get(routes::profile::my_profile)),
        )?)
        .merge(limited(
            GENEROUS,
            Router::new()
                .route("/api/products", get(routes::products::list_products))
                .route("/api/products/{id}", get(routes::products::get_product)),
        )?)
        .merge(limited(
            HIGH_THROUGHPUT,
            Router::new().route("/api/webhooks/payment", post(routes::webhooks::payment)),
        )?)
        .merge(limited(
            MESSAGE,
            Router::new().route("/api/notifications/send", post(routes::notifications::send)),
        )?)
        // Operational routes are not rate limited.
        .route("/api/health", get(routes::health::health_check))
        .route("/api/metrics", get(routes::metrics::get_metrics))
        .route("/api/stats", get(routes::stats::get_stats))
        .route("/api/policies", get(routes::policies::list_policies))
        .route("/api/config", get(routes::config::get_config))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            client::resolve_client,
        ))
        .with_state(state);

    Ok(app)
}

/// Start the HTTP server on the specified address.
///
/// Serves until `shutdown` resolves.
pub async fn run_server(
    state: SharedState,
    listen_addr: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_router(state)?;

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!("ratelab listening on {}", listen_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    Ok(())
}

/// Convenience function to create a SharedState from an AppConfig.
pub fn new_shared_state(config: AppConfig) -> RatelabResult<SharedState> {
    Ok(Arc::new(AppState::new(config)?))
}
