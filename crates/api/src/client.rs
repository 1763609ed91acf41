//! Resolves who is calling before any policy is applied.
//!
//! Two concerns live here, mirroring what sits in front of the limiter in a
//! real deployment: the client address (taken from a forwarded-for header
//! when the service runs behind a trusted proxy, otherwise the socket peer)
//! and a stand-in authentication scheme.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::Response;
use ratelab_common::ForwardedHeadersConfig;
use ratelab_rate_limit::{ClientContext, Identity};

use crate::state::SharedState;

/// User every authenticated request is attributed to.
pub const DEMO_USER: &str = "demo-user";

/// Middleware inserting the resolved [`ClientContext`] into the request
/// extensions.
pub async fn resolve_client(State(state): State<SharedState>, mut request: Request, next: Next) -> Response {
    let context = client_context(&state.config.forwarded_headers, &request);
    request.extensions_mut().insert(context);
    next.run(request).await
}

pub fn client_context(forwarded: &ForwardedHeadersConfig, request: &Request) -> ClientContext {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    // Untrusted forwarded headers never reach the limiter.
    let forwarded_for = if forwarded.enabled {
        forwarded_client(request.headers(), &forwarded.header)
    } else {
        None
    };
    let client_addr = forwarded_for.clone().or(peer);

    ClientContext {
        client_addr,
        forwarded_for,
        identity: authenticate(request.headers()),
        headers: request.headers().clone(),
    }
}

/// First address of a forwarded-for chain, with any port stripped.
fn forwarded_client(headers: &HeaderMap, name: &str) -> Option<String> {
    let first = headers
        .get(name)?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim();

    if first.is_empty() {
        return None;
    }

    if let Ok(addr) = first.parse::<SocketAddr>() {
        return Some(addr.ip().to_string());
    }
    Some(first.trim_start_matches('[').trim_end_matches(']').to_string())
}

/// Any request carrying an `Authorization` header is treated as the demo
/// user; everything else is anonymous.
fn authenticate(headers: &HeaderMap) -> Identity {
    if headers.contains_key(header::AUTHORIZATION) {
        Identity::authenticated(DEMO_USER)
    } else {
        Identity::anonymous()
    }
}
