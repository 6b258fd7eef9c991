use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{net::SocketAddr, sync::Arc};
use tracing::debug;

use super::{RateLimitDecision, RateLimiter};
use crate::error::GatewayError;

/// Global middleware: reject over-limit clients before routing or auth.
pub async fn enforce(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_ip(
        peer,
        request.headers(),
        limiter.config().trust_forwarded_for(),
    );

    match limiter.check(&client).await {
        RateLimitDecision::Allowed => next.run(request).await,
        RateLimitDecision::Limited {
            retry_after_seconds,
        } => {
            debug!(client = %client, path = %request.uri().path(), "rate limit exceeded");
            GatewayError::RateLimited {
                retry_after_seconds,
            }
            .into_response()
        }
    }
}

/// Client key for rate limiting.
///
/// Forwarding headers are honored only when `trust_forwarded` is set; the
/// first `X-Forwarded-For` hop wins, then `X-Real-IP`, then the peer address.
#[must_use]
pub fn client_ip(peer: Option<SocketAddr>, headers: &HeaderMap, trust_forwarded: bool) -> String {
    if trust_forwarded {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }

        let real_ip = headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = real_ip {
            return ip.to_string();
        }
    }

    peer.map_or_else(|| "unknown".to_string(), |addr| addr.ip().to_string())
}
