//! HTTP surface of the gateway: local routes, the proxy fallback and the
//! global middleware stack.

use crate::{
    auth::{self, Authenticator, Guard},
    error::GatewayError,
    identity::{AccountStatus, Role},
    proxy::{self, ProxyGateway},
    ratelimit::{self, RateLimiter},
};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    handler::Handler,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderName, HeaderValue, Method, Request,
    },
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Extension, Router,
};
use std::{any::Any, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{error, info, info_span, Span};
use ulid::Ulid;
use url::Url;
use utoipa_swagger_ui::SwaggerUi;

pub(crate) mod handlers;
mod openapi;

pub use openapi::openapi;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared state reachable from every local handler.
#[derive(Clone, Debug)]
pub struct AppState {
    pub authenticator: Arc<Authenticator>,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    #[must_use]
    pub fn new(authenticator: Arc<Authenticator>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            authenticator,
            limiter,
        }
    }
}

/// Build the full application router.
///
/// Local routes are matched first; anything else falls through to the proxy,
/// which answers `404 not_found` for paths outside its prefix.
pub fn router(state: Arc<AppState>, gateway: Arc<ProxyGateway>, cors: CorsLayer) -> Router {
    let authn = state.authenticator.clone();
    let bearer = from_fn_with_state(Guard::bearer(authn.clone()), auth::enforce);
    let session = from_fn_with_state(Guard::session(authn.clone()), auth::enforce);
    let either = from_fn_with_state(Guard::either(authn.clone()), auth::enforce);
    let optional = from_fn_with_state(Guard::optional(authn.clone()), auth::enforce);
    let active = from_fn_with_state(
        Guard::either(authn.clone()).with_statuses(&[AccountStatus::Active]),
        auth::enforce,
    );
    let admin_only = from_fn_with_state(
        Guard::either(authn)
            .with_statuses(&[AccountStatus::Active])
            .with_roles(&[Role::Admin]),
        auth::enforce,
    );

    let sessions = Router::new()
        .route(
            "/v1/sessions",
            post(handlers::sessions::create.layer(bearer))
                .get(handlers::sessions::list.layer(either.clone()))
                .delete(handlers::sessions::revoke_all.layer(either.clone())),
        )
        .route(
            "/v1/sessions/extend",
            post(handlers::sessions::extend.layer(session.clone())),
        )
        .route(
            "/v1/sessions/current",
            delete(handlers::sessions::revoke_current.layer(session)),
        )
        .route(
            "/v1/sessions/:id",
            delete(handlers::sessions::revoke.layer(either)),
        );

    let me = Router::new()
        .route("/v1/me", get(handlers::me::me.layer(optional)))
        .route(
            "/v1/me/password",
            post(handlers::me::change_password.layer(active)),
        );

    let admin = Router::new()
        .route("/users", get(handlers::admin::list_users))
        .route("/users/:id", delete(handlers::admin::delete_user))
        .route("/users/:id/approve", post(handlers::admin::approve_user))
        .route("/users/:id/suspend", post(handlers::admin::suspend_user))
        .route(
            "/users/:id/sessions",
            get(handlers::admin::user_sessions).delete(handlers::admin::revoke_user_sessions),
        )
        .route("/stats", get(handlers::admin::stats))
        .layer(admin_only);

    let fallback = Router::new().fallback(proxy::handle).with_state(gateway);

    Router::new()
        .route(
            "/health",
            get(handlers::health::health)
                .head(handlers::health::health)
                .options(handlers::health::health),
        )
        .merge(SwaggerUi::new("/docs").url("/openapi.json", openapi()))
        .merge(sessions)
        .merge(me)
        .nest("/v1/admin", admin)
        .merge(fallback)
        .layer(
            ServiceBuilder::new()
                .layer(CatchPanicLayer::custom(panic_response))
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static(REQUEST_ID_HEADER),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    REQUEST_ID_HEADER,
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(from_fn_with_state(
                    state.limiter.clone(),
                    ratelimit::enforce,
                ))
                .layer(Extension(state)),
        )
}

/// CORS policy for browser clients; an empty origin list disables CORS.
///
/// # Errors
/// Returns an error if an origin is not a valid absolute URL.
pub fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    let origins = origins
        .iter()
        .map(|origin| cors_origin(origin))
        .collect::<Result<Vec<_>>>()?;
    if origins.is_empty() {
        return Ok(CorsLayer::new());
    }

    Ok(CorsLayer::new()
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true))
}

/// Start the server and block until `shutdown` fires.
///
/// The session reaper and the rate-limit sweeper run for the lifetime of the
/// server and are stopped with it.
///
/// # Errors
/// Return error if the listener cannot be bound or the server fails.
pub async fn new(
    port: u16,
    state: Arc<AppState>,
    gateway: Arc<ProxyGateway>,
    cors: CorsLayer,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(format!("::0:{port}"))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;

    let reaper = state
        .authenticator
        .sessions()
        .spawn_reaper(shutdown.child_token());
    let sweeper = state.limiter.spawn_sweeper(shutdown.child_token());

    let app = router(state, gateway, cors);

    info!("Listening on [::]:{}", port);

    let signal = shutdown.clone();
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        signal.cancelled().await;
        info!("Gracefully shutdown");
    })
    .await;

    shutdown.cancel();
    let _ = tokio::join!(reaper, sweeper);

    served.context("Server error")
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("handler panicked: {detail}");
    GatewayError::Internal("handler panicked".to_string()).into_response()
}

fn cors_origin(origin: &str) -> Result<HeaderValue> {
    let parsed = Url::parse(origin).with_context(|| format!("Invalid CORS origin: {origin}"))?;
    let host = parsed
        .host_str()
        .with_context(|| format!("CORS origin must include a host: {origin}"))?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    HeaderValue::from_str(&format!("{}://{}{}", parsed.scheme(), host, port))
        .context("Failed to build CORS origin header")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_origin_drops_path() {
        let origin = cors_origin("https://app.example.com:8443/login?next=/");
        assert_eq!(
            origin.ok(),
            Some(HeaderValue::from_static("https://app.example.com:8443"))
        );
        assert!(cors_origin("not a url").is_err());
    }

    #[test]
    fn empty_origin_list_is_accepted() {
        assert!(cors_layer(&[]).is_ok());
        assert!(cors_layer(&["https://app.example.com".to_string()]).is_ok());
        assert!(cors_layer(&["::".to_string()]).is_err());
    }

    #[test]
    fn panic_payloads_become_internal_errors() {
        let response = panic_response(Box::new("boom"));
        assert_eq!(
            response.status(),
            axum::http::StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
