use crate::{
    api::{self, AppState},
    auth::Authenticator,
    cli::{
        commands::{identity, rate_limit, session, upstream},
        telemetry,
    },
    clock::{Clock, SystemClock},
    identity::{AuthProvider, HttpAuthProvider, PgProfileStore, ProfileStore},
    proxy::{
        Environment, MetadataTokenSource, NoTokenSource, ProxyConfig, ProxyGateway,
        StaticTokenSource, TokenSource, TokenSourceKind, METADATA_IDENTITY_URL,
    },
    ratelimit::{RateLimitConfig, RateLimiter},
    session::{CookieConfig, SessionConfig, SessionStore},
};
use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const METADATA_TIMEOUT_SECONDS: u64 = 5;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub identity: identity::Options,
    pub upstream: upstream::Options,
    pub session: session::Options,
    pub rate_limit: rate_limit::Options,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the configuration is invalid or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let sessions = Arc::new(SessionStore::new(session_config(&args.session), clock.clone()));
    let cookies = cookie_config(&args.session);
    if !cookies.secure() {
        warn!("Session cookie is not marked Secure; use only for local development");
    }

    // The pool connects on first use so /health can report an unreachable store.
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .acquire_timeout(Duration::from_secs(5))
        .test_before_acquire(true)
        .connect_lazy(&args.identity.dsn)
        .context("Invalid database connection string")?;
    let profiles: Arc<dyn ProfileStore> = Arc::new(PgProfileStore::new(pool));

    let auth_timeout = Duration::from_secs(args.identity.timeout_seconds);
    let provider: Arc<dyn AuthProvider> = Arc::new(HttpAuthProvider::new(
        args.identity.provider_url.clone(),
        auth_timeout,
    )?);

    let authenticator = Arc::new(
        Authenticator::new(sessions, provider, profiles, cookies).with_timeout(auth_timeout),
    );

    let limiter = Arc::new(RateLimiter::new(rate_limit_config(&args.rate_limit), clock));

    let environment = args.upstream.environment;
    let token_kind = args.upstream.token_source;
    let tokens = token_source(&args.upstream)?;
    if environment == Environment::Production && token_kind == TokenSourceKind::None {
        warn!("Running in production without an upstream service credential");
    }

    let proxy_config = ProxyConfig::new(args.upstream.upstream_url.clone())?
        .with_api_root(args.upstream.api_root.clone())
        .with_prefix(args.upstream.prefix.clone())
        .with_passthrough_pattern(&args.upstream.passthrough_pattern)?
        .with_timeout(Duration::from_secs(args.upstream.timeout_seconds))
        .with_slow_request(Duration::from_millis(args.upstream.slow_request_ms))
        .with_environment(environment);
    let gateway = Arc::new(ProxyGateway::new(
        proxy_config,
        authenticator.clone(),
        tokens,
    )?);

    info!(
        upstream = %args.upstream.upstream_url,
        prefix = %gateway.rewriter().prefix(),
        environment = ?environment,
        token_source = %token_kind,
        "proxy configured"
    );

    let cors = api::cors_layer(&args.cors_origins)?;
    let state = Arc::new(AppState::new(authenticator, limiter));

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let result = api::new(args.port, state, gateway, cors, shutdown).await;

    telemetry::shutdown_tracer();

    result
}

fn session_config(options: &session::Options) -> SessionConfig {
    SessionConfig::new()
        .with_default_ttl_seconds(options.ttl_seconds)
        .with_max_sessions_per_user(options.max_per_user)
        .with_reap_interval_seconds(options.reap_interval_seconds)
}

fn cookie_config(options: &session::Options) -> CookieConfig {
    CookieConfig::new()
        .with_name(options.cookie_name.clone())
        .with_domain(options.cookie_domain.clone())
        .with_secure(options.cookie_secure)
        .with_same_site(options.cookie_same_site)
}

fn rate_limit_config(options: &rate_limit::Options) -> RateLimitConfig {
    RateLimitConfig::new()
        .with_capacity(options.capacity)
        .with_refill_per_second(options.refill_per_second)
        .with_idle_seconds(options.idle_seconds)
        .with_sweep_interval_seconds(options.sweep_seconds)
        .with_trust_forwarded_for(options.trust_forwarded_for)
}

fn token_source(options: &upstream::Options) -> Result<Arc<dyn TokenSource>> {
    Ok(match options.token_source {
        TokenSourceKind::None => Arc::new(NoTokenSource),
        TokenSourceKind::Static => {
            use secrecy::{ExposeSecret, SecretString};

            let token = options
                .service_token
                .as_ref()
                .context("missing required argument: --service-token")?;
            Arc::new(StaticTokenSource::new(SecretString::from(
                token.expose_secret().to_string(),
            )))
        }
        TokenSourceKind::Metadata => Arc::new(MetadataTokenSource::new(
            METADATA_IDENTITY_URL,
            Duration::from_secs(METADATA_TIMEOUT_SECONDS),
        )?),
    })
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("Failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}
