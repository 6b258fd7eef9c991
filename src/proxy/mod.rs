//! Authenticating reverse proxy.
//!
//! Flow Overview:
//! 1) `OPTIONS` is answered locally with `204`; nothing is forwarded.
//! 2) The path below the gateway prefix is rewritten onto the upstream API
//!    root (pass-through segments are kept verbatim).
//! 3) The caller is authenticated (session, then bearer), must be `active`,
//!    and `/admin` paths additionally require the `admin` role.
//! 4) Headers are cleaned, trust headers and the service credential are
//!    attached, and the request is sent upstream.
//! 5) Upstream CORS and hop-by-hop headers are dropped, asset responses get
//!    cache headers, error bodies are previewed in the logs, and transport
//!    failures become `503` JSON errors.
//!
//! Dropping the handler future (client disconnect) drops the in-flight
//! upstream request with it.

mod response;
mod rewrite;
mod token;

pub use rewrite::{
    extract_session_token, PathRewriter, Rewrite, DEFAULT_PASSTHROUGH_PATTERN,
    SESSION_TOKEN_QUERY_PARAM,
};
pub use token::{
    MetadataTokenSource, NoTokenSource, StaticTokenSource, TokenSource, TokenSourceError,
    TokenSourceKind, METADATA_IDENTITY_URL,
};

use anyhow::{Context, Result};
use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE, HOST},
        request::Parts,
        HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
    },
    response::{IntoResponse, Response},
};
use regex::Regex;
use secrecy::ExposeSecret;
use std::{
    error::Error as _,
    fmt,
    net::SocketAddr,
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    auth::{refresh_session_cookie, require_role, require_status, Authenticator},
    error::GatewayError,
    identity::{AccountStatus, Identity, Role},
};

pub const USER_ID_HEADER: &str = "x-portero-user-id";
pub const USER_ROLE_HEADER: &str = "x-portero-user-role";
pub const SESSION_TOKEN_HEADER: &str = "x-portero-session-token";

const DEFAULT_API_ROOT: &str = "/api";
const DEFAULT_PREFIX: &str = "/proxy";
const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_SLOW_REQUEST_MS: u64 = 2000;
const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Why the upstream could not be reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpstreamFailure {
    Timeout,
    ConnectionRefused,
    ConnectionError,
    CredentialUnavailable,
}

impl UpstreamFailure {
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Timeout => "upstream_timeout",
            Self::ConnectionRefused => "connection_refused",
            Self::ConnectionError => "connection_error",
            Self::CredentialUnavailable => "upstream_credential_unavailable",
        }
    }

    /// Classify a transport error from the upstream client.
    #[must_use]
    pub fn classify(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout;
        }
        let mut source = err.source();
        while let Some(cause) = source {
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                match io.kind() {
                    std::io::ErrorKind::ConnectionRefused => return Self::ConnectionRefused,
                    std::io::ErrorKind::TimedOut => return Self::Timeout,
                    _ => {}
                }
            }
            source = cause.source();
        }
        Self::ConnectionError
    }
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!("unknown environment: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    upstream_url: Url,
    api_root: String,
    prefix: String,
    passthrough: Regex,
    timeout: Duration,
    slow_request: Duration,
    environment: Environment,
}

impl ProxyConfig {
    /// # Errors
    /// Returns an error if the built-in pass-through pattern fails to compile.
    pub fn new(upstream_url: Url) -> Result<Self> {
        Ok(Self {
            upstream_url,
            api_root: DEFAULT_API_ROOT.to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            passthrough: Regex::new(DEFAULT_PASSTHROUGH_PATTERN)
                .context("Invalid default pass-through pattern")?,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
            slow_request: Duration::from_millis(DEFAULT_SLOW_REQUEST_MS),
            environment: Environment::Development,
        })
    }

    #[must_use]
    pub fn with_api_root(mut self, api_root: impl Into<String>) -> Self {
        self.api_root = api_root.into();
        self
    }

    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// # Errors
    /// Returns an error if `pattern` is not a valid regular expression.
    pub fn with_passthrough_pattern(mut self, pattern: &str) -> Result<Self> {
        self.passthrough = Regex::new(pattern)
            .with_context(|| format!("Invalid pass-through pattern: {pattern}"))?;
        Ok(self)
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_slow_request(mut self, threshold: Duration) -> Self {
        self.slow_request = threshold;
        self
    }

    #[must_use]
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    #[must_use]
    pub fn upstream_url(&self) -> &Url {
        &self.upstream_url
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn environment(&self) -> Environment {
        self.environment
    }
}

pub struct ProxyGateway {
    config: ProxyConfig,
    rewriter: PathRewriter,
    client: reqwest::Client,
    authenticator: Arc<Authenticator>,
    tokens: Arc<dyn TokenSource>,
}

impl ProxyGateway {
    /// # Errors
    /// Returns an error if the upstream HTTP client cannot be built.
    pub fn new(
        config: ProxyConfig,
        authenticator: Arc<Authenticator>,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(config.timeout)
            .connect_timeout(config.timeout.min(Duration::from_secs(10)))
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .context("Failed to build upstream HTTP client")?;

        let rewriter =
            PathRewriter::new(&config.prefix, &config.api_root, config.passthrough.clone());

        Ok(Self {
            config,
            rewriter,
            client,
            authenticator,
            tokens,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    #[must_use]
    pub fn rewriter(&self) -> &PathRewriter {
        &self.rewriter
    }

    async fn authorize(
        &self,
        headers: &HeaderMap,
        rewrite: &Rewrite,
    ) -> Result<Identity, GatewayError> {
        let identity = self.authenticator.authenticate(headers).await?;
        require_status(&identity, &[AccountStatus::Active])?;
        if rewrite.is_admin() {
            require_role(&identity, &[Role::Admin])?;
        }
        Ok(identity)
    }

    async fn service_token(&self) -> Result<Option<HeaderValue>, GatewayError> {
        let audience = self.config.upstream_url.as_str();
        match self.tokens.token(audience).await {
            Ok(Some(token)) => {
                let value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                    .map_err(|_| {
                        GatewayError::ServiceUnavailable(UpstreamFailure::CredentialUnavailable)
                    })?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(err) if self.config.environment == Environment::Production => {
                error!("Failed to obtain upstream credential: {err}");
                Err(GatewayError::ServiceUnavailable(
                    UpstreamFailure::CredentialUnavailable,
                ))
            }
            Err(err) => {
                warn!("Forwarding without upstream credential: {err}");
                Ok(None)
            }
        }
    }

    fn upstream_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.config.upstream_url.clone();
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base}{path}"));
        url.set_query(query);
        url
    }

    /// Authenticate and forward. The caller is returned whenever
    /// authentication passed, including when forwarding then fails.
    async fn forward(
        &self,
        request: Request,
    ) -> (Option<Identity>, Result<Response, GatewayError>) {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let (parts, body) = request.into_parts();

        let Some(rewrite) = self.rewriter.rewrite(parts.uri.path()) else {
            return (None, Err(GatewayError::NotFound("route")));
        };
        let identity = match self.authorize(&parts.headers, &rewrite).await {
            Ok(identity) => identity,
            Err(err) => return (None, Err(err)),
        };

        let result = self.send(&parts, body, peer, &rewrite, &identity).await;
        (Some(identity), result)
    }

    async fn send(
        &self,
        parts: &Parts,
        body: Body,
        peer: Option<SocketAddr>,
        rewrite: &Rewrite,
        identity: &Identity,
    ) -> Result<Response, GatewayError> {
        let credential = self.service_token().await?;

        let (query, session_token) = extract_session_token(parts.uri.query());
        let url = self.upstream_url(&rewrite.upstream_path, query.as_deref());

        let mut headers = self.outbound_headers(&parts.headers, peer);
        if let Some(credential) = credential {
            headers.insert(AUTHORIZATION, credential);
        }
        if let Some(token) = session_token.and_then(|t| HeaderValue::from_str(&t).ok()) {
            headers.insert(HeaderName::from_static(SESSION_TOKEN_HEADER), token);
        }
        insert_trust_headers(&mut headers, identity);

        let body = to_bytes(body, MAX_REQUEST_BODY_BYTES).await.map_err(|_| {
            GatewayError::Validation(format!(
                "request body exceeds the {} MiB limit",
                MAX_REQUEST_BODY_BYTES / (1024 * 1024)
            ))
        })?;

        let method = parts.method.clone();
        debug!(method = %method, url = %url, user_id = %identity.user_id, "forwarding request");

        let upstream = self
            .client
            .request(method.clone(), url.clone())
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|err| {
                let failure = UpstreamFailure::classify(&err);
                error!(
                    method = %method,
                    url = %url,
                    failure = %failure,
                    "upstream request failed: {err}"
                );
                GatewayError::ServiceUnavailable(failure)
            })?;

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        response::strip_hop_by_hop(&mut response_headers);
        response::strip_cors(&mut response_headers);
        if (status.is_success() || status.is_redirection()) && rewrite.is_asset() {
            response::apply_asset_caching(&mut response_headers, &rewrite.upstream_path);
        }

        let body = if status.is_client_error() || status.is_server_error() {
            response::logged_error_body(upstream, method.as_str(), url.as_str()).await
        } else {
            Body::from_stream(upstream.bytes_stream())
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;

        // Upstream cookies stay; the gateway cookie is appended next to them.
        let now = self.authenticator.sessions().now();
        refresh_session_cookie(&mut response, identity, self.authenticator.cookies(), now);

        Ok(response)
    }

    fn outbound_headers(&self, inbound: &HeaderMap, peer: Option<SocketAddr>) -> HeaderMap {
        let mut headers = inbound.clone();
        response::strip_hop_by_hop(&mut headers);
        headers.remove(HOST);
        headers.remove(AUTHORIZATION);
        headers.remove(USER_ID_HEADER);
        headers.remove(USER_ROLE_HEADER);
        headers.remove(SESSION_TOKEN_HEADER);

        headers.remove(COOKIE);
        if let Some(cookies) = self.authenticator.cookies().strip_from(inbound) {
            headers.insert(COOKIE, cookies);
        }

        // Client forwarding headers are either extended with the peer or replaced.
        headers.remove("x-forwarded-for");
        if let Some(addr) = peer {
            let client = addr.ip().to_string();
            let chain = inbound
                .get("x-forwarded-for")
                .and_then(|value| value.to_str().ok())
                .map_or_else(|| client.clone(), |prior| format!("{prior}, {client}"));
            if let Ok(value) = HeaderValue::from_str(&chain) {
                headers.insert("x-forwarded-for", value);
            }
        }
        headers.remove("x-forwarded-host");
        if let Some(host) = inbound.get(HOST) {
            headers.insert("x-forwarded-host", host.clone());
        }
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
        headers
    }

    fn log_if_slow(
        &self,
        method: &Method,
        path: &str,
        identity: Option<&Identity>,
        started: Instant,
    ) {
        let elapsed = started.elapsed();
        if elapsed < self.config.slow_request {
            return;
        }
        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        match identity {
            Some(identity) => warn!(
                method = %method,
                path,
                duration_ms,
                user_id = %identity.user_id,
                "slow proxied request"
            ),
            None => warn!(method = %method, path, duration_ms, "slow proxied request"),
        }
    }
}

impl fmt::Debug for ProxyGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyGateway")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn insert_trust_headers(headers: &mut HeaderMap, identity: &Identity) {
    if let Ok(value) = HeaderValue::from_str(&identity.user_id.to_string()) {
        headers.insert(HeaderName::from_static(USER_ID_HEADER), value);
    }
    headers.insert(
        HeaderName::from_static(USER_ROLE_HEADER),
        HeaderValue::from_static(identity.role.as_str()),
    );
}

/// Proxy handler mounted under the gateway prefix for every method.
pub async fn handle(State(gateway): State<Arc<ProxyGateway>>, request: Request) -> Response {
    if request.method() == Method::OPTIONS {
        return StatusCode::NO_CONTENT.into_response();
    }

    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let (identity, result) = gateway.forward(request).await;
    let response = match result {
        Ok(response) => response,
        Err(err) => {
            if matches!(err, GatewayError::ServiceUnavailable(_)) {
                info!(method = %method, path = %path, code = err.code(), "proxy request rejected");
            }
            err.into_response()
        }
    };
    gateway.log_if_slow(&method, &path, identity.as_ref(), started);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::SystemClock,
        identity::{MemoryProfileStore, Profile, StaticAuthProvider},
        session::{CookieConfig, SessionConfig, SessionStore},
    };

    #[test]
    fn failure_codes() {
        assert_eq!(UpstreamFailure::Timeout.code(), "upstream_timeout");
        assert_eq!(UpstreamFailure::ConnectionRefused.code(), "connection_refused");
        assert_eq!(UpstreamFailure::ConnectionError.code(), "connection_error");
        assert_eq!(
            UpstreamFailure::CredentialUnavailable.code(),
            "upstream_credential_unavailable"
        );
    }

    #[tokio::test]
    async fn refused_connection_is_classified() -> Result<()> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);

        let client = reqwest::Client::builder().no_proxy().build()?;
        let err = client
            .get(format!("http://{addr}/"))
            .send()
            .await
            .err()
            .context("request to a closed port succeeded")?;
        assert_eq!(UpstreamFailure::classify(&err), UpstreamFailure::ConnectionRefused);
        Ok(())
    }

    #[test]
    fn environment_parses() {
        assert_eq!("prod".parse::<Environment>(), Ok(Environment::Production));
        assert_eq!(
            "Development".parse::<Environment>(),
            Ok(Environment::Development)
        );
        assert!("staging".parse::<Environment>().is_err());
    }

    const MEMBER_TOKEN: &str = "member-token";

    fn member() -> Profile {
        let now = chrono::Utc::now();
        Profile {
            user_id: uuid::Uuid::new_v4(),
            email: "member@example.com".to_string(),
            display_name: None,
            role: Role::Member,
            status: AccountStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    fn gateway(upstream: &str, member: &Profile) -> Result<ProxyGateway> {
        let sessions = Arc::new(SessionStore::new(
            SessionConfig::new(),
            Arc::new(SystemClock),
        ));
        let authenticator = Arc::new(Authenticator::new(
            sessions,
            Arc::new(StaticAuthProvider::new().with_token(MEMBER_TOKEN, member.user_id)),
            Arc::new(MemoryProfileStore::new().with_profile(member.clone())),
            CookieConfig::new(),
        ));
        let config = ProxyConfig::new(Url::parse(upstream)?)?;
        ProxyGateway::new(config, authenticator, Arc::new(NoTokenSource))
    }

    fn proxied(method: Method, token: Option<&str>, body: Body) -> Result<Request> {
        let mut builder = axum::http::Request::builder()
            .method(method)
            .uri("/proxy/widgets");
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        Ok(builder.body(body)?)
    }

    fn closed_port() -> Result<String> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);
        Ok(format!("http://{addr}"))
    }

    #[test]
    fn upstream_url_keeps_base_path() -> Result<()> {
        let gateway = gateway("http://upstream.local/app/", &member())?;
        let url = gateway.upstream_url("/api/users", Some("page=2"));
        assert_eq!(url.as_str(), "http://upstream.local/app/api/users?page=2");

        let url = gateway.upstream_url("/3f2504e0-4f89-11d3-9a0c-0305e82c3301/tile", None);
        assert_eq!(
            url.as_str(),
            "http://upstream.local/app/3f2504e0-4f89-11d3-9a0c-0305e82c3301/tile"
        );
        Ok(())
    }

    #[test]
    fn outbound_headers_are_sanitized() -> Result<()> {
        let gateway = gateway("http://upstream.local", &member())?;
        let mut inbound = HeaderMap::new();
        inbound.insert(HOST, HeaderValue::from_static("gateway.local"));
        inbound.insert(AUTHORIZATION, HeaderValue::from_static("Bearer user-token"));
        inbound.insert(USER_ID_HEADER, HeaderValue::from_static("forged"));
        inbound.insert(USER_ROLE_HEADER, HeaderValue::from_static("admin"));
        inbound.insert(COOKIE, HeaderValue::from_static("portero_session=abc; theme=dark"));
        inbound.insert("connection", HeaderValue::from_static("close"));
        inbound.insert("x-request-id", HeaderValue::from_static("01HZY"));

        let peer = "192.0.2.1:4000".parse().ok();
        let headers = gateway.outbound_headers(&inbound, peer);

        assert!(headers.get(AUTHORIZATION).is_none());
        assert!(headers.get(USER_ID_HEADER).is_none());
        assert!(headers.get(USER_ROLE_HEADER).is_none());
        assert!(headers.get(HOST).is_none());
        assert!(headers.get("connection").is_none());
        assert_eq!(
            headers.get(COOKIE),
            Some(&HeaderValue::from_static("theme=dark"))
        );
        assert_eq!(
            headers.get("x-forwarded-for"),
            Some(&HeaderValue::from_static("192.0.2.1"))
        );
        assert_eq!(
            headers.get("x-forwarded-host"),
            Some(&HeaderValue::from_static("gateway.local"))
        );
        assert_eq!(
            headers.get("x-request-id"),
            Some(&HeaderValue::from_static("01HZY"))
        );
        Ok(())
    }

    #[test]
    fn client_forwarding_headers_are_not_passed_through() -> Result<()> {
        let gateway = gateway("http://upstream.local", &member())?;
        let mut inbound = HeaderMap::new();
        inbound.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9"));
        inbound.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        inbound.insert("x-forwarded-host", HeaderValue::from_static("evil.example"));

        let headers = gateway.outbound_headers(&inbound, None);
        assert!(headers.get("x-forwarded-for").is_none());
        assert!(headers.get("x-forwarded-host").is_none());
        assert_eq!(
            headers.get("x-forwarded-proto"),
            Some(&HeaderValue::from_static("http"))
        );

        let headers = gateway.outbound_headers(&inbound, "192.0.2.1:4000".parse().ok());
        assert_eq!(
            headers.get("x-forwarded-for"),
            Some(&HeaderValue::from_static("203.0.113.9, 192.0.2.1"))
        );
        assert_eq!(
            headers.get("x-forwarded-proto"),
            Some(&HeaderValue::from_static("http"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn failed_forward_still_reports_the_caller() -> Result<()> {
        let member = member();
        let gateway = gateway(&closed_port()?, &member)?;

        let (identity, result) = gateway
            .forward(proxied(Method::GET, Some(MEMBER_TOKEN), Body::empty())?)
            .await;
        assert_eq!(identity.map(|i| i.user_id), Some(member.user_id));
        assert!(matches!(
            result,
            Err(GatewayError::ServiceUnavailable(UpstreamFailure::ConnectionRefused))
        ));

        let (identity, result) = gateway
            .forward(proxied(Method::GET, None, Body::empty())?)
            .await;
        assert!(identity.is_none());
        assert_eq!(result.err().map(|e| e.status()), Some(StatusCode::UNAUTHORIZED));
        Ok(())
    }

    #[tokio::test]
    async fn oversized_body_names_the_limit() -> Result<()> {
        let member = member();
        let gateway = gateway(&closed_port()?, &member)?;

        let body = Body::from(vec![0_u8; MAX_REQUEST_BODY_BYTES + 1]);
        let (identity, result) = gateway
            .forward(proxied(Method::POST, Some(MEMBER_TOKEN), body)?)
            .await;
        assert!(identity.is_some());
        let err = result.err().context("oversized body was forwarded")?;
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "validation_error");
        assert!(err.body().message.contains("32 MiB"));
        Ok(())
    }
}
