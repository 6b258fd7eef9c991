//! Upstream service and proxy behaviour.

use crate::proxy::{Environment, TokenSourceKind, DEFAULT_PASSTHROUGH_PATTERN};
use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;
use url::Url;

pub const ARG_UPSTREAM_URL: &str = "upstream-url";
pub const ARG_UPSTREAM_API_ROOT: &str = "upstream-api-root";
pub const ARG_PROXY_PREFIX: &str = "proxy-prefix";
pub const ARG_PASSTHROUGH_PATTERN: &str = "passthrough-pattern";
pub const ARG_UPSTREAM_TIMEOUT_SECONDS: &str = "upstream-timeout-seconds";
pub const ARG_SLOW_REQUEST_MS: &str = "slow-request-ms";
pub const ARG_SERVICE_TOKEN_SOURCE: &str = "service-token-source";
pub const ARG_SERVICE_TOKEN: &str = "service-token";
pub const ARG_ENVIRONMENT: &str = "environment";

#[derive(Debug)]
pub struct Options {
    pub upstream_url: Url,
    pub api_root: String,
    pub prefix: String,
    pub passthrough_pattern: String,
    pub timeout_seconds: u64,
    pub slow_request_ms: u64,
    pub token_source: TokenSourceKind,
    pub service_token: Option<SecretString>,
    pub environment: Environment,
}

impl Options {
    /// Parse upstream arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the upstream URL is invalid or the static token
    /// source has no token.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let raw_url = matches
            .get_one::<String>(ARG_UPSTREAM_URL)
            .context("missing required argument: --upstream-url")?;
        let upstream_url =
            Url::parse(raw_url).with_context(|| format!("invalid --upstream-url: {raw_url}"))?;

        let token_source = matches
            .get_one::<TokenSourceKind>(ARG_SERVICE_TOKEN_SOURCE)
            .copied()
            .unwrap_or_default();
        let service_token = matches
            .get_one::<String>(ARG_SERVICE_TOKEN)
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .map(SecretString::from);
        if token_source == TokenSourceKind::Static && service_token.is_none() {
            return Err(anyhow!(
                "missing required argument: --{ARG_SERVICE_TOKEN} (required for the static token source)"
            ));
        }

        let string = |id: &str, default: &str| -> String {
            matches
                .get_one::<String>(id)
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        Ok(Self {
            upstream_url,
            api_root: string(ARG_UPSTREAM_API_ROOT, "/api"),
            prefix: string(ARG_PROXY_PREFIX, "/proxy"),
            passthrough_pattern: string(ARG_PASSTHROUGH_PATTERN, DEFAULT_PASSTHROUGH_PATTERN),
            timeout_seconds: matches
                .get_one::<u64>(ARG_UPSTREAM_TIMEOUT_SECONDS)
                .copied()
                .unwrap_or(30),
            slow_request_ms: matches
                .get_one::<u64>(ARG_SLOW_REQUEST_MS)
                .copied()
                .unwrap_or(2000),
            token_source,
            service_token,
            environment: matches
                .get_one::<Environment>(ARG_ENVIRONMENT)
                .copied()
                .unwrap_or_default(),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_UPSTREAM_URL)
                .long(ARG_UPSTREAM_URL)
                .help("Base URL of the upstream service, example: http://app.internal:9000")
                .env("PORTERO_UPSTREAM_URL")
                .required(true),
        )
        .arg(
            Arg::new(ARG_UPSTREAM_API_ROOT)
                .long(ARG_UPSTREAM_API_ROOT)
                .help("Upstream path that replaces the proxy prefix")
                .env("PORTERO_UPSTREAM_API_ROOT")
                .default_value("/api"),
        )
        .arg(
            Arg::new(ARG_PROXY_PREFIX)
                .long(ARG_PROXY_PREFIX)
                .help("Gateway path prefix the proxy is mounted under")
                .env("PORTERO_PROXY_PREFIX")
                .default_value("/proxy"),
        )
        .arg(
            Arg::new(ARG_PASSTHROUGH_PATTERN)
                .long(ARG_PASSTHROUGH_PATTERN)
                .help("Regex for a first path segment that is forwarded without the API root")
                .env("PORTERO_PASSTHROUGH_PATTERN")
                .default_value(DEFAULT_PASSTHROUGH_PATTERN),
        )
        .arg(
            Arg::new(ARG_UPSTREAM_TIMEOUT_SECONDS)
                .long(ARG_UPSTREAM_TIMEOUT_SECONDS)
                .help("Timeout for a whole upstream request, in seconds")
                .env("PORTERO_UPSTREAM_TIMEOUT_SECONDS")
                .default_value("30")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_SLOW_REQUEST_MS)
                .long(ARG_SLOW_REQUEST_MS)
                .help("Proxied requests slower than this are logged, in milliseconds")
                .env("PORTERO_SLOW_REQUEST_MS")
                .default_value("2000")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_SERVICE_TOKEN_SOURCE)
                .long(ARG_SERVICE_TOKEN_SOURCE)
                .help("Where the upstream service credential comes from: none, static, metadata")
                .env("PORTERO_SERVICE_TOKEN_SOURCE")
                .default_value("none")
                .value_parser(|value: &str| value.parse::<TokenSourceKind>()),
        )
        .arg(
            Arg::new(ARG_SERVICE_TOKEN)
                .long(ARG_SERVICE_TOKEN)
                .help("Upstream credential for the static token source")
                .env("PORTERO_SERVICE_TOKEN")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_ENVIRONMENT)
                .long(ARG_ENVIRONMENT)
                .help("development or production; production refuses to forward without a credential")
                .env("PORTERO_ENVIRONMENT")
                .default_value("development")
                .value_parser(|value: &str| value.parse::<Environment>()),
        )
}
