use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use url::Url;

pub const ARG_DSN: &str = "dsn";
pub const ARG_AUTH_PROVIDER_URL: &str = "auth-provider-url";
pub const ARG_AUTH_TIMEOUT_SECONDS: &str = "auth-timeout-seconds";

#[derive(Debug, Clone)]
pub struct Options {
    pub dsn: String,
    pub provider_url: Url,
    pub timeout_seconds: u64,
}

impl Options {
    /// Parse profile store and identity provider arguments.
    ///
    /// # Errors
    /// Returns an error if a required argument is missing or the provider URL is invalid.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let dsn = matches
            .get_one::<String>(ARG_DSN)
            .cloned()
            .filter(|dsn| !dsn.trim().is_empty())
            .context("missing required argument: --dsn")?;
        let raw = matches
            .get_one::<String>(ARG_AUTH_PROVIDER_URL)
            .context("missing required argument: --auth-provider-url")?;
        let provider_url =
            Url::parse(raw).with_context(|| format!("invalid --auth-provider-url: {raw}"))?;

        Ok(Self {
            dsn,
            provider_url,
            timeout_seconds: matches
                .get_one::<u64>(ARG_AUTH_TIMEOUT_SECONDS)
                .copied()
                .unwrap_or(5),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_DSN)
                .short('d')
                .long(ARG_DSN)
                .help("Database connection string for the profile store")
                .env("PORTERO_DSN")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_AUTH_PROVIDER_URL)
                .long(ARG_AUTH_PROVIDER_URL)
                .help("Identity provider base URL, example: https://idp.internal/")
                .env("PORTERO_AUTH_PROVIDER_URL")
                .required(true),
        )
        .arg(
            Arg::new(ARG_AUTH_TIMEOUT_SECONDS)
                .long(ARG_AUTH_TIMEOUT_SECONDS)
                .help("Deadline for token verification plus profile lookup, in seconds")
                .env("PORTERO_AUTH_TIMEOUT_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}
