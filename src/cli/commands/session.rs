//! Session store and session cookie settings.

use crate::session::SameSite;
use clap::{Arg, ArgAction, ArgMatches, Command};

pub const ARG_SESSION_TTL_SECONDS: &str = "session-ttl-seconds";
pub const ARG_MAX_SESSIONS_PER_USER: &str = "max-sessions-per-user";
pub const ARG_SESSION_REAP_INTERVAL_SECONDS: &str = "session-reap-interval-seconds";
pub const ARG_COOKIE_NAME: &str = "cookie-name";
pub const ARG_COOKIE_DOMAIN: &str = "cookie-domain";
pub const ARG_COOKIE_SECURE: &str = "cookie-secure";
pub const ARG_COOKIE_SAME_SITE: &str = "cookie-same-site";

#[derive(Debug, Clone)]
pub struct Options {
    pub ttl_seconds: i64,
    pub max_per_user: usize,
    pub reap_interval_seconds: u64,
    pub cookie_name: String,
    pub cookie_domain: Option<String>,
    pub cookie_secure: bool,
    pub cookie_same_site: SameSite,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        Self {
            ttl_seconds: matches
                .get_one::<i64>(ARG_SESSION_TTL_SECONDS)
                .copied()
                .unwrap_or(86_400),
            max_per_user: matches
                .get_one::<usize>(ARG_MAX_SESSIONS_PER_USER)
                .copied()
                .unwrap_or(5),
            reap_interval_seconds: matches
                .get_one::<u64>(ARG_SESSION_REAP_INTERVAL_SECONDS)
                .copied()
                .unwrap_or(300),
            cookie_name: matches
                .get_one::<String>(ARG_COOKIE_NAME)
                .cloned()
                .unwrap_or_else(|| "portero_session".to_string()),
            cookie_domain: matches
                .get_one::<String>(ARG_COOKIE_DOMAIN)
                .map(|domain| domain.trim().to_string())
                .filter(|domain| !domain.is_empty()),
            cookie_secure: matches
                .get_one::<bool>(ARG_COOKIE_SECURE)
                .copied()
                .unwrap_or(true),
            cookie_same_site: matches
                .get_one::<SameSite>(ARG_COOKIE_SAME_SITE)
                .copied()
                .unwrap_or_default(),
        }
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SESSION_TTL_SECONDS)
                .long(ARG_SESSION_TTL_SECONDS)
                .help("Default session lifetime in seconds")
                .env("PORTERO_SESSION_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_MAX_SESSIONS_PER_USER)
                .long(ARG_MAX_SESSIONS_PER_USER)
                .help("Live sessions per user before the least recently used is evicted")
                .env("PORTERO_MAX_SESSIONS_PER_USER")
                .default_value("5")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new(ARG_SESSION_REAP_INTERVAL_SECONDS)
                .long(ARG_SESSION_REAP_INTERVAL_SECONDS)
                .help("How often expired sessions are purged, in seconds")
                .env("PORTERO_SESSION_REAP_INTERVAL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_COOKIE_NAME)
                .long(ARG_COOKIE_NAME)
                .help("Session cookie name")
                .env("PORTERO_COOKIE_NAME")
                .default_value("portero_session"),
        )
        .arg(
            Arg::new(ARG_COOKIE_DOMAIN)
                .long(ARG_COOKIE_DOMAIN)
                .help("Session cookie Domain attribute")
                .env("PORTERO_COOKIE_DOMAIN"),
        )
        .arg(
            Arg::new(ARG_COOKIE_SECURE)
                .long(ARG_COOKIE_SECURE)
                .help("Mark the session cookie Secure")
                .env("PORTERO_COOKIE_SECURE")
                .default_value("true")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(bool)),
        )
        .arg(
            Arg::new(ARG_COOKIE_SAME_SITE)
                .long(ARG_COOKIE_SAME_SITE)
                .help("Session cookie SameSite attribute: strict, lax, none")
                .env("PORTERO_COOKIE_SAME_SITE")
                .default_value("lax")
                .value_parser(|value: &str| value.parse::<SameSite>()),
        )
}
