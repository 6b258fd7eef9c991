//! Maps validated CLI arguments to the action the binary runs.

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::{identity, rate_limit, session, upstream, ARG_CORS_ORIGIN, ARG_PORT};
use anyhow::Result;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let cors_origins = matches
        .get_many::<String>(ARG_CORS_ORIGIN)
        .map(|values| {
            values
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Ok(Action::Server(Args {
        port,
        cors_origins,
        identity: identity::Options::parse(matches)?,
        upstream: upstream::Options::parse(matches)?,
        session: session::Options::parse(matches),
        rate_limit: rate_limit::Options::parse(matches),
    }))
}
