//! # Portero (Authenticating Reverse-Proxy Gateway)
//!
//! `portero` terminates inbound traffic in front of an upstream application
//! service. Every request flows through the same pipeline:
//!
//! 1. **Rate limiting:** a token bucket per client IP rejects abusive clients
//!    with `429` before any other work is done.
//! 2. **Authentication:** the caller is resolved from the session cookie first
//!    and from an `Authorization: Bearer` token second. Sessions live in an
//!    in-memory store with a per-user cap and a background reaper.
//! 3. **Authorization:** role and account-status guards run on the resolved
//!    identity.
//! 4. **Forwarding:** gateway routes are served locally; everything under the
//!    proxy prefix is rewritten and forwarded upstream with trust headers, and
//!    upstream failures are normalized to `503` JSON errors.
//!
//! The identity provider and the profile datastore are external capabilities
//! (`identity::AuthProvider`, `identity::ProfileStore`) so the core can run
//! against test doubles.

pub mod api;
pub mod auth;
pub mod cli;
pub mod clock;
pub mod error;
pub mod identity;
pub mod proxy;
pub mod ratelimit;
pub mod session;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
