//! Session cookie formatting and parsing.

use axum::http::{
    header::{InvalidHeaderValue, COOKIE},
    HeaderMap, HeaderValue,
};
use std::{fmt, str::FromStr};

const DEFAULT_COOKIE_NAME: &str = "portero_session";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    #[default]
    Lax,
    None,
}

impl SameSite {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "Strict",
            Self::Lax => "Lax",
            Self::None => "None",
        }
    }
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SameSite {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "lax" => Ok(Self::Lax),
            "none" => Ok(Self::None),
            other => Err(format!("invalid SameSite value: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CookieConfig {
    name: String,
    domain: Option<String>,
    secure: bool,
    same_site: SameSite,
}

impl CookieConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: DEFAULT_COOKIE_NAME.to_string(),
            domain: None,
            secure: true,
            same_site: SameSite::Lax,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_domain(mut self, domain: Option<String>) -> Self {
        self.domain = domain.filter(|domain| !domain.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    #[must_use]
    pub fn with_same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = same_site;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn secure(&self) -> bool {
        self.secure
    }

    /// `Set-Cookie` value carrying the session token.
    ///
    /// # Errors
    /// Fails when the token or domain contains bytes not allowed in a header.
    pub fn session_cookie(
        &self,
        token: &str,
        max_age_seconds: i64,
    ) -> Result<HeaderValue, InvalidHeaderValue> {
        HeaderValue::from_str(&self.format(token, max_age_seconds.max(0)))
    }

    /// `Set-Cookie` value that makes the browser drop the session cookie.
    ///
    /// # Errors
    /// Fails when the configured domain is not a valid header value.
    pub fn clear_cookie(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        HeaderValue::from_str(&self.format("", 0))
    }

    fn format(&self, token: &str, max_age_seconds: i64) -> String {
        let mut cookie = format!(
            "{}={token}; Path=/; HttpOnly; SameSite={}; Max-Age={max_age_seconds}",
            self.name, self.same_site
        );
        if let Some(domain) = &self.domain {
            cookie.push_str("; Domain=");
            cookie.push_str(domain);
        }
        // browsers reject SameSite=None without Secure
        if self.secure || self.same_site == SameSite::None {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// Session token from the request's `Cookie` headers, if any.
    #[must_use]
    pub fn extract(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .find_map(|pair| {
                let (key, val) = pair.trim().split_once('=')?;
                (key.trim() == self.name)
                    .then(|| val.trim().to_string())
                    .filter(|val| !val.is_empty())
            })
    }

    /// Rebuild a `Cookie` header without the session cookie.
    ///
    /// Returns `None` when nothing else is left to forward.
    #[must_use]
    pub fn strip_from(&self, headers: &HeaderMap) -> Option<HeaderValue> {
        let remaining: Vec<&str> = headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .filter(|pair| {
                pair.split_once('=')
                    .map_or(true, |(key, _)| key.trim() != self.name)
            })
            .collect();

        if remaining.is_empty() {
            return None;
        }
        HeaderValue::from_str(&remaining.join("; ")).ok()
    }
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self::new()
    }
}
