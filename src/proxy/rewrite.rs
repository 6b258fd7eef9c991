use regex::Regex;
use url::form_urlencoded;

/// Query parameter that may carry a session id where cookies cannot be set.
pub const SESSION_TOKEN_QUERY_PARAM: &str = "session_token";

/// Default pass-through pattern: a UUID-shaped first path segment.
pub const DEFAULT_PASSTHROUGH_PATTERN: &str =
    r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$";

const ASSET_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "webp", "gif", "svg", "pbf"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rewrite {
    /// Path below the gateway prefix, always starting with `/`.
    pub remainder: String,
    /// Path sent to the upstream.
    pub upstream_path: String,
    pub passthrough: bool,
}

impl Rewrite {
    /// Paths under `/admin` need the admin role.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        !self.passthrough
            && (self.remainder == "/admin" || self.remainder.starts_with("/admin/"))
    }

    /// Images and tiles get long-lived cache headers.
    #[must_use]
    pub fn is_asset(&self) -> bool {
        if self.passthrough {
            return true;
        }
        let last = self.remainder.rsplit('/').next().unwrap_or_default();
        last.rsplit_once('.').is_some_and(|(_, ext)| {
            ASSET_EXTENSIONS
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(ext))
        })
    }
}

/// Maps gateway paths onto upstream paths.
#[derive(Clone, Debug)]
pub struct PathRewriter {
    prefix: String,
    api_root: String,
    passthrough: Regex,
}

impl PathRewriter {
    #[must_use]
    pub fn new(prefix: &str, api_root: &str, passthrough: Regex) -> Self {
        Self {
            prefix: normalize(prefix),
            api_root: normalize(api_root),
            passthrough,
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        if self.prefix.is_empty() {
            "/"
        } else {
            &self.prefix
        }
    }

    /// `<prefix>/rest` becomes `<api_root>/rest`, unless the first segment of
    /// `rest` matches the pass-through pattern, in which case `/rest` is sent
    /// unchanged. Returns `None` for paths outside the prefix.
    #[must_use]
    pub fn rewrite(&self, path: &str) -> Option<Rewrite> {
        let rest = path.strip_prefix(&self.prefix)?;
        if !(rest.is_empty() || rest.starts_with('/')) {
            return None;
        }
        let remainder = if rest.is_empty() {
            "/".to_string()
        } else {
            rest.to_string()
        };

        let first = remainder
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or_default();
        let passthrough = !first.is_empty() && self.passthrough.is_match(first);

        let upstream_path = if passthrough {
            remainder.clone()
        } else if remainder == "/" && !self.api_root.is_empty() {
            self.api_root.clone()
        } else {
            format!("{}{remainder}", self.api_root)
        };

        Some(Rewrite {
            remainder,
            upstream_path,
            passthrough,
        })
    }
}

// "/proxy/" and "proxy" both become "/proxy"; "/" becomes ""
fn normalize(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

/// Pull the session token out of a query string.
///
/// Returns the query to forward (`None` when nothing is left) and the token.
#[must_use]
pub fn extract_session_token(query: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(query) = query.filter(|query| !query.is_empty()) else {
        return (None, None);
    };

    let mut token = None;
    let mut kept = form_urlencoded::Serializer::new(String::new());
    let mut any_kept = false;
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        if key == SESSION_TOKEN_QUERY_PARAM {
            if !value.is_empty() {
                token = Some(value.into_owned());
            }
        } else {
            kept.append_pair(&key, &value);
            any_kept = true;
        }
    }

    if token.is_none() {
        // leave the original encoding untouched
        return (Some(query.to_string()), None);
    }
    let remaining = any_kept.then(|| kept.finish());
    (remaining, token)
}
