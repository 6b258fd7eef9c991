//! Service-to-service credentials attached to forwarded requests.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use std::{fmt, str::FromStr, time::Duration};
use url::Url;

/// Identity token endpoint of the compute metadata server.
pub const METADATA_IDENTITY_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/identity";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenSourceError {
    #[error("token source unavailable: {0}")]
    Unavailable(String),
    #[error("token source returned an unusable token: {0}")]
    Invalid(String),
}

/// Produces a credential scoped to `audience` (the upstream URL).
///
/// `Ok(None)` means no credential is configured.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self, audience: &str) -> Result<Option<SecretString>, TokenSourceError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoTokenSource;

#[async_trait]
impl TokenSource for NoTokenSource {
    async fn token(&self, _audience: &str) -> Result<Option<SecretString>, TokenSourceError> {
        Ok(None)
    }
}

#[derive(Debug)]
pub struct StaticTokenSource {
    token: SecretString,
}

impl StaticTokenSource {
    #[must_use]
    pub fn new(token: SecretString) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self, _audience: &str) -> Result<Option<SecretString>, TokenSourceError> {
        Ok(Some(SecretString::from(
            self.token.expose_secret().to_string(),
        )))
    }
}

/// Fetches a fresh identity token from the metadata server on every call.
#[derive(Clone, Debug)]
pub struct MetadataTokenSource {
    client: Client,
    endpoint: Url,
}

impl MetadataTokenSource {
    /// # Errors
    /// Returns an error if the endpoint is not a valid URL or the client cannot be built.
    pub fn new(endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        let endpoint = Url::parse(endpoint)?;
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl TokenSource for MetadataTokenSource {
    async fn token(&self, audience: &str) -> Result<Option<SecretString>, TokenSourceError> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("audience", audience)
            .append_pair("format", "full");

        let response = self
            .client
            .get(url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|err| TokenSourceError::Unavailable(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TokenSourceError::Unavailable(format!(
                "metadata server returned {status}"
            )));
        }

        let token = response
            .text()
            .await
            .map_err(|err| TokenSourceError::Unavailable(err.to_string()))?;
        let token = token.trim();
        if token.is_empty() || token.contains(char::is_whitespace) {
            return Err(TokenSourceError::Invalid("empty or malformed token".to_string()));
        }
        Ok(Some(SecretString::from(token.to_string())))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TokenSourceKind {
    #[default]
    None,
    Static,
    Metadata,
}

impl FromStr for TokenSourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "static" => Ok(Self::Static),
            "metadata" => Ok(Self::Metadata),
            other => Err(format!("unknown token source: {other}")),
        }
    }
}

impl fmt::Display for TokenSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Static => "static",
            Self::Metadata => "metadata",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Query, http::HeaderMap, routing::get, Router};
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn static_and_none_sources() -> anyhow::Result<()> {
        assert!(NoTokenSource.token("http://upstream").await?.is_none());

        let fixed = StaticTokenSource::new(SecretString::from("s3cret".to_string()));
        let token = fixed.token("http://upstream").await?;
        assert_eq!(token.map(|t| t.expose_secret().to_string()).as_deref(), Some("s3cret"));
        Ok(())
    }

    #[tokio::test]
    async fn metadata_source_sends_flavor_and_audience() -> anyhow::Result<()> {
        let router = Router::new().route(
            "/identity",
            get(
                |headers: HeaderMap, Query(params): Query<HashMap<String, String>>| async move {
                    let flavored = headers
                        .get("metadata-flavor")
                        .is_some_and(|value| value == "Google");
                    match (flavored, params.get("audience").map(String::as_str)) {
                        (true, Some("http://upstream")) => {
                            (axum::http::StatusCode::OK, "id-token\n")
                        }
                        _ => (axum::http::StatusCode::FORBIDDEN, ""),
                    }
                },
            ),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        let source =
            MetadataTokenSource::new(&format!("http://{addr}/identity"), Duration::from_secs(5))?;
        let token = source.token("http://upstream").await?;
        assert_eq!(token.map(|t| t.expose_secret().to_string()).as_deref(), Some("id-token"));
        assert!(matches!(
            source.token("http://elsewhere").await,
            Err(TokenSourceError::Unavailable(_))
        ));
        Ok(())
    }

    #[test]
    fn kind_parses() {
        assert_eq!("Metadata".parse::<TokenSourceKind>(), Ok(TokenSourceKind::Metadata));
        assert_eq!("none".parse::<TokenSourceKind>(), Ok(TokenSourceKind::None));
        assert!("kms".parse::<TokenSourceKind>().is_err());
    }
}
