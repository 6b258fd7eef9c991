//! HTTP client for the identity provider.
//!
//! Endpoints, relative to the configured base URL:
//! - `POST v1/tokens/verify` `{"token"}` -> `{"sub", "claims"}`
//! - `POST v1/users` `{"email", "password"}` -> `{"id"}`
//! - `PUT v1/users/{id}/password` `{"current_password", "new_password"}`
//! - `DELETE v1/users/{id}`

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;
use uuid::Uuid;

use super::{AuthProvider, ProviderError, VerifiedToken};

#[derive(Deserialize)]
struct VerifyResponse {
    sub: Uuid,
    #[serde(default)]
    claims: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct CreateResponse {
    id: Uuid,
}

#[derive(Clone, Debug)]
pub struct HttpAuthProvider {
    client: Client,
    base_url: Url,
}

impl HttpAuthProvider {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(timeout)
            .build()
            .context("Failed to build identity provider HTTP client")?;

        Ok(Self {
            client,
            base_url: with_trailing_slash(base_url),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProviderError> {
        self.base_url
            .join(path)
            .map_err(|err| ProviderError::Unavailable(format!("invalid provider url: {err}")))
    }
}

// `Url::join` drops the last segment unless the base ends with '/'
fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn transport(err: &reqwest::Error) -> ProviderError {
    ProviderError::Unavailable(err.to_string())
}

async fn rejected(response: reqwest::Response) -> ProviderError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    debug!(status = %status, "identity provider rejected request");
    if status.is_server_error() {
        ProviderError::Unavailable(format!("identity provider returned {status}"))
    } else if body.is_empty() {
        ProviderError::Rejected(status.to_string())
    } else {
        ProviderError::Rejected(body.chars().take(200).collect())
    }
}

#[async_trait]
impl AuthProvider for HttpAuthProvider {
    #[instrument(skip(self, token), level = "debug")]
    async fn verify_token(&self, token: &str) -> Result<VerifiedToken, ProviderError> {
        let response = self
            .client
            .post(self.endpoint("v1/tokens/verify")?)
            .json(&json!({ "token": token }))
            .send()
            .await
            .map_err(|err| transport(&err))?;

        match response.status() {
            status if status.is_success() => {
                let body: VerifyResponse = response.json().await.map_err(|err| transport(&err))?;
                Ok(VerifiedToken {
                    subject: body.sub,
                    claims: body.claims,
                })
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::BAD_REQUEST => {
                Err(ProviderError::InvalidToken)
            }
            _ => Err(rejected(response).await),
        }
    }

    #[instrument(skip(self, current_password, new_password), level = "debug")]
    async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &SecretString,
        new_password: &SecretString,
    ) -> Result<(), ProviderError> {
        let response = self
            .client
            .put(self.endpoint(&format!("v1/users/{user_id}/password"))?)
            .json(&json!({
                "current_password": current_password.expose_secret(),
                "new_password": new_password.expose_secret(),
            }))
            .send()
            .await
            .map_err(|err| transport(&err))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ProviderError::NotFound),
            _ => Err(rejected(response).await),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_identity(&self, user_id: Uuid) -> Result<(), ProviderError> {
        let response = self
            .client
            .delete(self.endpoint(&format!("v1/users/{user_id}"))?)
            .send()
            .await
            .map_err(|err| transport(&err))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ProviderError::NotFound),
            _ => Err(rejected(response).await),
        }
    }

    #[instrument(skip(self, password), level = "debug")]
    async fn create_identity(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Uuid, ProviderError> {
        let response = self
            .client
            .post(self.endpoint("v1/users")?)
            .json(&json!({
                "email": email,
                "password": password.expose_secret(),
            }))
            .send()
            .await
            .map_err(|err| transport(&err))?;

        if response.status().is_success() {
            let body: CreateResponse = response.json().await.map_err(|err| transport(&err))?;
            Ok(body.id)
        } else {
            Err(rejected(response).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Path, http::StatusCode as AxumStatus, routing::{delete, post}, Json, Router};
    use tokio::net::TcpListener;

    async fn spawn(router: Router) -> Result<Url> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Ok(Url::parse(&format!("http://{addr}/idp"))?)
    }

    #[tokio::test]
    async fn verify_token_maps_statuses() -> Result<()> {
        let subject = Uuid::new_v4();
        let router = Router::new().route(
            "/idp/v1/tokens/verify",
            post(move |Json(body): Json<serde_json::Value>| async move {
                if body["token"] == "good" {
                    (
                        AxumStatus::OK,
                        Json(json!({ "sub": subject, "claims": { "scope": "api" } })),
                    )
                } else {
                    (AxumStatus::UNAUTHORIZED, Json(json!({ "error": "invalid" })))
                }
            }),
        );
        let provider = HttpAuthProvider::new(spawn(router).await?, Duration::from_secs(5))?;

        let verified = provider.verify_token("good").await?;
        assert_eq!(verified.subject, subject);
        assert_eq!(verified.claims.get("scope"), Some(&json!("api")));
        assert_eq!(
            provider.verify_token("bad").await.err(),
            Some(ProviderError::InvalidToken)
        );
        Ok(())
    }

    #[tokio::test]
    async fn delete_identity_not_found() -> Result<()> {
        let router = Router::new().route(
            "/idp/v1/users/:id",
            delete(|Path(_id): Path<Uuid>| async { AxumStatus::NOT_FOUND }),
        );
        let provider = HttpAuthProvider::new(spawn(router).await?, Duration::from_secs(5))?;
        assert_eq!(
            provider.delete_identity(Uuid::new_v4()).await.err(),
            Some(ProviderError::NotFound)
        );
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_provider_is_unavailable() -> Result<()> {
        let provider =
            HttpAuthProvider::new(Url::parse("http://127.0.0.1:1/")?, Duration::from_secs(2))?;
        assert!(matches!(
            provider.verify_token("any").await,
            Err(ProviderError::Unavailable(_))
        ));
        Ok(())
    }

    #[test]
    fn trailing_slash_is_added_once() -> Result<()> {
        let url = with_trailing_slash(Url::parse("http://idp.local/base")?);
        assert_eq!(url.path(), "/base/");
        let url = with_trailing_slash(Url::parse("http://idp.local/")?);
        assert_eq!(url.path(), "/");
        Ok(())
    }
}
