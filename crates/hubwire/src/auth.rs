//! Bearer credentials for hub sessions.
//!
//! Every connect attempt asks its [`CredentialSource`] for a fresh
//! [`Credential`]. Nothing is cached and nothing is refreshed ahead of time.
//! [`TokenProvider`] is the production source: it trades the configured
//! username and password for a token at the hub's `/auth/token` endpoint.

use std::fmt;
use std::future::Future;

use serde::Deserialize;

use crate::config::HubConfig;
use crate::error::{HubError, HubResult};

/// A short-lived bearer token. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value for an `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&"<redacted>").finish()
    }
}

/// Produces one credential per connection attempt.
pub trait CredentialSource: Send + Sync + 'static {
    /// Fetch a credential. Errors abort the current connect attempt.
    fn acquire(&self) -> impl Future<Output = HubResult<Credential>> + Send;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(rename = "Token", alias = "token")]
    token: String,
}

/// Exchanges username/password for a token over HTTP.
///
/// `GET {auth_endpoint}?username=..&password=..` → `{"Token": "..."}`.
/// No retries happen here; the supervisor's retry loop owns that.
#[derive(Debug, Clone)]
pub struct TokenProvider {
    http: reqwest::Client,
    endpoint: reqwest::Url,
    username: String,
    password: String,
}

impl TokenProvider {
    /// Build a provider from the hub configuration.
    ///
    /// # Errors
    /// Returns [`HubError::ConfigError`] if the endpoint cannot be resolved,
    /// or [`HubError::Http`] if the HTTP client cannot be built.
    pub fn new(config: &HubConfig) -> HubResult<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .timeout(config.timeouts.connect_timeout())
            .build()?;

        Ok(Self {
            http,
            endpoint: config.auth_endpoint()?,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn endpoint(&self) -> &reqwest::Url {
        &self.endpoint
    }

    /// Request a new token.
    ///
    /// # Errors
    /// - [`HubError::Http`] when the endpoint is unreachable
    /// - [`HubError::AuthenticationFailed`] on a non-success status
    /// - [`HubError::TokenParse`] when the body has no usable token
    pub async fn fetch_token(&self) -> HubResult<Credential> {
        tracing::debug!(endpoint = %self.endpoint, "Requesting access token");

        let response = self
            .http
            .get(self.endpoint.clone())
            .query(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "Token endpoint rejected the request");
            return Err(HubError::AuthenticationFailed {
                status: status.as_u16(),
                reason: if body.is_empty() {
                    status.canonical_reason().unwrap_or("unknown").to_string()
                } else {
                    body
                },
            });
        }

        let body = response.text().await?;
        let parsed: TokenResponse =
            serde_json::from_str(&body).map_err(|e| HubError::TokenParse {
                reason: e.to_string(),
            })?;

        if parsed.token.is_empty() {
            return Err(HubError::TokenParse {
                reason: "token field is empty".into(),
            });
        }

        tracing::debug!("Access token acquired");
        Ok(Credential::new(parsed.token))
    }
}

impl CredentialSource for TokenProvider {
    async fn acquire(&self) -> HubResult<Credential> {
        self.fetch_token().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_debug_is_redacted() {
        let credential = Credential::new("super-secret");
        let printed = format!("{credential:?}");
        assert!(!printed.contains("super-secret"));
        assert_eq!(credential.bearer(), "Bearer super-secret");
        assert_eq!(credential.as_str(), "super-secret");
    }

    #[test]
    fn test_token_response_field_names() {
        let parsed: TokenResponse = serde_json::from_str(r#"{"Token":"abc"}"#).unwrap();
        assert_eq!(parsed.token, "abc");
        let parsed: TokenResponse = serde_json::from_str(r#"{"token":"def"}"#).unwrap();
        assert_eq!(parsed.token, "def");
        assert!(serde_json::from_str::<TokenResponse>(r#"{"jwt":"x"}"#).is_err());
    }

    #[test]
    fn test_provider_uses_derived_endpoint() {
        let config = HubConfig::new("wss://hub.example.com/realtime");
        let provider = TokenProvider::new(&config).unwrap();
        assert_eq!(
            provider.endpoint().as_str(),
            "https://hub.example.com/auth/token"
        );
    }

    #[test]
    fn test_provider_rejects_bad_url() {
        let config = HubConfig::new("::::");
        assert!(matches!(
            TokenProvider::new(&config).unwrap_err(),
            HubError::ConfigError { .. }
        ));
    }
}
