//! Bearer token acquisition for the Dataverse Web API.

use crate::config::{DataverseConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::retry::with_retry;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Exchanges app credentials for a bearer token.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Get a token for `resource`.
    async fn token(
        &self,
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
        resource: &str,
    ) -> Result<String>;
}

/// OAuth2 client-credentials flow against an Azure AD style authority.
pub struct ClientCredentials {
    http: Client,
    authority_url: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl ClientCredentials {
    /// Create a provider for the given authority.
    pub fn new(authority_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            authority_url: authority_url.into(),
        })
    }

    /// Create a provider from Dataverse settings.
    pub fn from_config(config: &DataverseConfig) -> Result<Self> {
        Self::new(&config.authority_url, config.token_timeout())
    }

    /// Token endpoint for a tenant.
    pub fn token_url(&self, tenant_id: &str) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_url.trim_end_matches('/'),
            tenant_id
        )
    }
}

#[async_trait]
impl TokenProvider for ClientCredentials {
    #[instrument(skip(self, client_secret), fields(tenant = %tenant_id, client = %client_id))]
    async fn token(
        &self,
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
        resource: &str,
    ) -> Result<String> {
        let scope = format!("{}/.default", resource.trim_end_matches('/'));
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("scope", scope.as_str()),
        ];

        let response = self
            .http
            .post(self.token_url(tenant_id))
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::auth_transport("Token request failed", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::auth(
                format!("Token endpoint returned HTTP {}: {}", status.as_u16(), body),
                Some(status.as_u16()),
            ));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::auth_transport("Invalid token response", e))?;

        debug!(expires_in = ?token.expires_in, "Token acquired");
        Ok(token.access_token)
    }
}

/// Acquire the run's token, retrying transient failures.
pub async fn acquire_token<P>(
    provider: &P,
    config: &DataverseConfig,
    retry: &RetryConfig,
) -> Result<String>
where
    P: TokenProvider + ?Sized,
{
    info!("Authenticating to {}", config.resource());
    with_retry(retry, "Token request", || {
        provider.token(
            &config.tenant_id,
            &config.client_id,
            &config.client_secret,
            config.resource(),
        )
    })
    .await
}
