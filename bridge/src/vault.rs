use crate::identity::{IdentityClient, IdentityError};
use rand::Rng;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

const VAULT_API_VERSION: &str = "7.4";
const VAULT_SCOPE: &str = "https://vault.azure.net";
const MAX_RETRIES: u32 = 5;
const INITIAL_BACKOFF_SECS: f64 = 1.0;

#[derive(thiserror::Error, Debug)]
pub enum VaultError {
    #[error("secret not found in vault: {0}")]
    NotFound(String),
    #[error("vault request failed with status {0}: {1}")]
    RequestFailed(StatusCode, String),
    #[error("rate limited by vault after {0} attempts")]
    RetriesExceeded(u32),
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

#[derive(Deserialize)]
struct SecretBundle {
    value: String,
}

/// REST client for a Key-Vault-style secret store, authenticated with a
/// managed-identity bearer token.
pub struct VaultClient {
    client: reqwest::Client,
    vault_url: String,
    token: String,
    max_retries: u32,
    initial_backoff: f64,
}

impl VaultClient {
    /// Build a client and probe the vault once so a misconfigured identity
    /// fails at startup instead of on the first secret fetch.
    pub async fn connect(vault_url: &str, identity: &IdentityClient) -> Result<Self, VaultError> {
        let token = identity.token(VAULT_SCOPE).await?;

        let vault = VaultClient {
            client: reqwest::Client::new(),
            vault_url: vault_url.trim_end_matches('/').to_string(),
            token,
            max_retries: MAX_RETRIES,
            initial_backoff: INITIAL_BACKOFF_SECS,
        };

        tracing::info!(vault_url = %vault.vault_url, "connecting to vault");
        let response = vault
            .client
            .get(format!("{}/secrets", vault.vault_url))
            .query(&[("api-version", VAULT_API_VERSION), ("maxresults", "1")])
            .bearer_auth(&vault.token)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(%status, "vault access probe failed");
            return Err(VaultError::RequestFailed(status, body));
        }

        Ok(vault)
    }

    /// Override the 429 retry policy. Used by tests to avoid real backoff
    /// delays.
    pub fn with_retry_policy(mut self, max_retries: u32, initial_backoff: f64) -> Self {
        self.max_retries = max_retries;
        self.initial_backoff = initial_backoff;
        self
    }

    /// Fetch one secret, retrying with exponential backoff and jitter when
    /// the vault rate-limits. Any other failure propagates immediately.
    pub async fn get_secret(&self, name: &str) -> Result<String, VaultError> {
        for attempt in 0..self.max_retries {
            let response = self
                .client
                .get(format!("{}/secrets/{}", self.vault_url, name))
                .query(&[("api-version", VAULT_API_VERSION)])
                .bearer_auth(&self.token)
                .send()
                .await?;

            match response.status() {
                status if status.is_success() => {
                    return Ok(response.json::<SecretBundle>().await?.value);
                }
                StatusCode::NOT_FOUND => return Err(VaultError::NotFound(name.to_string())),
                StatusCode::TOO_MANY_REQUESTS => {
                    if attempt + 1 == self.max_retries {
                        break;
                    }
                    let backoff = self.initial_backoff * 2f64.powi(attempt as i32);
                    let jitter = rand::thread_rng().gen_range(0.0..0.1 * backoff);
                    tracing::warn!(
                        secret = name,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_secs = backoff + jitter,
                        "rate limited by vault, backing off"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(backoff + jitter)).await;
                }
                status => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(VaultError::RequestFailed(status, body));
                }
            }
        }

        Err(VaultError::RetriesExceeded(self.max_retries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn connected_client(server: &MockServer) -> VaultClient {
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"access_token": "tok"})),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/secrets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [],
                "nextLink": null
            })))
            .mount(server)
            .await;

        let identity = IdentityClient::new(format!("{}/token", server.uri()), None);
        VaultClient::connect(&server.uri(), &identity)
            .await
            .expect("vault probe should succeed")
    }

    #[tokio::test]
    async fn fetches_secret_value() {
        let server = MockServer::start().await;
        let vault = connected_client(&server).await;

        Mock::given(method("GET"))
            .and(path("/secrets/JIRA-TOKEN"))
            .and(query_param("api-version", VAULT_API_VERSION))
            .and(header_exists("authorization"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"value": "s3cret", "id": "x"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let value = vault.get_secret("JIRA-TOKEN").await.unwrap();
        assert_eq!(value, "s3cret");
    }

    #[tokio::test]
    async fn retries_on_rate_limit_then_succeeds() {
        let server = MockServer::start().await;
        let vault = connected_client(&server)
            .await
            .with_retry_policy(5, 0.01);

        Mock::given(method("GET"))
            .and(path("/secrets/JIRA-EMAIL"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/secrets/JIRA-EMAIL"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"value": "ok"})),
            )
            .mount(&server)
            .await;

        let value = vault.get_secret("JIRA-EMAIL").await.unwrap();
        assert_eq!(value, "ok");
    }

    #[tokio::test]
    async fn rate_limit_exhaustion_gives_up() {
        let server = MockServer::start().await;
        let vault = connected_client(&server)
            .await
            .with_retry_policy(3, 0.001);

        Mock::given(method("GET"))
            .and(path("/secrets/JIRA-URL"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let err = vault.get_secret("JIRA-URL").await.unwrap_err();
        assert!(matches!(err, VaultError::RetriesExceeded(3)));
    }

    #[tokio::test]
    async fn non_rate_limit_errors_do_not_retry() {
        let server = MockServer::start().await;
        let vault = connected_client(&server).await;

        Mock::given(method("GET"))
            .and(path("/secrets/BROKEN"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1)
            .mount(&server)
            .await;

        let err = vault.get_secret("BROKEN").await.unwrap_err();
        assert!(matches!(
            err,
            VaultError::RequestFailed(status, body)
                if status == StatusCode::INTERNAL_SERVER_ERROR && body == "boom"
        ));
    }

    #[tokio::test]
    async fn missing_secret_is_not_found() {
        let server = MockServer::start().await;
        let vault = connected_client(&server).await;

        Mock::given(method("GET"))
            .and(path("/secrets/GONE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = vault.get_secret("GONE").await.unwrap_err();
        assert!(matches!(err, VaultError::NotFound(name) if name == "GONE"));
    }
}
