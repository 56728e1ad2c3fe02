use serde::Deserialize;

const DEFAULT_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const TOKEN_API_VERSION: &str = "2018-02-01";

#[derive(thiserror::Error, Debug)]
pub enum IdentityError {
    #[error("token request failed with status {0}: {1}")]
    TokenRequestFailed(reqwest::StatusCode, String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Fetches bearer tokens from the managed-identity token endpoint. A
/// user-assigned identity is selected with `AZURE_CLIENT_ID`; otherwise the
/// system-assigned identity is used.
pub struct IdentityClient {
    client: reqwest::Client,
    endpoint: String,
    client_id: Option<String>,
}

impl IdentityClient {
    pub fn new(endpoint: String, client_id: Option<String>) -> Self {
        IdentityClient {
            client: reqwest::Client::new(),
            endpoint,
            client_id,
        }
    }

    pub fn from_env() -> Self {
        let endpoint = std::env::var("IDENTITY_ENDPOINT")
            .unwrap_or_else(|_| DEFAULT_TOKEN_ENDPOINT.to_string());
        let client_id = std::env::var("AZURE_CLIENT_ID").ok();

        match &client_id {
            Some(id) => tracing::info!(client_id = %id, "using user-assigned managed identity"),
            None => tracing::info!("using system-assigned managed identity"),
        }

        IdentityClient::new(endpoint, client_id)
    }

    /// Get an access token for the given resource scope.
    pub async fn token(&self, resource: &str) -> Result<String, IdentityError> {
        let mut query = vec![("api-version", TOKEN_API_VERSION), ("resource", resource)];
        if let Some(id) = &self.client_id {
            query.push(("client_id", id));
        }

        let response = self
            .client
            .get(&self.endpoint)
            .header("Metadata", "true")
            .query(&query)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(IdentityError::TokenRequestFailed(status, body));
        }

        Ok(response.json::<TokenResponse>().await?.access_token)
    }
}
