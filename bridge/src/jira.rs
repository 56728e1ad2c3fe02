use crate::config::Config;
use serde::Deserialize;

pub const DEFAULT_ISSUE_TYPE: &str = "Bug";

#[derive(thiserror::Error, Debug)]
pub enum JiraError {
    #[error("ticket creation failed with status {0}: {1}")]
    CreationFailed(reqwest::StatusCode, String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

#[derive(Deserialize)]
struct CreatedIssue {
    key: String,
}

/// Issue-tracker client. No retry at this layer; a failed creation is the
/// orchestrator's problem and the dedup store keeps re-runs from
/// double-filing.
#[derive(Clone)]
pub struct JiraClient {
    client: reqwest::Client,
    base_url: String,
    email: String,
    token: String,
    project: String,
}

impl JiraClient {
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();

        JiraClient {
            client,
            base_url: config.jira_url.trim_end_matches('/').to_string(),
            email: config.jira_email.clone(),
            token: config.jira_token.clone(),
            project: config.jira_project.clone(),
        }
    }

    /// Create one ticket and return its key. Any non-2xx response fails
    /// with the remote body attached.
    pub async fn create_ticket(
        &self,
        summary: &str,
        description: &str,
        issue_type: &str,
    ) -> Result<String, JiraError> {
        let payload = serde_json::json!({
            "fields": {
                "project": { "key": self.project },
                "summary": summary,
                "description": description,
                "issuetype": { "name": issue_type }
            }
        });

        let response = self
            .client
            .post(format!("{}/rest/api/2/issue", self.base_url))
            .basic_auth(&self.email, Some(&self.token))
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(JiraError::CreationFailed(status, body));
        }

        Ok(response.json::<CreatedIssue>().await?.key)
    }
}
