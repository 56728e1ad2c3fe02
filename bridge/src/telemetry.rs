use crate::config::Config;
use crate::metrics_defs;
use serde::Deserialize;
use serde_json::Value;

/// Exceptions from the last hour, most recent first. Column order in the
/// response is not guaranteed, so rows are projected by column name.
const EXCEPTIONS_QUERY: &str = "\
exceptions \
| where timestamp >= ago(1h) \
| project timestamp, problemId, type, outerMessage, customDimensions \
| order by timestamp desc";

#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("telemetry query failed with status {0}: {1}")]
    QueryFailed(reqwest::StatusCode, String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// One reported exception instance. Built fresh on every query, never
/// persisted.
#[derive(Debug, Clone)]
pub struct ExceptionRecord {
    pub timestamp: String,
    pub problem_id: String,
    pub exception_type: String,
    pub message: String,
    pub custom_dimensions: Value,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    tables: Vec<Table>,
}

#[derive(Deserialize)]
struct Table {
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

#[derive(Deserialize)]
struct Column {
    name: String,
}

#[derive(Clone)]
pub struct TelemetryClient {
    client: reqwest::Client,
    base_url: String,
    app_id: String,
    api_key: String,
}

impl TelemetryClient {
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();

        TelemetryClient {
            client,
            base_url: config.appinsights_url.trim_end_matches('/').to_string(),
            app_id: config.appinsights_app_id.clone(),
            api_key: config.appinsights_api_key.clone(),
        }
    }

    /// Query recent exceptions, fail-open: a backend outage or malformed
    /// response yields an empty list rather than an error, so a telemetry
    /// blip never blocks the pass.
    pub async fn query_recent_exceptions(&self) -> Vec<ExceptionRecord> {
        match self.try_query().await {
            Ok(records) => {
                tracing::info!(count = records.len(), "telemetry query returned exceptions");
                records
            }
            Err(err) => {
                metrics::counter!(metrics_defs::TELEMETRY_FAILURES.name).increment(1);
                tracing::error!(error = %err, "telemetry query failed, treating as no exceptions");
                Vec::new()
            }
        }
    }

    async fn try_query(&self) -> Result<Vec<ExceptionRecord>, TelemetryError> {
        let url = format!("{}/v1/apps/{}/query", self.base_url, self.app_id);

        let response = self
            .client
            .post(&url)
            .header("X-Api-Key", &self.api_key)
            .json(&serde_json::json!({ "query": EXCEPTIONS_QUERY }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TelemetryError::QueryFailed(status, body));
        }

        let data: QueryResponse = response.json().await?;
        Ok(flatten(data))
    }
}

/// Project the tabular response into records, by column name. Rows missing
/// any required column are unusable and dropped; backend ordering is kept.
fn flatten(data: QueryResponse) -> Vec<ExceptionRecord> {
    let Some(table) = data.tables.into_iter().next() else {
        return Vec::new();
    };

    let index_of = |name: &str| table.columns.iter().position(|c| c.name == name);
    let (Some(ts), Some(pid), Some(ty), Some(msg), Some(dims)) = (
        index_of("timestamp"),
        index_of("problemId"),
        index_of("type"),
        index_of("outerMessage"),
        index_of("customDimensions"),
    ) else {
        tracing::warn!("telemetry response missing expected columns, dropping result");
        return Vec::new();
    };

    table
        .rows
        .into_iter()
        .filter_map(|row| {
            let text = |i: usize| row.get(i).and_then(Value::as_str).map(str::to_string);
            Some(ExceptionRecord {
                timestamp: text(ts)?,
                problem_id: text(pid)?,
                exception_type: text(ty)?,
                message: text(msg)?,
                custom_dimensions: row.get(dims).cloned().unwrap_or(Value::Null),
            })
        })
        .collect()
}
