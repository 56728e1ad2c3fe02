use crate::metrics_defs;
use crate::table::{StorageAccount, TableClient, TableEntity, TableError};
use chrono::DateTime;
use parking_lot::RwLock;
use serde::Serialize;
use std::time::Duration;

pub const TABLE_NAME: &str = "ExceptionTracking";
pub const PARTITION_KEY: &str = "exceptions";

const MARK_RETRIES: u32 = 3;

#[derive(thiserror::Error, Debug)]
pub enum DedupError {
    #[error("unusable timestamp {0:?}: {1}")]
    BadTimestamp(String, chrono::ParseError),
    #[error("could not establish table connection after retries")]
    ConnectionFailed,
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Durable proof that an exception was already ticketed. One row per
/// truncated-second row key; rewritten wholesale on upsert.
#[derive(Serialize, Debug)]
pub struct ProcessedMarker {
    #[serde(rename = "PartitionKey")]
    pub partition_key: String,
    #[serde(rename = "RowKey")]
    pub row_key: String,
    #[serde(rename = "JiraKey")]
    pub jira_key: String,
    #[serde(rename = "ProcessedTime")]
    pub processed_time: String,
    #[serde(rename = "OriginalProblemId")]
    pub original_problem_id: String,
    #[serde(rename = "OriginalTimestamp")]
    pub original_timestamp: String,
}

impl TableEntity for ProcessedMarker {
    fn partition_key(&self) -> &str {
        &self.partition_key
    }
    fn row_key(&self) -> &str {
        &self.row_key
    }
}

/// Dedup key: the exception timestamp truncated to whole seconds. Two
/// exceptions within the same second collide by design.
pub fn row_key(timestamp: &str) -> Result<String, DedupError> {
    let parsed = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| DedupError::BadTimestamp(timestamp.to_string(), e))?;
    Ok(sanitize_key(&parsed.format("%Y%m%d%H%M%S").to_string()))
}

/// Clamp a key to the table service's rules: no slashes, no leading dots,
/// bounded length, never empty.
pub fn sanitize_key(key: &str) -> String {
    let cleaned = key.replace(['/', '\\'], "_");
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        return "unknown".to_string();
    }

    if cleaned.len() > 1000 {
        cleaned.chars().take(250).collect()
    } else {
        cleaned.to_string()
    }
}

/// Seen-set over the durable table, with a process-wide cached connection
/// handle that is liveness-probed before reuse and replaced when stale.
/// Reads and writes are both fail-open: an outage must not block ticket
/// creation, at the accepted risk of one duplicate ticket.
pub struct DedupStore {
    account: StorageAccount,
    handle: RwLock<Option<TableClient>>,
    max_retries: u32,
    retry_delay: Duration,
    request_timeout: Duration,
}

impl DedupStore {
    pub fn new(
        account: StorageAccount,
        max_retries: u32,
        retry_delay: Duration,
        request_timeout: Duration,
    ) -> Self {
        DedupStore {
            account,
            handle: RwLock::new(None),
            max_retries,
            retry_delay,
            request_timeout,
        }
    }

    /// True iff a marker already exists for this timestamp's row key.
    /// Store unavailability reads as "not processed".
    pub async fn is_processed(&self, timestamp: &str) -> bool {
        match self.check_processed(timestamp).await {
            Ok(processed) => processed,
            Err(err) => {
                metrics::counter!(metrics_defs::STORE_FAILURES.name).increment(1);
                tracing::error!(
                    timestamp,
                    error = %err,
                    "could not check processed status, treating as not processed"
                );
                false
            }
        }
    }

    async fn check_processed(&self, timestamp: &str) -> Result<bool, DedupError> {
        let key = row_key(timestamp)?;
        let client = self.table_client().await?;

        let rows = match client
            .query_entities(&format!("RowKey eq '{key}'"))
            .await
        {
            Ok(rows) => rows,
            // Table vanished between probe and query: nothing is marked yet.
            Err(TableError::TableNotFound) => {
                let _ = client.create_table().await;
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        };

        if rows.is_empty() {
            tracing::debug!(timestamp, "no existing marker for timestamp");
            Ok(false)
        } else {
            tracing::info!(timestamp, "found existing marker for timestamp");
            Ok(true)
        }
    }

    /// Record that an exception was ticketed. Retries table recreation on
    /// a missing table; after the retry budget the marker is dropped and
    /// logged, accepting one possible future duplicate.
    pub async fn mark_processed(&self, problem_id: &str, timestamp: &str, jira_key: &str) {
        let key = match row_key(timestamp) {
            Ok(key) => key,
            Err(err) => {
                tracing::error!(timestamp, error = %err, "cannot mark exception as processed");
                return;
            }
        };

        let client = match self.table_client().await {
            Ok(client) => client,
            Err(err) => {
                tracing::error!(error = %err, "cannot mark exception as processed");
                return;
            }
        };

        let marker = ProcessedMarker {
            partition_key: PARTITION_KEY.to_string(),
            row_key: key,
            jira_key: jira_key.to_string(),
            processed_time: chrono::Utc::now().to_rfc3339(),
            original_problem_id: problem_id.to_string(),
            original_timestamp: timestamp.to_string(),
        };

        for attempt in 1..=MARK_RETRIES {
            match client.upsert_entity(&marker).await {
                Ok(()) => {
                    tracing::info!(timestamp, jira_key, "marked exception as processed");
                    return;
                }
                Err(TableError::TableNotFound) => {
                    tracing::warn!("table not found while marking, recreating");
                    if let Err(err) = client.create_table().await {
                        tracing::error!(error = %err, "table recreation failed");
                    }
                }
                Err(err) => {
                    tracing::error!(attempt, error = %err, "error upserting marker");
                }
            }
        }

        metrics::counter!(metrics_defs::MARK_FAILURES.name).increment(1);
        tracing::error!(timestamp, "failed to mark exception as processed after retries");
    }

    /// Get a live table handle: reuse the cached one when its probe passes,
    /// otherwise reconnect and lazily create the table. Worst case under
    /// races is a redundant reconnect, never corruption.
    async fn table_client(&self) -> Result<TableClient, DedupError> {
        for attempt in 1..=self.max_retries {
            let cached = self.handle.read().clone();
            if let Some(client) = cached {
                match client.probe().await {
                    Ok(()) => return Ok(client),
                    Err(err) => {
                        tracing::warn!(error = %err, "cached table handle failed probe, reconnecting");
                        *self.handle.write() = None;
                    }
                }
            }

            let client = TableClient::new(self.account.clone(), TABLE_NAME, self.request_timeout);
            match client.create_table().await {
                Ok(()) => {
                    *self.handle.write() = Some(client.clone());
                    return Ok(client);
                }
                Err(err) => {
                    tracing::error!(
                        attempt,
                        max_retries = self.max_retries,
                        error = %err,
                        "table connection attempt failed"
                    );
                    if attempt < self.max_retries {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        Err(DedupError::ConnectionFailed)
    }
}
