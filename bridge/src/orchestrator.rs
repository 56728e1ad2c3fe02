use crate::dedup::DedupStore;
use crate::jira::{DEFAULT_ISSUE_TYPE, JiraClient, JiraError};
use crate::metrics_defs;
use crate::telemetry::{ExceptionRecord, TelemetryClient};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

/// Where exception records come from.
#[async_trait]
pub trait ExceptionSource: Send + Sync {
    async fn recent_exceptions(&self) -> Vec<ExceptionRecord>;
}

/// Where tickets go.
#[async_trait]
pub trait TicketSink: Send + Sync {
    async fn create_ticket(&self, summary: &str, description: &str) -> Result<String, JiraError>;
}

/// The seen-set deciding which exceptions were already ticketed.
#[async_trait]
pub trait ProcessedLedger: Send + Sync {
    async fn is_processed(&self, timestamp: &str) -> bool;
    async fn mark_processed(&self, problem_id: &str, timestamp: &str, ticket_key: &str);
}

#[async_trait]
impl ExceptionSource for TelemetryClient {
    async fn recent_exceptions(&self) -> Vec<ExceptionRecord> {
        self.query_recent_exceptions().await
    }
}

#[async_trait]
impl TicketSink for JiraClient {
    async fn create_ticket(&self, summary: &str, description: &str) -> Result<String, JiraError> {
        JiraClient::create_ticket(self, summary, description, DEFAULT_ISSUE_TYPE).await
    }
}

#[async_trait]
impl ProcessedLedger for DedupStore {
    async fn is_processed(&self, timestamp: &str) -> bool {
        DedupStore::is_processed(self, timestamp).await
    }

    async fn mark_processed(&self, problem_id: &str, timestamp: &str, ticket_key: &str) {
        DedupStore::mark_processed(self, problem_id, timestamp, ticket_key).await
    }
}

/// Aggregate counts for one pass. Ticket failures land in neither bucket,
/// so `tickets_created + skipped <= total_exceptions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total_exceptions: usize,
    pub tickets_created: usize,
    pub skipped: usize,
}

/// Runs one pass: fetch recent exceptions, skip the already-ticketed ones,
/// file a ticket for the rest, and record a marker per success. Strictly
/// sequential; one record's failure never aborts the pass.
pub struct Orchestrator {
    source: Arc<dyn ExceptionSource>,
    tickets: Arc<dyn TicketSink>,
    ledger: Arc<dyn ProcessedLedger>,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn ExceptionSource>,
        tickets: Arc<dyn TicketSink>,
        ledger: Arc<dyn ProcessedLedger>,
    ) -> Self {
        Orchestrator {
            source,
            tickets,
            ledger,
        }
    }

    pub async fn run_pass(&self) -> Summary {
        let exceptions = self.source.recent_exceptions().await;
        tracing::info!(count = exceptions.len(), "starting pass");

        let mut created = 0;
        let mut skipped = 0;

        for record in &exceptions {
            if self.ledger.is_processed(&record.timestamp).await {
                tracing::info!(problem_id = %record.problem_id, "skipping processed exception");
                metrics::counter!(metrics_defs::TICKETS_SKIPPED.name).increment(1);
                skipped += 1;
                continue;
            }

            let summary = format!("Exception {} at {}", record.problem_id, record.timestamp);
            let description = render_description(record);

            match self.tickets.create_ticket(&summary, &description).await {
                Ok(key) => {
                    self.ledger
                        .mark_processed(&record.problem_id, &record.timestamp, &key)
                        .await;
                    metrics::counter!(metrics_defs::TICKETS_CREATED.name).increment(1);
                    tracing::info!(
                        ticket = %key,
                        problem_id = %record.problem_id,
                        "created ticket for exception"
                    );
                    created += 1;
                }
                Err(err) => {
                    metrics::counter!(metrics_defs::TICKET_FAILURES.name).increment(1);
                    tracing::error!(
                        problem_id = %record.problem_id,
                        error = %err,
                        "error processing exception, continuing"
                    );
                }
            }
        }

        metrics::counter!(metrics_defs::PASS_RUNS.name).increment(1);
        Summary {
            total_exceptions: exceptions.len(),
            tickets_created: created,
            skipped,
        }
    }
}

fn render_description(record: &ExceptionRecord) -> String {
    let dimensions = serde_json::to_string_pretty(&record.custom_dimensions)
        .unwrap_or_else(|_| record.custom_dimensions.to_string());

    format!(
        "Exception Details:\n\
         -----------------\n\
         Problem ID: {}\n\
         Timestamp: {}\n\
         Type: {}\n\
         \n\
         Message:\n\
         {}\n\
         \n\
         Custom Dimensions:\n\
         {}\n\
         \n\
         *Created by automatic exception tracking*",
        record.problem_id, record.timestamp, record.exception_type, record.message, dimensions
    )
}

#[cfg(test)]
pub(crate) mod testutils {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Default)]
    pub struct FakeSource {
        pub records: Vec<ExceptionRecord>,
    }

    #[async_trait]
    impl ExceptionSource for FakeSource {
        async fn recent_exceptions(&self) -> Vec<ExceptionRecord> {
            self.records.clone()
        }
    }

    /// Records created tickets; fails for problem ids in `fail_for`.
    #[derive(Default)]
    pub struct FakeTickets {
        pub created: Mutex<Vec<(String, String)>>,
        pub fail_for: Vec<String>,
    }

    #[async_trait]
    impl TicketSink for FakeTickets {
        async fn create_ticket(
            &self,
            summary: &str,
            description: &str,
        ) -> Result<String, JiraError> {
            if self.fail_for.iter().any(|p| summary.contains(p.as_str())) {
                return Err(JiraError::CreationFailed(
                    reqwest::StatusCode::BAD_REQUEST,
                    "rejected".to_string(),
                ));
            }
            let mut created = self.created.lock();
            created.push((summary.to_string(), description.to_string()));
            Ok(format!("OPS-{}", created.len()))
        }
    }

    /// In-memory ledger keyed exactly like the real store.
    #[derive(Default)]
    pub struct FakeLedger {
        pub marked: Mutex<HashSet<String>>,
        pub markers: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl ProcessedLedger for FakeLedger {
        async fn is_processed(&self, timestamp: &str) -> bool {
            match crate::dedup::row_key(timestamp) {
                Ok(key) => self.marked.lock().contains(&key),
                Err(_) => false,
            }
        }

        async fn mark_processed(&self, problem_id: &str, timestamp: &str, ticket_key: &str) {
            if let Ok(key) = crate::dedup::row_key(timestamp) {
                self.marked.lock().insert(key.clone());
                self.markers.lock().push((
                    key,
                    problem_id.to_string(),
                    ticket_key.to_string(),
                ));
            }
        }
    }

    pub fn record(problem_id: &str, timestamp: &str) -> ExceptionRecord {
        ExceptionRecord {
            timestamp: timestamp.to_string(),
            problem_id: problem_id.to_string(),
            exception_type: "NullReferenceException".to_string(),
            message: "object reference not set".to_string(),
            custom_dimensions: serde_json::json!({"environment": "prod"}),
        }
    }
}
