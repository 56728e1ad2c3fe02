//! Exception-to-ticket bridge: polls a telemetry backend for recent
//! application exceptions and files issue-tracker tickets for the ones not
//! seen before, using a durable table as the seen-set.

pub mod api;
pub mod config;
pub mod dedup;
pub mod identity;
pub mod jira;
pub mod metrics_defs;
pub mod orchestrator;
pub mod secrets;
pub mod table;
pub mod telemetry;
pub mod vault;
