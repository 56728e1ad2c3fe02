use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

const ODATA_VERSION: &str = "2019-02-02";
const DEFAULT_ENDPOINT_SUFFIX: &str = "core.windows.net";

#[derive(thiserror::Error, Debug)]
pub enum TableError {
    #[error("invalid connection string: {0}")]
    ConnectionString(String),
    #[error("table not found")]
    TableNotFound,
    #[error("table request failed with status {0}: {1}")]
    RequestFailed(StatusCode, String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Parsed storage-account settings for the table service.
#[derive(Clone, Debug)]
pub struct StorageAccount {
    pub name: String,
    key: Vec<u8>,
    pub endpoint: String,
}

/// Parse a `Key=Value;Key=Value` connection string. `AccountName` and
/// `AccountKey` are required; `TableEndpoint` overrides the derived endpoint
/// so tests and emulators can point elsewhere.
pub fn parse_connection_string(raw: &str) -> Result<StorageAccount, TableError> {
    let mut name = None;
    let mut key = None;
    let mut endpoint = None;
    let mut suffix = DEFAULT_ENDPOINT_SUFFIX.to_string();

    for pair in raw.split(';').filter(|p| !p.is_empty()) {
        let Some((field, value)) = pair.split_once('=') else {
            return Err(TableError::ConnectionString(format!(
                "malformed segment: {pair}"
            )));
        };
        match field.trim() {
            "AccountName" => name = Some(value.to_string()),
            // Account keys are base64 and may themselves contain '='.
            "AccountKey" => key = Some(value.to_string()),
            "TableEndpoint" => endpoint = Some(value.trim_end_matches('/').to_string()),
            "EndpointSuffix" => suffix = value.to_string(),
            _ => {}
        }
    }

    let name = name.ok_or_else(|| TableError::ConnectionString("missing AccountName".into()))?;
    let key = key.ok_or_else(|| TableError::ConnectionString("missing AccountKey".into()))?;
    let key = BASE64
        .decode(&key)
        .map_err(|e| TableError::ConnectionString(format!("AccountKey is not base64: {e}")))?;
    let endpoint = endpoint.unwrap_or_else(|| format!("https://{name}.table.{suffix}"));

    Ok(StorageAccount {
        name,
        key,
        endpoint,
    })
}

/// Minimal REST client for one table in the durable table service, using
/// SharedKeyLite request signing.
#[derive(Clone)]
pub struct TableClient {
    client: reqwest::Client,
    account: StorageAccount,
    table: String,
}

impl TableClient {
    pub fn new(account: StorageAccount, table: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        TableClient {
            client,
            account,
            table: table.to_string(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// SharedKeyLite for the table service signs only the date and the
    /// canonicalized resource.
    fn sign(&self, date: &str, resource: &str) -> String {
        let string_to_sign = format!("{date}\n/{}/{resource}", self.account.name);
        let mut mac = HmacSha256::new_from_slice(&self.account.key)
            .expect("HMAC can take key of any size");
        mac.update(string_to_sign.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    fn signed_request(&self, method: reqwest::Method, resource: &str) -> reqwest::RequestBuilder {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let signature = self.sign(&date, resource);

        self.client
            .request(method, format!("{}/{resource}", self.account.endpoint))
            .header(
                "Authorization",
                format!("SharedKeyLite {}:{signature}", self.account.name),
            )
            .header("x-ms-date", date)
            .header("x-ms-version", ODATA_VERSION)
            .header("Accept", "application/json;odata=nometadata")
    }

    /// Create the table. Creation is idempotent: "already exists" is
    /// success.
    pub async fn create_table(&self) -> Result<(), TableError> {
        let response = self
            .signed_request(reqwest::Method::POST, "Tables")
            .json(&serde_json::json!({ "TableName": self.table }))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                tracing::info!(table = %self.table, "created table");
                Ok(())
            }
            StatusCode::CONFLICT => {
                tracing::debug!(table = %self.table, "table already exists");
                Ok(())
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(TableError::RequestFailed(status, body))
            }
        }
    }

    /// Query entities matching an OData filter.
    pub async fn query_entities(&self, filter: &str) -> Result<Vec<Value>, TableError> {
        let response = self
            .signed_request(reqwest::Method::GET, &format!("{}()", self.table))
            .query(&[("$filter", filter)])
            .send()
            .await?;

        let entities: QueryResult = Self::read_json(response).await?;
        Ok(entities.value)
    }

    /// Insert-or-replace one entity, keyed by its partition and row keys.
    pub async fn upsert_entity<E: Serialize + TableEntity>(
        &self,
        entity: &E,
    ) -> Result<(), TableError> {
        let resource = format!(
            "{}(PartitionKey='{}',RowKey='{}')",
            self.table,
            entity.partition_key(),
            entity.row_key()
        );

        let response = self
            .signed_request(reqwest::Method::PUT, &resource)
            .json(entity)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(TableError::TableNotFound),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(TableError::RequestFailed(status, body))
            }
        }
    }

    /// Cheap liveness check for a cached handle: list at most one row.
    pub async fn probe(&self) -> Result<(), TableError> {
        let response = self
            .signed_request(reqwest::Method::GET, &format!("{}()", self.table))
            .query(&[("$top", "1"), ("$select", "PartitionKey")])
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(TableError::TableNotFound),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(TableError::RequestFailed(status, body))
            }
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TableError> {
        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(TableError::TableNotFound),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(TableError::RequestFailed(status, body))
            }
        }
    }
}

/// Keys identifying an entity within its table.
pub trait TableEntity {
    fn partition_key(&self) -> &str;
    fn row_key(&self) -> &str;
}

#[derive(serde::Deserialize)]
struct QueryResult {
    #[serde(default)]
    value: Vec<Value>,
}
