use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 1;
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_APPINSIGHTS_URL: &str = "https://api.applicationinsights.io";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {0}: {1}")]
    InvalidVar(&'static str, String),
}

/// Runtime settings, read from the environment after secret resolution has
/// populated it. Required values come from the vault or the environment;
/// the rest carry fixed defaults.
#[derive(Clone, Debug)]
pub struct Config {
    pub jira_url: String,
    pub jira_email: String,
    pub jira_token: String,
    pub jira_project: String,
    pub connection_string: String,
    pub appinsights_app_id: String,
    pub appinsights_api_key: String,
    pub appinsights_url: String,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Config {
            jira_url: required("JIRA_URL")?,
            jira_email: required("JIRA_EMAIL")?,
            jira_token: required("JIRA_TOKEN")?,
            jira_project: required("JIRA_PROJECT")?,
            connection_string: required("AZURE_CONNECTION_STRING")?,
            appinsights_app_id: required("APPINSIGHTS_APP_ID")?,
            appinsights_api_key: required("APPINSIGHTS_API_KEY")?,
            appinsights_url: std::env::var("APPINSIGHTS_URL")
                .unwrap_or_else(|_| DEFAULT_APPINSIGHTS_URL.to_string()),
            request_timeout: Duration::from_secs(parse_or(
                "REQUEST_TIMEOUT",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?),
            max_retries: parse_or("MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            retry_delay: Duration::from_secs(parse_or("RETRY_DELAY", DEFAULT_RETRY_DELAY_SECS)?),
            port: parse_or("PORT", DEFAULT_PORT)?,
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::MissingVar(name)),
    }
}

fn parse_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidVar(name, value)),
        Err(_) => Ok(default),
    }
}
