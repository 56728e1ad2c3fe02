use crate::vault::{VaultClient, VaultError};
use std::collections::HashMap;

/// Secrets the service cannot run without. Vault names use dashes; the
/// matching environment variable replaces them with underscores.
pub const REQUIRED_SECRETS: &[&str] = &[
    "APPINSIGHTS-APP-ID",
    "APPINSIGHTS-API-KEY",
    "JIRA-EMAIL",
    "JIRA-TOKEN",
    "JIRA-URL",
    "JIRA-PROJECT",
    "AZURE-CONNECTION-STRING",
];

#[derive(thiserror::Error, Debug)]
pub enum SecretsError {
    #[error("missing required secrets: {}", .0.join(", "))]
    SecretsMissing(Vec<String>),
    #[error(transparent)]
    Vault(#[from] VaultError),
}

pub fn env_name(secret_name: &str) -> String {
    secret_name.replace('-', "_")
}

/// Resolve the full required set, keyed by environment-variable name.
pub async fn resolve(vault: &VaultClient) -> Result<HashMap<String, String>, SecretsError> {
    resolve_names(REQUIRED_SECRETS, vault).await
}

/// Resolve each named secret, preferring the environment and falling back to
/// the vault. A secret absent from both sides lands in the missing list; the
/// whole set must resolve or resolution fails naming every gap.
pub async fn resolve_names(
    names: &[&str],
    vault: &VaultClient,
) -> Result<HashMap<String, String>, SecretsError> {
    let mut resolved = HashMap::new();
    let mut to_fetch = Vec::new();

    for name in names {
        let env = env_name(name);
        match std::env::var(&env) {
            Ok(value) if !value.is_empty() => {
                tracing::info!(secret = *name, "found secret in environment");
                resolved.insert(env, value);
            }
            _ => to_fetch.push(*name),
        }
    }

    if !to_fetch.is_empty() {
        tracing::info!(count = to_fetch.len(), "fetching missing secrets from vault");
    }

    let mut missing = Vec::new();
    for name in to_fetch {
        match vault.get_secret(name).await {
            Ok(value) => {
                tracing::info!(secret = name, "retrieved secret from vault");
                resolved.insert(env_name(name), value);
            }
            Err(VaultError::NotFound(_)) => {
                tracing::error!(secret = name, "secret not found in vault");
                missing.push(name.to_string());
            }
            Err(err) => {
                tracing::error!(secret = name, error = %err, "error retrieving secret");
                missing.push(name.to_string());
            }
        }
    }

    if !missing.is_empty() {
        return Err(SecretsError::SecretsMissing(missing));
    }

    Ok(resolved)
}

/// Publish resolved secrets into the process environment for downstream
/// config reads. Values already present are never overwritten. Must run
/// before request handling starts; no other thread may be reading the
/// environment concurrently.
pub fn export_to_env(secrets: &HashMap<String, String>) {
    for (name, value) in secrets {
        if std::env::var(name).is_err() {
            unsafe { std::env::set_var(name, value) };
        }
    }
}
