use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use dealsync_core::config::{AppConfig, LoadOptions};
use secrecy::{ExposeSecret, SecretString};
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_key: &str| {
        field_source(key_path, Some(env_key), config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let entries: Vec<(&str, String, &str)> = vec![
        ("database.url", config.database.url.clone(), "DEALSYNC_DATABASE_URL"),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            "DEALSYNC_DATABASE_MAX_CONNECTIONS",
        ),
        (
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            "DEALSYNC_DATABASE_TIMEOUT_SECS",
        ),
        ("server.bind_address", config.server.bind_address.clone(), "DEALSYNC_SERVER_BIND_ADDRESS"),
        ("server.port", config.server.port.to_string(), "DEALSYNC_SERVER_PORT"),
        (
            "server.admin_token",
            redact_secret(config.server.admin_token.as_ref()),
            "DEALSYNC_SERVER_ADMIN_TOKEN",
        ),
        (
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs.to_string(),
            "DEALSYNC_SERVER_GRACEFUL_SHUTDOWN_SECS",
        ),
        ("crm.mode", format!("{:?}", config.crm.mode), "DEALSYNC_CRM_MODE"),
        ("crm.base_url", optional(config.crm.base_url.as_deref()), "DEALSYNC_CRM_BASE_URL"),
        (
            "crm.access_token",
            redact_secret(config.crm.access_token.as_ref()),
            "DEALSYNC_CRM_ACCESS_TOKEN",
        ),
        ("crm.timeout_secs", config.crm.timeout_secs.to_string(), "DEALSYNC_CRM_TIMEOUT_SECS"),
        (
            "crm.webhook_secret",
            redact_secret(config.crm.webhook_secret.as_ref()),
            "DEALSYNC_CRM_WEBHOOK_SECRET",
        ),
        (
            "payments.signing_secret",
            redact_secret(config.payments.signing_secret.as_ref()),
            "DEALSYNC_PAYMENTS_SIGNING_SECRET",
        ),
        (
            "payments.signature_tolerance_secs",
            config.payments.signature_tolerance_secs.to_string(),
            "DEALSYNC_PAYMENTS_SIGNATURE_TOLERANCE_SECS",
        ),
        (
            "esign.shared_secret",
            redact_secret(config.esign.shared_secret.as_ref()),
            "DEALSYNC_ESIGN_SHARED_SECRET",
        ),
        (
            "esign.final_document_type",
            config.esign.final_document_type.clone(),
            "DEALSYNC_ESIGN_FINAL_DOCUMENT_TYPE",
        ),
        (
            "esign.document_types",
            config.esign.document_types.join(","),
            "DEALSYNC_ESIGN_DOCUMENT_TYPES",
        ),
        (
            "practice.shared_secret",
            redact_secret(config.practice.shared_secret.as_ref()),
            "DEALSYNC_PRACTICE_SHARED_SECRET",
        ),
        ("automation.enabled", config.automation.enabled.to_string(), "DEALSYNC_AUTOMATION_ENABLED"),
        (
            "automation.rehearsal_mode",
            config.automation.rehearsal_mode.to_string(),
            "DEALSYNC_AUTOMATION_REHEARSAL_MODE",
        ),
        (
            "automation.base_url",
            optional(config.automation.base_url.as_deref()),
            "DEALSYNC_AUTOMATION_BASE_URL",
        ),
        (
            "automation.timeout_secs",
            config.automation.timeout_secs.to_string(),
            "DEALSYNC_AUTOMATION_TIMEOUT_SECS",
        ),
        (
            "sync_queue.max_attempts",
            config.sync_queue.max_attempts.to_string(),
            "DEALSYNC_SYNC_QUEUE_MAX_ATTEMPTS",
        ),
        (
            "sync_queue.retry_intervals_secs",
            config
                .sync_queue
                .retry_intervals_secs
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(","),
            "DEALSYNC_SYNC_QUEUE_RETRY_INTERVALS",
        ),
        (
            "sync_queue.poll_interval_ms",
            config.sync_queue.poll_interval_ms.to_string(),
            "DEALSYNC_SYNC_QUEUE_POLL_INTERVAL_MS",
        ),
        (
            "sync_queue.claim_timeout_secs",
            config.sync_queue.claim_timeout_secs.to_string(),
            "DEALSYNC_SYNC_QUEUE_CLAIM_TIMEOUT_SECS",
        ),
        ("logging.level", config.logging.level.clone(), "DEALSYNC_LOGGING_LEVEL"),
        ("logging.format", format!("{:?}", config.logging.format), "DEALSYNC_LOGGING_FORMAT"),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend(
        entries
            .into_iter()
            .map(|(key, value, env_key)| render_line(key, &value, source(key, env_key))),
    );
    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from("dealsync.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/dealsync.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn optional(value: Option<&str>) -> String {
    value.unwrap_or("<unset>").to_string()
}

fn redact_secret(secret: Option<&SecretString>) -> String {
    match secret.map(|secret| secret.expose_secret().trim()) {
        None => "<unset>".to_string(),
        Some("") => "<empty>".to_string(),
        Some(value) => match value.split_once('_') {
            Some((prefix, _)) if prefix.len() <= 6 => format!("{prefix}_***"),
            _ => "<redacted>".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::redact_secret;

    #[test]
    fn secrets_never_render_in_full() {
        assert_eq!(redact_secret(None), "<unset>");
        assert_eq!(redact_secret(Some(&SecretString::from("  ".to_string()))), "<empty>");
        assert_eq!(redact_secret(Some(&SecretString::from("whsec_abc123".to_string()))), "whsec_***");
        assert_eq!(
            redact_secret(Some(&SecretString::from("plain-long-secret".to_string()))),
            "<redacted>"
        );
    }
}
