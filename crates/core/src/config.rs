use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::DispatchSettings;
use crate::ingest::GatewaySettings;
use crate::reconcile::HandlerSettings;
use crate::sync_queue::SyncQueueConfig;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub crm: CrmConfig,
    pub payments: PaymentsConfig,
    pub esign: ESignConfig,
    pub practice: PracticeConfig,
    pub automation: AutomationConfig,
    pub sync_queue: SyncQueueSettings,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Bearer token for the recovery and queue inspection endpoints. Unset disables them.
    pub admin_token: Option<SecretString>,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct CrmConfig {
    pub mode: CrmMode,
    pub base_url: Option<String>,
    pub access_token: Option<SecretString>,
    pub timeout_secs: u64,
    pub webhook_secret: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct PaymentsConfig {
    pub signing_secret: Option<SecretString>,
    pub signature_tolerance_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ESignConfig {
    pub shared_secret: Option<SecretString>,
    pub final_document_type: String,
    /// Document types whose envelope ids are stored on the deal; used for CRM lookups.
    pub document_types: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct PracticeConfig {
    pub shared_secret: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct AutomationConfig {
    pub enabled: bool,
    pub rehearsal_mode: bool,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct SyncQueueSettings {
    pub max_attempts: u32,
    pub retry_intervals_secs: Vec<u64>,
    pub poll_interval_ms: u64,
    pub claim_timeout_secs: u64,
    pub batch_size: u32,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Where deals live. `local` keeps them in the SQLite mirror.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrmMode {
    Local,
    Http,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub server_port: Option<u16>,
    pub crm_mode: Option<CrmMode>,
    pub automation_enabled: Option<bool>,
    pub rehearsal_mode: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        let queue = SyncQueueConfig::default();
        Self {
            database: DatabaseConfig {
                url: "sqlite://dealsync.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                admin_token: None,
                graceful_shutdown_secs: 15,
            },
            crm: CrmConfig {
                mode: CrmMode::Local,
                base_url: None,
                access_token: None,
                timeout_secs: 10,
                webhook_secret: None,
            },
            payments: PaymentsConfig { signing_secret: None, signature_tolerance_secs: 300 },
            esign: ESignConfig {
                shared_secret: None,
                final_document_type: HandlerSettings::default().final_document_type,
                document_types: vec![
                    "engagement".to_string(),
                    HandlerSettings::default().final_document_type,
                ],
            },
            practice: PracticeConfig { shared_secret: None },
            automation: AutomationConfig {
                enabled: true,
                rehearsal_mode: true,
                base_url: None,
                timeout_secs: 120,
            },
            sync_queue: SyncQueueSettings {
                max_attempts: queue.max_attempts,
                retry_intervals_secs: queue.retry_intervals_secs,
                poll_interval_ms: 500,
                claim_timeout_secs: 300,
                batch_size: 50,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for CrmMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "http" => Ok(Self::Http),
            other => Err(ConfigError::Validation(format!(
                "unsupported crm mode `{other}` (expected local|http)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("dealsync.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            payments_signing_secret: self.payments.signing_secret.clone(),
            signature_tolerance_secs: self.payments.signature_tolerance_secs,
            esign_secret: self.esign.shared_secret.clone(),
            practice_secret: self.practice.shared_secret.clone(),
            crm_secret: self.crm.webhook_secret.clone(),
        }
    }

    pub fn sync_queue_config(&self) -> SyncQueueConfig {
        SyncQueueConfig {
            max_attempts: self.sync_queue.max_attempts,
            retry_intervals_secs: self.sync_queue.retry_intervals_secs.clone(),
            claim_timeout_seconds: i64::try_from(self.sync_queue.claim_timeout_secs)
                .unwrap_or(i64::MAX),
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            enabled: self.automation.enabled,
            rehearsal_mode: self.automation.rehearsal_mode,
        }
    }

    pub fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings { final_document_type: self.esign.final_document_type.clone() }
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(admin_token) = server.admin_token {
                self.server.admin_token = Some(secret_value(admin_token));
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(crm) = patch.crm {
            if let Some(mode) = crm.mode {
                self.crm.mode = mode;
            }
            if let Some(base_url) = crm.base_url {
                self.crm.base_url = Some(base_url);
            }
            if let Some(access_token) = crm.access_token {
                self.crm.access_token = Some(secret_value(access_token));
            }
            if let Some(timeout_secs) = crm.timeout_secs {
                self.crm.timeout_secs = timeout_secs;
            }
            if let Some(webhook_secret) = crm.webhook_secret {
                self.crm.webhook_secret = Some(secret_value(webhook_secret));
            }
        }

        if let Some(payments) = patch.payments {
            if let Some(signing_secret) = payments.signing_secret {
                self.payments.signing_secret = Some(secret_value(signing_secret));
            }
            if let Some(tolerance) = payments.signature_tolerance_secs {
                self.payments.signature_tolerance_secs = tolerance;
            }
        }

        if let Some(esign) = patch.esign {
            if let Some(shared_secret) = esign.shared_secret {
                self.esign.shared_secret = Some(secret_value(shared_secret));
            }
            if let Some(final_document_type) = esign.final_document_type {
                self.esign.final_document_type = final_document_type;
            }
            if let Some(document_types) = esign.document_types {
                self.esign.document_types = document_types;
            }
        }

        if let Some(practice) = patch.practice {
            if let Some(shared_secret) = practice.shared_secret {
                self.practice.shared_secret = Some(secret_value(shared_secret));
            }
        }

        if let Some(automation) = patch.automation {
            if let Some(enabled) = automation.enabled {
                self.automation.enabled = enabled;
            }
            if let Some(rehearsal_mode) = automation.rehearsal_mode {
                self.automation.rehearsal_mode = rehearsal_mode;
            }
            if let Some(base_url) = automation.base_url {
                self.automation.base_url = Some(base_url);
            }
            if let Some(timeout_secs) = automation.timeout_secs {
                self.automation.timeout_secs = timeout_secs;
            }
        }

        if let Some(queue) = patch.sync_queue {
            if let Some(max_attempts) = queue.max_attempts {
                self.sync_queue.max_attempts = max_attempts;
            }
            if let Some(retry_intervals_secs) = queue.retry_intervals_secs {
                self.sync_queue.retry_intervals_secs = retry_intervals_secs;
            }
            if let Some(poll_interval_ms) = queue.poll_interval_ms {
                self.sync_queue.poll_interval_ms = poll_interval_ms;
            }
            if let Some(claim_timeout_secs) = queue.claim_timeout_secs {
                self.sync_queue.claim_timeout_secs = claim_timeout_secs;
            }
            if let Some(batch_size) = queue.batch_size {
                self.sync_queue.batch_size = batch_size;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("DEALSYNC_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("DEALSYNC_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("DEALSYNC_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("DEALSYNC_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("DEALSYNC_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("DEALSYNC_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("DEALSYNC_SERVER_PORT") {
            self.server.port = parse_u16("DEALSYNC_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("DEALSYNC_SERVER_ADMIN_TOKEN") {
            self.server.admin_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("DEALSYNC_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("DEALSYNC_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("DEALSYNC_CRM_MODE") {
            self.crm.mode = value.parse()?;
        }
        if let Some(value) = read_env("DEALSYNC_CRM_BASE_URL") {
            self.crm.base_url = Some(value);
        }
        if let Some(value) = read_env("DEALSYNC_CRM_ACCESS_TOKEN") {
            self.crm.access_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("DEALSYNC_CRM_TIMEOUT_SECS") {
            self.crm.timeout_secs = parse_u64("DEALSYNC_CRM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("DEALSYNC_CRM_WEBHOOK_SECRET") {
            self.crm.webhook_secret = Some(secret_value(value));
        }

        if let Some(value) = read_env("DEALSYNC_PAYMENTS_SIGNING_SECRET") {
            self.payments.signing_secret = Some(secret_value(value));
        }
        if let Some(value) = read_env("DEALSYNC_PAYMENTS_SIGNATURE_TOLERANCE_SECS") {
            self.payments.signature_tolerance_secs =
                parse_u64("DEALSYNC_PAYMENTS_SIGNATURE_TOLERANCE_SECS", &value)?;
        }

        if let Some(value) = read_env("DEALSYNC_ESIGN_SHARED_SECRET") {
            self.esign.shared_secret = Some(secret_value(value));
        }
        if let Some(value) = read_env("DEALSYNC_ESIGN_FINAL_DOCUMENT_TYPE") {
            self.esign.final_document_type = value;
        }
        if let Some(value) = read_env("DEALSYNC_ESIGN_DOCUMENT_TYPES") {
            self.esign.document_types = value
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = read_env("DEALSYNC_PRACTICE_SHARED_SECRET") {
            self.practice.shared_secret = Some(secret_value(value));
        }

        if let Some(value) = read_env("DEALSYNC_AUTOMATION_ENABLED") {
            self.automation.enabled = parse_bool("DEALSYNC_AUTOMATION_ENABLED", &value)?;
        }
        if let Some(value) = read_env("DEALSYNC_AUTOMATION_REHEARSAL_MODE") {
            self.automation.rehearsal_mode =
                parse_bool("DEALSYNC_AUTOMATION_REHEARSAL_MODE", &value)?;
        }
        if let Some(value) = read_env("DEALSYNC_AUTOMATION_BASE_URL") {
            self.automation.base_url = Some(value);
        }
        if let Some(value) = read_env("DEALSYNC_AUTOMATION_TIMEOUT_SECS") {
            self.automation.timeout_secs = parse_u64("DEALSYNC_AUTOMATION_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("DEALSYNC_SYNC_QUEUE_MAX_ATTEMPTS") {
            self.sync_queue.max_attempts = parse_u32("DEALSYNC_SYNC_QUEUE_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("DEALSYNC_SYNC_QUEUE_RETRY_INTERVALS") {
            self.sync_queue.retry_intervals_secs =
                parse_intervals("DEALSYNC_SYNC_QUEUE_RETRY_INTERVALS", &value)?;
        }
        if let Some(value) = read_env("DEALSYNC_SYNC_QUEUE_POLL_INTERVAL_MS") {
            self.sync_queue.poll_interval_ms =
                parse_u64("DEALSYNC_SYNC_QUEUE_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = read_env("DEALSYNC_SYNC_QUEUE_CLAIM_TIMEOUT_SECS") {
            self.sync_queue.claim_timeout_secs =
                parse_u64("DEALSYNC_SYNC_QUEUE_CLAIM_TIMEOUT_SECS", &value)?;
        }

        let log_level =
            read_env("DEALSYNC_LOGGING_LEVEL").or_else(|| read_env("DEALSYNC_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("DEALSYNC_LOGGING_FORMAT").or_else(|| read_env("DEALSYNC_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(mode) = overrides.crm_mode {
            self.crm.mode = mode;
        }
        if let Some(enabled) = overrides.automation_enabled {
            self.automation.enabled = enabled;
        }
        if let Some(rehearsal_mode) = overrides.rehearsal_mode {
            self.automation.rehearsal_mode = rehearsal_mode;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_crm(&self.crm)?;
        validate_payments(&self.payments)?;
        validate_automation(&self.automation)?;
        validate_sync_queue(&self.sync_queue)?;
        validate_logging(&self.logging)?;
        Ok(())
    }

    /// Webhook sources that will reject every delivery because no secret is set.
    pub fn unconfigured_webhook_sources(&self) -> Vec<&'static str> {
        let is_missing = |secret: &Option<SecretString>| {
            secret.as_ref().map(|value| value.expose_secret().trim().is_empty()).unwrap_or(true)
        };
        let mut missing = Vec::new();
        if is_missing(&self.payments.signing_secret) {
            missing.push("payments");
        }
        if is_missing(&self.esign.shared_secret) {
            missing.push("esign");
        }
        if is_missing(&self.practice.shared_secret) {
            missing.push("practice");
        }
        if is_missing(&self.crm.webhook_secret) {
            missing.push("crm");
        }
        missing
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("dealsync.toml"), PathBuf::from("config/dealsync.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_http_url(field: &str, value: &str) -> Result<(), ConfigError> {
    if !value.starts_with("http://") && !value.starts_with("https://") {
        return Err(ConfigError::Validation(format!(
            "{field} must start with http:// or https://"
        )));
    }
    Ok(())
}

fn validate_crm(crm: &CrmConfig) -> Result<(), ConfigError> {
    if crm.timeout_secs == 0 || crm.timeout_secs > 300 {
        return Err(ConfigError::Validation("crm.timeout_secs must be in range 1..=300".to_string()));
    }

    if crm.mode == CrmMode::Http {
        let base_url = crm.base_url.as_deref().map(str::trim).unwrap_or_default();
        if base_url.is_empty() {
            return Err(ConfigError::Validation(
                "crm.base_url is required when crm.mode is `http`".to_string(),
            ));
        }
        validate_http_url("crm.base_url", base_url)?;

        let missing_token = crm
            .access_token
            .as_ref()
            .map(|value| value.expose_secret().trim().is_empty())
            .unwrap_or(true);
        if missing_token {
            return Err(ConfigError::Validation(
                "crm.access_token is required when crm.mode is `http`".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_payments(payments: &PaymentsConfig) -> Result<(), ConfigError> {
    if payments.signature_tolerance_secs == 0 {
        return Err(ConfigError::Validation(
            "payments.signature_tolerance_secs must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_automation(automation: &AutomationConfig) -> Result<(), ConfigError> {
    if automation.timeout_secs == 0 || automation.timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "automation.timeout_secs must be in range 1..=600".to_string(),
        ));
    }
    if let Some(base_url) = &automation.base_url {
        validate_http_url("automation.base_url", base_url)?;
    }
    Ok(())
}

fn validate_sync_queue(queue: &SyncQueueSettings) -> Result<(), ConfigError> {
    if queue.max_attempts == 0 {
        return Err(ConfigError::Validation(
            "sync_queue.max_attempts must be greater than zero".to_string(),
        ));
    }
    if queue.retry_intervals_secs.is_empty() {
        return Err(ConfigError::Validation(
            "sync_queue.retry_intervals_secs must list at least one interval".to_string(),
        ));
    }
    if queue.poll_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "sync_queue.poll_interval_ms must be greater than zero".to_string(),
        ));
    }
    if queue.claim_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "sync_queue.claim_timeout_secs must be greater than zero".to_string(),
        ));
    }
    if queue.batch_size == 0 {
        return Err(ConfigError::Validation(
            "sync_queue.batch_size must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| invalid(key, value))
}

/// `"1,5,30"` → `[1, 5, 30]`.
fn parse_intervals(key: &str, value: &str) -> Result<Vec<u64>, ConfigError> {
    value
        .split(',')
        .map(|part| part.trim().parse::<u64>().map_err(|_| invalid(key, value)))
        .collect()
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    crm: Option<CrmPatch>,
    payments: Option<PaymentsPatch>,
    esign: Option<ESignPatch>,
    practice: Option<PracticePatch>,
    automation: Option<AutomationPatch>,
    sync_queue: Option<SyncQueuePatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    admin_token: Option<String>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CrmPatch {
    mode: Option<CrmMode>,
    base_url: Option<String>,
    access_token: Option<String>,
    timeout_secs: Option<u64>,
    webhook_secret: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PaymentsPatch {
    signing_secret: Option<String>,
    signature_tolerance_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ESignPatch {
    shared_secret: Option<String>,
    final_document_type: Option<String>,
    document_types: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct PracticePatch {
    shared_secret: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AutomationPatch {
    enabled: Option<bool>,
    rehearsal_mode: Option<bool>,
    base_url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SyncQueuePatch {
    max_attempts: Option<u32>,
    retry_intervals_secs: Option<Vec<u64>>,
    poll_interval_ms: Option<u64>,
    claim_timeout_secs: Option<u64>,
    batch_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, CrmMode, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_match_retry_schedule_and_rehearsal() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.sync_queue.max_attempts == 3, "three attempts by default")?;
        ensure(config.sync_queue.retry_intervals_secs == vec![1, 5, 30], "1/5/30 schedule")?;
        ensure(config.sync_queue.poll_interval_ms == 500, "500ms poll")?;
        ensure(config.automation.rehearsal_mode, "automation rehearses by default")?;
        ensure(config.crm.mode == CrmMode::Local, "local crm by default")?;
        ensure(
            config.unconfigured_webhook_sources() == vec!["payments", "esign", "practice", "crm"],
            "every webhook source starts unconfigured",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_DEALSYNC_SIGNING_SECRET", "whsec_from_env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("dealsync.toml");
            fs::write(
                &path,
                r#"
[payments]
signing_secret = "${TEST_DEALSYNC_SIGNING_SECRET}"

[sync_queue]
retry_intervals_secs = [2, 10]
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            let secret = config.payments.signing_secret.as_ref().map(|s| s.expose_secret());
            ensure(secret == Some("whsec_from_env"), "signing secret should come from env")?;
            ensure(
                config.sync_queue_config().retry_intervals_secs == vec![2, 10],
                "file intervals should reach the queue config",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_DEALSYNC_SIGNING_SECRET"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DEALSYNC_LOG_LEVEL", "warn");
        env::set_var("DEALSYNC_LOG_FORMAT", "json");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Json),
                "json logging format should be set from env var",
            )
        })();

        clear_vars(&["DEALSYNC_LOG_LEVEL", "DEALSYNC_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DEALSYNC_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("DEALSYNC_SYNC_QUEUE_RETRY_INTERVALS", "3, 9, 27");
        env::set_var("DEALSYNC_AUTOMATION_REHEARSAL_MODE", "false");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("dealsync.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[automation]
rehearsal_mode = true
enabled = false

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.sync_queue.retry_intervals_secs == vec![3, 9, 27],
                "env intervals should win over defaults",
            )?;
            ensure(!config.automation.rehearsal_mode, "env rehearsal flag should win over file")?;
            ensure(!config.dispatch_settings().enabled, "file should disable automation")?;
            Ok(())
        })();

        clear_vars(&[
            "DEALSYNC_DATABASE_URL",
            "DEALSYNC_SYNC_QUEUE_RETRY_INTERVALS",
            "DEALSYNC_AUTOMATION_REHEARSAL_MODE",
        ]);
        result
    }

    #[test]
    fn http_crm_mode_requires_base_url_and_token() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DEALSYNC_CRM_MODE", "http");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("crm.base_url")
            );
            ensure(has_message, "validation failure should mention crm.base_url")
        })();

        clear_vars(&["DEALSYNC_CRM_MODE"]);
        result
    }

    #[test]
    fn malformed_interval_env_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DEALSYNC_SYNC_QUEUE_RETRY_INTERVALS", "1,five,30");

        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. }) => ensure(
                key == "DEALSYNC_SYNC_QUEUE_RETRY_INTERVALS",
                "error should name the offending variable",
            ),
            Err(other) => Err(format!("unexpected error: {other}")),
            Ok(_) => Err("expected interval parse failure".to_string()),
        };

        clear_vars(&["DEALSYNC_SYNC_QUEUE_RETRY_INTERVALS"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DEALSYNC_SERVER_ADMIN_TOKEN", "admin-secret-value");
        env::set_var("DEALSYNC_ESIGN_SHARED_SECRET", "esign-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("admin-secret-value"), "debug output should hide admin token")?;
            ensure(!debug.contains("esign-secret-value"), "debug output should hide esign secret")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )
        })();

        clear_vars(&["DEALSYNC_SERVER_ADMIN_TOKEN", "DEALSYNC_ESIGN_SHARED_SECRET"]);
        result
    }
}
