use serde::Deserialize;
use std::sync::Arc;
use std::{env, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;

use crate::credentials::CredentialSettings;
use crate::gmail::client::{DEFAULT_API_BASE, DEFAULT_REQUEST_TIMEOUT, GmailClient};
use crate::gmail::oauth::{AUTH_ENDPOINT, DEFAULT_SCOPES, OAuthClient, TOKEN_ENDPOINT};
use crate::mapper::{DEFAULT_INLINE_ATTACHMENT_MAX_BYTES, MapperOptions};
use crate::protocol::rate_limit::{DEFAULT_PER_HOUR, DEFAULT_PER_MINUTE};
use crate::protocol::{
    DEFAULT_INLINE_ATTACHMENT_BYTES, DEFAULT_MAX_ATTACHMENT_BYTES, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_REQUEST_BYTES, ProtocolSettings, RateLimits,
};
use crate::secrets::{DEFAULT_SECRET_SERVICE, KeyringSecretStore, MemorySecretStore, SecretStore};
use crate::sync::{
    DEFAULT_MAX_CACHED_MESSAGES, DEFAULT_PAGE_SIZE, DEFAULT_PASS_TIMEOUT, SyncSettings,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub app: AppConfig,
    pub paths: PathsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub gmail: GmailConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    pub service_name: String,
    pub env: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    pub database: PathBuf,
    pub attachment_spool: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TelemetryConfig {
    pub otlp_endpoint: Option<String>,
    #[serde(default)]
    pub export_traces: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct GmailConfig {
    pub client_id: String,
    pub client_secret: String,
    pub api_base: String,
    pub token_endpoint: String,
    pub auth_endpoint: String,
    pub scopes: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            api_base: DEFAULT_API_BASE.to_string(),
            token_endpoint: TOKEN_ENDPOINT.to_string(),
            auth_endpoint: AUTH_ENDPOINT.to_string(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
        }
    }
}

impl GmailConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn client(&self, http: reqwest::Client) -> GmailClient {
        GmailClient::new(http)
            .with_api_base(self.api_base.clone())
            .with_request_timeout(self.request_timeout())
    }

    pub fn oauth_client(&self, http: reqwest::Client) -> OAuthClient {
        OAuthClient::new(http, self.client_id.clone(), self.client_secret.clone())
            .with_token_endpoint(self.token_endpoint.clone())
            .with_auth_endpoint(self.auth_endpoint.clone())
            .with_scopes(self.scopes.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct SyncConfig {
    pub interval_secs: u64,
    pub max_cached_messages: u64,
    pub page_size: u32,
    pub pass_timeout_secs: u64,
    pub inline_attachment_max_bytes: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            max_cached_messages: DEFAULT_MAX_CACHED_MESSAGES,
            page_size: DEFAULT_PAGE_SIZE,
            pass_timeout_secs: DEFAULT_PASS_TIMEOUT.as_secs(),
            inline_attachment_max_bytes: DEFAULT_INLINE_ATTACHMENT_MAX_BYTES,
        }
    }
}

impl SyncConfig {
    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            interval: Duration::from_secs(self.interval_secs.max(1)),
            max_cached_messages: self.max_cached_messages,
            page_size: self.page_size.max(1),
            pass_timeout: Duration::from_secs(self.pass_timeout_secs.max(1)),
            mapper: MapperOptions {
                inline_attachment_max_bytes: self.inline_attachment_max_bytes,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecretBackend {
    /// OS keychain.
    #[default]
    Keyring,
    /// Process memory only; tokens are lost on exit.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct AuthConfig {
    pub refresh_buffer_secs: u64,
    pub pending_flow_ttl_secs: u64,
    pub secret_service: String,
    pub secret_backend: SecretBackend,
}

impl Default for AuthConfig {
    fn default() -> Self {
        let defaults = CredentialSettings::default();
        Self {
            refresh_buffer_secs: defaults.refresh_buffer.as_secs(),
            pending_flow_ttl_secs: defaults.pending_flow_ttl.as_secs(),
            secret_service: DEFAULT_SECRET_SERVICE.to_string(),
            secret_backend: SecretBackend::default(),
        }
    }
}

impl AuthConfig {
    pub fn secret_store(&self) -> Arc<dyn SecretStore> {
        match self.secret_backend {
            SecretBackend::Keyring => {
                Arc::new(KeyringSecretStore::with_service(self.secret_service.clone()))
            }
            SecretBackend::Memory => Arc::new(MemorySecretStore::new()),
        }
    }

    pub fn credential_settings(&self) -> CredentialSettings {
        CredentialSettings {
            refresh_buffer: Duration::from_secs(self.refresh_buffer_secs),
            pending_flow_ttl: Duration::from_secs(self.pending_flow_ttl_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct ProtocolConfig {
    /// Unix socket to listen on in addition to stdio. `None` serves stdio only.
    pub socket_path: Option<PathBuf>,
    pub per_minute: u32,
    pub per_hour: u32,
    pub max_connections: usize,
    pub max_attachment_bytes: u64,
    pub inline_attachment_bytes: u64,
    pub sanitize_timeout_ms: u64,
    pub max_request_bytes: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            per_minute: DEFAULT_PER_MINUTE,
            per_hour: DEFAULT_PER_HOUR,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_attachment_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
            inline_attachment_bytes: DEFAULT_INLINE_ATTACHMENT_BYTES,
            sanitize_timeout_ms: 250,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        }
    }
}

impl ProtocolConfig {
    pub fn settings(&self) -> ProtocolSettings {
        ProtocolSettings {
            rate_limits: RateLimits {
                per_minute: self.per_minute,
                per_hour: self.per_hour,
            },
            max_connections: self.max_connections.max(1),
            max_attachment_bytes: self.max_attachment_bytes,
            inline_attachment_bytes: self.inline_attachment_bytes,
            sanitize_timeout: Duration::from_millis(self.sanitize_timeout_ms),
            max_request_bytes: self.max_request_bytes.max(1),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ConfigBuild(config::ConfigError),
    #[error("failed to parse configuration: {0}")]
    Deserialize(config::ConfigError),
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::ConfigBuild(_) => "config.read",
            ConfigError::Deserialize(_) => "config.parse",
            ConfigError::MissingEnvVar(_) => "config.missing_env",
        }
    }

    pub fn is_recoverable(&self) -> bool {
        false
    }
}

impl Config {
    /// Load configuration from the provided path, apply environment overrides, and
    /// resolve any `env:` indirections.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(ConfigError::ConfigBuild)?;

        let mut cfg: Config = raw.try_deserialize().map_err(ConfigError::Deserialize)?;
        cfg.apply_env_overrides();
        cfg.resolve_env_markers()?;
        cfg.expand_paths();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(otlp) = env::var("OTLP_ENDPOINT") {
            self.telemetry.otlp_endpoint = Some(otlp);
        }

        if let Ok(socket) = env::var("DUOMAIL_SOCKET") {
            self.protocol.socket_path = Some(PathBuf::from(socket));
        }

        if let Ok(database) = env::var("DUOMAIL_DATABASE") {
            self.paths.database = PathBuf::from(database);
        }
    }

    fn resolve_env_markers(&mut self) -> Result<(), ConfigError> {
        apply_env_marker(&mut self.app.service_name)?;
        apply_env_marker(&mut self.app.env)?;
        apply_env_marker(&mut self.gmail.client_id)?;
        apply_env_marker(&mut self.gmail.client_secret)?;
        apply_env_marker(&mut self.gmail.api_base)?;
        apply_env_marker(&mut self.auth.secret_service)?;
        apply_env_marker_path(&mut self.paths.database)?;
        apply_env_marker_path(&mut self.paths.attachment_spool)?;
        if let Some(socket) = &mut self.protocol.socket_path {
            apply_env_marker_path(socket)?;
        }
        if let Some(endpoint) = &mut self.telemetry.otlp_endpoint {
            apply_env_marker(endpoint)?;
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        expand_tilde(&mut self.paths.database);
        expand_tilde(&mut self.paths.attachment_spool);
        if let Some(socket) = &mut self.protocol.socket_path {
            expand_tilde(socket);
        }
    }
}

fn expand_tilde(path: &mut PathBuf) {
    let value = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&value);
    *path = PathBuf::from(expanded.as_ref());
}

fn apply_env_marker(value: &mut String) -> Result<(), ConfigError> {
    if let Some(rest) = value.strip_prefix("env:") {
        let resolved = env::var(rest).map_err(|_| ConfigError::MissingEnvVar(rest.to_string()))?;
        *value = resolved;
    }
    Ok(())
}

fn apply_env_marker_path(path: &mut PathBuf) -> Result<(), ConfigError> {
    let mut value = path.to_string_lossy().to_string();
    apply_env_marker(&mut value)?;
    *path = PathBuf::from(value);
    Ok(())
}
