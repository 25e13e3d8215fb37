use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8750;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Frames above this size are gzipped and spilled to the object store.
pub const DEFAULT_INLINE_MAX_BYTES: usize = 32 * 1024;
/// Ledger writes slower than this no longer block the client stream.
pub const DEFAULT_WRITE_DEADLINE_MS: u64 = 2_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_CLOCK_SKEW_SECS: i64 = 30;
/// Hard cap for ledger page reads; larger limits are a validation error.
pub const MAX_LEDGER_PAGE_LIMIT: usize = 1_000;

/// Top-level config (maestro.toml + MAESTRO_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MaestroConfig {
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub usage_guardrails: UsageGuardrailConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub guardrails: GuardrailPipelineConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
    Test,
}

impl Environment {
    pub fn is_local(&self) -> bool {
        matches!(self, Environment::Development | Environment::Test)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Origins allowed by the CORS layer. Empty means same-origin only.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

/// One signing key in the rotatable key set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SigningKey {
    pub kid: String,
    pub secret: String,
}

/// Rotatable key set: `active` signs new tokens, `previous` is still
/// accepted for verification, `next` is staged but not yet trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeySetConfig {
    pub active: SigningKey,
    #[serde(default)]
    pub next: Option<SigningKey>,
    #[serde(default)]
    pub previous: Option<SigningKey>,
}

impl Default for KeySetConfig {
    fn default() -> Self {
        Self {
            active: SigningKey {
                kid: "dev-1".to_string(),
                secret: "change-me".to_string(),
            },
            next: None,
            previous: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_audience")]
    pub audience: String,
    #[serde(default)]
    pub email_verification_required: bool,
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: i64,
    #[serde(default)]
    pub key_set: KeySetConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            audience: default_audience(),
            email_verification_required: false,
            clock_skew_secs: default_clock_skew(),
            key_set: KeySetConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStoreProvider {
    #[default]
    Memory,
    S3,
    Minio,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObjectStoreConfig {
    #[serde(default)]
    pub provider: ObjectStoreProvider,
    #[serde(default)]
    pub bucket: Option<String>,
    /// Endpoint override for S3-compatible stores (MinIO). Required for
    /// `minio`, optional for `s3`.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderRuntime {
    #[default]
    Mock,
    OpenaiCompat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub runtime: ProviderRuntime,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_agent")]
    pub default_agent: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            runtime: ProviderRuntime::Mock,
            base_url: None,
            api_key: None,
            default_agent: default_agent(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitScope {
    Ip,
    User,
    Tenant,
    Global,
}

/// One named rate-limit window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateWindow {
    pub name: String,
    pub limit: u64,
    pub window_seconds: u64,
    pub scope: RateLimitScope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_windows")]
    pub windows: Vec<RateWindow>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            windows: default_rate_windows(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageLimitType {
    Requests,
    InputTokens,
    OutputTokens,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageGranularity {
    Minute,
    Hour,
    Day,
    Month,
}

impl UsageGranularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageGranularity::Minute => "minute",
            UsageGranularity::Hour => "hour",
            UsageGranularity::Day => "day",
            UsageGranularity::Month => "month",
        }
    }
}

/// Plan-backed usage limit for one feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLimit {
    pub feature_key: String,
    pub limit_type: UsageLimitType,
    pub limit_value: u64,
    pub granularity: UsageGranularity,
    /// Soft limits log and mark the response; hard limits deny with 429.
    #[serde(default)]
    pub hard: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UsageGuardrailConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub limits: Vec<UsageLimit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_inline_max_bytes")]
    pub inline_max_bytes: usize,
    #[serde(default = "default_write_deadline_ms")]
    pub write_deadline_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            inline_max_bytes: default_inline_max_bytes(),
            write_deadline_ms: default_write_deadline_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_s: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_s: default_heartbeat_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionConfig {
    #[serde(default)]
    pub disable_provider_conversation_creation: bool,
    #[serde(default)]
    pub force_provider_session_rebind: bool,
}

/// Guardrail pipeline: one or more bundles resolved against the registry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GuardrailPipelineConfig {
    #[serde(default)]
    pub bundles: Vec<GuardrailBundleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GuardrailBundleConfig {
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub guardrail_keys: Vec<String>,
    #[serde(default)]
    pub guardrails: Vec<GuardrailOverrideConfig>,
    #[serde(default)]
    pub suppress_tripwire: bool,
    #[serde(default)]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailOverrideConfig {
    pub guardrail_key: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObservabilityConfig {
    /// When set, structured log events are exported over OTLP/HTTP.
    /// The exporter is best-effort; an unreachable endpoint never fails a
    /// request.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

impl MaestroConfig {
    /// Load config: explicit path > MAESTRO_CONFIG env > ./maestro.toml.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: MaestroConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("MAESTRO_").split("__"))
            .extract()
            .map_err(|e| ConfigError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Startup validation. Errors here exit the process with code 2.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.key_set.active.secret.is_empty() {
            return Err(ConfigError("auth.key_set.active.secret is empty".into()));
        }
        if !self.environment.is_local() && self.auth.key_set.active.secret == "change-me" {
            return Err(ConfigError(
                "auth.key_set.active.secret must be set outside development".into(),
            ));
        }
        if self.ledger.inline_max_bytes == 0 {
            return Err(ConfigError("ledger.inline_max_bytes must be positive".into()));
        }
        if self.stream.heartbeat_interval_s == 0 {
            return Err(ConfigError("stream.heartbeat_interval_s must be positive".into()));
        }
        match self.object_store.provider {
            ObjectStoreProvider::Memory => {}
            ObjectStoreProvider::S3 | ObjectStoreProvider::Minio => {
                if self.object_store.bucket.is_none() {
                    return Err(ConfigError("object_store.bucket is required".into()));
                }
                if self.object_store.provider == ObjectStoreProvider::Minio
                    && self.object_store.endpoint.is_none()
                {
                    return Err(ConfigError(
                        "object_store.endpoint is required for minio".into(),
                    ));
                }
            }
        }
        if self.provider.runtime == ProviderRuntime::OpenaiCompat && self.provider.base_url.is_none()
        {
            return Err(ConfigError(
                "provider.base_url is required for openai_compat".into(),
            ));
        }
        for w in &self.rate_limit.windows {
            if w.limit == 0 || w.window_seconds == 0 {
                return Err(ConfigError(format!(
                    "rate_limit window '{}' needs a positive limit and window",
                    w.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Configuration error: {0}")]
pub struct ConfigError(pub String);

fn default_config_path() -> String {
    std::env::var("MAESTRO_CONFIG").unwrap_or_else(|_| "maestro.toml".to_string())
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_issuer() -> String {
    "https://auth.maestro.local".to_string()
}

fn default_audience() -> String {
    "maestro-api".to_string()
}

fn default_clock_skew() -> i64 {
    DEFAULT_CLOCK_SKEW_SECS
}

fn default_db_path() -> String {
    "maestro.db".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_agent() -> String {
    "triage".to_string()
}

fn default_inline_max_bytes() -> usize {
    DEFAULT_INLINE_MAX_BYTES
}

fn default_write_deadline_ms() -> u64 {
    DEFAULT_WRITE_DEADLINE_MS
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

fn default_rate_windows() -> Vec<RateWindow> {
    vec![
        RateWindow {
            name: "api-per-user".to_string(),
            limit: 120,
            window_seconds: 60,
            scope: RateLimitScope::User,
        },
        RateWindow {
            name: "api-per-tenant".to_string(),
            limit: 600,
            window_seconds: 60,
            scope: RateLimitScope::Tenant,
        },
    ]
}

fn bool_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        MaestroConfig::default().validate().unwrap();
    }

    #[test]
    fn production_rejects_placeholder_secret() {
        let mut cfg = MaestroConfig::default();
        cfg.environment = Environment::Production;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn minio_requires_endpoint() {
        let mut cfg = MaestroConfig::default();
        cfg.object_store.provider = ObjectStoreProvider::Minio;
        cfg.object_store.bucket = Some("maestro".into());
        assert!(cfg.validate().is_err());
        cfg.object_store.endpoint = Some("http://127.0.0.1:9000".into());
        cfg.validate().unwrap();
    }
}
