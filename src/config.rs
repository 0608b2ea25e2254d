use std::env;

/// Backend selection for the storage abstraction (§4.2 / §6 Configuration).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Remote,
}

/// Registration policy applied to new agents when no tenant overrides it (§3 Tenant).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationPolicy {
    Open,
    ApprovalRequired,
}

/// Hub-wide configuration, collected from the environment the way the teacher's
/// `RateLimitConfig::from_env` does — defaults baked in, overridden by `env::var` when set.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub port: u16,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub message_ttl_sec: i64,
    pub cleanup_interval_ms: u64,
    pub api_key_required: bool,
    pub master_api_key: Option<String>,
    pub storage_backend: StorageBackend,
    pub remote_store_url: Option<String>,
    pub remote_store_app_id: Option<String>,
    pub remote_store_api_key: Option<String>,
    pub registration_policy: RegistrationPolicy,
    pub round_table_default_timeout_minutes: i64,
    pub default_visibility_timeout_sec: i64,
    pub max_delivery_attempts: i64,
    pub round_table_purge_after_hours: i64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            message_ttl_sec: 86_400,
            cleanup_interval_ms: 60_000,
            api_key_required: false,
            master_api_key: None,
            storage_backend: StorageBackend::Memory,
            remote_store_url: None,
            remote_store_app_id: None,
            remote_store_api_key: None,
            registration_policy: RegistrationPolicy::Open,
            round_table_default_timeout_minutes: 60,
            default_visibility_timeout_sec: 60,
            max_delivery_attempts: 5,
            round_table_purge_after_hours: 168,
        }
    }
}

impl HubConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("PORT")
            && let Ok(n) = val.parse::<u16>()
        {
            config.port = n;
        }
        if let Ok(val) = env::var("HEARTBEAT_INTERVAL_MS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.heartbeat_interval_ms = n;
        }
        if let Ok(val) = env::var("HEARTBEAT_TIMEOUT_MS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.heartbeat_timeout_ms = n;
        }
        if let Ok(val) = env::var("MESSAGE_TTL_SEC")
            && let Ok(n) = val.parse::<i64>()
        {
            config.message_ttl_sec = n;
        }
        if let Ok(val) = env::var("CLEANUP_INTERVAL_MS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.cleanup_interval_ms = n;
        }
        if let Ok(val) = env::var("API_KEY_REQUIRED") {
            config.api_key_required = val != "0" && val.to_lowercase() != "false";
        }
        if let Ok(val) = env::var("MASTER_API_KEY") {
            config.master_api_key = Some(val);
        }
        if let Ok(val) = env::var("STORAGE_BACKEND") {
            config.storage_backend = match val.as_str() {
                "mech" | "remote" => StorageBackend::Remote,
                _ => StorageBackend::Memory,
            };
        }
        if let Ok(val) = env::var("REMOTE_STORE_URL") {
            config.remote_store_url = Some(val);
        }
        if let Ok(val) = env::var("REMOTE_STORE_APP_ID") {
            config.remote_store_app_id = Some(val);
        }
        if let Ok(val) = env::var("REMOTE_STORE_API_KEY") {
            config.remote_store_api_key = Some(val);
        }
        if let Ok(val) = env::var("REGISTRATION_POLICY") {
            config.registration_policy = match val.as_str() {
                "approval_required" => RegistrationPolicy::ApprovalRequired,
                _ => RegistrationPolicy::Open,
            };
        }
        if let Ok(val) = env::var("ROUND_TABLE_DEFAULT_TIMEOUT_MINUTES")
            && let Ok(n) = val.parse::<i64>()
        {
            config.round_table_default_timeout_minutes = n;
        }
        if let Ok(val) = env::var("DEFAULT_VISIBILITY_TIMEOUT_SEC")
            && let Ok(n) = val.parse::<i64>()
        {
            config.default_visibility_timeout_sec = n;
        }
        if let Ok(val) = env::var("MAX_DELIVERY_ATTEMPTS")
            && let Ok(n) = val.parse::<i64>()
        {
            config.max_delivery_attempts = n;
        }
        if let Ok(val) = env::var("ROUND_TABLE_PURGE_AFTER_HOURS")
            && let Ok(n) = val.parse::<i64>()
        {
            config.round_table_purge_after_hours = n;
        }

        config
    }
}
