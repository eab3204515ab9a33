use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_env: String,
    pub port: u16,
    pub log_level: String,
    pub request_timeout_secs: u64,
    pub rate_limit_per_second: u64,
    pub rate_limit_burst: u32,
    pub store_backend: String,
    pub redis_url: String,
    pub key_prefix: String,
    pub jwt_secret: String,
    pub encryption_key_id: String,
    pub encryption_master_key: String,
    pub idempotency_ttl_secs: u64,
    pub spend_daily_limit: String,
    pub spend_record_ttl_secs: u64,
    pub cost_model: String,
    pub estimated_output_tokens: u64,
    pub worker_queue_prefix: String,
    pub worker_poll_interval_ms: u64,
    pub worker_promote_batch: usize,
    pub worker_backoff_base_ms: u64,
    pub worker_backoff_max_ms: u64,
    pub worker_max_attempts: u32,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let cfg = config::Config::builder()
            .set_default("app_env", "development")?
            .set_default("port", 3000)?
            .set_default("log_level", "info")?
            .set_default("request_timeout_secs", 30)?
            .set_default("rate_limit_per_second", 50)?
            .set_default("rate_limit_burst", 100)?
            .set_default("store_backend", "memory")?
            .set_default("redis_url", "redis://127.0.0.1:6379")?
            .set_default("key_prefix", "reverie")?
            .set_default("jwt_secret", "dev-secret")?
            .set_default("encryption_key_id", "local-dev")?
            // 32 zero bytes; override outside development
            .set_default(
                "encryption_master_key",
                "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=",
            )?
            .set_default("idempotency_ttl_secs", 86_400)?
            .set_default("spend_daily_limit", "5.00")?
            .set_default("spend_record_ttl_secs", 604_800)?
            .set_default("cost_model", "claude-3-sonnet")?
            .set_default("estimated_output_tokens", 100)?
            .set_default("worker_queue_prefix", "reverie:jobs")?
            .set_default("worker_poll_interval_ms", 1000)?
            .set_default("worker_promote_batch", 50)?
            .set_default("worker_backoff_base_ms", 1000)?
            .set_default("worker_backoff_max_ms", 60000)?
            .set_default("worker_max_attempts", 5)?
            .add_source(config::Environment::default().separator("__"))
            .build()?;
        let config: Self = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        self.daily_limit()?;
        if self.rate_limit_per_second == 0 || self.rate_limit_burst == 0 {
            return Err(config::ConfigError::Message(
                "rate_limit_per_second and rate_limit_burst must be positive".into(),
            ));
        }
        match self.store_backend.as_str() {
            "memory" | "redis" => Ok(()),
            other => Err(config::ConfigError::Message(format!(
                "store_backend must be memory or redis, got {other}"
            ))),
        }
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }

    pub fn is_test(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("test")
    }

    pub fn uses_redis(&self) -> bool {
        self.store_backend.eq_ignore_ascii_case("redis")
    }

    pub fn daily_limit(&self) -> Result<Decimal, config::ConfigError> {
        let limit = Decimal::from_str(self.spend_daily_limit.trim()).map_err(|err| {
            config::ConfigError::Message(format!("spend_daily_limit is not a decimal: {err}"))
        })?;
        if limit.is_sign_negative() {
            return Err(config::ConfigError::Message(
                "spend_daily_limit must not be negative".into(),
            ));
        }
        Ok(limit)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub fn spend_record_ttl(&self) -> Duration {
        Duration::from_secs(self.spend_record_ttl_secs)
    }
}
