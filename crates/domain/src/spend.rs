use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::clock::{Clock, SystemClock};
use crate::error::DomainError;
use crate::idempotency::DEFAULT_KEY_PREFIX;
use crate::ports::kv::KvStore;
use crate::util::{format_ms_rfc3339, utc_date};

const KEY_NAMESPACE: &str = "spend";

pub const DEFAULT_COST_MODEL: &str = "claude-3-sonnet";

/// $5.00 per user per day.
pub fn default_daily_limit() -> Decimal {
    Decimal::new(500, 2)
}

/// Resolves the daily budget for a user. Tier-based limits plug in here.
pub trait DailyLimitResolver: Send + Sync {
    fn daily_limit(&self, user_id: &str) -> Decimal;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FixedDailyLimit(pub Decimal);

impl Default for FixedDailyLimit {
    fn default() -> Self {
        Self(default_daily_limit())
    }
}

impl DailyLimitResolver for FixedDailyLimit {
    fn daily_limit(&self, _user_id: &str) -> Decimal {
        self.0
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SpendRecord {
    pub user_id: String,
    pub date: String,
    pub request_count: u64,
    pub accumulated_cost: Decimal,
    pub daily_limit: Decimal,
    pub created_at: String,
    pub updated_at: String,
    pub expires_at_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SpendCheck {
    pub allowed: bool,
    pub remaining: Decimal,
    pub current_cost: Decimal,
    pub daily_limit: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SpendConfig {
    pub record_ttl: Duration,
}

impl Default for SpendConfig {
    fn default() -> Self {
        Self {
            record_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Per-user, per-day spend tracking.
///
/// `check_limit` never writes; `record` is a read-modify-write without a
/// conditional update, so two concurrent records for the same user may lose
/// one increment. Admission is advisory, not a security boundary.
#[derive(Clone)]
pub struct SpendLedger {
    store: Arc<dyn KvStore>,
    limits: Arc<dyn DailyLimitResolver>,
    clock: Arc<dyn Clock>,
    config: SpendConfig,
    prefix: String,
}

impl SpendLedger {
    pub fn new(
        store: Arc<dyn KvStore>,
        limits: Arc<dyn DailyLimitResolver>,
        config: SpendConfig,
    ) -> Self {
        Self {
            store,
            limits,
            clock: Arc::new(SystemClock),
            config,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn storage_key(&self, user_id: &str, date: &str) -> String {
        format!("{}:{KEY_NAMESPACE}:{user_id}:{date}", self.prefix)
    }

    pub async fn check_limit(
        &self,
        user_id: &str,
        estimated_cost: Decimal,
    ) -> DomainResult<SpendCheck> {
        if estimated_cost.is_sign_negative() {
            return Err(DomainError::Validation(
                "estimated cost must not be negative".into(),
            ));
        }
        let now = self.clock.now_ms();
        let record = self.today(user_id, now).await?;

        let current_cost = record.accumulated_cost;
        let daily_limit = record.daily_limit;
        let allowed = current_cost + estimated_cost <= daily_limit;
        let reason = (!allowed).then(|| {
            format!(
                "daily limit exceeded: current ${current_cost}, request ${estimated_cost}, limit ${daily_limit}"
            )
        });

        Ok(SpendCheck {
            allowed,
            remaining: daily_limit - current_cost,
            current_cost,
            daily_limit,
            reason,
        })
    }

    pub async fn record(&self, user_id: &str, actual_cost: Decimal) -> DomainResult<()> {
        if actual_cost.is_sign_negative() {
            return Err(DomainError::Validation(
                "recorded cost must not be negative".into(),
            ));
        }
        let now = self.clock.now_ms();
        let mut record = self.today(user_id, now).await?;
        record.request_count = record.request_count.saturating_add(1);
        record.accumulated_cost += actual_cost;
        record.updated_at = format_ms_rfc3339(now);
        record.expires_at_ms = now + self.config.record_ttl.as_millis() as i64;

        let payload = serde_json::to_string(&record)
            .map_err(|err| DomainError::Internal(format!("serialize spend record: {err}")))?;
        self.store
            .put(
                &self.storage_key(user_id, &record.date),
                &payload,
                self.config.record_ttl,
            )
            .await?;
        tracing::debug!(
            user_id,
            date = %record.date,
            accumulated_cost = %record.accumulated_cost,
            "spend recorded"
        );
        Ok(())
    }

    /// Today's record for the user, if anything was recorded yet.
    pub async fn summary(&self, user_id: &str) -> DomainResult<Option<SpendRecord>> {
        let date = utc_date(self.clock.now_ms());
        self.load(user_id, &date).await
    }

    async fn today(&self, user_id: &str, now_ms: i64) -> DomainResult<SpendRecord> {
        let date = utc_date(now_ms);
        match self.load(user_id, &date).await? {
            Some(record) => Ok(record),
            None => Ok(self.fresh_record(user_id, date, now_ms)),
        }
    }

    async fn load(&self, user_id: &str, date: &str) -> DomainResult<Option<SpendRecord>> {
        let Some(payload) = self.store.get(&self.storage_key(user_id, date)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&payload)
            .map(Some)
            .map_err(|err| DomainError::Internal(format!("decode spend record: {err}")))
    }

    fn fresh_record(&self, user_id: &str, date: String, now_ms: i64) -> SpendRecord {
        let timestamp = format_ms_rfc3339(now_ms);
        SpendRecord {
            user_id: user_id.to_string(),
            date,
            request_count: 0,
            accumulated_cost: Decimal::ZERO,
            daily_limit: self.limits.daily_limit(user_id),
            created_at: timestamp.clone(),
            updated_at: timestamp,
            expires_at_ms: now_ms + self.config.record_ttl.as_millis() as i64,
        }
    }
}

struct ModelPricing {
    input_per_1k: Decimal,
    output_per_1k: Decimal,
}

fn pricing_for(model: &str) -> ModelPricing {
    let model = model.to_ascii_lowercase();
    if model.contains("haiku") {
        ModelPricing {
            input_per_1k: Decimal::new(25, 5),
            output_per_1k: Decimal::new(125, 5),
        }
    } else if model.contains("opus") {
        ModelPricing {
            input_per_1k: Decimal::new(15, 3),
            output_per_1k: Decimal::new(75, 3),
        }
    } else {
        // sonnet, and the fallback for unknown models
        ModelPricing {
            input_per_1k: Decimal::new(3, 3),
            output_per_1k: Decimal::new(15, 3),
        }
    }
}

/// Estimated model cost in dollars for a request of the given token counts.
pub fn estimate_cost(input_tokens: u64, output_tokens: u64, model: &str) -> Decimal {
    let pricing = pricing_for(model);
    let per_thousand = Decimal::from(1_000u64);
    Decimal::from(input_tokens) * pricing.input_per_1k / per_thousand
        + Decimal::from(output_tokens) * pricing.output_per_1k / per_thousand
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_uses_model_family_pricing() {
        // 1000 in, 1000 out on sonnet: 0.003 + 0.015
        assert_eq!(
            estimate_cost(1_000, 1_000, "anthropic.claude-3-sonnet-20240229-v1:0"),
            Decimal::new(18, 3)
        );
        assert_eq!(
            estimate_cost(1_000, 1_000, "anthropic.claude-3-haiku-20240307-v1:0"),
            Decimal::new(150, 5)
        );
        assert_eq!(
            estimate_cost(1_000, 1_000, "claude-3-opus"),
            Decimal::new(90, 3)
        );
    }

    #[test]
    fn unknown_model_falls_back_to_default_pricing() {
        assert_eq!(
            estimate_cost(2_000, 100, "some-new-model"),
            estimate_cost(2_000, 100, DEFAULT_COST_MODEL)
        );
    }

    #[test]
    fn fixed_limit_defaults_to_five_dollars() {
        assert_eq!(
            FixedDailyLimit::default().daily_limit("anyone"),
            Decimal::new(5, 0)
        );
    }
}
