use std::sync::Arc;

use reverie_domain::encryption::EncryptionBoundary;
use reverie_domain::idempotency::{IdempotencyConfig, IdempotencyService};
use reverie_domain::jobs::{JobDefaults, LoggingJobQueue};
use reverie_domain::journal::{JournalConfig, JournalService};
use reverie_domain::kv::InMemoryKvStore;
use reverie_domain::ports::auth::TokenVerifier;
use reverie_domain::ports::cipher::EnvelopeCipher;
use reverie_domain::ports::jobs::JobQueue;
use reverie_domain::ports::kv::KvStore;
use reverie_domain::spend::{FixedDailyLimit, SpendConfig, SpendLedger};
use reverie_infra::auth::JwtVerifier;
use reverie_infra::cipher::LocalEnvelopeCipher;
use reverie_infra::config::AppConfig;
use reverie_infra::jobs::RedisJobQueue;
use reverie_infra::kv::RedisKvStore;
use reverie_infra::repositories::InMemoryJournalRepository;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub journal: JournalService,
    pub ledger: SpendLedger,
    pub verifier: Arc<dyn TokenVerifier>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let (store, jobs): (Arc<dyn KvStore>, Arc<dyn JobQueue>) = if config.uses_redis() {
            let store = RedisKvStore::connect(&config.redis_url).await?;
            let jobs =
                RedisJobQueue::connect_with_prefix(&config.redis_url, &config.worker_queue_prefix)
                    .await?;
            (Arc::new(store), Arc::new(jobs))
        } else {
            // Nothing consumes an in-process queue, so workflow triggers are only logged.
            tracing::warn!("memory store backend: idempotency and spend state are process-local");
            (Arc::new(InMemoryKvStore::new()), Arc::new(LoggingJobQueue))
        };
        let cipher = LocalEnvelopeCipher::from_base64(
            config.encryption_key_id.clone(),
            &config.encryption_master_key,
        )?;
        Self::from_parts(config, store, Arc::new(cipher), jobs)
    }

    /// Wires services over already-built adapters.
    pub fn from_parts(
        config: AppConfig,
        store: Arc<dyn KvStore>,
        cipher: Arc<dyn EnvelopeCipher>,
        jobs: Arc<dyn JobQueue>,
    ) -> anyhow::Result<Self> {
        let idempotency = IdempotencyService::new(
            store.clone(),
            IdempotencyConfig {
                record_ttl: config.idempotency_ttl(),
            },
        )
        .with_prefix(config.key_prefix.clone());
        let ledger = SpendLedger::new(
            store,
            Arc::new(FixedDailyLimit(config.daily_limit()?)),
            SpendConfig {
                record_ttl: config.spend_record_ttl(),
            },
        )
        .with_prefix(config.key_prefix.clone());
        let journal = JournalService::new(
            idempotency,
            ledger.clone(),
            EncryptionBoundary::new(cipher),
            Arc::new(InMemoryJournalRepository::new()),
            jobs,
            JournalConfig {
                cost_model: config.cost_model.clone(),
                estimated_output_tokens: config.estimated_output_tokens,
                job_defaults: JobDefaults {
                    max_attempts: config.worker_max_attempts,
                },
            },
        );
        let verifier = Arc::new(JwtVerifier::new(&config.jwt_secret));
        Ok(Self {
            config,
            journal,
            ledger,
            verifier,
        })
    }
}
