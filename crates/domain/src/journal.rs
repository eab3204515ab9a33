use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::clock::{Clock, SystemClock};
use crate::encryption::EncryptionBoundary;
use crate::error::DomainError;
use crate::idempotency::IdempotencyService;
use crate::identity::ActorIdentity;
use crate::jobs::{JobDefaults, new_job};
use crate::ports::jobs::{JobQueue, JobType};
use crate::ports::journal::JournalRepository;
use crate::spend::{DEFAULT_COST_MODEL, SpendLedger, estimate_cost};
use crate::util::{format_ms_rfc3339, uuid_v7_without_dashes};

pub const CREATE_OPERATION: &str = "POST /v1/journal-entries";

const MAX_CONTENT_LENGTH: usize = 10_000;
const MAX_MOOD_LENGTH: usize = 64;
const MAX_TAGS: usize = 20;
const MAX_TAG_LENGTH: usize = 64;

/// Journal entry as persisted and returned. When `encrypted` is true the
/// `content`, `mood` and `tags` fields hold base64 ciphertext.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct JournalEntry {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub mood: String,
    pub tags: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
    pub encrypted: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JournalEntryCreate {
    pub content: String,
    #[serde(default)]
    pub mood: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Everything about the inbound request the orchestrator needs besides the
/// parsed body.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub raw_body: String,
    pub idempotency_key: Option<String>,
    pub correlation_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct JournalEntryCreatedPayload {
    pub entry_id: String,
    pub user_id: String,
    pub encrypted: bool,
    pub created_at: String,
}

#[derive(Clone, Debug)]
pub struct JournalConfig {
    pub cost_model: String,
    pub estimated_output_tokens: u64,
    pub job_defaults: JobDefaults,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            cost_model: DEFAULT_COST_MODEL.to_string(),
            estimated_output_tokens: 100,
            job_defaults: JobDefaults::default(),
        }
    }
}

/// Request lifecycle for journal writes:
/// deduplicate, admit or degrade, encrypt, persist, record cost, trigger.
#[derive(Clone)]
pub struct JournalService {
    idempotency: IdempotencyService,
    ledger: SpendLedger,
    boundary: EncryptionBoundary,
    repository: Arc<dyn JournalRepository>,
    jobs: Arc<dyn JobQueue>,
    config: JournalConfig,
    clock: Arc<dyn Clock>,
}

impl JournalService {
    pub fn new(
        idempotency: IdempotencyService,
        ledger: SpendLedger,
        boundary: EncryptionBoundary,
        repository: Arc<dyn JournalRepository>,
        jobs: Arc<dyn JobQueue>,
        config: JournalConfig,
    ) -> Self {
        Self {
            idempotency,
            ledger,
            boundary,
            repository,
            jobs,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ledger(&self) -> &SpendLedger {
        &self.ledger
    }

    pub async fn create_entry(
        &self,
        actor: &ActorIdentity,
        request: &RequestContext,
        input: JournalEntryCreate,
    ) -> DomainResult<JournalEntry> {
        let input = validate_journal_entry_create(input)?;
        self.idempotency
            .process_with_key(
                &actor.user_id,
                CREATE_OPERATION,
                request.idempotency_key.as_deref(),
                &request.raw_body,
                || self.execute_create(actor, request, input),
            )
            .await
    }

    async fn execute_create(
        &self,
        actor: &ActorIdentity,
        request: &RequestContext,
        input: JournalEntryCreate,
    ) -> DomainResult<JournalEntry> {
        let estimated_cost = estimate_cost(
            input.content.chars().count() as u64,
            self.config.estimated_output_tokens,
            &self.config.cost_model,
        );
        let admission = self
            .ledger
            .check_limit(&actor.user_id, estimated_cost)
            .await?;

        let draft = JournalEntry::draft(&actor.user_id, input, self.clock.now_ms());
        if !admission.allowed {
            tracing::info!(
                user_id = %actor.user_id,
                remaining = %admission.remaining,
                reason = admission.reason.as_deref().unwrap_or_default(),
                "spend limit reached; returning unencrypted entry without persisting"
            );
            metrics::counter!("journal_degraded_writes_total").increment(1);
            return Ok(draft);
        }

        let entry = self.encrypt_entry(draft).await?;
        let entry = self.repository.create(&entry).await?;

        if let Err(err) = self.ledger.record(&actor.user_id, estimated_cost).await {
            tracing::warn!(error = %err, user_id = %actor.user_id, "failed to record spend");
        }
        self.trigger_workflow(&entry, request).await;

        tracing::info!(entry_id = %entry.id, user_id = %entry.user_id, "journal entry created");
        Ok(entry)
    }

    pub async fn get_entry(&self, actor: &ActorIdentity, entry_id: &str) -> DomainResult<JournalEntry> {
        let entry = self
            .repository
            .get(entry_id)
            .await?
            .filter(|entry| entry.user_id == actor.user_id)
            .ok_or(DomainError::NotFound)?;
        self.decrypt_entry(entry).await
    }

    pub async fn list_entries(&self, actor: &ActorIdentity) -> DomainResult<Vec<JournalEntry>> {
        let entries = self.repository.list_by_user(&actor.user_id).await?;
        let mut decrypted = Vec::with_capacity(entries.len());
        for entry in entries {
            decrypted.push(self.decrypt_entry(entry).await?);
        }
        Ok(decrypted)
    }

    /// Encrypts all PHI fields or none of them.
    async fn encrypt_entry(&self, entry: JournalEntry) -> DomainResult<JournalEntry> {
        let content = self.boundary.encrypt_field(&entry.content).await?;
        let mood = self.boundary.encrypt_field(&entry.mood).await?;
        let tags = self.boundary.encrypt_fields(&entry.tags).await?;
        Ok(JournalEntry {
            content,
            mood,
            tags,
            encrypted: true,
            ..entry
        })
    }

    async fn decrypt_entry(&self, entry: JournalEntry) -> DomainResult<JournalEntry> {
        if !entry.encrypted {
            return Ok(entry);
        }
        let content = self.boundary.decrypt_field(&entry.content).await?;
        let mood = self.boundary.decrypt_field(&entry.mood).await?;
        let tags = self.boundary.decrypt_fields(&entry.tags).await?;
        Ok(JournalEntry {
            content,
            mood,
            tags,
            encrypted: false,
            ..entry
        })
    }

    async fn trigger_workflow(&self, entry: &JournalEntry, request: &RequestContext) {
        let payload = JournalEntryCreatedPayload {
            entry_id: entry.id.clone(),
            user_id: entry.user_id.clone(),
            encrypted: entry.encrypted,
            created_at: entry.created_at.clone(),
        };
        let payload = match serde_json::to_value(&payload) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode journal workflow payload");
                return;
            }
        };
        let job = new_job(
            uuid_v7_without_dashes(),
            JobType::JournalEntryCreated,
            payload,
            entry.id.clone(),
            request.correlation_id.clone(),
            &self.config.job_defaults,
        );
        if let Err(err) = self.jobs.enqueue(&job).await {
            tracing::warn!(error = %err, entry_id = %entry.id, "failed to enqueue journal workflow");
        }
    }
}

impl JournalEntry {
    fn draft(user_id: &str, input: JournalEntryCreate, now_ms: i64) -> Self {
        let timestamp = format_ms_rfc3339(now_ms);
        Self {
            id: format!("entry_{}", uuid_v7_without_dashes()),
            user_id: user_id.to_string(),
            content: input.content,
            mood: input.mood,
            tags: input.tags,
            created_at: timestamp.clone(),
            updated_at: timestamp,
            encrypted: false,
        }
    }
}

fn validate_journal_entry_create(input: JournalEntryCreate) -> DomainResult<JournalEntryCreate> {
    if input.content.trim().is_empty() {
        return Err(DomainError::Validation("content is required".into()));
    }
    if input.content.chars().count() > MAX_CONTENT_LENGTH {
        return Err(DomainError::Validation(format!(
            "content exceeds {MAX_CONTENT_LENGTH} characters"
        )));
    }
    if input.mood.chars().count() > MAX_MOOD_LENGTH {
        return Err(DomainError::Validation(format!(
            "mood exceeds {MAX_MOOD_LENGTH} characters"
        )));
    }
    if input.tags.len() > MAX_TAGS {
        return Err(DomainError::Validation(format!(
            "at most {MAX_TAGS} tags are allowed"
        )));
    }
    if input
        .tags
        .iter()
        .any(|tag| tag.chars().count() > MAX_TAG_LENGTH)
    {
        return Err(DomainError::Validation(format!(
            "tags must be at most {MAX_TAG_LENGTH} characters"
        )));
    }
    Ok(input)
}
