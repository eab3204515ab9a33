use reverie_domain::journal::JournalEntryCreatedPayload;
use reverie_domain::ports::jobs::{JobEnvelope, JobType};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HandlerError {
    /// The job can never succeed; retrying is pointless.
    #[error("invalid job payload: {0}")]
    InvalidPayload(String),
    #[error("transient failure: {0}")]
    Transient(String),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Outbound notification for a new entry. Carries identifiers only; entry
/// content never leaves the encryption boundary through the job queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryNotification {
    pub entry_id: String,
    pub user_id: String,
    pub correlation_id: String,
}

pub trait NotificationSink: Send + Sync {
    fn deliver(&self, notification: &EntryNotification) -> Result<(), HandlerError>;
}

/// Delivery by structured log line, the only channel configured today.
#[derive(Default)]
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn deliver(&self, notification: &EntryNotification) -> Result<(), HandlerError> {
        tracing::info!(
            entry_id = %notification.entry_id,
            user_id = %notification.user_id,
            correlation_id = %notification.correlation_id,
            "journal entry notification dispatched"
        );
        Ok(())
    }
}

pub struct JobHandler<S> {
    sink: S,
}

impl<S: NotificationSink> JobHandler<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn handle(&self, job: &JobEnvelope) -> Result<(), HandlerError> {
        match job.job_type {
            JobType::JournalEntryCreated => self.handle_entry_created(job),
        }
    }

    fn handle_entry_created(&self, job: &JobEnvelope) -> Result<(), HandlerError> {
        let payload: JournalEntryCreatedPayload = serde_json::from_value(job.payload.clone())
            .map_err(|err| HandlerError::InvalidPayload(err.to_string()))?;
        if payload.entry_id.is_empty() || payload.user_id.is_empty() {
            return Err(HandlerError::InvalidPayload(
                "entry_id and user_id are required".into(),
            ));
        }
        self.sink.deliver(&EntryNotification {
            entry_id: payload.entry_id,
            user_id: payload.user_id,
            correlation_id: job.correlation_id.clone(),
        })
    }
}
