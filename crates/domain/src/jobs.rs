use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::now_ms;
use crate::ports::BoxFuture;
use crate::ports::jobs::{JobEnvelope, JobQueue, JobQueueError, JobType};

#[derive(Clone, Debug)]
pub struct JobDefaults {
    pub max_attempts: u32,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

pub fn backoff_ms(base_ms: u64, attempt: u32, max_ms: u64) -> u64 {
    if attempt == 0 {
        return 0;
    }
    let pow = 2u64.saturating_pow(attempt.saturating_sub(1));
    let delay = base_ms.saturating_mul(pow);
    delay.min(max_ms)
}

pub fn new_job(
    job_id: String,
    job_type: JobType,
    payload: serde_json::Value,
    request_id: String,
    correlation_id: String,
    defaults: &JobDefaults,
) -> JobEnvelope {
    let now = now_ms();
    JobEnvelope {
        job_id,
        job_type,
        payload,
        request_id,
        correlation_id,
        attempt: 1,
        max_attempts: defaults.max_attempts,
        run_at_ms: now,
        created_at_ms: now,
    }
}

/// Queue kept in process memory; `dequeue` never blocks.
#[derive(Clone, Default)]
pub struct InMemoryJobQueue {
    inner: Arc<Mutex<QueueState>>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<String>,
    delayed: Vec<(i64, String)>,
    processing: VecDeque<String>,
    payloads: HashMap<String, JobEnvelope>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut QueueState) -> Result<T, JobQueueError>,
    ) -> Result<T, JobQueueError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| JobQueueError::Operation("job queue lock poisoned".into()))?;
        f(&mut guard)
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, job: &JobEnvelope) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let job = job.clone();
        let result = self.with_state(|state| {
            if job.run_at_ms <= now_ms() {
                state.ready.push_back(job.job_id.clone());
            } else {
                state.delayed.push((job.run_at_ms, job.job_id.clone()));
            }
            state.payloads.insert(job.job_id.clone(), job);
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn dequeue(
        &self,
        _timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<JobEnvelope>, JobQueueError>> {
        let result = self.with_state(|state| {
            let Some(job_id) = state.ready.pop_front() else {
                return Ok(None);
            };
            let job = state.payloads.get(&job_id).cloned().ok_or_else(|| {
                JobQueueError::Operation(format!("missing payload for job_id {job_id}"))
            })?;
            state.processing.push_back(job_id);
            Ok(Some(job))
        });
        Box::pin(async move { result })
    }

    fn ack(&self, job_id: &str) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let result = self.with_state(|state| {
            state.processing.retain(|id| id != job_id);
            state.payloads.remove(job_id);
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn promote_due(
        &self,
        now_ms: i64,
        limit: usize,
    ) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        let result = self.with_state(|state| {
            state.delayed.sort_by_key(|(run_at, _)| *run_at);
            let due = state
                .delayed
                .iter()
                .take(limit)
                .take_while(|(run_at, _)| *run_at <= now_ms)
                .count();
            for (_, job_id) in state.delayed.drain(..due) {
                state.ready.push_back(job_id);
            }
            Ok(due)
        });
        Box::pin(async move { result })
    }

    fn requeue_processing(&self, limit: usize) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        let result = self.with_state(|state| {
            let count = limit.min(state.processing.len());
            let moved: Vec<String> = state.processing.drain(..count).collect();
            state.ready.extend(moved);
            Ok(count)
        });
        Box::pin(async move { result })
    }
}

/// Trigger for deployments without a consumer: jobs are logged and dropped.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingJobQueue;

impl JobQueue for LoggingJobQueue {
    fn enqueue(&self, job: &JobEnvelope) -> BoxFuture<'_, Result<(), JobQueueError>> {
        tracing::info!(
            job_id = %job.job_id,
            job_type = job.job_type.as_str(),
            request_id = %job.request_id,
            correlation_id = %job.correlation_id,
            "no job consumer configured; workflow trigger logged only"
        );
        Box::pin(async { Ok(()) })
    }

    fn dequeue(
        &self,
        _timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<JobEnvelope>, JobQueueError>> {
        Box::pin(async { Ok(None) })
    }

    fn ack(&self, _job_id: &str) -> BoxFuture<'_, Result<(), JobQueueError>> {
        Box::pin(async { Ok(()) })
    }

    fn promote_due(
        &self,
        _now_ms: i64,
        _limit: usize,
    ) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        Box::pin(async { Ok(0) })
    }

    fn requeue_processing(&self, _limit: usize) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        Box::pin(async { Ok(0) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backoff_ms_returns_zero_for_zero_attempt() {
        assert_eq!(backoff_ms(1_000, 0, 60_000), 0);
    }

    #[test]
    fn backoff_ms_grows_geometrically() {
        assert_eq!(backoff_ms(1_000, 1, 60_000), 1_000);
        assert_eq!(backoff_ms(1_000, 2, 60_000), 2_000);
        assert_eq!(backoff_ms(1_000, 3, 60_000), 4_000);
    }

    #[test]
    fn backoff_ms_caps_at_maximum() {
        assert_eq!(backoff_ms(1_000, 10, 3_000), 3_000);
    }

    fn sample_job(job_id: &str) -> JobEnvelope {
        new_job(
            job_id.to_string(),
            JobType::JournalEntryCreated,
            json!({"entry_id": "entry_1"}),
            "req-1".to_string(),
            "corr-1".to_string(),
            &JobDefaults { max_attempts: 9 },
        )
    }

    #[test]
    fn new_job_populates_payload_and_retries() {
        let job = sample_job("job-1");
        assert_eq!(job.job_id, "job-1");
        assert_eq!(job.attempt, 1);
        assert_eq!(job.max_attempts, 9);
        assert_eq!(job.created_at_ms, job.run_at_ms);
        assert_eq!(job.payload, json!({"entry_id": "entry_1"}));
    }

    #[tokio::test]
    async fn in_memory_queue_delivers_ready_jobs_in_order() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue(&sample_job("a")).await.unwrap();
        queue.enqueue(&sample_job("b")).await.unwrap();

        let first = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.job_id, "a");
        queue.ack(&first.job_id).await.unwrap();

        let second = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second.job_id, "b");
        assert!(queue.dequeue(Duration::ZERO).await.unwrap().is_none());

        assert_eq!(queue.requeue_processing(10).await.unwrap(), 1);
        let again = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.job_id, "b");
    }

    #[tokio::test]
    async fn logging_queue_retains_nothing() {
        let queue = LoggingJobQueue;
        for n in 0..10 {
            queue.enqueue(&sample_job(&format!("job-{n}"))).await.unwrap();
        }
        assert!(queue.dequeue(Duration::ZERO).await.unwrap().is_none());
        assert_eq!(queue.promote_due(i64::MAX, 10).await.unwrap(), 0);
        assert_eq!(queue.requeue_processing(10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delayed_jobs_wait_for_promotion() {
        let queue = InMemoryJobQueue::new();
        let run_at = now_ms() + 60_000;
        queue
            .enqueue(&sample_job("later").with_run_at(run_at))
            .await
            .unwrap();
        assert!(queue.dequeue(Duration::ZERO).await.unwrap().is_none());

        assert_eq!(queue.promote_due(run_at - 1, 10).await.unwrap(), 0);
        assert_eq!(queue.promote_due(run_at, 10).await.unwrap(), 1);
        let job = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(job.job_id, "later");
    }
}
