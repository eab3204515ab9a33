use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use reverie_domain::clock::now_ms;
use reverie_domain::ports::BoxFuture;
use reverie_domain::ports::jobs::{JobEnvelope, JobQueue, JobQueueError};

/// Reliable queue on Redis: a ready list, a delayed sorted set scored by
/// `run_at_ms`, a processing list for in-flight ids and a payload hash.
#[derive(Clone)]
pub struct RedisJobQueue {
    manager: ConnectionManager,
    keys: QueueKeys,
}

#[derive(Clone, Debug)]
struct QueueKeys {
    ready: String,
    delayed: String,
    processing: String,
    payloads: String,
}

impl QueueKeys {
    fn new(prefix: &str) -> Self {
        Self {
            ready: format!("{prefix}:ready"),
            delayed: format!("{prefix}:delayed"),
            processing: format!("{prefix}:processing"),
            payloads: format!("{prefix}:payloads"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobQueueMetricsSnapshot {
    pub ready: u64,
    pub delayed: u64,
    pub processing: u64,
    pub oldest_delayed_ms: Option<i64>,
}

fn op_err(err: redis::RedisError) -> JobQueueError {
    JobQueueError::Operation(err.to_string())
}

impl RedisJobQueue {
    pub async fn connect_with_prefix(
        redis_url: &str,
        prefix: impl AsRef<str>,
    ) -> Result<Self, JobQueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| JobQueueError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| JobQueueError::Unavailable(err.to_string()))?;
        Ok(Self {
            manager,
            keys: QueueKeys::new(prefix.as_ref()),
        })
    }

    fn serialize(job: &JobEnvelope) -> Result<String, JobQueueError> {
        serde_json::to_string(job).map_err(|err| JobQueueError::Serialization(err.to_string()))
    }

    fn deserialize(payload: &str) -> Result<JobEnvelope, JobQueueError> {
        serde_json::from_str(payload).map_err(|err| JobQueueError::Serialization(err.to_string()))
    }

    /// Stores the job payload and schedules it, either on the ready list or
    /// in the delayed set.
    fn schedule(&self, pipeline: &mut redis::Pipeline, job_id: &str, run_at_ms: i64) {
        if run_at_ms <= now_ms() {
            pipeline.cmd("LPUSH").arg(&self.keys.ready).arg(job_id);
        } else {
            pipeline
                .cmd("ZADD")
                .arg(&self.keys.delayed)
                .arg(run_at_ms)
                .arg(job_id);
        }
    }

    /// Moves an in-flight job back to the queue with its updated attempt
    /// count and run time, in one transaction.
    pub async fn restore_processing_with_retry_delay(
        &self,
        job: &JobEnvelope,
    ) -> Result<(), JobQueueError> {
        let payload = Self::serialize(job)?;
        let mut pipeline = redis::pipe();
        pipeline.atomic();
        pipeline
            .cmd("HSET")
            .arg(&self.keys.payloads)
            .arg(&job.job_id)
            .arg(payload)
            .ignore();
        pipeline
            .cmd("LREM")
            .arg(&self.keys.processing)
            .arg(1)
            .arg(&job.job_id)
            .ignore();
        self.schedule(&mut pipeline, &job.job_id, job.run_at_ms);

        let mut conn = self.manager.clone();
        let _: () = pipeline.query_async(&mut conn).await.map_err(op_err)?;
        Ok(())
    }

    pub async fn metrics_snapshot(&self) -> Result<JobQueueMetricsSnapshot, JobQueueError> {
        let mut conn = self.manager.clone();
        let ready: u64 = conn.llen(&self.keys.ready).await.map_err(op_err)?;
        let delayed: u64 = conn.zcard(&self.keys.delayed).await.map_err(op_err)?;
        let processing: u64 = conn.llen(&self.keys.processing).await.map_err(op_err)?;

        let oldest_delayed_ms = if delayed == 0 {
            None
        } else {
            let head: Vec<(String, f64)> = conn
                .zrange_withscores(&self.keys.delayed, 0, 0)
                .await
                .map_err(op_err)?;
            head.into_iter().next().map(|(_, score)| score as i64)
        };

        Ok(JobQueueMetricsSnapshot {
            ready,
            delayed,
            processing,
            oldest_delayed_ms,
        })
    }
}

impl JobQueue for RedisJobQueue {
    fn enqueue(&self, job: &JobEnvelope) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let payload = Self::serialize(job);
        let job_id = job.job_id.clone();
        let run_at_ms = job.run_at_ms;
        Box::pin(async move {
            let mut pipeline = redis::pipe();
            pipeline.atomic();
            pipeline
                .cmd("HSET")
                .arg(&self.keys.payloads)
                .arg(&job_id)
                .arg(payload?)
                .ignore();
            self.schedule(&mut pipeline, &job_id, run_at_ms);

            let mut conn = self.manager.clone();
            let _: () = pipeline.query_async(&mut conn).await.map_err(op_err)?;
            Ok(())
        })
    }

    fn dequeue(
        &self,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<JobEnvelope>, JobQueueError>> {
        let timeout_secs = timeout.as_secs().max(1);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let job_id: Option<String> = redis::cmd("BRPOPLPUSH")
                .arg(&self.keys.ready)
                .arg(&self.keys.processing)
                .arg(timeout_secs)
                .query_async(&mut conn)
                .await
                .map_err(op_err)?;
            let Some(job_id) = job_id else {
                return Ok(None);
            };

            let payload: Option<String> = conn
                .hget(&self.keys.payloads, &job_id)
                .await
                .map_err(op_err)?;
            match payload {
                Some(payload) => Ok(Some(Self::deserialize(&payload)?)),
                None => {
                    let _: i64 = conn
                        .lrem(&self.keys.processing, 1, &job_id)
                        .await
                        .map_err(op_err)?;
                    Err(JobQueueError::Operation(format!(
                        "missing payload for job_id {job_id}"
                    )))
                }
            }
        })
    }

    fn ack(&self, job_id: &str) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let job_id = job_id.to_string();
        Box::pin(async move {
            let mut pipeline = redis::pipe();
            pipeline.atomic();
            pipeline
                .cmd("LREM")
                .arg(&self.keys.processing)
                .arg(1)
                .arg(&job_id)
                .ignore();
            pipeline
                .cmd("HDEL")
                .arg(&self.keys.payloads)
                .arg(&job_id)
                .ignore();
            let mut conn = self.manager.clone();
            let _: () = pipeline.query_async(&mut conn).await.map_err(op_err)?;
            Ok(())
        })
    }

    fn promote_due(&self, now_ms: i64, limit: usize) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let mut moved = 0usize;
            while moved < limit {
                let popped: Vec<(String, f64)> = conn
                    .zpopmin(&self.keys.delayed, 1)
                    .await
                    .map_err(op_err)?;
                let Some((job_id, score)) = popped.into_iter().next() else {
                    break;
                };
                if score as i64 > now_ms {
                    // Not due yet; put it back and stop.
                    let _: i64 = conn
                        .zadd(&self.keys.delayed, &job_id, score)
                        .await
                        .map_err(op_err)?;
                    break;
                }
                let _: i64 = conn.lpush(&self.keys.ready, &job_id).await.map_err(op_err)?;
                moved += 1;
            }
            Ok(moved)
        })
    }

    fn requeue_processing(&self, limit: usize) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        Box::pin(async move {
            if limit == 0 {
                return Ok(0);
            }
            let mut conn = self.manager.clone();
            let job_ids: Vec<String> = conn
                .lrange(&self.keys.processing, 0, limit.saturating_sub(1) as isize)
                .await
                .map_err(op_err)?;
            if job_ids.is_empty() {
                return Ok(0);
            }

            let mut pipeline = redis::pipe();
            pipeline.atomic();
            pipeline
                .cmd("RPUSH")
                .arg(&self.keys.ready)
                .arg(&job_ids)
                .ignore();
            pipeline
                .cmd("LTRIM")
                .arg(&self.keys.processing)
                .arg(job_ids.len() as i64)
                .arg(-1)
                .ignore();
            let _: () = pipeline.query_async(&mut conn).await.map_err(op_err)?;
            Ok(job_ids.len())
        })
    }
}
