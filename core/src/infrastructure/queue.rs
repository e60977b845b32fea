// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! In-process job queue backing the workflow engine.
//!
//! Single-host by design: a bounded mpsc channel carries job ids to the
//! dispatcher while a state table tracks attempts and terminal outcomes.
//! Failed jobs are retried with exponential backoff up to the attempt cap;
//! discarded jobs are skipped at dequeue and observed by running workers
//! between steps.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::errors::CoreError;

/// Default attempt cap: one initial try plus two retries.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Discarded,
}

#[derive(Debug, Clone)]
struct JobRecord<T> {
    payload: T,
    state: JobState,
    attempts: u32,
    last_error: Option<String>,
}

/// A dequeued job handed to a worker.
#[derive(Debug, Clone)]
pub struct Job<T> {
    pub id: String,
    pub payload: T,
    pub attempt: u32,
}

pub struct JobQueue<T> {
    tx: mpsc::Sender<String>,
    rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    records: Arc<Mutex<HashMap<String, JobRecord<T>>>>,
    max_attempts: u32,
}

impl<T: Clone + Send + 'static> JobQueue<T> {
    pub fn new() -> Self {
        Self::with_max_attempts(DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            records: Arc::new(Mutex::new(HashMap::new())),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Add a job keyed by id. Re-enqueueing a live id is a conflict.
    pub async fn enqueue(&self, id: &str, payload: T) -> Result<(), CoreError> {
        {
            let mut records = self.records.lock().unwrap();
            if let Some(existing) = records.get(id) {
                if matches!(existing.state, JobState::Waiting | JobState::Active) {
                    return Err(CoreError::Conflict(format!("job '{id}' already queued")));
                }
            }
            records.insert(
                id.to_string(),
                JobRecord {
                    payload,
                    state: JobState::Waiting,
                    attempts: 0,
                    last_error: None,
                },
            );
        }
        self.tx
            .send(id.to_string())
            .await
            .map_err(|_| CoreError::Backend("job queue closed".into()))
    }

    /// Blocking receive for the dispatcher. Discarded jobs are consumed and
    /// skipped. Returns `None` once the queue is closed.
    pub async fn dequeue(&self) -> Option<Job<T>> {
        let mut rx = self.rx.lock().await;
        loop {
            let id = rx.recv().await?;
            let mut records = self.records.lock().unwrap();
            let Some(record) = records.get_mut(&id) else {
                continue;
            };
            if record.state != JobState::Waiting {
                debug!(job_id = %id, state = ?record.state, "Skipping non-waiting job");
                continue;
            }
            record.state = JobState::Active;
            record.attempts += 1;
            return Some(Job {
                id,
                payload: record.payload.clone(),
                attempt: record.attempts,
            });
        }
    }

    pub fn complete(&self, id: &str) {
        self.set_state(id, JobState::Completed, None);
    }

    /// Record a failure. Below the attempt cap the job is re-queued after
    /// an exponential backoff delay; at the cap it goes terminal.
    pub fn fail(&self, id: &str, error: &str) {
        let retry = {
            let mut records = self.records.lock().unwrap();
            match records.get_mut(id) {
                Some(record) if record.state == JobState::Active => {
                    record.last_error = Some(error.to_string());
                    if record.attempts < self.max_attempts {
                        record.state = JobState::Waiting;
                        Some(backoff_delay(record.attempts))
                    } else {
                        record.state = JobState::Failed;
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some(delay) = retry {
            let tx = self.tx.clone();
            let id = id.to_string();
            warn!(job_id = %id, delay_secs = delay.as_secs(), "Retrying job after backoff");
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(id).await;
            });
        }
    }

    /// Mark a job discarded. Waiting jobs never start; an active worker
    /// observes the state change between steps.
    pub fn discard(&self, id: &str, reason: &str) {
        self.set_state(id, JobState::Discarded, Some(reason));
    }

    pub fn state(&self, id: &str) -> Option<JobState> {
        self.records.lock().unwrap().get(id).map(|r| r.state)
    }

    pub fn last_error(&self, id: &str) -> Option<String> {
        self.records
            .lock()
            .unwrap()
            .get(id)
            .and_then(|r| r.last_error.clone())
    }

    fn set_state(&self, id: &str, state: JobState, error: Option<&str>) {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get_mut(id) {
            record.state = state;
            if let Some(error) = error {
                record.last_error = Some(error.to_string());
            }
        }
    }
}

impl<T: Clone + Send + 'static> Default for JobQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(6))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_dequeue_complete() {
        let queue: JobQueue<String> = JobQueue::new();
        queue.enqueue("job-1", "payload".to_string()).await.unwrap();

        let job = queue.dequeue().await.unwrap();
        assert_eq!(job.id, "job-1");
        assert_eq!(job.attempt, 1);
        assert_eq!(queue.state("job-1"), Some(JobState::Active));

        queue.complete("job-1");
        assert_eq!(queue.state("job-1"), Some(JobState::Completed));
    }

    #[tokio::test]
    async fn duplicate_live_enqueue_is_a_conflict() {
        let queue: JobQueue<u32> = JobQueue::new();
        queue.enqueue("dup", 1).await.unwrap();
        assert!(queue.enqueue("dup", 2).await.is_err());
    }

    #[tokio::test]
    async fn discarded_jobs_are_skipped_at_dequeue() {
        let queue: JobQueue<u32> = JobQueue::new();
        queue.enqueue("a", 1).await.unwrap();
        queue.enqueue("b", 2).await.unwrap();
        queue.discard("a", "cancelled");

        let job = queue.dequeue().await.unwrap();
        assert_eq!(job.id, "b");
        assert_eq!(queue.state("a"), Some(JobState::Discarded));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_jobs_retry_until_the_attempt_cap() {
        let queue: JobQueue<u32> = JobQueue::with_max_attempts(2);
        queue.enqueue("flaky", 7).await.unwrap();

        let job = queue.dequeue().await.unwrap();
        assert_eq!(job.attempt, 1);
        queue.fail("flaky", "boom");
        assert_eq!(queue.state("flaky"), Some(JobState::Waiting));

        let job = queue.dequeue().await.unwrap();
        assert_eq!(job.attempt, 2);
        queue.fail("flaky", "boom again");
        assert_eq!(queue.state("flaky"), Some(JobState::Failed));
        assert_eq!(queue.last_error("flaky").as_deref(), Some("boom again"));
    }
}
