//! In-process background work queue.
//!
//! Apps that declare `requires_queue` register one consumer at startup; each
//! consumer runs on its own tokio task and drains jobs in FIFO order. A job
//! whose handler fails is retried with linear backoff up to
//! [`MAX_ATTEMPTS`] times, then dropped with a warning.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::apps::AppName;
use crate::session::SessionEvent;

pub const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub app: AppName,
    /// App instance the job belongs to.
    pub instance_id: String,
    pub event: SessionEvent,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("no queue consumer registered for app '{0}'")]
    NoConsumer(AppName),
    #[error("queue consumer for app '{0}' has stopped")]
    Closed(AppName),
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> anyhow::Result<()>;
}

#[derive(Clone, Default)]
pub struct JobQueue {
    consumers: Arc<RwLock<HashMap<AppName, mpsc::UnboundedSender<Job>>>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the consumer task for `app`. Replaces any earlier consumer.
    pub fn register_consumer(&self, app: AppName, handler: Arc<dyn JobHandler>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        self.consumers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(app, tx);
        info!(app = %app, "queue consumer registered");

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                run_job(handler.as_ref(), &job, RETRY_BACKOFF).await;
            }
            debug!(app = %app, "queue consumer stopped");
        })
    }

    pub fn has_consumer(&self, app: AppName) -> bool {
        self.consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&app)
    }

    pub fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        let app = job.app;
        let consumers = self.consumers.read().unwrap_or_else(PoisonError::into_inner);
        let tx = consumers.get(&app).ok_or(QueueError::NoConsumer(app))?;
        tx.send(job).map_err(|_| QueueError::Closed(app))?;
        debug!(app = %app, "job enqueued");
        Ok(())
    }
}

async fn run_job(handler: &dyn JobHandler, job: &Job, backoff: Duration) {
    for attempt in 1..=MAX_ATTEMPTS {
        match handler.handle(job).await {
            Ok(()) => return,
            Err(e) if attempt < MAX_ATTEMPTS => {
                warn!(app = %job.app, instance = %job.instance_id, attempt, error = %e, "job failed, retrying");
                tokio::time::sleep(backoff * attempt).await;
            }
            Err(e) => {
                warn!(app = %job.app, instance = %job.instance_id, error = %e, "job failed, giving up");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::session::EventPayload;

    struct Collect(mpsc::UnboundedSender<Job>);

    #[async_trait]
    impl JobHandler for Collect {
        async fn handle(&self, job: &Job) -> anyhow::Result<()> {
            self.0.send(job.clone())?;
            Ok(())
        }
    }

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn handle(&self, _job: &Job) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("helpdesk unavailable");
            }
            Ok(())
        }
    }

    fn job(app: AppName) -> Job {
        Job {
            app,
            instance_id: "app_1".into(),
            event: SessionEvent {
                session: "default".into(),
                payload: EventPayload::MessageReceived {
                    id: "m1".into(),
                    from: "1@c.us".into(),
                    body: "hello".into(),
                },
            },
        }
    }

    #[tokio::test]
    async fn consumer_receives_jobs_in_order() {
        let queue = JobQueue::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        queue.register_consumer(AppName::Chatwoot, Arc::new(Collect(tx)));

        let mut second = job(AppName::Chatwoot);
        second.instance_id = "app_2".into();
        queue.enqueue(job(AppName::Chatwoot)).unwrap();
        queue.enqueue(second).unwrap();

        assert_eq!(rx.recv().await.unwrap().instance_id, "app_1");
        assert_eq!(rx.recv().await.unwrap().instance_id, "app_2");
    }

    #[test]
    fn enqueue_without_consumer_fails() {
        let queue = JobQueue::new();
        assert!(!queue.has_consumer(AppName::Calls));
        assert_eq!(
            queue.enqueue(job(AppName::Calls)),
            Err(QueueError::NoConsumer(AppName::Calls))
        );
    }

    #[tokio::test]
    async fn failed_jobs_are_retried_until_max_attempts() {
        let flaky = Flaky {
            failures_left: AtomicU32::new(1),
            calls: AtomicU32::new(0),
        };
        run_job(&flaky, &job(AppName::Chatwoot), Duration::ZERO).await;
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);

        let hopeless = Flaky {
            failures_left: AtomicU32::new(u32::MAX),
            calls: AtomicU32::new(0),
        };
        run_job(&hopeless, &job(AppName::Chatwoot), Duration::ZERO).await;
        assert_eq!(hopeless.calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }
}
