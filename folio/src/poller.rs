use crate::config::JobsConfig;
use crate::scheduler::JobScheduler;
use anyhow::{bail, Result};
use log::{debug, error, info};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const STOPPED: u8 = 2;

/// Runs the job scheduler periodically in a background task until stopped.
#[derive(Clone)]
pub struct Poller {
    stop_polling: Arc<AtomicU8>,
    wake_up: Arc<Notify>,
}

impl Poller {
    /// Must be called from within a tokio runtime.
    pub fn start_polling(scheduler: Arc<JobScheduler>, config: JobsConfig) -> Self {
        let stop = Arc::new(AtomicU8::new(RUNNING));
        let wake_up = Arc::new(Notify::new());
        let stop_clone = stop.clone();
        let wake_up_clone = wake_up.clone();
        tokio::spawn(async move {
            info!(
                "Starting job poller. queue={:?}, limit={}, interval={:?}",
                config.queue, config.limit, config.poll_interval
            );
            while stop_clone.load(Ordering::SeqCst) == RUNNING {
                // A panicking run must not take the poller down with it.
                let handle = tokio::spawn(poll(scheduler.clone(), config.clone()));
                if let Err(err) = handle.await {
                    error!("Poller iteration panicked: {:?}", err);
                }
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    _ = wake_up_clone.notified() => {}
                }
            }
            info!("Polling has stopped");
            stop_clone.store(STOPPED, Ordering::SeqCst);
        });
        Self {
            stop_polling: stop,
            wake_up,
        }
    }

    /// Signals the poller to stop and waits for the in-flight run to settle.
    pub async fn stop_polling(&self) -> Result<()> {
        info!("Stopping poller");
        self.stop_polling.store(STOPPING, Ordering::SeqCst);
        self.wake_up.notify_one();
        for _ in 0..1000 {
            if self.is_stopped() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        bail!("Poller did not stop")
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_polling.load(Ordering::SeqCst) == STOPPED
    }
}

async fn poll(scheduler: Arc<JobScheduler>, config: JobsConfig) {
    match scheduler
        .run_due_jobs_with_report(config.limit, config.queue.as_deref())
        .await
    {
        Ok(report) if report.found > 0 => debug!(
            "Poll finished. found={}, succeeded={}, failed={}, skipped={}",
            report.found,
            report.succeeded(),
            report.failed(),
            report.skipped.len()
        ),
        Ok(_) => {}
        Err(err) => error!("Failed to run due jobs: {:?}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finder::{Finder, ReadTransform};
    use crate::jobs::{jobs_collection, NewJob, JOBS_COLLECTION};
    use crate::query::SimpleQueryBuilder;
    use crate::registry::tests::{task, workflow};
    use crate::registry::WorkflowRegistryBuilder;
    use crate::schema::SchemaRegistryBuilder;
    use crate::state::{Connection, DocumentStore, InMemoryStore, State};
    use crate::MockWorkflowExecutor;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn create_test_scheduler(
        store: Arc<InMemoryStore>,
        executor: MockWorkflowExecutor,
    ) -> Arc<JobScheduler> {
        let registry = SchemaRegistryBuilder::default()
            .add_collection(jobs_collection())
            .build()
            .unwrap();
        let finder = Finder::new(
            State {
                store,
                registry: registry.clone(),
            },
            Arc::new(SimpleQueryBuilder::new(registry, 10)),
            Arc::new(ReadTransform),
            10,
        );
        let workflows = WorkflowRegistryBuilder::default()
            .add_task(task("send", None))
            .add_workflow(workflow("notify", &[("send", "first")]))
            .build()
            .unwrap();
        Arc::new(JobScheduler::new(
            Arc::new(finder),
            workflows,
            Arc::new(executor),
            2,
        ))
    }

    fn test_config() -> JobsConfig {
        JobsConfig {
            poll_interval: Duration::from_millis(10),
            ..JobsConfig::default()
        }
    }

    #[tokio::test]
    async fn test_poller_runs_jobs_until_stopped() {
        let store = Arc::new(InMemoryStore::default());
        let job = NewJob::workflow("notify", json!({})).into_document().unwrap();
        let connection = store.connection(None);
        let id = connection
            .create(JOBS_COLLECTION.to_string(), job)
            .await
            .unwrap()["id"]
            .clone();

        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        let connection_clone = connection.clone();
        let mut executor = MockWorkflowExecutor::new();
        executor.expect_run_workflow().returning(move |job, _, _| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            let update = crate::state::tests::doc(json!({"completedAt": "2024-01-01T00:00:00Z"}));
            let connection = connection_clone.clone();
            // The mock is synchronous, so the completion is written from a detached task.
            tokio::spawn(async move {
                connection
                    .update_by_id(JOBS_COLLECTION.to_string(), job.id, update)
                    .await
                    .unwrap();
            });
            Ok(())
        });

        let poller = Poller::start_polling(create_test_scheduler(store, executor), test_config());
        for _ in 0..100 {
            let job = connection
                .find_by_id(JOBS_COLLECTION.to_string(), id.clone())
                .await
                .unwrap()
                .unwrap();
            if job.contains_key("completedAt") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        poller.stop_polling().await.unwrap();
        assert!(poller.is_stopped());
        assert!(runs.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_stop_idle_poller() {
        let mut executor = MockWorkflowExecutor::new();
        executor.expect_run_workflow().times(0);
        let poller = Poller::start_polling(
            create_test_scheduler(Arc::new(InMemoryStore::default()), executor),
            JobsConfig {
                poll_interval: Duration::from_secs(60),
                ..JobsConfig::default()
            },
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        poller.stop_polling().await.unwrap();
        assert!(poller.is_stopped());
    }
}
