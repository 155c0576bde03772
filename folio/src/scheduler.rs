use crate::finder::{FindArgs, Finder};
use crate::jobs::{get_workflow_status, Job, JOBS_COLLECTION};
use crate::query::{Operator, Where};
use crate::registry::WorkflowRegistry;
use crate::{DocumentId, WorkflowError, WorkflowExecutor, WorkflowSlug};
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, error, info};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub job_id: DocumentId,
    pub workflow_slug: WorkflowSlug,
    pub error: Option<WorkflowError>,
}

/// What a scheduler run did with the due jobs it fetched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub found: usize,
    pub new_jobs: usize,
    /// One entry per job handed to the executor, in fetch order.
    pub outcomes: Vec<JobOutcome>,
    /// Jobs without a registered workflow, or whose document could not be read.
    pub skipped: Vec<DocumentId>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_none()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_some()).count()
    }
}

/// Jobs eligible to run at `now`: not completed, not errored, not being processed, not
/// waiting, and in `queue` when one is given.
pub fn due_jobs_where(now: DateTime<Utc>, queue: Option<&str>) -> Where {
    let mut clauses = vec![
        Where::field("completedAt", Operator::Exists, json!(false)),
        Where::field("hasError", Operator::NotEquals, json!(true)),
        Where::field("processing", Operator::Equals, json!(false)),
        Where::Or(vec![
            Where::field("waitUntil", Operator::Exists, json!(false)),
            Where::field("waitUntil", Operator::LessThan, json!(now.to_rfc3339())),
        ]),
    ];
    if let Some(queue) = queue {
        clauses.push(Where::field("queue", Operator::Equals, json!(queue)));
    }
    Where::And(clauses)
}

/// Fetches due jobs and hands each of them to the workflow executor.
///
/// Marking jobs as completed or errored is left to the executor. Jobs run concurrently,
/// at most `concurrency` at a time, and a failing job does not affect the others.
pub struct JobScheduler {
    finder: Arc<Finder>,
    workflows: Arc<WorkflowRegistry>,
    executor: Arc<dyn WorkflowExecutor>,
    concurrency: usize,
}

impl JobScheduler {
    pub fn new(
        finder: Arc<Finder>,
        workflows: Arc<WorkflowRegistry>,
        executor: Arc<dyn WorkflowExecutor>,
        concurrency: usize,
    ) -> Self {
        Self {
            finder,
            workflows,
            executor,
            concurrency: concurrency.max(1),
        }
    }

    /// Runs one batch of due jobs. Returns `true` once every job of the batch settled;
    /// only a failure to query the jobs is an error.
    pub async fn run_due_jobs(&self, limit: i64, queue: Option<&str>) -> Result<bool> {
        self.run_due_jobs_with_report(limit, queue).await?;
        Ok(true)
    }

    pub async fn run_due_jobs_with_report(
        &self,
        limit: i64,
        queue: Option<&str>,
    ) -> Result<RunReport> {
        info!("Querying for {} jobs.", limit);
        let page = self
            .finder
            .find_page(FindArgs {
                where_: Some(due_jobs_where(Utc::now(), queue)),
                limit: Some(limit),
                pagination: false,
                override_access: true,
                show_hidden_fields: true,
                ..FindArgs::new(JOBS_COLLECTION)
            })
            .await?;

        let mut report = RunReport {
            found: page.docs.len(),
            ..RunReport::default()
        };
        if page.docs.is_empty() {
            return Ok(report);
        }

        let mut jobs = Vec::with_capacity(page.docs.len());
        for doc in page.docs {
            let id = doc.get("id").cloned().unwrap_or_default();
            match Job::from_document(doc) {
                Ok(job) => jobs.push(job),
                Err(err) => {
                    error!("Skipping unreadable job. job_id={}, error={:?}", id, err);
                    report.skipped.push(id);
                }
            }
        }

        report.new_jobs = jobs.iter().filter(|job| !job.seen_by_worker).count();
        if report.new_jobs > 0 {
            info!(
                "{} job(s) found, {} of which are new. Running {} job(s).",
                report.found, report.new_jobs, limit
            );
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut runs = Vec::with_capacity(jobs.len());
        for job in jobs {
            let workflow = match self.workflows.workflow_for(&job) {
                Some(workflow) => workflow,
                None => {
                    debug!(
                        "Skipping job without a registered workflow. job_id={}, workflow={:?}, task={:?}",
                        job.id, job.workflow_slug, job.task_slug
                    );
                    report.skipped.push(job.id);
                    continue;
                }
            };
            let status = get_workflow_status(&job, &workflow, self.workflows.task_configs());
            let executor = self.executor.clone();
            let semaphore = semaphore.clone();
            let job_id = job.id.clone();
            let workflow_slug = workflow.slug.clone();
            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(err) => return Err(WorkflowError::internal_error(err.to_string())),
                };
                executor.run_workflow(job, workflow, status).await
            });
            runs.push(async move {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(join_error) => Err(WorkflowError::internal_error(format!(
                        "Workflow run panicked: {:?}",
                        join_error
                    ))),
                };
                if let Err(err) = &result {
                    error!(
                        "Workflow run failed. job_id={}, workflow={}, error={:?}",
                        job_id, workflow_slug, err
                    );
                }
                JobOutcome {
                    job_id,
                    workflow_slug,
                    error: result.err(),
                }
            });
        }
        report.outcomes = join_all(runs).await;
        debug!(
            "Scheduler run finished. succeeded={}, failed={}, skipped={}",
            report.succeeded(),
            report.failed(),
            report.skipped.len()
        );
        Ok(report)
    }
}
