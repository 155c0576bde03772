use crate::jobs::{
    Job, TaskLogEntry, TaskState, TaskStatus, WorkflowConfig, WorkflowTasksStatus,
    JOBS_COLLECTION,
};
use crate::registry::TaskHandlerRegistry;
use crate::state::State;
use crate::{
    Document, TaskInput, WorkflowError, WorkflowErrorType, WorkflowExecutor,
};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::sync::Arc;

/// Workflow executor running the pending tasks of a job one after the other through the
/// registered task handlers.
///
/// The job is flagged `processing` while the executor works on it. The run stops at the
/// first failing task; the failure counts as one try of the job, and the job is marked
/// as errored once the task exhausted its retries or the error is not retriable.
pub struct SimpleWorkflowExecutor {
    state: State,
    handlers: Arc<TaskHandlerRegistry>,
}

struct TaskFailure {
    task_id: String,
    error: WorkflowError,
    exhausted: bool,
}

impl SimpleWorkflowExecutor {
    pub fn new(state: State, handlers: Arc<TaskHandlerRegistry>) -> Self {
        Self { state, handlers }
    }

    async fn run_task(
        &self,
        job: &Job,
        workflow: &WorkflowConfig,
        task: &TaskStatus,
        previous_outputs: serde_json::Map<String, Value>,
    ) -> Result<Value, WorkflowError> {
        let handler = self.handlers.get(&task.task_slug)?;
        let input = TaskInput {
            job_id: job.id.clone(),
            workflow_slug: workflow.slug.clone(),
            task_slug: task.task_slug.clone(),
            task_id: task.task_id.clone(),
            input: job.input.clone(),
            previous_outputs,
        };
        match tokio::spawn(async move { handler.run(input).await }).await {
            Ok(result) => result,
            Err(join_error) => {
                error!(
                    "Task execution panicked. job_id={}, task_id={}, error={:?}",
                    job.id, task.task_id, join_error
                );
                Err(WorkflowError {
                    is_retriable: false,
                    error: format!("{:?}", join_error),
                    error_type: WorkflowErrorType::TaskExecutionError,
                })
            }
        }
    }

    async fn run_pending(
        &self,
        job: &Job,
        workflow: &WorkflowConfig,
        status: &WorkflowTasksStatus,
        log: &mut Vec<TaskLogEntry>,
    ) -> Result<(), TaskFailure> {
        let mut outputs = status.outputs();
        for task in status.pending() {
            let executed_at = Utc::now();
            let result = self.run_task(job, workflow, task, outputs.clone()).await;
            let mut entry = TaskLogEntry {
                task_slug: task.task_slug.clone(),
                task_id: task.task_id.clone(),
                state: TaskState::Succeeded,
                executed_at,
                completed_at: Utc::now(),
                input: job.input.clone(),
                output: None,
                error: None,
            };
            match result {
                Ok(output) => {
                    debug!(
                        "Task succeeded. job_id={}, task_id={}",
                        job.id, task.task_id
                    );
                    entry.output = Some(output.clone());
                    log.push(entry);
                    outputs.insert(task.task_id.clone(), output);
                }
                Err(error) => {
                    warn!(
                        "Task failed. job_id={}, task_id={}, error={:?}",
                        job.id, task.task_id, error
                    );
                    entry.state = TaskState::Failed;
                    entry.error = Some(error.error.clone());
                    log.push(entry);
                    return Err(TaskFailure {
                        task_id: task.task_id.clone(),
                        exhausted: task.total_tried + 1 > task.retries,
                        error,
                    });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WorkflowExecutor for SimpleWorkflowExecutor {
    async fn run_workflow(
        &self,
        job: Job,
        workflow: WorkflowConfig,
        status: WorkflowTasksStatus,
    ) -> Result<(), WorkflowError> {
        let connection = self.state.store.connection(None);
        let mut claim = Document::new();
        claim.insert("processing".to_string(), Value::Bool(true));
        claim.insert("seenByWorker".to_string(), Value::Bool(true));
        connection
            .update_by_id(JOBS_COLLECTION.to_string(), job.id.clone(), claim)
            .await?;
        info!(
            "Running workflow. job_id={}, workflow={}, pending_tasks={}",
            job.id,
            workflow.slug,
            status.pending().len()
        );

        let mut log = job.log.clone();
        let result = self.run_pending(&job, &workflow, &status, &mut log).await;

        let mut update = Document::new();
        update.insert("processing".to_string(), Value::Bool(false));
        update.insert(
            "log".to_string(),
            serde_json::to_value(&log).map_err(|e| WorkflowError::internal_error(e.to_string()))?,
        );
        match &result {
            Ok(()) => {
                info!("Job completed. job_id={}", job.id);
                update.insert(
                    "completedAt".to_string(),
                    Value::String(Utc::now().to_rfc3339()),
                );
            }
            Err(failure) => {
                update.insert("totalTried".to_string(), Value::from(job.total_tried + 1));
                if failure.exhausted || !failure.error.is_retriable {
                    error!(
                        "Job failed permanently. job_id={}, task_id={}, error={}",
                        job.id, failure.task_id, failure.error
                    );
                    update.insert("hasError".to_string(), Value::Bool(true));
                    update.insert(
                        "error".to_string(),
                        json!({"message": failure.error.error, "taskId": failure.task_id}),
                    );
                }
            }
        }
        connection
            .update_by_id(JOBS_COLLECTION.to_string(), job.id.clone(), update)
            .await?;
        result.map_err(|failure| failure.error)
    }
}
