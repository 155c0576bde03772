use crate::schema::{CollectionConfig, Field, FieldKind};
use crate::{Document, DocumentId, TaskSlug, WorkflowSlug};
use anyhow::{format_err, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const JOBS_COLLECTION: &str = "folio-jobs";
pub const DEFAULT_QUEUE: &str = "default";

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

/// A unit of background work persisted in the [JOBS_COLLECTION] collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: DocumentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_slug: Option<WorkflowSlug>,
    /// Set instead of `workflow_slug` for jobs running a single task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_slug: Option<TaskSlug>,
    #[serde(default)]
    pub input: Value,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub has_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default)]
    pub processing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub seen_by_worker: bool,
    #[serde(default)]
    pub total_tried: u32,
    #[serde(default)]
    pub log: Vec<TaskLogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn from_document(doc: Document) -> Result<Self> {
        serde_json::from_value(Value::Object(doc))
            .map_err(|err| format_err!("Invalid job document: {:?}", err))
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.completed_at.is_none()
            && !self.has_error
            && !self.processing
            && self.wait_until.map_or(true, |wait_until| wait_until < now)
    }
}

/// Parameters of a job to be queued.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub workflow_slug: Option<WorkflowSlug>,
    pub task_slug: Option<TaskSlug>,
    pub input: Value,
    pub queue: Option<String>,
    pub wait_until: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn workflow<S: Into<String>>(workflow_slug: S, input: Value) -> Self {
        Self {
            workflow_slug: Some(workflow_slug.into()),
            input,
            ..Self::default()
        }
    }

    pub fn task<S: Into<String>>(task_slug: S, input: Value) -> Self {
        Self {
            task_slug: Some(task_slug.into()),
            input,
            ..Self::default()
        }
    }

    pub fn in_queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn wait_until(mut self, wait_until: DateTime<Utc>) -> Self {
        self.wait_until = Some(wait_until);
        self
    }

    /// The document to persist, with every scheduling flag in its initial state.
    pub fn into_document(self) -> Result<Document> {
        let mut doc = Document::new();
        if let Some(workflow_slug) = self.workflow_slug {
            doc.insert("workflowSlug".to_string(), Value::String(workflow_slug));
        }
        if let Some(task_slug) = self.task_slug {
            doc.insert("taskSlug".to_string(), Value::String(task_slug));
        }
        doc.insert("input".to_string(), self.input);
        doc.insert(
            "queue".to_string(),
            Value::String(self.queue.unwrap_or_else(default_queue)),
        );
        if let Some(wait_until) = self.wait_until {
            doc.insert("waitUntil".to_string(), serde_json::to_value(wait_until)?);
        }
        doc.insert("hasError".to_string(), Value::Bool(false));
        doc.insert("processing".to_string(), Value::Bool(false));
        doc.insert("seenByWorker".to_string(), Value::Bool(false));
        doc.insert("totalTried".to_string(), Value::from(0));
        doc.insert("log".to_string(), Value::Array(vec![]));
        Ok(doc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Succeeded,
    Failed,
}

/// One task execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLogEntry {
    pub task_slug: TaskSlug,
    pub task_id: String,
    pub state: TaskState,
    pub executed_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTask {
    pub task_slug: TaskSlug,
    /// Identifies the step within the workflow. A task may appear several times under
    /// different ids.
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowConfig {
    pub slug: WorkflowSlug,
    #[serde(default)]
    pub queue: Option<String>,
    /// Retries for every task without a retry count of its own.
    #[serde(default)]
    pub retries: Option<u32>,
    pub tasks: Vec<WorkflowTask>,
}

impl WorkflowConfig {
    /// Workflow wrapping a job that references a single task.
    pub fn single_task(task: &TaskConfig) -> Self {
        Self {
            slug: task.slug.clone(),
            queue: None,
            retries: task.retries,
            tasks: vec![WorkflowTask {
                task_slug: task.slug.clone(),
                id: task.slug.clone(),
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub slug: TaskSlug,
    #[serde(default)]
    pub retries: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    pub task_slug: TaskSlug,
    pub task_id: String,
    pub complete: bool,
    pub output: Option<Value>,
    pub total_tried: u32,
    pub retries: u32,
    /// Failed more times than its retries allow.
    pub exhausted: bool,
}

/// Per-task progress of a job, in workflow order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowTasksStatus {
    pub tasks: Vec<TaskStatus>,
}

impl WorkflowTasksStatus {
    pub fn executed(&self) -> Vec<&TaskStatus> {
        self.tasks.iter().filter(|t| t.complete).collect()
    }

    pub fn pending(&self) -> Vec<&TaskStatus> {
        self.tasks.iter().filter(|t| !t.complete).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|t| t.complete)
    }

    /// Outputs of the completed tasks keyed by task id.
    pub fn outputs(&self) -> serde_json::Map<String, Value> {
        self.tasks
            .iter()
            .filter_map(|t| match (&t.output, t.complete) {
                (Some(output), true) => Some((t.task_id.clone(), output.clone())),
                _ => None,
            })
            .collect()
    }
}

/// Cross-references the job log with the workflow's tasks.
///
/// Retries come from the task config, then the workflow, then default to zero.
pub fn get_workflow_status(
    job: &Job,
    workflow: &WorkflowConfig,
    task_configs: &HashMap<TaskSlug, TaskConfig>,
) -> WorkflowTasksStatus {
    let tasks = workflow
        .tasks
        .iter()
        .map(|task| {
            let attempts: Vec<&TaskLogEntry> = job
                .log
                .iter()
                .filter(|entry| entry.task_id == task.id && entry.task_slug == task.task_slug)
                .collect();
            let succeeded = attempts
                .iter()
                .find(|entry| entry.state == TaskState::Succeeded);
            let retries = task_configs
                .get(&task.task_slug)
                .and_then(|config| config.retries)
                .or(workflow.retries)
                .unwrap_or(0);
            let total_tried = attempts.len() as u32;
            TaskStatus {
                task_slug: task.task_slug.clone(),
                task_id: task.id.clone(),
                complete: succeeded.is_some(),
                output: succeeded.and_then(|entry| entry.output.clone()),
                total_tried,
                retries,
                exhausted: succeeded.is_none() && total_tried > retries,
            }
        })
        .collect();
    WorkflowTasksStatus { tasks }
}

/// Schema of the jobs collection. Scheduling bookkeeping is hidden from regular queries.
pub fn jobs_collection() -> CollectionConfig {
    CollectionConfig::new(
        JOBS_COLLECTION,
        vec![
            Field::json("input"),
            Field::text("queue"),
            Field::text("workflowSlug"),
            Field::text("taskSlug"),
            Field::date("completedAt"),
            Field::checkbox("hasError"),
            Field::json("error"),
            Field::checkbox("processing").hidden(),
            Field::date("waitUntil"),
            Field::checkbox("seenByWorker").hidden(),
            Field::number("totalTried").hidden(),
            Field::new("log", FieldKind::Json).hidden(),
        ],
    )
    .with_default_sort("createdAt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::doc;
    use chrono::Duration;
    use serde_json::json;

    fn log_entry(task_id: &str, state: TaskState, output: Option<Value>) -> TaskLogEntry {
        TaskLogEntry {
            task_slug: "send".to_string(),
            task_id: task_id.to_string(),
            state,
            executed_at: Utc::now(),
            completed_at: Utc::now(),
            input: Value::Null,
            output,
            error: None,
        }
    }

    fn create_test_workflow() -> WorkflowConfig {
        WorkflowConfig {
            slug: "notify".to_string(),
            queue: None,
            retries: Some(1),
            tasks: vec![
                WorkflowTask {
                    task_slug: "send".to_string(),
                    id: "first".to_string(),
                },
                WorkflowTask {
                    task_slug: "send".to_string(),
                    id: "second".to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_job_from_document() {
        let job = Job::from_document(doc(json!({
            "id": 7,
            "workflowSlug": "notify",
            "input": {"to": "ana"},
            "hasError": false,
            "waitUntil": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-01T00:00:00Z",
            "log": [{
                "taskSlug": "send",
                "taskId": "first",
                "state": "failed",
                "executedAt": "2024-01-01T00:00:00Z",
                "completedAt": "2024-01-01T00:00:01Z",
                "error": "boom"
            }]
        })))
        .unwrap();
        assert_eq!(json!(7), job.id);
        assert_eq!(DEFAULT_QUEUE, job.queue);
        assert_eq!(TaskState::Failed, job.log[0].state);
        assert!(job.is_due(Utc::now()));
        assert!(!job.is_due("2023-12-31T00:00:00Z".parse().unwrap()));
        assert!(Job::from_document(doc(json!({"workflowSlug": "notify"}))).is_err());
    }

    #[test]
    fn test_new_job_document() {
        let wait_until = Utc::now() + Duration::minutes(5);
        let doc = NewJob::workflow("notify", json!({"to": "ana"}))
            .in_queue("emails")
            .wait_until(wait_until)
            .into_document()
            .unwrap();
        assert_eq!(json!("notify"), doc["workflowSlug"]);
        assert_eq!(json!("emails"), doc["queue"]);
        assert_eq!(json!(false), doc["processing"]);
        assert!(!doc.contains_key("taskSlug"));
        let mut stored = doc.clone();
        stored.insert("id".to_string(), json!(1));
        let job = Job::from_document(stored).unwrap();
        assert_eq!(Some(wait_until), job.wait_until);
        assert!(!job.is_due(Utc::now()));
    }

    #[test]
    fn test_workflow_status() {
        let mut job = Job::from_document(doc(json!({"id": 1, "workflowSlug": "notify"}))).unwrap();
        let workflow = create_test_workflow();
        let mut task_configs = HashMap::new();

        let status = get_workflow_status(&job, &workflow, &task_configs);
        assert_eq!(2, status.pending().len());
        assert!(status.executed().is_empty());
        assert!(!status.is_complete());

        job.log.push(log_entry("first", TaskState::Failed, None));
        job.log
            .push(log_entry("first", TaskState::Succeeded, Some(json!(1))));
        job.log.push(log_entry("second", TaskState::Failed, None));
        job.log.push(log_entry("second", TaskState::Failed, None));
        let status = get_workflow_status(&job, &workflow, &task_configs);
        assert_eq!("first", status.executed()[0].task_id);
        assert_eq!(Some(json!(1)), status.tasks[0].output);
        assert_eq!(2, status.tasks[0].total_tried);
        let pending = status.pending();
        let second = pending[0];
        assert_eq!(2, second.total_tried);
        assert_eq!(1, second.retries);
        assert!(second.exhausted);
        assert_eq!(json!({"first": 1}), Value::Object(status.outputs()));

        // Task retries take precedence over the workflow's.
        task_configs.insert(
            "send".to_string(),
            TaskConfig {
                slug: "send".to_string(),
                retries: Some(3),
            },
        );
        let status = get_workflow_status(&job, &workflow, &task_configs);
        assert!(!status.tasks[1].exhausted);
    }

    #[test]
    fn test_jobs_collection_hides_bookkeeping() {
        let collection = jobs_collection();
        let hidden: Vec<&str> = collection
            .fields
            .iter()
            .filter(|f| f.hidden)
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(vec!["processing", "seenByWorker", "totalTried", "log"], hidden);
    }
}
