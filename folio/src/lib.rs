//! Schema-driven document query engine and background job runner.

pub mod api;
pub mod config;
pub mod finder;
pub mod jobs;
pub mod paths;
pub mod poller;
pub mod query;
pub mod registry;
pub mod runners;
pub mod scheduler;
pub mod schema;
pub mod state;

use crate::jobs::{Job, WorkflowConfig, WorkflowTasksStatus};
use anyhow::format_err;
use async_trait::async_trait;
use derive_more::Display;
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A stored document: a JSON object keyed by field name.
pub type Document = serde_json::Map<String, serde_json::Value>;
/// Document ids are either text or numbers depending on the store's [schema::IdType].
pub type DocumentId = serde_json::Value;
/// Unique name of a collection. Must be unique across the schema registry.
pub type CollectionSlug = String;
/// Unique name of a workflow definition.
pub type WorkflowSlug = String;
/// Unique name of a task definition.
pub type TaskSlug = String;
/// Identifies an open store transaction. Calls carrying the same id share one connection.
pub type TransactionId = Uuid;

/// Returns the canonical map key for a document id: its JSON rendering, so that `1` and
/// `"1"` never collide.
pub fn id_key(id: &DocumentId) -> String {
    id.to_string()
}

/// Error raised by the query side of the engine: path resolution, query building and
/// schema lookups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FolioError {
    pub error: String,
    pub error_type: FolioErrorType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
pub enum FolioErrorType {
    /// A query path does not match the schema.
    InvalidPath,
    /// A query path touches a hidden field without overriding access.
    Forbidden,
    /// The schema shape is valid but the requested resolution is not supported.
    NotSupported,
    /// A block reference could not be found in the registry.
    MissingBlock,
    UnknownCollection,
    InvalidQuery,
}

impl FolioError {
    pub fn new<S: Into<String>>(error_type: FolioErrorType, error: S) -> Self {
        Self {
            error: error.into(),
            error_type,
        }
    }

    pub fn invalid_path(path: &str) -> Self {
        Self::new(
            FolioErrorType::InvalidPath,
            format!("The following path cannot be queried: {}", path),
        )
    }

    pub fn forbidden(path: &str) -> Self {
        Self::new(
            FolioErrorType::Forbidden,
            format!("You are not allowed to query the following path: {}", path),
        )
    }

    pub fn unknown_collection(slug: &str) -> Self {
        Self::new(
            FolioErrorType::UnknownCollection,
            format!("Collection '{}' not found in registry", slug),
        )
    }

    pub fn is_access_error(&self) -> bool {
        matches!(self.error_type, FolioErrorType::Forbidden)
    }
}

impl fmt::Display for FolioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.error)
    }
}

impl std::error::Error for FolioError {}

/// Error returned by workflow executors and task handlers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowError {
    pub is_retriable: bool,
    pub error: String,
    pub error_type: WorkflowErrorType,
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for WorkflowError {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WorkflowErrorType {
    DomainError,
    InternalError,
    TaskExecutionError,
}

impl WorkflowError {
    pub fn internal_error(error: String) -> Self {
        Self {
            is_retriable: true,
            error_type: WorkflowErrorType::InternalError,
            error,
        }
    }

    pub fn retriable_domain_error(error: String) -> Self {
        Self {
            is_retriable: true,
            error_type: WorkflowErrorType::DomainError,
            error,
        }
    }

    pub fn non_retriable_domain_error(error: String) -> Self {
        Self {
            is_retriable: false,
            error_type: WorkflowErrorType::DomainError,
            error,
        }
    }

    pub fn is_internal_error(&self) -> bool {
        matches!(self.error_type, WorkflowErrorType::InternalError)
    }

    pub fn is_domain_error(&self) -> bool {
        matches!(self.error_type, WorkflowErrorType::DomainError)
    }
}

impl From<anyhow::Error> for WorkflowError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            is_retriable: false,
            error: err.to_string(),
            error_type: WorkflowErrorType::InternalError,
        }
    }
}

impl From<String> for WorkflowError {
    fn from(err: String) -> Self {
        Self {
            is_retriable: false,
            error: err,
            error_type: WorkflowErrorType::InternalError,
        }
    }
}

/// The component that drives a job through its workflow.
///
/// The scheduler hands every due job over to the executor together with the workflow
/// definition and the already computed task status. The executor is responsible for
/// marking the job as completed or errored; the scheduler never does.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    /// Resumes the workflow for the given job.
    ///
    /// # Arguments
    ///
    /// * `job` - The job as fetched by the scheduler, hidden fields included.
    /// * `workflow` - The workflow definition the job references.
    /// * `status` - Tasks already executed vs pending, derived from the job log.
    async fn run_workflow(
        &self,
        job: Job,
        workflow: WorkflowConfig,
        status: WorkflowTasksStatus,
    ) -> Result<(), WorkflowError>;
}

/// Input handed to a [TaskHandler] for a single task execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    pub job_id: DocumentId,
    pub workflow_slug: WorkflowSlug,
    pub task_slug: TaskSlug,
    pub task_id: String,
    /// The job input, shared by every task of the workflow.
    pub input: serde_json::Value,
    /// Outputs of the tasks already completed, keyed by task id.
    pub previous_outputs: serde_json::Map<String, serde_json::Value>,
}

impl TaskInput {
    pub fn value<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_value(self.input.clone()).map_err(|err| format_err!("{:?}", err))
    }

    pub fn output_of<T: DeserializeOwned>(&self, task_id: &str) -> anyhow::Result<T> {
        let output = self
            .previous_outputs
            .get(task_id)
            .ok_or_else(|| format_err!("No output recorded for task '{}'", task_id))?;
        serde_json::from_value(output.clone()).map_err(|err| format_err!("{:?}", err))
    }
}

/// Represents a single task implementation.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Returns the task output in case of success or a [WorkflowError] otherwise.
    ///
    /// Implementation must be idempotent. Jobs are delivered at least once, so a task
    /// may run again after a crash between its execution and the job update.
    async fn run(&self, input: TaskInput) -> Result<serde_json::Value, WorkflowError>;

    /// Returns the slug of the task. Must be unique in the registry.
    fn slug(&self) -> &str;
}

#[macro_export]
macro_rules! task_ok {
    ($result:expr) => {
        ::std::result::Result::Ok(
            ::serde_json::to_value($result)
                .map_err(|e| $crate::WorkflowError::internal_error(format!("{:?}", e)))?,
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_key_does_not_collide() {
        assert_eq!("1", id_key(&serde_json::json!(1)));
        assert_eq!("\"abc\"", id_key(&serde_json::json!("abc")));
        assert_ne!(id_key(&serde_json::json!("1")), id_key(&serde_json::json!(1)));
    }

    #[test]
    fn test_folio_error_downcast() {
        let err: anyhow::Error = FolioError::forbidden("secret").into();
        let folio_err = err.downcast_ref::<FolioError>().unwrap();
        assert!(folio_err.is_access_error());
        assert_eq!(
            "Forbidden: You are not allowed to query the following path: secret",
            err.to_string()
        );
    }

    #[test]
    fn test_task_input_previous_outputs() {
        let mut previous_outputs = serde_json::Map::new();
        previous_outputs.insert("fetch".to_string(), serde_json::json!(42));
        let input = TaskInput {
            job_id: serde_json::json!("job"),
            workflow_slug: "wf".to_string(),
            task_slug: "count".to_string(),
            task_id: "count".to_string(),
            input: serde_json::json!({"a": 1}),
            previous_outputs,
        };
        assert_eq!(42, input.output_of::<i64>("fetch").unwrap());
        assert!(input.output_of::<i64>("missing").is_err());
    }
}
