use crate::jobs::{Job, TaskConfig, WorkflowConfig};
use crate::{TaskHandler, TaskSlug, WorkflowSlug};
use anyhow::{bail, format_err, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Workflow and task definitions known to the scheduler.
pub struct WorkflowRegistry {
    workflows: HashMap<WorkflowSlug, WorkflowConfig>,
    task_configs: HashMap<TaskSlug, TaskConfig>,
}

impl WorkflowRegistry {
    pub fn new(
        workflows: HashMap<WorkflowSlug, WorkflowConfig>,
        task_configs: HashMap<TaskSlug, TaskConfig>,
    ) -> Self {
        Self {
            workflows,
            task_configs,
        }
    }

    pub fn workflow(&self, slug: &str) -> Option<&WorkflowConfig> {
        self.workflows.get(slug)
    }

    pub fn task_config(&self, slug: &str) -> Option<&TaskConfig> {
        self.task_configs.get(slug)
    }

    pub fn task_configs(&self) -> &HashMap<TaskSlug, TaskConfig> {
        &self.task_configs
    }

    /// The workflow a job runs: the one it names, or a single task workflow for jobs that
    /// reference a task directly. `None` when neither is registered.
    pub fn workflow_for(&self, job: &Job) -> Option<WorkflowConfig> {
        match (&job.workflow_slug, &job.task_slug) {
            (Some(workflow_slug), _) => self.workflow(workflow_slug).cloned(),
            (None, Some(task_slug)) => self.task_config(task_slug).map(WorkflowConfig::single_task),
            (None, None) => None,
        }
    }
}

pub struct WorkflowRegistryBuilder {
    workflows: HashMap<WorkflowSlug, WorkflowConfig>,
    task_configs: HashMap<TaskSlug, TaskConfig>,
}

impl Default for WorkflowRegistryBuilder {
    fn default() -> Self {
        Self {
            workflows: HashMap::new(),
            task_configs: HashMap::new(),
        }
    }
}

impl WorkflowRegistryBuilder {
    pub fn add_workflow(&mut self, workflow: WorkflowConfig) -> &mut Self {
        self.workflows.insert(workflow.slug.clone(), workflow);
        self
    }

    pub fn add_task(&mut self, task: TaskConfig) -> &mut Self {
        self.task_configs.insert(task.slug.clone(), task);
        self
    }

    /// Fails when a workflow references a task that has not been registered.
    pub fn build(&self) -> Result<Arc<WorkflowRegistry>> {
        for workflow in self.workflows.values() {
            if workflow.tasks.is_empty() {
                bail!("Workflow '{}' has no tasks", workflow.slug);
            }
            if let Some(task) = workflow
                .tasks
                .iter()
                .find(|task| !self.task_configs.contains_key(&task.task_slug))
            {
                bail!(
                    "Workflow '{}' references unknown task '{}'",
                    workflow.slug,
                    task.task_slug
                );
            }
        }
        Ok(Arc::new(WorkflowRegistry::new(
            self.workflows.clone(),
            self.task_configs.clone(),
        )))
    }
}

/// Maps task slugs to their implementation.
pub struct TaskHandlerRegistry {
    handlers: HashMap<TaskSlug, Arc<dyn TaskHandler>>,
}

impl TaskHandlerRegistry {
    pub fn new(handlers: HashMap<TaskSlug, Arc<dyn TaskHandler>>) -> Self {
        Self { handlers }
    }

    pub fn get(&self, task_slug: &str) -> Result<Arc<dyn TaskHandler>> {
        self.handlers
            .get(task_slug)
            .cloned()
            .ok_or_else(|| format_err!("Task handler '{}' does not exist in registry!", task_slug))
    }
}

pub struct TaskHandlerRegistryBuilder {
    handlers: HashMap<TaskSlug, Arc<dyn TaskHandler>>,
}

impl Default for TaskHandlerRegistryBuilder {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl TaskHandlerRegistryBuilder {
    pub fn add(&mut self, handler: impl TaskHandler + 'static) -> &mut Self {
        self.handlers
            .insert(handler.slug().to_string(), Arc::new(handler));
        self
    }

    pub fn build(&self) -> Arc<TaskHandlerRegistry> {
        Arc::new(TaskHandlerRegistry::new(self.handlers.clone()))
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::jobs::WorkflowTask;
    use crate::state::tests::doc;
    use crate::{TaskInput, WorkflowError};
    use async_trait::async_trait;
    use serde_json::json;

    pub fn task(slug: &str, retries: Option<u32>) -> TaskConfig {
        TaskConfig {
            slug: slug.to_string(),
            retries,
        }
    }

    pub fn workflow(slug: &str, tasks: &[(&str, &str)]) -> WorkflowConfig {
        WorkflowConfig {
            slug: slug.to_string(),
            queue: None,
            retries: None,
            tasks: tasks
                .iter()
                .map(|(task_slug, id)| WorkflowTask {
                    task_slug: task_slug.to_string(),
                    id: id.to_string(),
                })
                .collect(),
        }
    }

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        async fn run(&self, input: TaskInput) -> Result<serde_json::Value, WorkflowError> {
            Ok(input.input)
        }

        fn slug(&self) -> &str {
            "echo"
        }
    }

    #[test]
    fn test_workflow_registry() {
        let registry = WorkflowRegistryBuilder::default()
            .add_task(task("send", Some(2)))
            .add_workflow(workflow("notify", &[("send", "first")]))
            .build()
            .unwrap();
        assert!(registry.workflow("notify").is_some());
        assert_eq!(Some(2), registry.task_config("send").unwrap().retries);

        let job = |value| crate::jobs::Job::from_document(doc(value)).unwrap();
        let by_workflow = registry.workflow_for(&job(json!({"id": 1, "workflowSlug": "notify"})));
        assert_eq!("notify", by_workflow.unwrap().slug);
        let by_task = registry
            .workflow_for(&job(json!({"id": 2, "taskSlug": "send"})))
            .unwrap();
        assert_eq!(Some(2), by_task.retries);
        assert_eq!("send", by_task.tasks[0].id);
        assert!(registry
            .workflow_for(&job(json!({"id": 3, "workflowSlug": "unknown"})))
            .is_none());
        assert!(registry.workflow_for(&job(json!({"id": 4}))).is_none());
    }

    #[test]
    fn test_workflow_registry_rejects_unknown_tasks() {
        let result = WorkflowRegistryBuilder::default()
            .add_workflow(workflow("notify", &[("send", "first")]))
            .build();
        assert!(result.is_err());
        let result = WorkflowRegistryBuilder::default()
            .add_workflow(workflow("empty", &[]))
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_task_handler_registry() {
        let registry = TaskHandlerRegistryBuilder::default().add(Echo).build();
        let handler = registry.get("echo").unwrap();
        let output = handler
            .run(TaskInput {
                job_id: json!(1),
                workflow_slug: "wf".to_string(),
                task_slug: "echo".to_string(),
                task_id: "echo".to_string(),
                input: json!({"a": 1}),
                previous_outputs: serde_json::Map::new(),
            })
            .await
            .unwrap();
        assert_eq!(json!({"a": 1}), output);
        assert!(registry.get("missing").is_err());
    }
}
