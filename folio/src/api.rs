use crate::config::FolioConfig;
use crate::finder::{DocumentTransform, FindArgs, Finder, PaginatedDocs, ReadTransform};
use crate::jobs::{jobs_collection, Job, NewJob, TaskConfig, WorkflowConfig, JOBS_COLLECTION};
use crate::paths::{resolve_collection_path, resolve_global_path, PathSegment};
use crate::poller::Poller;
use crate::query::{QueryBuilder, SimpleQueryBuilder};
use crate::registry::{TaskHandlerRegistryBuilder, WorkflowRegistry, WorkflowRegistryBuilder};
use crate::runners::SimpleWorkflowExecutor;
use crate::scheduler::{JobScheduler, RunReport};
use crate::schema::{
    Block, CollectionConfig, GlobalConfig, IdType, LocalizationConfig, SchemaRegistry,
    SchemaRegistryBuilder,
};
use crate::state::{DocumentStore, State};
use crate::{Document, DocumentId, TaskHandler, WorkflowExecutor};
use anyhow::{bail, format_err, Result};
use std::sync::Arc;

pub struct FolioBuilder {
    store: Arc<dyn DocumentStore>,
    schema_builder: SchemaRegistryBuilder,
    workflow_builder: WorkflowRegistryBuilder,
    handler_builder: TaskHandlerRegistryBuilder,
    executor: Option<Arc<dyn WorkflowExecutor>>,
    query_builder: Option<Arc<dyn QueryBuilder>>,
    transform: Option<Arc<dyn DocumentTransform>>,
    config: FolioConfig,
}

impl FolioBuilder {
    pub fn new(store: impl DocumentStore + 'static) -> Self {
        Self::with_shared_store(Arc::new(store))
    }

    /// Same as [FolioBuilder::new] for a store the caller keeps a handle to.
    pub fn with_shared_store(store: Arc<dyn DocumentStore>) -> Self {
        let mut schema_builder = SchemaRegistryBuilder::default();
        schema_builder.add_collection(jobs_collection());
        Self {
            store,
            schema_builder,
            workflow_builder: WorkflowRegistryBuilder::default(),
            handler_builder: TaskHandlerRegistryBuilder::default(),
            executor: None,
            query_builder: None,
            transform: None,
            config: FolioConfig::default(),
        }
    }

    pub fn register_collection(&mut self, collection: CollectionConfig) -> &mut Self {
        self.schema_builder.add_collection(collection);
        self
    }

    pub fn register_global(&mut self, global: GlobalConfig) -> &mut Self {
        self.schema_builder.add_global(global);
        self
    }

    pub fn register_block(&mut self, block: Block) -> &mut Self {
        self.schema_builder.add_block(block);
        self
    }

    pub fn localization(&mut self, localization: LocalizationConfig) -> &mut Self {
        self.schema_builder.localization(localization);
        self
    }

    pub fn default_id_type(&mut self, id_type: IdType) -> &mut Self {
        self.schema_builder.default_id_type(id_type);
        self
    }

    pub fn register_workflow(&mut self, workflow: WorkflowConfig) -> &mut Self {
        self.workflow_builder.add_workflow(workflow);
        self
    }

    pub fn register_task(&mut self, task: TaskConfig) -> &mut Self {
        self.workflow_builder.add_task(task);
        self
    }

    pub fn register_task_handler(&mut self, handler: impl TaskHandler + 'static) -> &mut Self {
        self.handler_builder.add(handler);
        self
    }

    /// Replaces the built-in executor that runs registered task handlers.
    pub fn executor(&mut self, executor: Arc<dyn WorkflowExecutor>) -> &mut Self {
        self.executor = Some(executor);
        self
    }

    pub fn query_builder(&mut self, query_builder: Arc<dyn QueryBuilder>) -> &mut Self {
        self.query_builder = Some(query_builder);
        self
    }

    pub fn transform(&mut self, transform: Arc<dyn DocumentTransform>) -> &mut Self {
        self.transform = Some(transform);
        self
    }

    pub fn config(&mut self, config: FolioConfig) -> &mut Self {
        self.config = config;
        self
    }

    /// Fails on an invalid schema or on workflows referencing unknown tasks.
    pub fn build(&self) -> Result<Folio> {
        let registry = self.schema_builder.build()?;
        let workflows = self.workflow_builder.build()?;
        let state = State {
            store: self.store.clone(),
            registry: registry.clone(),
        };
        let query_builder = self.query_builder.clone().unwrap_or_else(|| {
            Arc::new(SimpleQueryBuilder::new(
                registry.clone(),
                self.config.max_path_segments,
            ))
        });
        let transform = self
            .transform
            .clone()
            .unwrap_or_else(|| Arc::new(ReadTransform));
        let finder = Arc::new(Finder::new(
            state.clone(),
            query_builder,
            transform,
            self.config.default_limit,
        ));
        let executor = self.executor.clone().unwrap_or_else(|| {
            Arc::new(SimpleWorkflowExecutor::new(
                state.clone(),
                self.handler_builder.build(),
            ))
        });
        let scheduler = Arc::new(JobScheduler::new(
            finder.clone(),
            workflows.clone(),
            executor,
            self.config.jobs.concurrency,
        ));
        log::info!(
            "Folio ready. store={}, collections={:?}",
            state.store.name(),
            registry.collection_slugs()
        );
        Ok(Folio {
            state,
            finder,
            workflows,
            scheduler,
            config: self.config.clone(),
        })
    }
}

/// Public interface to the query engine and the job runner.
#[derive(Clone)]
pub struct Folio {
    state: State,
    finder: Arc<Finder>,
    workflows: Arc<WorkflowRegistry>,
    scheduler: Arc<JobScheduler>,
    config: FolioConfig,
}

impl Folio {
    /// Returns one page of documents of a collection.
    ///
    /// Errors caused by the query itself are [crate::FolioError]s and can be downcast.
    pub async fn find(&self, args: FindArgs) -> Result<PaginatedDocs<Document>> {
        let collection = args.collection.clone();
        self.finder.find_page(args).await.map_err(|err| {
            log::error!("Find failed. collection={}, error={:?}", collection, err);
            err
        })
    }

    /// Resolves a dotted query path against a collection.
    ///
    /// # Arguments
    ///
    /// * `collection_slug` - The collection the path starts from.
    /// * `path` - Dotted path, e.g. `author.name` or `meta.es.title`.
    /// * `locale` - Locale to resolve localized fields with. Defaults to the default locale.
    /// * `override_access` - Allows paths through hidden fields.
    pub fn resolve_path(
        &self,
        collection_slug: &str,
        path: &str,
        locale: Option<&str>,
        override_access: bool,
    ) -> Result<Vec<PathSegment>> {
        resolve_collection_path(
            &self.state.registry,
            collection_slug,
            path,
            locale,
            override_access,
        )
    }

    pub fn resolve_global_path(
        &self,
        global_slug: &str,
        path: &str,
        locale: Option<&str>,
        override_access: bool,
    ) -> Result<Vec<PathSegment>> {
        resolve_global_path(
            &self.state.registry,
            global_slug,
            path,
            locale,
            override_access,
        )
    }

    /// Persists a new job. The job runs on the next scheduler run after its `wait_until`.
    ///
    /// Without an explicit queue the job lands in the workflow's queue, or the default one.
    pub async fn queue_job(&self, mut job: NewJob) -> Result<Job> {
        let workflow = match (&job.workflow_slug, &job.task_slug) {
            (Some(workflow_slug), _) => self
                .workflows
                .workflow(workflow_slug)
                .cloned()
                .ok_or_else(|| format_err!("Workflow '{}' is not registered", workflow_slug))?,
            (None, Some(task_slug)) => self
                .workflows
                .task_config(task_slug)
                .map(WorkflowConfig::single_task)
                .ok_or_else(|| format_err!("Task '{}' is not registered", task_slug))?,
            (None, None) => bail!("A job needs either a workflow or a task"),
        };
        if job.queue.is_none() {
            job.queue = workflow.queue.clone();
        }
        let created = self
            .state
            .store
            .connection(None)
            .create(JOBS_COLLECTION.to_string(), job.into_document()?)
            .await
            .map_err(|err| {
                log::error!(
                    "Failed to queue job. workflow={}, error={:?}",
                    workflow.slug,
                    err
                );
                err
            })?;
        let job = Job::from_document(created)?;
        log::info!(
            "Queued job. job_id={}, workflow={}, queue={}",
            job.id,
            workflow.slug,
            job.queue
        );
        Ok(job)
    }

    /// Returns the job with the given id, hidden scheduling fields included.
    pub async fn get_job(&self, id: DocumentId) -> Result<Option<Job>> {
        let doc = self
            .state
            .store
            .connection(None)
            .find_by_id(JOBS_COLLECTION.to_string(), id)
            .await
            .map_err(|err| {
                log::error!("Failed to get job. error={:?}", err);
                err
            })?;
        doc.map(Job::from_document).transpose()
    }

    /// Runs one batch of due jobs now. Defaults come from the jobs configuration.
    pub async fn run_jobs(&self, limit: Option<i64>, queue: Option<&str>) -> Result<RunReport> {
        let limit = limit.unwrap_or(self.config.jobs.limit);
        let queue = queue.or_else(|| self.config.jobs.queue.as_deref());
        self.scheduler.run_due_jobs_with_report(limit, queue).await
    }

    /// Starts running due jobs in the background. Must be called within a tokio runtime.
    pub fn start_polling(&self) -> Poller {
        Poller::start_polling(self.scheduler.clone(), self.config.jobs.clone())
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.state.registry
    }

    pub fn config(&self) -> &FolioConfig {
        &self.config
    }
}
