use anyhow::{bail, Result};
use demo::{BuildDigest, DigestContext, FetchUsers, FilterUsers};
use folio::api::{Folio, FolioBuilder};
use folio::config::FolioConfig;
use folio::finder::FindArgs;
use folio::jobs::{NewJob, TaskConfig, WorkflowConfig, WorkflowTask};
use folio::query::{Operator, Where};
use folio::schema::{CollectionConfig, Field, LocalizationConfig, RelationTo};
use folio::state::{DocumentStore, InMemoryStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn digest_workflow() -> WorkflowConfig {
    let task = |task_slug: &str, id: &str| WorkflowTask {
        task_slug: task_slug.to_string(),
        id: id.to_string(),
    };
    WorkflowConfig {
        slug: "user-digest".to_string(),
        queue: None,
        retries: Some(2),
        tasks: vec![
            task("fetch-users", "fetch"),
            task("filter-users", "filter"),
            task("build-digest", "digest"),
        ],
    }
}

fn create_folio(store: Arc<InMemoryStore>) -> Result<Folio> {
    let mut builder = FolioBuilder::with_shared_store(store);
    builder
        .config(FolioConfig::from_env()?)
        .localization(LocalizationConfig {
            locale_codes: vec!["en".to_string(), "es".to_string()],
            default_locale: "en".to_string(),
        })
        .register_collection(CollectionConfig::new(
            "authors",
            vec![Field::text("name"), Field::text("email").hidden()],
        ))
        .register_collection(
            CollectionConfig::new(
                "posts",
                vec![
                    Field::text("title").localized(),
                    Field::relationship("author", RelationTo::One("authors".to_string())),
                    Field::number("views"),
                ],
            )
            .with_default_sort("-views"),
        );
    for slug in ["fetch-users", "filter-users", "build-digest"].iter() {
        builder.register_task(TaskConfig {
            slug: slug.to_string(),
            retries: None,
        });
    }
    builder
        .register_workflow(digest_workflow())
        .register_task_handler(FetchUsers)
        .register_task_handler(FilterUsers)
        .register_task_handler(BuildDigest)
        .build()
}

async fn seed(store: &InMemoryStore) -> Result<()> {
    let connection = store.connection(None);
    let ada = connection
        .create(
            "authors".to_string(),
            serde_json::from_value(json!({"name": "Ada", "email": "ada@example.com"}))?,
        )
        .await?;
    for (views, en, es) in vec![
        (120, "Hello engines", "Hola motores"),
        (40, "Notes on numbers", "Notas sobre numeros"),
    ] {
        connection
            .create(
                "posts".to_string(),
                serde_json::from_value(json!({
                    "title": {"en": en, "es": es},
                    "author": ada["id"],
                    "views": views,
                }))?,
            )
            .await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = env_logger::try_init();

    let store = Arc::new(InMemoryStore::default());
    let folio = create_folio(store.clone())?;
    seed(&store).await?;

    let page = folio
        .find(FindArgs {
            where_: Some(Where::field("author.name", Operator::Equals, json!("Ada"))),
            locale: Some("es".to_string()),
            ..FindArgs::new("posts")
        })
        .await?;
    log::info!("Posts by Ada: {}", serde_json::to_string_pretty(&page)?);

    let job = folio
        .queue_job(NewJob::workflow(
            "user-digest",
            serde_json::to_value(DigestContext {
                keyword: "rust".to_string(),
                age_filter: 30,
            })?,
        ))
        .await?;

    let poller = folio.start_polling();
    let mut finished = None;
    for _ in 0..100 {
        match folio.get_job(job.id.clone()).await? {
            Some(current) if current.completed_at.is_some() || current.has_error => {
                finished = Some(current);
                break;
            }
            _ => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
    poller.stop_polling().await?;

    match finished {
        Some(job) if !job.has_error => {
            let digest = job.log.last().and_then(|entry| entry.output.clone());
            log::info!("Digest ready: {}", json!(digest));
            Ok(())
        }
        Some(job) => bail!("Digest job failed: {:?}", job.error),
        None => bail!("Digest job did not finish in time"),
    }
}
