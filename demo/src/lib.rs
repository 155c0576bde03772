use async_trait::async_trait;
use chrono::{DateTime, Utc};
use folio::{task_ok, TaskHandler, TaskInput, WorkflowError};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct DigestContext {
    pub keyword: String,
    pub age_filter: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct User {
    pub name: String,
    pub age: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Digest {
    pub keyword: String,
    pub users: Vec<User>,
    pub generated_at: DateTime<Utc>,
}

pub struct FetchUsers;

#[async_trait]
impl TaskHandler for FetchUsers {
    async fn run(&self, input: TaskInput) -> Result<serde_json::Value, WorkflowError> {
        let context: DigestContext = input.value()?;
        log::info!("Fetching users. keyword={}", context.keyword);
        task_ok!(vec![
            User {
                name: format!("{} fan", context.keyword),
                age: 18,
            },
            User {
                name: "Ada".to_string(),
                age: 36,
            },
            User {
                name: "Grace".to_string(),
                age: 45,
            },
        ])
    }

    fn slug(&self) -> &str {
        "fetch-users"
    }
}

pub struct FilterUsers;

#[async_trait]
impl TaskHandler for FilterUsers {
    async fn run(&self, input: TaskInput) -> Result<serde_json::Value, WorkflowError> {
        let context: DigestContext = input.value()?;
        let users: Vec<User> = input.output_of("fetch")?;
        if users.is_empty() {
            return Err(WorkflowError::retriable_domain_error(
                "No users fetched yet".to_string(),
            ));
        }
        task_ok!(users
            .into_iter()
            .filter(|user| user.age >= context.age_filter)
            .collect::<Vec<_>>())
    }

    fn slug(&self) -> &str {
        "filter-users"
    }
}

pub struct BuildDigest;

#[async_trait]
impl TaskHandler for BuildDigest {
    async fn run(&self, input: TaskInput) -> Result<serde_json::Value, WorkflowError> {
        let context: DigestContext = input.value()?;
        task_ok!(Digest {
            keyword: context.keyword,
            users: input.output_of("filter")?,
            generated_at: Utc::now(),
        })
    }

    fn slug(&self) -> &str {
        "build-digest"
    }
}
