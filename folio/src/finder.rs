//! Paginated reads.
//!
//! A find call builds one [QueryPlan] and runs it in up to three store calls over a single
//! connection:
//!
//! 1. when the plan needs joins, a distinct id pre-pass that applies filter, sort and
//!    pagination on document ids, so joined rows cannot inflate a page;
//! 2. the hydration fetch, restricted to the pre-pass ids (re-sorted to their pre-pass
//!    position) or applying filter, sort and pagination directly;
//! 3. the total count, when pagination is requested.

use crate::query::{BuildQueryArgs, QueryBuilder, QueryPlan, Where};
use crate::schema::{Field, FieldKind};
use crate::state::{FindManyArgs, RowFilter, SelectDistinctArgs, State};
use crate::{
    id_key, CollectionSlug, Document, DocumentId, FolioError, FolioErrorType, TransactionId,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_LIMIT: i64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct FindArgs {
    pub collection: CollectionSlug,
    pub where_: Option<Where>,
    pub sort: Option<String>,
    /// Page size. Zero or negative means no limit once normalized by the store.
    pub limit: Option<i64>,
    /// 1-based page number.
    pub page: Option<i64>,
    /// Explicit offset, taking precedence over the one derived from `page`.
    pub skip: Option<i64>,
    pub pagination: bool,
    pub locale: Option<String>,
    pub transaction_id: Option<TransactionId>,
    pub override_access: bool,
    pub show_hidden_fields: bool,
}

impl FindArgs {
    pub fn new<S: Into<String>>(collection: S) -> Self {
        Self {
            collection: collection.into(),
            where_: None,
            sort: None,
            limit: None,
            page: None,
            skip: None,
            pagination: true,
            locale: None,
            transaction_id: None,
            override_access: false,
            show_hidden_fields: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedDocs<T> {
    pub docs: Vec<T>,
    pub total_docs: u64,
    pub total_pages: u64,
    pub page: u64,
    pub paging_counter: u64,
    pub has_next_page: bool,
    pub has_prev_page: bool,
    pub next_page: Option<u64>,
    pub prev_page: Option<u64>,
    /// The limit as requested, before the store normalized it.
    pub limit: i64,
}

impl<T> PaginatedDocs<T> {
    fn empty(limit: i64) -> Self {
        Self {
            docs: vec![],
            total_docs: 0,
            total_pages: 0,
            page: 1,
            paging_counter: 0,
            has_next_page: false,
            has_prev_page: false,
            next_page: None,
            prev_page: None,
            limit,
        }
    }
}

pub struct TransformArgs<'a> {
    pub fields: &'a [Field],
    pub show_hidden_fields: bool,
    pub locale: Option<&'a str>,
}

/// Turns a raw stored row into the document handed to the caller.
pub trait DocumentTransform: Send + Sync {
    fn transform(&self, doc: Document, args: &TransformArgs<'_>) -> Result<Document>;
}

/// Default transform: strips hidden fields unless asked to show them.
pub struct ReadTransform;

impl DocumentTransform for ReadTransform {
    fn transform(&self, mut doc: Document, args: &TransformArgs<'_>) -> Result<Document> {
        if !args.show_hidden_fields {
            strip_hidden(&mut doc, args.fields);
        }
        Ok(doc)
    }
}

fn strip_hidden(doc: &mut Document, fields: &[Field]) {
    for field in fields {
        if field.hidden {
            doc.remove(&field.name);
            continue;
        }
        match (&field.kind, doc.get_mut(&field.name)) {
            (FieldKind::Group { fields }, Some(Value::Object(nested)))
            | (FieldKind::Tab { fields }, Some(Value::Object(nested))) => {
                strip_hidden(nested, fields)
            }
            (FieldKind::Array { fields }, Some(Value::Array(rows))) => {
                for row in rows.iter_mut() {
                    if let Value::Object(row) = row {
                        strip_hidden(row, fields);
                    }
                }
            }
            _ => {}
        }
    }
}

pub struct Finder {
    state: State,
    query_builder: Arc<dyn QueryBuilder>,
    transform: Arc<dyn DocumentTransform>,
    default_limit: i64,
}

impl Finder {
    pub fn new(
        state: State,
        query_builder: Arc<dyn QueryBuilder>,
        transform: Arc<dyn DocumentTransform>,
        default_limit: i64,
    ) -> Self {
        Self {
            state,
            query_builder,
            transform,
            default_limit,
        }
    }

    /// Returns one page of documents plus pagination metadata.
    ///
    /// Store errors are returned as they are. The pre-pass and hydration fetch are two
    /// separate reads, so concurrent writes between them may shift a page.
    pub async fn find_page(&self, args: FindArgs) -> Result<PaginatedDocs<Document>> {
        let collection = self
            .state
            .registry
            .require_collection(&args.collection)?
            .clone();
        let requested_limit = args.limit.unwrap_or(self.default_limit);
        let limit = self.state.store.normalize_limit(requested_limit);
        let page = args.page.unwrap_or(1).max(1);
        let page_offset = if limit > 0 {
            (page - 1).checked_mul(limit).ok_or_else(|| {
                FolioError::new(
                    FolioErrorType::InvalidQuery,
                    format!("Page {} is out of range for limit {}", page, limit),
                )
            })? as u64
        } else {
            0
        };
        let plan: QueryPlan = self.query_builder.build_query(BuildQueryArgs {
            collection: collection.slug.clone(),
            locale: args.locale.clone(),
            sort: args.sort.clone(),
            where_: args.where_.clone(),
            override_access: args.override_access,
        })?;
        let connection = self.state.store.connection(args.transaction_id);

        let page_limit = if limit > 0 { Some(limit as u64) } else { None };
        let offset = match args.skip {
            Some(skip) if skip > 0 => skip as u64,
            _ => page_offset,
        };

        let mut ordered_ids: Option<Vec<DocumentId>> = None;
        let find_args = if plan.joins.is_empty() {
            FindManyArgs {
                collection: collection.slug.clone(),
                filter: plan.where_.clone().map(RowFilter::Where),
                order_by: plan.order_by.clone(),
                limit: page_limit,
                offset,
            }
        } else {
            let ids = connection
                .select_distinct(SelectDistinctArgs {
                    collection: collection.slug.clone(),
                    where_: plan.where_.clone(),
                    order_by: plan.order_by.clone(),
                    joins: plan.joins.clone(),
                    limit: page_limit,
                    offset,
                })
                .await?;
            if ids.is_empty() {
                log::debug!(
                    "Distinct pre-pass found no documents. collection={}",
                    collection.slug
                );
                return Ok(PaginatedDocs::empty(requested_limit));
            }
            ordered_ids = Some(ids.clone());
            FindManyArgs {
                collection: collection.slug.clone(),
                filter: Some(RowFilter::IdIn(ids)),
                order_by: plan.order_by.clone(),
                limit: None,
                offset: 0,
            }
        };

        let mut rows = connection.find_many(find_args).await?;
        if let Some(ids) = &ordered_ids {
            let positions: HashMap<String, usize> = ids
                .iter()
                .enumerate()
                .map(|(position, id)| (id_key(id), position))
                .collect();
            rows.sort_by_key(|row| {
                row.get("id")
                    .and_then(|id| positions.get(&id_key(id)).copied())
                    .unwrap_or(usize::MAX)
            });
        }

        let mut total_docs = None;
        let mut total_pages = 1;
        let mut paging_counter = 1;
        let mut has_prev_page = false;
        let mut has_next_page = false;
        let within_limit = ordered_ids
            .as_ref()
            .map_or(true, |ids| (ids.len() as i64) <= limit);
        if args.pagination && within_limit {
            let total = connection
                .count_distinct(collection.slug.clone(), plan.where_.clone())
                .await?;
            total_docs = Some(total);
            total_pages = if limit > 0 {
                (total + limit as u64 - 1) / limit as u64
            } else {
                1
            };
            has_prev_page = page > 1;
            has_next_page = total_pages > page as u64;
            paging_counter = page_offset + 1;
        }

        let transform_args = TransformArgs {
            fields: &collection.fields,
            show_hidden_fields: args.show_hidden_fields,
            locale: args.locale.as_deref(),
        };
        let docs = rows
            .into_iter()
            .map(|row| self.transform.transform(row, &transform_args))
            .collect::<Result<Vec<_>>>()?;

        let total_docs = match total_docs {
            Some(total) if args.pagination && total > 0 => total,
            _ => {
                total_pages = 1;
                paging_counter = 1;
                has_prev_page = false;
                has_next_page = false;
                docs.len() as u64
            }
        };

        log::debug!(
            "Found page. collection={}, page={}, docs={}, total={}",
            collection.slug,
            page,
            docs.len(),
            total_docs
        );
        Ok(PaginatedDocs {
            docs,
            total_docs,
            total_pages,
            page: page as u64,
            paging_counter,
            has_next_page,
            has_prev_page,
            next_page: if has_next_page {
                Some(page as u64 + 1)
            } else {
                None
            },
            prev_page: if has_prev_page {
                Some(page as u64 - 1)
            } else {
                None
            },
            limit: requested_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Operator, SimpleQueryBuilder};
    use crate::schema::{CollectionConfig, IdType, RelationTo, SchemaRegistryBuilder};
    use crate::state::tests::doc;
    use crate::state::{
        Connection, DocumentStore, InMemoryStore, MockConnection, MockDocumentStore,
    };
    use serde_json::json;

    fn numbered_store() -> InMemoryStore {
        InMemoryStore::new(IdType::Number).with_operation_log()
    }

    async fn create_test_finder(store: InMemoryStore) -> (Finder, Arc<InMemoryStore>) {
        let registry = SchemaRegistryBuilder::default()
            .add_collection(
                CollectionConfig::new(
                    "posts",
                    vec![
                        Field::number("rank"),
                        Field::text("status"),
                        Field::text("notes").hidden(),
                        Field::relationship("author", RelationTo::One("users".to_string())),
                        Field::group("meta", vec![Field::text("seo").hidden()]),
                    ],
                )
                .with_default_sort("rank"),
            )
            .add_collection(CollectionConfig::new("users", vec![Field::text("name")]))
            .build()
            .unwrap();
        let store = Arc::new(store);
        let conn = store.connection(None);
        for name in ["Ana", "Bob"].iter() {
            conn.create("users".to_string(), doc(json!({ "name": name })))
                .await
                .unwrap();
        }
        for rank in 1..=5 {
            let author = if rank % 2 == 0 { 2 } else { 1 };
            let status = if rank <= 3 { "draft" } else { "published" };
            conn.create(
                "posts".to_string(),
                doc(json!({
                    "rank": rank,
                    "status": status,
                    "notes": "internal",
                    "author": author,
                    "meta": {"seo": "x", "title": "t"}
                })),
            )
            .await
            .unwrap();
        }
        store.clear_operations();
        let state = State {
            store: store.clone(),
            registry: registry.clone(),
        };
        let finder = Finder::new(
            state,
            Arc::new(SimpleQueryBuilder::new(registry, 10)),
            Arc::new(ReadTransform),
            DEFAULT_LIMIT,
        );
        (finder, store)
    }

    fn ranks(page: &PaginatedDocs<Document>) -> Vec<i64> {
        page.docs
            .iter()
            .map(|doc| doc["rank"].as_i64().unwrap())
            .collect()
    }

    fn kinds(store: &InMemoryStore) -> Vec<&'static str> {
        store.operations().iter().map(|op| op.kind).collect()
    }

    #[tokio::test]
    async fn test_find_page() {
        let (finder, store) = create_test_finder(numbered_store()).await;
        let page = finder
            .find_page(FindArgs {
                limit: Some(2),
                page: Some(2),
                ..FindArgs::new("posts")
            })
            .await
            .unwrap();
        assert_eq!(vec![3, 4], ranks(&page));
        assert_eq!(5, page.total_docs);
        assert_eq!(3, page.total_pages);
        assert_eq!(3, page.paging_counter);
        assert!(page.has_prev_page);
        assert!(page.has_next_page);
        assert_eq!(Some(3), page.next_page);
        assert_eq!(Some(1), page.prev_page);
        assert_eq!(2, page.limit);
        assert_eq!(vec!["find_many", "count_distinct"], kinds(&store));
        // Hidden fields are stripped, including nested ones.
        assert!(!page.docs[0].contains_key("notes"));
        assert_eq!(json!({"title": "t"}), page.docs[0]["meta"]);
    }

    #[tokio::test]
    async fn test_find_page_with_filter_and_sort() {
        let (finder, _) = create_test_finder(numbered_store()).await;
        let page = finder
            .find_page(FindArgs {
                where_: Some(Where::field("status", Operator::Equals, json!("draft"))),
                sort: Some("-rank".to_string()),
                show_hidden_fields: true,
                ..FindArgs::new("posts")
            })
            .await
            .unwrap();
        assert_eq!(vec![3, 2, 1], ranks(&page));
        assert_eq!(3, page.total_docs);
        assert_eq!(1, page.total_pages);
        assert!(!page.has_next_page);
        assert_eq!(None, page.next_page);
        assert_eq!(json!("internal"), page.docs[0]["notes"]);
    }

    #[tokio::test]
    async fn test_find_page_serializes_camel_case() {
        let (finder, _) = create_test_finder(numbered_store()).await;
        let page = finder
            .find_page(FindArgs {
                limit: Some(10),
                ..FindArgs::new("posts")
            })
            .await
            .unwrap();
        let value = serde_json::to_value(&page).unwrap();
        assert_eq!(json!(5), value["totalDocs"]);
        assert_eq!(json!(1), value["pagingCounter"]);
        assert_eq!(Value::Null, value["nextPage"]);
        assert_eq!(Value::Null, value["prevPage"]);
    }

    #[tokio::test]
    async fn test_pre_pass_order_is_preserved() {
        let (finder, store) = create_test_finder(numbered_store()).await;
        let page = finder
            .find_page(FindArgs {
                where_: Some(Where::field("author.name", Operator::Equals, json!("Ana"))),
                sort: Some("-rank".to_string()),
                limit: Some(2),
                ..FindArgs::new("posts")
            })
            .await
            .unwrap();
        assert_eq!(vec![5, 3], ranks(&page));
        assert_eq!(3, page.total_docs);
        assert_eq!(2, page.total_pages);
        assert_eq!(
            vec!["select_distinct", "find_many", "count_distinct"],
            kinds(&store)
        );
    }

    #[tokio::test]
    async fn test_empty_pre_pass_skips_hydration() {
        let (finder, store) = create_test_finder(numbered_store()).await;
        let page = finder
            .find_page(FindArgs {
                where_: Some(Where::field("author.name", Operator::Equals, json!("Eve"))),
                page: Some(3),
                ..FindArgs::new("posts")
            })
            .await
            .unwrap();
        assert!(page.docs.is_empty());
        assert_eq!(0, page.total_docs);
        assert_eq!(0, page.total_pages);
        assert_eq!(1, page.page);
        assert_eq!(0, page.paging_counter);
        assert!(!page.has_next_page && !page.has_prev_page);
        assert_eq!(vec!["select_distinct"], kinds(&store));
    }

    #[tokio::test]
    async fn test_pagination_disabled() {
        let (finder, store) = create_test_finder(numbered_store()).await;
        let page = finder
            .find_page(FindArgs {
                limit: Some(2),
                page: Some(2),
                pagination: false,
                ..FindArgs::new("posts")
            })
            .await
            .unwrap();
        assert_eq!(vec![3, 4], ranks(&page));
        assert_eq!(2, page.total_docs);
        assert_eq!(1, page.total_pages);
        assert_eq!(1, page.paging_counter);
        assert!(!page.has_prev_page && !page.has_next_page);
        assert_eq!(vec!["find_many"], kinds(&store));
    }

    #[tokio::test]
    async fn test_zero_limit() {
        let (finder, _) = create_test_finder(
            numbered_store().with_zero_limit_unbounded(),
        )
        .await;
        let page = finder
            .find_page(FindArgs {
                limit: Some(0),
                ..FindArgs::new("posts")
            })
            .await
            .unwrap();
        assert_eq!(5, page.docs.len());
        assert_eq!(0, page.limit);
        assert_eq!(1, page.total_pages);

        // Unbounded pre-pass: more ids than the limit, so no count.
        let page = finder
            .find_page(FindArgs {
                where_: Some(Where::field("author.name", Operator::Exists, json!(true))),
                limit: Some(0),
                ..FindArgs::new("posts")
            })
            .await
            .unwrap();
        assert_eq!(5, page.total_docs);
        assert_eq!(1, page.total_pages);
    }

    #[tokio::test]
    async fn test_out_of_range_page_is_rejected() {
        let (finder, store) = create_test_finder(numbered_store()).await;
        let err = finder
            .find_page(FindArgs {
                page: Some(i64::MAX / 2),
                ..FindArgs::new("posts")
            })
            .await
            .unwrap_err();
        assert_eq!(
            FolioErrorType::InvalidQuery,
            err.downcast_ref::<FolioError>().unwrap().error_type
        );
        assert!(kinds(&store).is_empty());

        // Without a limit the page does not move the offset.
        let page = finder
            .find_page(FindArgs {
                page: Some(i64::MAX),
                limit: Some(0),
                ..FindArgs::new("posts")
            })
            .await
            .unwrap();
        assert_eq!(5, page.docs.len());
    }

    #[tokio::test]
    async fn test_transaction_connection_is_used_for_every_phase() {
        let (finder, store) = create_test_finder(numbered_store()).await;
        let tx = store.begin_transaction().await.unwrap();
        finder
            .find_page(FindArgs {
                where_: Some(Where::field("author.name", Operator::Equals, json!("Bob"))),
                transaction_id: Some(tx),
                ..FindArgs::new("posts")
            })
            .await
            .unwrap();
        let label = format!("tx:{}", tx);
        let operations = store.operations();
        assert_eq!(3, operations.len());
        assert!(operations.iter().all(|op| op.connection == label));
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let registry = SchemaRegistryBuilder::default()
            .add_collection(CollectionConfig::new("posts", vec![Field::text("title")]))
            .build()
            .unwrap();
        let mut connection = MockConnection::new();
        connection
            .expect_find_many()
            .times(1)
            .returning(|_| Err(anyhow::format_err!("connection reset")));
        connection.expect_count_distinct().times(0);
        let connection: Arc<dyn Connection> = Arc::new(connection);
        let mut store = MockDocumentStore::new();
        store.expect_normalize_limit().returning(|limit| limit);
        store
            .expect_connection()
            .times(1)
            .returning(move |_| connection.clone());
        let finder = Finder::new(
            State {
                store: Arc::new(store),
                registry: registry.clone(),
            },
            Arc::new(SimpleQueryBuilder::new(registry, 10)),
            Arc::new(ReadTransform),
            DEFAULT_LIMIT,
        );
        let err = finder.find_page(FindArgs::new("posts")).await.unwrap_err();
        assert_eq!("connection reset", err.to_string());
    }
}
