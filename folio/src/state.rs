use crate::query::{ColumnHop, Join, Operator, OrderBy, Predicate};
use crate::schema::{IdType, SchemaRegistry};
use crate::{id_key, CollectionSlug, Document, DocumentId, TransactionId};
use anyhow::{bail, format_err, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Shared handles every component of the engine works with.
#[derive(Clone)]
pub struct State {
    pub store: Arc<dyn DocumentStore>,
    pub registry: Arc<SchemaRegistry>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowFilter {
    Where(Predicate),
    /// Restricts the rows to the given document ids. Used by the hydration fetch after a
    /// distinct id pre-pass.
    IdIn(Vec<DocumentId>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindManyArgs {
    pub collection: CollectionSlug,
    pub filter: Option<RowFilter>,
    pub order_by: Option<OrderBy>,
    /// `None` means no limit.
    pub limit: Option<u64>,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectDistinctArgs {
    pub collection: CollectionSlug,
    pub where_: Option<Predicate>,
    pub order_by: Option<OrderBy>,
    pub joins: Vec<Join>,
    pub limit: Option<u64>,
    pub offset: u64,
}

/// A handle to the store. Calls made through the same connection share its transaction,
/// if any.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connection: Send + Sync {
    async fn find_many(&self, args: FindManyArgs) -> Result<Vec<Document>>;

    /// Returns the ids of the documents matching the filter, without duplicates, in the
    /// requested order.
    async fn select_distinct(&self, args: SelectDistinctArgs) -> Result<Vec<DocumentId>>;

    async fn count_distinct(
        &self,
        collection: CollectionSlug,
        where_: Option<Predicate>,
    ) -> Result<u64>;

    async fn find_by_id(
        &self,
        collection: CollectionSlug,
        id: DocumentId,
    ) -> Result<Option<Document>>;

    /// Persists a new document. The store assigns `id` (unless given), `createdAt` and
    /// `updatedAt`.
    async fn create(&self, collection: CollectionSlug, data: Document) -> Result<Document>;

    /// Shallow-merges `data` into the stored document and returns the result.
    async fn update_by_id(
        &self,
        collection: CollectionSlug,
        id: DocumentId,
        data: Document,
    ) -> Result<Document>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn name(&self) -> String;

    /// Maps a caller supplied limit to the store's convention. A negative limit means no
    /// limit.
    fn normalize_limit(&self, limit: i64) -> i64 {
        limit
    }

    /// Returns the connection bound to the transaction, or the default connection when no
    /// transaction is given or the transaction is unknown.
    fn connection(&self, transaction_id: Option<TransactionId>) -> Arc<dyn Connection>;

    async fn begin_transaction(&self) -> Result<TransactionId>;

    async fn commit_transaction(&self, transaction_id: TransactionId) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOperation {
    pub connection: String,
    pub kind: &'static str,
    pub collection: CollectionSlug,
}

#[derive(Default)]
struct InMemoryData {
    collections: HashMap<CollectionSlug, Vec<Document>>,
    next_ids: HashMap<CollectionSlug, u64>,
}

impl InMemoryData {
    fn docs(&self, collection: &str) -> &[Document] {
        self.collections
            .get(collection)
            .map(|docs| docs.as_slice())
            .unwrap_or(&[])
    }

    fn next_id(&mut self, collection: &str, id_type: IdType) -> DocumentId {
        match id_type {
            IdType::Text => Value::String(Uuid::new_v4().to_string()),
            IdType::Number => {
                let next = self.next_ids.entry(collection.to_string()).or_insert(0);
                *next += 1;
                Value::from(*next)
            }
        }
    }
}

type Operations = Arc<Mutex<Vec<StoreOperation>>>;

pub struct InMemoryConnection {
    label: String,
    data: Arc<Mutex<InMemoryData>>,
    /// Only kept when the store was built with [InMemoryStore::with_operation_log].
    operations: Option<Operations>,
    id_type: IdType,
}

/// Document store keeping every collection in memory.
///
/// Transactions only scope connections: writes are applied immediately and there is no
/// rollback.
pub struct InMemoryStore {
    main: Arc<InMemoryConnection>,
    sessions: Mutex<HashMap<TransactionId, Arc<InMemoryConnection>>>,
    zero_limit_unbounded: bool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(IdType::Text)
    }
}

impl InMemoryStore {
    pub fn new(id_type: IdType) -> Self {
        Self {
            main: Arc::new(InMemoryConnection {
                label: "main".to_string(),
                data: Arc::new(Mutex::new(InMemoryData::default())),
                operations: None,
                id_type,
            }),
            sessions: Mutex::new(HashMap::new()),
            zero_limit_unbounded: false,
        }
    }

    /// Treat a limit of `0` as "no limit".
    pub fn with_zero_limit_unbounded(mut self) -> Self {
        self.zero_limit_unbounded = true;
        self
    }

    /// Records every call served by this store and its transactions, see
    /// [InMemoryStore::operations]. Must be enabled before any transaction is opened.
    pub fn with_operation_log(mut self) -> Self {
        self.main = Arc::new(InMemoryConnection {
            label: self.main.label.clone(),
            data: self.main.data.clone(),
            operations: Some(Arc::new(Mutex::new(Vec::new()))),
            id_type: self.main.id_type,
        });
        self
    }

    /// Every call served so far, in order. Empty unless the operation log is enabled.
    pub fn operations(&self) -> Vec<StoreOperation> {
        self.main
            .operations
            .as_ref()
            .and_then(|operations| operations.lock().ok().map(|guard| guard.clone()))
            .unwrap_or_default()
    }

    pub fn clear_operations(&self) {
        if let Some(operations) = &self.main.operations {
            if let Ok(mut guard) = operations.lock() {
                guard.clear();
            }
        }
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    fn name(&self) -> String {
        "memory".to_string()
    }

    fn normalize_limit(&self, limit: i64) -> i64 {
        if self.zero_limit_unbounded && limit == 0 {
            -1
        } else {
            limit
        }
    }

    fn connection(&self, transaction_id: Option<TransactionId>) -> Arc<dyn Connection> {
        if let Some(transaction_id) = transaction_id {
            if let Ok(sessions) = self.sessions.lock() {
                if let Some(connection) = sessions.get(&transaction_id) {
                    return connection.clone();
                }
            }
            log::debug!(
                "Unknown transaction, using the default connection. transaction_id={}",
                transaction_id
            );
        }
        self.main.clone()
    }

    async fn begin_transaction(&self) -> Result<TransactionId> {
        let transaction_id = Uuid::new_v4();
        let connection = Arc::new(InMemoryConnection {
            label: format!("tx:{}", transaction_id),
            data: self.main.data.clone(),
            operations: self.main.operations.clone(),
            id_type: self.main.id_type,
        });
        lock(&self.sessions)?.insert(transaction_id, connection);
        Ok(transaction_id)
    }

    async fn commit_transaction(&self, transaction_id: TransactionId) -> Result<()> {
        lock(&self.sessions)?
            .remove(&transaction_id)
            .map(|_| ())
            .ok_or_else(|| format_err!("Unknown transaction id: {}", transaction_id))
    }
}

impl InMemoryConnection {
    fn record(&self, kind: &'static str, collection: &str) -> Result<()> {
        if let Some(operations) = &self.operations {
            lock(operations)?.push(StoreOperation {
                connection: self.label.clone(),
                kind,
                collection: collection.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn find_many(&self, args: FindManyArgs) -> Result<Vec<Document>> {
        self.record("find_many", &args.collection)?;
        let data = lock(&self.data)?;
        let mut docs: Vec<Document> = data
            .docs(&args.collection)
            .iter()
            .filter(|doc| match &args.filter {
                None => true,
                Some(RowFilter::Where(predicate)) => matches_predicate(&data, doc, predicate),
                Some(RowFilter::IdIn(ids)) => doc
                    .get("id")
                    .map_or(false, |id| ids.iter().any(|other| id_key(other) == id_key(id))),
            })
            .cloned()
            .collect();
        if let Some(order_by) = &args.order_by {
            docs.sort_by(|a, b| compare_documents(&data, a, b, order_by));
        }
        Ok(paginate(docs, args.offset, args.limit))
    }

    async fn select_distinct(&self, args: SelectDistinctArgs) -> Result<Vec<DocumentId>> {
        self.record("select_distinct", &args.collection)?;
        let data = lock(&self.data)?;
        let mut docs: Vec<&Document> = data
            .docs(&args.collection)
            .iter()
            .filter(|doc| {
                args.where_
                    .as_ref()
                    .map_or(true, |predicate| matches_predicate(&data, doc, predicate))
            })
            .collect();
        if let Some(order_by) = &args.order_by {
            docs.sort_by(|a, b| compare_documents(&data, a, b, order_by));
        }
        let mut seen = HashSet::new();
        let ids: Vec<DocumentId> = docs
            .into_iter()
            .filter_map(|doc| doc.get("id").cloned())
            .filter(|id| seen.insert(id_key(id)))
            .collect();
        Ok(paginate(ids, args.offset, args.limit))
    }

    async fn count_distinct(
        &self,
        collection: CollectionSlug,
        where_: Option<Predicate>,
    ) -> Result<u64> {
        self.record("count_distinct", &collection)?;
        let data = lock(&self.data)?;
        let count = data
            .docs(&collection)
            .iter()
            .filter(|doc| {
                where_
                    .as_ref()
                    .map_or(true, |predicate| matches_predicate(&data, doc, predicate))
            })
            .count();
        Ok(count as u64)
    }

    async fn find_by_id(
        &self,
        collection: CollectionSlug,
        id: DocumentId,
    ) -> Result<Option<Document>> {
        self.record("find_by_id", &collection)?;
        let data = lock(&self.data)?;
        let key = id_key(&id);
        Ok(data
            .docs(&collection)
            .iter()
            .find(|doc| doc.get("id").map(id_key) == Some(key.clone()))
            .cloned())
    }

    async fn create(&self, collection: CollectionSlug, mut doc: Document) -> Result<Document> {
        self.record("create", &collection)?;
        let mut data = lock(&self.data)?;
        let id = match doc.get("id") {
            Some(id) if !id.is_null() => id.clone(),
            _ => data.next_id(&collection, self.id_type),
        };
        let key = id_key(&id);
        if data
            .docs(&collection)
            .iter()
            .any(|existing| existing.get("id").map(id_key) == Some(key.clone()))
        {
            bail!(
                "Document with id {} already exists in collection '{}'",
                id,
                collection
            );
        }
        let now = Value::String(Utc::now().to_rfc3339());
        doc.insert("id".to_string(), id);
        doc.entry("createdAt").or_insert_with(|| now.clone());
        doc.insert("updatedAt".to_string(), now);
        data.collections
            .entry(collection)
            .or_insert_with(Vec::new)
            .push(doc.clone());
        Ok(doc)
    }

    async fn update_by_id(
        &self,
        collection: CollectionSlug,
        id: DocumentId,
        update: Document,
    ) -> Result<Document> {
        self.record("update_by_id", &collection)?;
        let mut data = lock(&self.data)?;
        let key = id_key(&id);
        let doc = data
            .collections
            .get_mut(&collection)
            .and_then(|docs| {
                docs.iter_mut()
                    .find(|doc| doc.get("id").map(id_key) == Some(key.clone()))
            })
            .ok_or_else(|| {
                format_err!(
                    "Document with id {} not found in collection '{}'",
                    id,
                    collection
                )
            })?;
        for (field, value) in update {
            if field != "id" {
                doc.insert(field, value);
            }
        }
        doc.insert(
            "updatedAt".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        Ok(doc.clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|err| format_err!("In-memory store lock poisoned: {}", err))
}

fn paginate<T>(items: Vec<T>, offset: u64, limit: Option<u64>) -> Vec<T> {
    items
        .into_iter()
        .skip(offset as usize)
        .take(limit.map_or(usize::MAX, |l| l as usize))
        .collect()
}

// Values found at `parts` below `value`. Arrays on the way are expanded element-wise and a
// trailing array yields its elements, so rows of array and blocks fields are evaluated one
// by one.
fn path_values(value: &Value, parts: &[&str]) -> Vec<Value> {
    match parts.split_first() {
        None => match value {
            Value::Null => vec![],
            Value::Array(items) => items.iter().filter(|v| !v.is_null()).cloned().collect(),
            other => vec![other.clone()],
        },
        Some((head, rest)) => match value {
            Value::Object(map) => map
                .get(*head)
                .map(|v| path_values(v, rest))
                .unwrap_or_default(),
            Value::Array(items) => items.iter().flat_map(|v| path_values(v, parts)).collect(),
            _ => vec![],
        },
    }
}

fn document_values(doc: &Document, path: &str) -> Vec<Value> {
    let parts: Vec<&str> = path.split('.').collect();
    match doc.get(parts[0]) {
        Some(value) => path_values(value, &parts[1..]),
        None => vec![],
    }
}

// A relation value may hold the bare id or a populated document.
fn references(reference: &Value, id: &Value) -> bool {
    let reference = reference.get("id").unwrap_or(reference);
    id_key(reference) == id_key(id)
}

fn column_values(data: &InMemoryData, doc: &Document, hops: &[ColumnHop]) -> Vec<Value> {
    let (hop, rest) = match hops.split_first() {
        Some(split) => split,
        None => return vec![],
    };
    let next = match rest.first() {
        Some(next) => next,
        None => return document_values(doc, &hop.path),
    };
    let related: Vec<&Document> = match &hop.join_on {
        Some(on) => match doc.get("id") {
            Some(id) => data
                .docs(&next.collection)
                .iter()
                .filter(|other| document_values(other, on).iter().any(|r| references(r, id)))
                .collect(),
            None => vec![],
        },
        None => {
            let ids = document_values(doc, &hop.path);
            data.docs(&next.collection)
                .iter()
                .filter(|other| {
                    other
                        .get("id")
                        .map_or(false, |id| ids.iter().any(|r| references(r, id)))
                })
                .collect()
        }
    };
    related
        .into_iter()
        .flat_map(|other| column_values(data, other, rest))
        .collect()
}

fn matches_predicate(data: &InMemoryData, doc: &Document, predicate: &Predicate) -> bool {
    match predicate {
        Predicate::And(items) => items.iter().all(|p| matches_predicate(data, doc, p)),
        Predicate::Or(items) => items.iter().any(|p| matches_predicate(data, doc, p)),
        Predicate::Compare {
            column,
            operator,
            value,
        } => evaluate(&column_values(data, doc, &column.hops), *operator, value),
    }
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

/// Orders two JSON scalars. Numbers compare numerically and strings holding RFC 3339
/// dates compare as instants. Values of different kinds are not comparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => match (parse_date(x), parse_date(y)) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => Some(x.cmp(y)),
        },
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    a == b || compare_values(a, b) == Some(Ordering::Equal)
}

fn operands(target: &Value) -> Vec<&Value> {
    match target {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn lowercase_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.to_lowercase()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn any_ordering(values: &[Value], target: &Value, accepted: &[Ordering]) -> bool {
    values.iter().any(|v| {
        compare_values(v, target).map_or(false, |ordering| accepted.contains(&ordering))
    })
}

/// Applies an operator to the values found for a column. Missing values only satisfy
/// `exists: false`, `equals: null`, and the negated operators.
fn evaluate(values: &[Value], operator: Operator, target: &Value) -> bool {
    let equals_any = |target: &Value| {
        if values.is_empty() {
            target.is_null()
        } else {
            values.iter().any(|v| values_equal(v, target))
        }
    };
    match operator {
        Operator::Exists => !values.is_empty() == target.as_bool().unwrap_or(true),
        Operator::Equals => equals_any(target),
        Operator::NotEquals => !equals_any(target),
        Operator::In => operands(target).into_iter().any(equals_any),
        Operator::NotIn => !operands(target).into_iter().any(equals_any),
        Operator::LessThan => any_ordering(values, target, &[Ordering::Less]),
        Operator::LessThanEqual => {
            any_ordering(values, target, &[Ordering::Less, Ordering::Equal])
        }
        Operator::GreaterThan => any_ordering(values, target, &[Ordering::Greater]),
        Operator::GreaterThanEqual => {
            any_ordering(values, target, &[Ordering::Greater, Ordering::Equal])
        }
        Operator::Like => match lowercase_text(target) {
            Some(pattern) => values.iter().filter_map(lowercase_text).any(|text| {
                pattern.split_whitespace().all(|word| text.contains(word))
            }),
            None => false,
        },
        Operator::Contains => match lowercase_text(target) {
            Some(pattern) => values
                .iter()
                .filter_map(lowercase_text)
                .any(|text| text.contains(&pattern)),
            None => false,
        },
    }
}

// Documents without a value sort first in ascending order.
fn compare_documents(
    data: &InMemoryData,
    a: &Document,
    b: &Document,
    order_by: &OrderBy,
) -> Ordering {
    let left = column_values(data, a, &order_by.column.hops).into_iter().next();
    let right = column_values(data, b, &order_by.column.hops).into_iter().next();
    let ordering = match (&left, &right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(left), Some(right)) => compare_values(left, right).unwrap_or(Ordering::Equal),
    };
    order_by.order.apply(ordering)
}
