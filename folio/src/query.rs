use crate::paths::{resolve_collection_path, PathSegment};
use crate::schema::{Field, FieldKind, LocalizationConfig, SchemaRegistry};
use crate::{CollectionSlug, FolioError, FolioErrorType};
use anyhow::{bail, Result};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::convert::TryFrom;
use std::str::FromStr;
use std::sync::Arc;

/// Document fields maintained by the store rather than declared in the schema.
pub const TIMESTAMP_FIELDS: [&str; 2] = ["createdAt", "updatedAt"];

pub const DEFAULT_SORT: &str = "-createdAt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Exists,
    LessThan,
    LessThanEqual,
    GreaterThan,
    GreaterThanEqual,
    In,
    NotIn,
    Like,
    Contains,
}

impl FromStr for Operator {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "equals" => Operator::Equals,
            "not_equals" => Operator::NotEquals,
            "exists" => Operator::Exists,
            "less_than" => Operator::LessThan,
            "less_than_equal" => Operator::LessThanEqual,
            "greater_than" => Operator::GreaterThan,
            "greater_than_equal" => Operator::GreaterThanEqual,
            "in" => Operator::In,
            "not_in" => Operator::NotIn,
            "like" => Operator::Like,
            "contains" => Operator::Contains,
            other => {
                return Err(FolioError::new(
                    FolioErrorType::InvalidQuery,
                    format!("Unknown operator '{}'", other),
                )
                .into())
            }
        })
    }
}

/// Caller-facing filter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Where {
    And(Vec<Where>),
    Or(Vec<Where>),
    Field {
        path: String,
        operator: Operator,
        value: Value,
    },
}

impl Where {
    pub fn field<S: Into<String>>(path: S, operator: Operator, value: Value) -> Self {
        Where::Field {
            path: path.into(),
            operator,
            value,
        }
    }
}

/// Parses the JSON filter shape, e.g.
/// `{"or": [{"title": {"equals": "a"}}, {"author.name": {"like": "jo"}}]}`.
///
/// Sibling keys are combined with `and`, as are several operators on one path.
impl TryFrom<Value> for Where {
    type Error = anyhow::Error;

    fn try_from(value: Value) -> Result<Self> {
        let object = match value {
            Value::Object(object) => object,
            other => {
                return Err(FolioError::new(
                    FolioErrorType::InvalidQuery,
                    format!("Expected a where object, got {}", other),
                )
                .into())
            }
        };
        let mut clauses = Vec::new();
        for (key, value) in object {
            match key.as_str() {
                "and" | "or" => {
                    let items = match value {
                        Value::Array(items) => items,
                        other => bail!(FolioError::new(
                            FolioErrorType::InvalidQuery,
                            format!("'{}' expects an array, got {}", key, other),
                        )),
                    };
                    let nested = items
                        .into_iter()
                        .map(Where::try_from)
                        .collect::<Result<Vec<_>>>()?;
                    clauses.push(if key == "and" {
                        Where::And(nested)
                    } else {
                        Where::Or(nested)
                    });
                }
                _ => {
                    let operators = match value {
                        Value::Object(operators) => operators,
                        other => bail!(FolioError::new(
                            FolioErrorType::InvalidQuery,
                            format!("Path '{}' expects an operator object, got {}", key, other),
                        )),
                    };
                    for (operator, operand) in operators {
                        clauses.push(Where::Field {
                            path: key.clone(),
                            operator: operator.parse()?,
                            value: operand,
                        });
                    }
                }
            }
        }
        if clauses.len() == 1 {
            Ok(clauses.remove(0))
        } else {
            Ok(Where::And(clauses))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn apply(&self, ordering: Ordering) -> Ordering {
        match self {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    }
}

/// One step of a column: a stored path inside one collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnHop {
    pub collection: CollectionSlug,
    pub path: String,
    /// Set when the hop is a join field: related documents are the ones of the next hop's
    /// collection whose `join_on` field points back at the current document.
    pub join_on: Option<String>,
}

/// A fully resolved column. Every hop but the last one is a relation crossing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub hops: Vec<ColumnHop>,
}

impl Column {
    pub fn local<S: Into<String>, P: Into<String>>(collection: S, path: P) -> Self {
        Self {
            hops: vec![ColumnHop {
                collection: collection.into(),
                path: path.into(),
                join_on: None,
            }],
        }
    }

    pub fn is_local(&self) -> bool {
        self.hops.len() == 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Compare {
        column: Column,
        operator: Operator,
        value: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JoinKind {
    /// Crossing a relationship, upload or join field into another collection.
    Relation,
    /// Expanding the rows of an array or blocks field.
    Rows,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Join {
    pub kind: JoinKind,
    pub from: CollectionSlug,
    pub field_path: String,
    pub to: CollectionSlug,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderBy {
    pub column: Column,
    pub order: SortOrder,
}

/// Everything a store needs to run both phases of a find call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPlan {
    pub where_: Option<Predicate>,
    pub order_by: Option<OrderBy>,
    /// Joins required by the filter or the sort. A non-empty list means rows may repeat per
    /// document, so the finder runs a distinct id pre-pass.
    pub joins: Vec<Join>,
    pub select_fields: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BuildQueryArgs {
    pub collection: CollectionSlug,
    pub locale: Option<String>,
    /// `field` for ascending, `-field` for descending.
    pub sort: Option<String>,
    pub where_: Option<Where>,
    pub override_access: bool,
}

/// Turns filter and sort criteria into a [QueryPlan].
#[cfg_attr(test, automock)]
pub trait QueryBuilder: Send + Sync {
    fn build_query(&self, args: BuildQueryArgs) -> Result<QueryPlan>;
}

/// Query builder that resolves every path through the schema registry.
pub struct SimpleQueryBuilder {
    registry: Arc<SchemaRegistry>,
    max_path_segments: usize,
}

impl SimpleQueryBuilder {
    pub fn new(registry: Arc<SchemaRegistry>, max_path_segments: usize) -> Self {
        Self {
            registry,
            max_path_segments,
        }
    }

    fn resolve_column(
        &self,
        collection: &str,
        path: &str,
        locale: Option<&str>,
        override_access: bool,
        joins: &mut Vec<Join>,
    ) -> Result<Column> {
        if path.split('.').count() > self.max_path_segments {
            bail!(FolioError::new(
                FolioErrorType::InvalidPath,
                format!(
                    "The path '{}' exceeds the maximum of {} segments",
                    path, self.max_path_segments
                ),
            ));
        }
        if TIMESTAMP_FIELDS.contains(&path) {
            let declared = self
                .registry
                .require_collection(collection)?
                .fields
                .iter()
                .any(|f| f.name == path);
            if !declared {
                return Ok(Column::local(collection, path));
            }
        }

        let segments =
            resolve_collection_path(&self.registry, collection, path, locale, override_access)?;
        if segments
            .iter()
            .any(|s| s.invalid && s.field.as_ref().map_or(false, |f| f.hidden))
        {
            bail!(FolioError::forbidden(path));
        }
        if segments.iter().any(|s| s.invalid || !s.complete) {
            bail!(FolioError::invalid_path(path));
        }

        let hops: Vec<ColumnHop> = segments
            .iter()
            .map(|s| ColumnHop {
                collection: s
                    .collection_slug
                    .clone()
                    .unwrap_or_else(|| collection.to_string()),
                path: s.path.clone(),
                join_on: match s.field.as_ref().map(|f| &f.kind) {
                    Some(FieldKind::Join { on, .. }) => Some(on.clone()),
                    _ => None,
                },
            })
            .collect();

        for (segment, hop) in segments.iter().zip(hops.iter()) {
            if let Some(rows_path) = self.rows_prefix(segment, &hop.collection) {
                push_unique(
                    joins,
                    Join {
                        kind: JoinKind::Rows,
                        from: hop.collection.clone(),
                        field_path: rows_path,
                        to: hop.collection.clone(),
                    },
                );
            }
        }
        for pair in hops.windows(2) {
            push_unique(
                joins,
                Join {
                    kind: JoinKind::Relation,
                    from: pair[0].collection.clone(),
                    field_path: pair[0].path.clone(),
                    to: pair[1].collection.clone(),
                },
            );
        }
        Ok(Column { hops })
    }

    // Returns the stored prefix of the first array or blocks field the segment goes through.
    fn rows_prefix(&self, segment: &PathSegment, collection: &str) -> Option<String> {
        let fields = &self.registry.collection(collection)?.fields;
        rows_prefix_in(fields, &segment.path, self.registry.localization())
    }

    fn predicate(
        &self,
        collection: &str,
        where_: &Where,
        locale: Option<&str>,
        override_access: bool,
        joins: &mut Vec<Join>,
    ) -> Result<Predicate> {
        Ok(match where_ {
            Where::And(items) => Predicate::And(
                items
                    .iter()
                    .map(|w| self.predicate(collection, w, locale, override_access, joins))
                    .collect::<Result<_>>()?,
            ),
            Where::Or(items) => Predicate::Or(
                items
                    .iter()
                    .map(|w| self.predicate(collection, w, locale, override_access, joins))
                    .collect::<Result<_>>()?,
            ),
            Where::Field {
                path,
                operator,
                value,
            } => {
                match operator {
                    Operator::In | Operator::NotIn if !value.is_array() => bail!(FolioError::new(
                        FolioErrorType::InvalidQuery,
                        format!("Operator {:?} on '{}' expects an array", operator, path),
                    )),
                    Operator::Exists if !value.is_boolean() => bail!(FolioError::new(
                        FolioErrorType::InvalidQuery,
                        format!("Operator exists on '{}' expects a boolean", path),
                    )),
                    _ => {}
                }
                Predicate::Compare {
                    column: self.resolve_column(collection, path, locale, override_access, joins)?,
                    operator: *operator,
                    value: value.clone(),
                }
            }
        })
    }
}

impl QueryBuilder for SimpleQueryBuilder {
    fn build_query(&self, args: BuildQueryArgs) -> Result<QueryPlan> {
        let collection = self.registry.require_collection(&args.collection)?;
        let locale = args.locale.clone().or_else(|| {
            self.registry
                .localization()
                .map(|l| l.default_locale.clone())
        });
        let locale = locale.as_deref();
        let mut joins = Vec::new();

        let where_ = match &args.where_ {
            Some(where_) => Some(self.predicate(
                &collection.slug,
                where_,
                locale,
                args.override_access,
                &mut joins,
            )?),
            None => None,
        };

        let sort = args
            .sort
            .clone()
            .or_else(|| collection.default_sort.clone())
            .unwrap_or_else(|| DEFAULT_SORT.to_string());
        let (path, order) = match sort.strip_prefix('-') {
            Some(path) => (path, SortOrder::Desc),
            None => (sort.as_str(), SortOrder::Asc),
        };
        let order_by = OrderBy {
            column: self.resolve_column(
                &collection.slug,
                path,
                locale,
                args.override_access,
                &mut joins,
            )?,
            order,
        };

        log::debug!(
            "Built query plan. collection={}, joins={}",
            collection.slug,
            joins.len()
        );
        Ok(QueryPlan {
            where_,
            order_by: Some(order_by),
            joins,
            select_fields: vec!["id".to_string()],
        })
    }
}

fn push_unique(joins: &mut Vec<Join>, join: Join) {
    if !joins.contains(&join) {
        joins.push(join);
    }
}

fn rows_prefix_in(
    fields: &[Field],
    path: &str,
    localization: Option<&LocalizationConfig>,
) -> Option<String> {
    let mut current = fields;
    let mut prefix: Vec<&str> = Vec::new();
    for part in path.split('.') {
        prefix.push(part);
        if localization.map_or(false, |l| l.is_locale(part)) {
            continue;
        }
        let field = current.iter().find(|f| f.name == part)?;
        match &field.kind {
            FieldKind::Array { .. } | FieldKind::Blocks { .. } => return Some(prefix.join(".")),
            kind => current = kind.nested_fields()?,
        }
    }
    None
}
