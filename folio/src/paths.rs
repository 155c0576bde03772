//! Resolution of dotted query paths against a field schema.
//!
//! A path such as `author.profile.city` is split on `.` and walked through the schema one
//! segment at a time. Every relation crossed starts a new [PathSegment] resolved against the
//! related collection, so the result describes which collection each part of the path lives
//! in and which stored path it maps to once localization is applied.

use crate::schema::{BlockRef, Field, FieldKind, SchemaRegistry};
use crate::{FolioError, FolioErrorType};
use anyhow::Result;
use serde::Serialize;

/// One resolved part of a query path, scoped to a single collection or global.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathSegment {
    /// The stored path within the collection, locale suffixes included.
    pub path: String,
    /// The matched field, or a synthetic one for `id`, `blockType`, `relationTo` and
    /// `globalType`. `None` when nothing matched.
    pub field: Option<Field>,
    pub collection_slug: Option<String>,
    pub global_slug: Option<String>,
    pub complete: bool,
    /// Set when the path does not match the schema or touches a hidden field. Callers must
    /// check this before using the segment.
    pub invalid: bool,
    pub parent_is_localized: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ResolvePathArgs<'a> {
    pub collection_slug: Option<&'a str>,
    pub global_slug: Option<&'a str>,
    pub fields: &'a [Field],
    pub incoming_path: &'a str,
    /// Locale appended to localized fields. Falls back to the default locale.
    pub locale: Option<&'a str>,
    pub override_access: bool,
    pub parent_is_localized: bool,
}

/// Resolves `args.incoming_path` against `args.fields`.
///
/// Mismatched or hidden fields never fail: the affected segment is flagged `invalid`.
/// Errors are reserved for schemas the resolver cannot follow: a block reference missing
/// from the registry, a relation to an unknown collection, or a nested path across a join
/// targeting several collections.
pub fn resolve_path(registry: &SchemaRegistry, args: ResolvePathArgs<'_>) -> Result<Vec<PathSegment>> {
    let segments: Vec<&str> = args.incoming_path.split('.').collect();
    let localization = registry.localization();
    let locale = args
        .locale
        .or_else(|| localization.map(|l| l.default_locale.as_str()));

    let mut current = PathSegment {
        path: String::new(),
        field: None,
        collection_slug: args.collection_slug.map(String::from),
        global_slug: args.global_slug.map(String::from),
        complete: false,
        invalid: false,
        parent_is_localized: args.parent_is_localized,
    };

    let mut i = 0;
    while i < segments.len() {
        let segment = segments[i];
        let mut current_path = if current.path.is_empty() {
            segment.to_string()
        } else {
            format!("{}.{}", current.path, segment)
        };
        let mut parent_is_localized = args.parent_is_localized;

        let matched = match current.field.as_ref().map(|f| &f.kind) {
            Some(FieldKind::Blocks { blocks }) => {
                if segment == "blockType" {
                    Some(Field::text("blockType"))
                } else {
                    find_in_blocks(registry, blocks, segment)?
                }
            }
            _ => {
                let fields_to_search = match &current.field {
                    Some(field) => field.kind.nested_fields().unwrap_or(&[]),
                    None => args.fields,
                };
                parent_is_localized = args.parent_is_localized
                    || current.field.as_ref().map_or(false, |f| f.localized);
                fields_to_search.iter().find(|f| f.name == segment).cloned()
            }
        };

        if current_path == "globalType" && args.global_slug.is_some() {
            current.path = current_path;
            current.complete = true;
            current.field = Some(Field::text("globalType"));
            return Ok(vec![current]);
        }

        if current_path == "relationTo" {
            current.path = current_path;
            current.complete = true;
            current.field = Some(Field::new(
                "relationTo",
                FieldKind::Select {
                    options: registry.collection_slugs(),
                },
            ));
            return Ok(vec![current]);
        }

        let matched = match matched {
            Some(field) => field,
            None if current_path == "id" && i == segments.len() - 1 => {
                current.path = current_path;
                current.field = Some(Field::new("id", registry.default_id_type().field_kind()));
                current.complete = true;
                return Ok(vec![current]);
            }
            None => {
                current.field = None;
                current.invalid = true;
                current.path = current_path;
                return Ok(vec![current]);
            }
        };

        if matched.hidden && !args.override_access {
            current.invalid = true;
        }

        let locale_segment = match (localization, segments.get(i + 1)) {
            (Some(l), Some(next)) if l.is_locale(next) => Some(*next),
            _ => None,
        };
        if let Some(locale_segment) = locale_segment {
            i += 1;
            current_path = format!("{}.{}", current_path, locale_segment);
        } else if localization.is_some() && matched.should_be_localized(parent_is_localized) {
            if let Some(locale) = locale {
                current_path = format!("{}.{}", current_path, locale);
            }
        }

        match &matched.kind {
            FieldKind::Relationship { relation_to }
            | FieldKind::Upload { relation_to }
            | FieldKind::Join {
                collection: relation_to,
                ..
            } => {
                let is_join = matches!(matched.kind, FieldKind::Join { .. });
                if !is_join && relation_to.is_polymorphic() {
                    // Polymorphic relations are only queryable directly.
                    let last = segments.last().copied().unwrap_or_default();
                    current.path = args.incoming_path.to_string();
                    if last == matched.name || last == "relationTo" || last == "value" {
                        current.complete = true;
                    } else {
                        current.invalid = true;
                    }
                    current.field = Some(matched);
                    return Ok(vec![current]);
                }

                current.complete = true;
                current.path = current_path;
                let nested_path = segments[i + 1..].join(".");
                if nested_path.is_empty() {
                    current.field = Some(matched);
                    return Ok(vec![current]);
                }

                let target = relation_to.single().ok_or_else(|| {
                    FolioError::new(
                        FolioErrorType::NotSupported,
                        format!(
                            "Querying across join field '{}' targeting several collections is not supported",
                            matched.name
                        ),
                    )
                })?;
                let related = registry.require_collection(target)?;
                let remaining = resolve_path(
                    registry,
                    ResolvePathArgs {
                        collection_slug: Some(related.slug.as_str()),
                        global_slug: args.global_slug,
                        fields: &related.fields,
                        incoming_path: &nested_path,
                        locale: args.locale,
                        override_access: args.override_access,
                        parent_is_localized: false,
                    },
                )?;
                current.field = Some(matched);
                let mut paths = vec![current];
                paths.extend(remaining);
                return Ok(paths);
            }
            FieldKind::Json | FieldKind::RichText => {
                // Opaque values: whatever follows is a path inside the stored blob.
                let upcoming = segments[i + 1..].join(".");
                current.complete = true;
                current.path = if upcoming.is_empty() {
                    current_path
                } else {
                    format!("{}.{}", current_path, upcoming)
                };
                current.field = Some(matched);
                return Ok(vec![current]);
            }
            _ => {
                if i + 1 == segments.len() {
                    current.complete = true;
                }
                current.path = current_path;
                current.field = Some(matched);
            }
        }

        i += 1;
    }

    Ok(vec![current])
}

/// Resolves a path against a registered collection.
pub fn resolve_collection_path(
    registry: &SchemaRegistry,
    collection_slug: &str,
    path: &str,
    locale: Option<&str>,
    override_access: bool,
) -> Result<Vec<PathSegment>> {
    let collection = registry.require_collection(collection_slug)?;
    resolve_path(
        registry,
        ResolvePathArgs {
            collection_slug: Some(collection.slug.as_str()),
            global_slug: None,
            fields: &collection.fields,
            incoming_path: path,
            locale,
            override_access,
            parent_is_localized: false,
        },
    )
}

/// Resolves a path against a registered global.
pub fn resolve_global_path(
    registry: &SchemaRegistry,
    global_slug: &str,
    path: &str,
    locale: Option<&str>,
    override_access: bool,
) -> Result<Vec<PathSegment>> {
    let global = registry.global(global_slug).ok_or_else(|| {
        FolioError::new(
            FolioErrorType::UnknownCollection,
            format!("Global '{}' not found in registry", global_slug),
        )
    })?;
    resolve_path(
        registry,
        ResolvePathArgs {
            collection_slug: None,
            global_slug: Some(global.slug.as_str()),
            fields: &global.fields,
            incoming_path: path,
            locale,
            override_access,
            parent_is_localized: false,
        },
    )
}

// Block variant order matters: the first variant declaring the field wins.
fn find_in_blocks(
    registry: &SchemaRegistry,
    blocks: &[BlockRef],
    segment: &str,
) -> Result<Option<Field>> {
    for block_ref in blocks {
        let found = match block_ref {
            BlockRef::Inline(block) => block.fields.iter().find(|f| f.name == segment).cloned(),
            BlockRef::Reference(slug) => {
                let block = registry.block(slug).ok_or_else(|| {
                    FolioError::new(
                        FolioErrorType::MissingBlock,
                        format!("Block '{}' not found in registry", slug),
                    )
                })?;
                block.fields.iter().find(|f| f.name == segment).cloned()
            }
        };
        if found.is_some() {
            return Ok(found);
        }
    }
    Ok(None)
}
