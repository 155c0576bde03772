use crate::{CollectionSlug, FolioError};
use anyhow::{bail, Result};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A relation target: a single collection or, for polymorphic relations, a set of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelationTo {
    One(CollectionSlug),
    Many(Vec<CollectionSlug>),
}

impl RelationTo {
    pub fn is_polymorphic(&self) -> bool {
        matches!(self, RelationTo::Many(_))
    }

    pub fn single(&self) -> Option<&str> {
        match self {
            RelationTo::One(slug) => Some(slug.as_str()),
            RelationTo::Many(_) => None,
        }
    }
}

/// A blocks field variant: either declared inline or referenced by slug from the
/// registry's block table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BlockRef {
    Reference(String),
    Inline(Block),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub slug: String,
    #[serde(default)]
    pub fields: Vec<Field>,
}

/// Supported field kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FieldKind {
    Text,
    Textarea,
    Email,
    Code,
    Number,
    Checkbox,
    Date,
    Point,
    Select {
        #[serde(default)]
        options: Vec<String>,
    },
    Radio {
        #[serde(default)]
        options: Vec<String>,
    },
    Group {
        fields: Vec<Field>,
    },
    Array {
        fields: Vec<Field>,
    },
    Tab {
        fields: Vec<Field>,
    },
    Relationship {
        #[serde(rename = "relationTo")]
        relation_to: RelationTo,
    },
    Upload {
        #[serde(rename = "relationTo")]
        relation_to: RelationTo,
    },
    /// Virtual field materializing the inverse side of a relationship.
    Join {
        collection: RelationTo,
        on: String,
    },
    Blocks {
        blocks: Vec<BlockRef>,
    },
    Json,
    RichText,
}

impl FieldKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Textarea => "textarea",
            FieldKind::Email => "email",
            FieldKind::Code => "code",
            FieldKind::Number => "number",
            FieldKind::Checkbox => "checkbox",
            FieldKind::Date => "date",
            FieldKind::Point => "point",
            FieldKind::Select { .. } => "select",
            FieldKind::Radio { .. } => "radio",
            FieldKind::Group { .. } => "group",
            FieldKind::Array { .. } => "array",
            FieldKind::Tab { .. } => "tab",
            FieldKind::Relationship { .. } => "relationship",
            FieldKind::Upload { .. } => "upload",
            FieldKind::Join { .. } => "join",
            FieldKind::Blocks { .. } => "blocks",
            FieldKind::Json => "json",
            FieldKind::RichText => "richText",
        }
    }

    /// Children of composite kinds. Scalars, relations and blocks have none.
    pub fn nested_fields(&self) -> Option<&[Field]> {
        match self {
            FieldKind::Group { fields } | FieldKind::Array { fields } | FieldKind::Tab { fields } => {
                Some(fields.as_slice())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default)]
    pub localized: bool,
    #[serde(default)]
    pub hidden: bool,
}

impl Field {
    pub fn new<S: Into<String>>(name: S, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            localized: false,
            hidden: false,
        }
    }

    pub fn text<S: Into<String>>(name: S) -> Self {
        Self::new(name, FieldKind::Text)
    }

    pub fn number<S: Into<String>>(name: S) -> Self {
        Self::new(name, FieldKind::Number)
    }

    pub fn checkbox<S: Into<String>>(name: S) -> Self {
        Self::new(name, FieldKind::Checkbox)
    }

    pub fn date<S: Into<String>>(name: S) -> Self {
        Self::new(name, FieldKind::Date)
    }

    pub fn json<S: Into<String>>(name: S) -> Self {
        Self::new(name, FieldKind::Json)
    }

    pub fn group<S: Into<String>>(name: S, fields: Vec<Field>) -> Self {
        Self::new(name, FieldKind::Group { fields })
    }

    pub fn array<S: Into<String>>(name: S, fields: Vec<Field>) -> Self {
        Self::new(name, FieldKind::Array { fields })
    }

    pub fn relationship<S: Into<String>>(name: S, relation_to: RelationTo) -> Self {
        Self::new(name, FieldKind::Relationship { relation_to })
    }

    pub fn blocks<S: Into<String>>(name: S, blocks: Vec<BlockRef>) -> Self {
        Self::new(name, FieldKind::Blocks { blocks })
    }

    pub fn localized(mut self) -> Self {
        self.localized = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Whether values of this field are stored per locale.
    ///
    /// A localized field nested in an already localized parent is stored once under the
    /// parent's locale key, so it is not localized a second time.
    pub fn should_be_localized(&self, parent_is_localized: bool) -> bool {
        self.localized && !parent_is_localized
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub slug: CollectionSlug,
    pub fields: Vec<Field>,
    /// Sort applied when a find call does not specify one, e.g. `-createdAt`.
    #[serde(default, rename = "defaultSort")]
    pub default_sort: Option<String>,
}

impl CollectionConfig {
    pub fn new<S: Into<String>>(slug: S, fields: Vec<Field>) -> Self {
        Self {
            slug: slug.into(),
            fields,
            default_sort: None,
        }
    }

    pub fn with_default_sort<S: Into<String>>(mut self, sort: S) -> Self {
        self.default_sort = Some(sort.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub slug: String,
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalizationConfig {
    #[serde(rename = "localeCodes")]
    pub locale_codes: Vec<String>,
    #[serde(rename = "defaultLocale")]
    pub default_locale: String,
}

impl LocalizationConfig {
    pub fn is_locale(&self, code: &str) -> bool {
        self.locale_codes.iter().any(|l| l == code)
    }
}

/// Type of the ids generated by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum IdType {
    #[display(fmt = "text")]
    Text,
    #[display(fmt = "number")]
    Number,
}

impl Default for IdType {
    fn default() -> Self {
        IdType::Text
    }
}

impl IdType {
    pub fn field_kind(&self) -> FieldKind {
        match self {
            IdType::Text => FieldKind::Text,
            IdType::Number => FieldKind::Number,
        }
    }
}

/// Every schema known to the engine, passed explicitly to whoever needs to look
/// collections, globals or blocks up by slug.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    collections: HashMap<CollectionSlug, Arc<CollectionConfig>>,
    collection_order: Vec<CollectionSlug>,
    globals: HashMap<String, Arc<GlobalConfig>>,
    blocks: HashMap<String, Arc<Block>>,
    localization: Option<LocalizationConfig>,
    default_id_type: IdType,
}

impl SchemaRegistry {
    pub fn collection(&self, slug: &str) -> Option<&Arc<CollectionConfig>> {
        self.collections.get(slug)
    }

    /// Same as [SchemaRegistry::collection] but fails with
    /// [crate::FolioErrorType::UnknownCollection] when the slug is not registered.
    pub fn require_collection(&self, slug: &str) -> Result<&Arc<CollectionConfig>> {
        self.collections
            .get(slug)
            .ok_or_else(|| FolioError::unknown_collection(slug).into())
    }

    pub fn global(&self, slug: &str) -> Option<&Arc<GlobalConfig>> {
        self.globals.get(slug)
    }

    pub fn block(&self, slug: &str) -> Option<&Arc<Block>> {
        self.blocks.get(slug)
    }

    /// Collection slugs in registration order.
    pub fn collection_slugs(&self) -> Vec<String> {
        self.collection_order.clone()
    }

    pub fn localization(&self) -> Option<&LocalizationConfig> {
        self.localization.as_ref()
    }

    pub fn default_id_type(&self) -> IdType {
        self.default_id_type
    }
}

pub struct SchemaRegistryBuilder {
    collections: Vec<CollectionConfig>,
    globals: Vec<GlobalConfig>,
    blocks: Vec<Block>,
    localization: Option<LocalizationConfig>,
    default_id_type: IdType,
}

impl Default for SchemaRegistryBuilder {
    fn default() -> Self {
        Self {
            collections: Vec::new(),
            globals: Vec::new(),
            blocks: Vec::new(),
            localization: None,
            default_id_type: IdType::Text,
        }
    }
}

impl SchemaRegistryBuilder {
    pub fn add_collection(&mut self, collection: CollectionConfig) -> &mut Self {
        self.collections.push(collection);
        self
    }

    pub fn add_global(&mut self, global: GlobalConfig) -> &mut Self {
        self.globals.push(global);
        self
    }

    pub fn add_block(&mut self, block: Block) -> &mut Self {
        self.blocks.push(block);
        self
    }

    pub fn localization(&mut self, localization: LocalizationConfig) -> &mut Self {
        self.localization = Some(localization);
        self
    }

    pub fn default_id_type(&mut self, id_type: IdType) -> &mut Self {
        self.default_id_type = id_type;
        self
    }

    pub fn build(&self) -> Result<Arc<SchemaRegistry>> {
        let mut registry = SchemaRegistry {
            default_id_type: self.default_id_type,
            localization: self.localization.clone(),
            ..SchemaRegistry::default()
        };
        for collection in self.collections.iter() {
            if registry.collections.contains_key(&collection.slug) {
                bail!("Duplicate collection slug: '{}'", collection.slug);
            }
            registry.collection_order.push(collection.slug.clone());
            registry
                .collections
                .insert(collection.slug.clone(), Arc::new(collection.clone()));
        }
        for global in self.globals.iter() {
            if registry.globals.contains_key(&global.slug) {
                bail!("Duplicate global slug: '{}'", global.slug);
            }
            registry
                .globals
                .insert(global.slug.clone(), Arc::new(global.clone()));
        }
        for block in self.blocks.iter() {
            if registry.blocks.contains_key(&block.slug) {
                bail!("Duplicate block slug: '{}'", block.slug);
            }
            registry
                .blocks
                .insert(block.slug.clone(), Arc::new(block.clone()));
        }
        if let Some(localization) = &registry.localization {
            if !localization.is_locale(&localization.default_locale) {
                bail!(
                    "Default locale '{}' is not one of the configured locales",
                    localization.default_locale
                );
            }
        }
        Ok(Arc::new(registry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FolioErrorType;
    use serde_json::json;

    #[test]
    fn test_field_from_json() {
        let field: Field = serde_json::from_value(json!({
            "name": "author",
            "type": "relationship",
            "relationTo": ["users", "admins"],
            "localized": true
        }))
        .unwrap();
        assert_eq!("author", field.name);
        assert!(field.localized);
        assert!(!field.hidden);
        match field.kind {
            FieldKind::Relationship { relation_to } => assert!(relation_to.is_polymorphic()),
            other => panic!("unexpected kind {:?}", other),
        }

        let blocks: Field = serde_json::from_value(json!({
            "name": "layout",
            "type": "blocks",
            "blocks": ["hero", {"slug": "quote", "fields": [{"name": "text", "type": "text"}]}]
        }))
        .unwrap();
        match blocks.kind {
            FieldKind::Blocks { blocks } => {
                assert_eq!(BlockRef::Reference("hero".to_string()), blocks[0]);
                assert!(matches!(&blocks[1], BlockRef::Inline(b) if b.slug == "quote"));
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_nested_localization() {
        let field = Field::text("title").localized();
        assert!(field.should_be_localized(false));
        assert!(!field.should_be_localized(true));
        assert!(!Field::text("slug").should_be_localized(false));
    }

    #[test]
    fn test_registry_builder() {
        let registry = SchemaRegistryBuilder::default()
            .add_collection(CollectionConfig::new("posts", vec![Field::text("title")]))
            .add_collection(CollectionConfig::new("users", vec![Field::text("name")]))
            .default_id_type(IdType::Number)
            .build()
            .unwrap();
        assert_eq!(vec!["posts", "users"], registry.collection_slugs());
        assert_eq!(IdType::Number, registry.default_id_type());
        assert!(registry.collection("posts").is_some());
        let err = registry.require_collection("pages").unwrap_err();
        assert_eq!(
            FolioErrorType::UnknownCollection,
            err.downcast_ref::<FolioError>().unwrap().error_type
        );
    }

    #[test]
    fn test_registry_builder_rejects_duplicates() {
        let result = SchemaRegistryBuilder::default()
            .add_collection(CollectionConfig::new("posts", vec![]))
            .add_collection(CollectionConfig::new("posts", vec![]))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_registry_builder_rejects_unknown_default_locale() {
        let result = SchemaRegistryBuilder::default()
            .localization(LocalizationConfig {
                locale_codes: vec!["en".to_string()],
                default_locale: "es".to_string(),
            })
            .build();
        assert!(result.is_err());
    }
}
