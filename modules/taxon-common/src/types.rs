use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::patch::{merge_metadata, merge_related_ids};
use crate::value::{metadata_to_json, Metadata};

/// Peer-edge adjacency list: object-type id → ids of related records.
pub type RelatedIds = BTreeMap<String, BTreeSet<Uuid>>;

// =============================================================================
// Records
// =============================================================================

/// The unit of storage produced by the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRecord {
    pub id: Uuid,
    pub owner_organisation_id: Option<String>,
    pub related_object_type_id: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub related_ids: RelatedIds,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ObjectRecord {
    pub fn new(
        owner_organisation_id: Option<String>,
        related_object_type_id: impl Into<String>,
        metadata: Metadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_organisation_id,
            related_object_type_id: related_object_type_id.into(),
            metadata,
            parent_id: None,
            related_ids: RelatedIds::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Global records have no owning organisation and are visible to all.
    pub fn is_global(&self) -> bool {
        self.owner_organisation_id.is_none()
    }

    /// Whether a caller in `organisation_id` may see this record.
    pub fn visible_to(&self, organisation_id: &str) -> bool {
        self.is_global() || self.owner_organisation_id.as_deref() == Some(organisation_id)
    }

    pub fn add_related(&mut self, object_type_id: impl Into<String>, id: Uuid) {
        self.related_ids
            .entry(object_type_id.into())
            .or_default()
            .insert(id);
    }

    pub fn references(&self, object_type_id: &str, id: Uuid) -> bool {
        self.related_ids
            .get(object_type_id)
            .is_some_and(|ids| ids.contains(&id))
    }

    /// Flattened `(type, id)` view of `related_ids`.
    pub fn related_refs(&self) -> Vec<RelatedRef> {
        refs_of(&self.related_ids)
    }

    /// Text rendering used for embeddings and similarity search.
    pub fn search_text(&self) -> String {
        format!("{} {}", self.related_object_type_id, metadata_to_json(&self.metadata))
    }
}

/// One edge endpoint in the relationship graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedRef {
    pub object_type_id: String,
    pub id: Uuid,
}

impl RelatedRef {
    pub fn new(object_type_id: impl Into<String>, id: Uuid) -> Self {
        Self {
            object_type_id: object_type_id.into(),
            id,
        }
    }
}

pub fn refs_of(related_ids: &RelatedIds) -> Vec<RelatedRef> {
    related_ids
        .iter()
        .flat_map(|(object_type_id, ids)| {
            ids.iter().map(move |id| RelatedRef::new(object_type_id.clone(), *id))
        })
        .collect()
}

/// Partial record written through the storage upsert.
///
/// With `may_already_exist` the store folds the patch into the existing row
/// with the structural patch merge; otherwise the patch replaces the row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_organisation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_object_type_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub related_ids: RelatedIds,
}

impl ObjectPatch {
    /// Patch that only adds a single peer edge.
    pub fn related_edge(object_type_id: impl Into<String>, id: Uuid) -> Self {
        let mut related_ids = RelatedIds::new();
        related_ids.entry(object_type_id.into()).or_default().insert(id);
        Self {
            related_ids,
            ..Default::default()
        }
    }

    /// Fold this patch into an existing record (structural merge).
    pub fn merge_into(&self, existing: &ObjectRecord, now: DateTime<Utc>) -> ObjectRecord {
        ObjectRecord {
            id: existing.id,
            owner_organisation_id: existing.owner_organisation_id.clone(),
            related_object_type_id: self
                .related_object_type_id
                .clone()
                .unwrap_or_else(|| existing.related_object_type_id.clone()),
            metadata: merge_metadata(&existing.metadata, &self.metadata),
            parent_id: self.parent_id.or(existing.parent_id),
            related_ids: merge_related_ids(&existing.related_ids, &self.related_ids),
            created_at: existing.created_at,
            updated_at: now,
        }
    }

    /// Build a full record from this patch. Needs a type id.
    pub fn into_record(
        self,
        id: Uuid,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<ObjectRecord> {
        Some(ObjectRecord {
            id,
            owner_organisation_id: self.owner_organisation_id,
            related_object_type_id: self.related_object_type_id?,
            metadata: self.metadata,
            parent_id: self.parent_id,
            related_ids: self.related_ids,
            created_at,
            updated_at: now,
        })
    }
}

impl From<&ObjectRecord> for ObjectPatch {
    fn from(record: &ObjectRecord) -> Self {
        Self {
            owner_organisation_id: record.owner_organisation_id.clone(),
            related_object_type_id: Some(record.related_object_type_id.clone()),
            metadata: record.metadata.clone(),
            parent_id: record.parent_id,
            related_ids: record.related_ids.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertStatus {
    Created,
    Updated,
}

// =============================================================================
// Catalog
// =============================================================================

/// Category of an object type. Signal, job and message change how the
/// pipeline treats instances of the type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectCategory {
    #[default]
    Standard,
    Static,
    Signal,
    Job,
    Message,
}

impl ObjectCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Static => "static",
            Self::Signal => "signal",
            Self::Job => "job",
            Self::Message => "message",
        }
    }

    /// Signals and messages never start a post-store analysis pass of their own.
    pub fn triggers_analysis_by_default(self) -> bool {
        !matches!(self, Self::Signal | Self::Message)
    }

    /// Categories only ever produced by the analysis pass.
    pub fn is_derived(self) -> bool {
        matches!(self, Self::Signal | Self::Job)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectTypeDef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: ObjectCategory,
    #[serde(default)]
    pub parent_object_type_id: Option<String>,
    #[serde(default)]
    pub owner_organisation_id: Option<String>,
    /// Explicit override of the category default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggers_analysis: Option<bool>,
}

impl ObjectTypeDef {
    pub fn triggers_analysis(&self) -> bool {
        self.triggers_analysis
            .unwrap_or_else(|| self.category.triggers_analysis_by_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Object,
}

impl FieldKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
        }
    }
}

/// Primitive shape of a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldTypeDef {
    pub id: String,
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub is_array: bool,
}

fn default_true() -> bool {
    true
}

/// A configured attribute ("metadata type") of an object type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub field_type_id: String,
    #[serde(default)]
    pub is_array: bool,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default = "default_true")]
    pub allow_ai_update: bool,
    #[serde(default)]
    pub dictionary_term_type: Option<String>,
    #[serde(default)]
    pub max_value: Option<f64>,
    /// `None` applies the field to every object type.
    #[serde(default)]
    pub related_object_type_id: Option<String>,
    #[serde(default)]
    pub owner_organisation_id: Option<String>,
}

impl FieldDef {
    pub fn applies_to(&self, object_type_id: &str) -> bool {
        match &self.related_object_type_id {
            Some(t) => t == object_type_id,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DictionaryTerm {
    pub id: String,
    #[serde(rename = "type")]
    pub term_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub owner_organisation_id: Option<String>,
}

/// Read-only snapshot of the configuration entities visible to one organisation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaCatalog {
    #[serde(default)]
    pub object_types: Vec<ObjectTypeDef>,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub field_types: Vec<FieldTypeDef>,
    #[serde(default)]
    pub dictionary_terms: Vec<DictionaryTerm>,
}

fn in_scope(owner: &Option<String>, organisation_id: &str) -> bool {
    owner.as_deref().map_or(true, |o| o == organisation_id)
}

impl SchemaCatalog {
    /// Keep only global entries and those owned by `organisation_id`.
    pub fn scoped_to(&self, organisation_id: &str) -> Self {
        Self {
            object_types: self
                .object_types
                .iter()
                .filter(|t| in_scope(&t.owner_organisation_id, organisation_id))
                .cloned()
                .collect(),
            fields: self
                .fields
                .iter()
                .filter(|f| in_scope(&f.owner_organisation_id, organisation_id))
                .cloned()
                .collect(),
            field_types: self.field_types.clone(),
            dictionary_terms: self
                .dictionary_terms
                .iter()
                .filter(|d| in_scope(&d.owner_organisation_id, organisation_id))
                .cloned()
                .collect(),
        }
    }

    pub fn object_type(&self, id: &str) -> Option<&ObjectTypeDef> {
        self.object_types.iter().find(|t| t.id == id)
    }

    pub fn field_type(&self, id: &str) -> Option<&FieldTypeDef> {
        self.field_types.iter().find(|t| t.id == id)
    }

    pub fn fields_for<'a>(&'a self, object_type_id: &'a str) -> impl Iterator<Item = &'a FieldDef> + 'a {
        self.fields.iter().filter(move |f| f.applies_to(object_type_id))
    }

    pub fn terms_of<'a>(&'a self, term_type: &'a str) -> impl Iterator<Item = &'a DictionaryTerm> + 'a {
        self.dictionary_terms
            .iter()
            .filter(move |d| d.term_type == term_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{metadata_from_json, MetadataValue};
    use serde_json::json;

    #[test]
    fn global_records_are_visible_to_every_organisation() {
        let global = ObjectRecord::new(None, "product", Metadata::new());
        let owned = ObjectRecord::new(Some("org1".into()), "product", Metadata::new());

        assert!(global.is_global());
        assert!(global.visible_to("org2"));
        assert!(owned.visible_to("org1"));
        assert!(!owned.visible_to("org2"));
    }

    #[test]
    fn record_serializes_camel_case() {
        let record = ObjectRecord::new(Some("org1".into()), "feedback", Metadata::new());
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["relatedObjectTypeId"], "feedback");
        assert_eq!(value["ownerOrganisationId"], "org1");
        assert!(value.get("parentId").is_none());
    }

    #[test]
    fn signal_and_message_do_not_trigger_analysis() {
        let def = |category| ObjectTypeDef {
            id: "t".into(),
            name: "t".into(),
            description: String::new(),
            category,
            parent_object_type_id: None,
            owner_organisation_id: None,
            triggers_analysis: None,
        };
        assert!(def(ObjectCategory::Standard).triggers_analysis());
        assert!(def(ObjectCategory::Static).triggers_analysis());
        assert!(!def(ObjectCategory::Signal).triggers_analysis());
        assert!(!def(ObjectCategory::Message).triggers_analysis());

        let mut overridden = def(ObjectCategory::Standard);
        overridden.triggers_analysis = Some(false);
        assert!(!overridden.triggers_analysis());
    }

    #[test]
    fn patch_merge_keeps_identity_and_unions_edges() {
        let mut existing = ObjectRecord::new(
            Some("org1".into()),
            "feedback",
            metadata_from_json(json!({"tags": ["a"]})).unwrap(),
        );
        let product = Uuid::new_v4();
        existing.add_related("product", product);

        let signal = Uuid::new_v4();
        let mut patch = ObjectPatch::related_edge("signal", signal);
        patch.metadata.insert(
            "tags".into(),
            MetadataValue::Array(vec!["b".into()]),
        );

        let merged = patch.merge_into(&existing, Utc::now());
        assert_eq!(merged.id, existing.id);
        assert_eq!(merged.created_at, existing.created_at);
        assert!(merged.references("product", product));
        assert!(merged.references("signal", signal));
        assert_eq!(
            merged.metadata["tags"],
            MetadataValue::Array(vec!["a".into(), "b".into()])
        );
    }

    #[test]
    fn catalog_scope_keeps_global_and_own_entries() {
        let catalog: SchemaCatalog = serde_json::from_value(json!({
            "objectTypes": [
                {"id": "feedback", "name": "Feedback"},
                {"id": "private", "name": "Private", "ownerOrganisationId": "org2"}
            ],
            "fields": [
                {"id": "title", "name": "Title", "fieldTypeId": "text"},
                {"id": "secret", "name": "Secret", "fieldTypeId": "text", "ownerOrganisationId": "org2"}
            ]
        }))
        .unwrap();

        let scoped = catalog.scoped_to("org1");
        assert!(scoped.object_type("feedback").is_some());
        assert!(scoped.object_type("private").is_none());
        assert_eq!(scoped.fields.len(), 1);
        assert!(scoped.fields[0].allow_ai_update);
    }
}
