use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::types::Json;
use uuid::Uuid;

use taxon_common::{
    metadata_from_json, DictionaryTerm, FieldDef, FieldTypeDef, ObjectRecord, ObjectTypeDef,
    RelatedIds,
};

use crate::traits::SimilarObject;

pub(crate) const OBJECT_COLUMNS: &str = "id, owner_organisation_id, related_object_type_id, \
     metadata, parent_id, related_ids, created_at, updated_at";

/// Lowercase catalog enums are stored as text and read back through serde.
fn parse_text_enum<T: DeserializeOwned>(column: &str, value: String) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(value.clone()))
        .with_context(|| format!("unknown {column} '{value}'"))
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ObjectRow {
    pub id: Uuid,
    pub owner_organisation_id: Option<String>,
    pub related_object_type_id: String,
    pub metadata: serde_json::Value,
    pub parent_id: Option<Uuid>,
    pub related_ids: Json<RelatedIds>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ObjectRow> for ObjectRecord {
    fn from(row: ObjectRow) -> Self {
        Self {
            id: row.id,
            owner_organisation_id: row.owner_organisation_id,
            related_object_type_id: row.related_object_type_id,
            metadata: metadata_from_json(row.metadata).unwrap_or_default(),
            parent_id: row.parent_id,
            related_ids: row.related_ids.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct SimilarRow {
    #[sqlx(flatten)]
    pub object: ObjectRow,
    pub similarity: f64,
}

impl From<SimilarRow> for SimilarObject {
    fn from(row: SimilarRow) -> Self {
        Self {
            record: row.object.into(),
            similarity: row.similarity,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ObjectTypeRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub parent_object_type_id: Option<String>,
    pub owner_organisation_id: Option<String>,
    pub triggers_analysis: Option<bool>,
}

impl TryFrom<ObjectTypeRow> for ObjectTypeDef {
    type Error = anyhow::Error;

    fn try_from(row: ObjectTypeRow) -> Result<Self> {
        Ok(Self {
            category: parse_text_enum("object type category", row.category)?,
            id: row.id,
            name: row.name,
            description: row.description,
            parent_object_type_id: row.parent_object_type_id,
            owner_organisation_id: row.owner_organisation_id,
            triggers_analysis: row.triggers_analysis,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct FieldTypeRow {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub is_array: bool,
}

impl TryFrom<FieldTypeRow> for FieldTypeDef {
    type Error = anyhow::Error;

    fn try_from(row: FieldTypeRow) -> Result<Self> {
        Ok(Self {
            kind: parse_text_enum("field kind", row.kind)?,
            id: row.id,
            name: row.name,
            is_array: row.is_array,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct FieldRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub field_type_id: String,
    pub is_array: bool,
    pub is_required: bool,
    pub allow_ai_update: bool,
    pub dictionary_term_type: Option<String>,
    pub max_value: Option<f64>,
    pub related_object_type_id: Option<String>,
    pub owner_organisation_id: Option<String>,
}

impl From<FieldRow> for FieldDef {
    fn from(row: FieldRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            description: row.description,
            field_type_id: row.field_type_id,
            is_array: row.is_array,
            is_required: row.is_required,
            allow_ai_update: row.allow_ai_update,
            dictionary_term_type: row.dictionary_term_type,
            max_value: row.max_value,
            related_object_type_id: row.related_object_type_id,
            owner_organisation_id: row.owner_organisation_id,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct TermRow {
    pub id: String,
    pub term_type: String,
    pub description: String,
    pub owner_organisation_id: Option<String>,
}

impl From<TermRow> for DictionaryTerm {
    fn from(row: TermRow) -> Self {
        Self {
            id: row.id,
            term_type: row.term_type,
            description: row.description,
            owner_organisation_id: row.owner_organisation_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taxon_common::{FieldKind, MetadataValue, ObjectCategory};

    fn type_row(category: &str) -> ObjectTypeRow {
        ObjectTypeRow {
            id: "feedback".into(),
            name: "Feedback".into(),
            description: String::new(),
            category: category.into(),
            parent_object_type_id: None,
            owner_organisation_id: None,
            triggers_analysis: None,
        }
    }

    #[test]
    fn category_text_is_parsed() {
        let def = ObjectTypeDef::try_from(type_row("signal")).unwrap();
        assert_eq!(def.category, ObjectCategory::Signal);
        assert!(!def.triggers_analysis());
    }

    #[test]
    fn unknown_category_is_an_error() {
        let err = ObjectTypeDef::try_from(type_row("widget")).unwrap_err();
        assert!(err.to_string().contains("widget"));
    }

    #[test]
    fn field_kind_text_is_parsed() {
        let def = FieldTypeDef::try_from(FieldTypeRow {
            id: "flag".into(),
            name: "Flag".into(),
            kind: "boolean".into(),
            is_array: false,
        })
        .unwrap();
        assert_eq!(def.kind, FieldKind::Boolean);
    }

    #[test]
    fn object_row_becomes_record() {
        let id = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let mut related = RelatedIds::new();
        related.entry("product".into()).or_default().insert(peer);

        let record: ObjectRecord = ObjectRow {
            id,
            owner_organisation_id: Some("org1".into()),
            related_object_type_id: "feedback".into(),
            metadata: json!({"title": "Slow export", "severity": null}),
            parent_id: None,
            related_ids: Json(related),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
        .into();

        assert_eq!(record.id, id);
        assert_eq!(
            record.metadata.get("title"),
            Some(&MetadataValue::String("Slow export".into()))
        );
        assert!(record.references("product", peer));
    }

    #[test]
    fn non_object_metadata_reads_as_empty() {
        let record: ObjectRecord = ObjectRow {
            id: Uuid::new_v4(),
            owner_organisation_id: None,
            related_object_type_id: "product".into(),
            metadata: json!("legacy"),
            parent_id: None,
            related_ids: Json(RelatedIds::new()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
        .into();
        assert!(record.metadata.is_empty());
    }
}
