//! Record merging.
//!
//! Two merges exist. The structural patch merge
//! ([`taxon_common::merge_metadata`]) is used for partial updates such as
//! relationship back-propagation and `may_already_exist` upserts. The
//! semantic merge here asks the oracle to reconcile an existing record with
//! a new extraction when dedup finds a match. The semantic merge never falls
//! back to the structural one.

use chrono::Utc;

use taxon_common::{merge_related_ids, Metadata, ObjectRecord, RelatedIds};

use crate::error::IngestError;
use crate::extractor::admit;
use crate::schema::ExtractionSchema;
use crate::traits::Oracle;

pub use taxon_common::merge_metadata as structural_merge;

pub async fn semantic_merge(
    oracle: &dyn Oracle,
    schema: &ExtractionSchema,
    existing: &Metadata,
    incoming: &Metadata,
) -> Result<Metadata, IngestError> {
    let output = oracle
        .merge(schema, existing, incoming)
        .await
        .map_err(|e| IngestError::Merge(format!("{e:#}")))?;

    admit(schema, output).map_err(IngestError::Merge)
}

/// The merge target rewritten with reconciled metadata.
///
/// Identity, ownership and `created_at` come from the existing record;
/// relationships are the union of both sides. Fields the pipeline may not
/// write (`allowAiUpdate = false`) are carried over from the existing record.
pub fn merged_record(
    existing: &ObjectRecord,
    metadata: Metadata,
    schema: &ExtractionSchema,
    parent_id: Option<uuid::Uuid>,
    related_ids: &RelatedIds,
) -> ObjectRecord {
    let mut merged_metadata: Metadata = existing
        .metadata
        .iter()
        .filter(|(k, _)| !schema.fields.contains_key(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    merged_metadata.extend(metadata);

    ObjectRecord {
        id: existing.id,
        owner_organisation_id: existing.owner_organisation_id.clone(),
        related_object_type_id: existing.related_object_type_id.clone(),
        metadata: merged_metadata,
        parent_id: parent_id.or(existing.parent_id),
        related_ids: merge_related_ids(&existing.related_ids, related_ids),
        created_at: existing.created_at,
        updated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::CompiledSchema;
    use crate::testing::{record, sample_catalog, MockOracle};
    use serde_json::json;
    use taxon_common::metadata_from_json;
    use uuid::Uuid;

    fn feedback_schema() -> ExtractionSchema {
        CompiledSchema::compile(&sample_catalog())
            .extraction_schema("feedback")
            .cloned()
            .unwrap()
    }

    fn meta(value: serde_json::Value) -> Metadata {
        metadata_from_json(value).unwrap()
    }

    #[tokio::test]
    async fn semantic_merge_uses_oracle_reply() {
        let oracle = MockOracle::new().merge_reply(json!({
            "title": "Login fails on Safari and Firefox",
            "severity": "critical",
            "tags": ["auth"]
        }));

        let merged = semantic_merge(
            &oracle,
            &feedback_schema(),
            &meta(json!({"title": "Login fails on Safari", "severity": "high", "tags": null})),
            &meta(json!({"title": "Login fails on Firefox", "severity": "critical", "tags": null})),
        )
        .await
        .unwrap();

        assert_eq!(merged["title"].as_str(), Some("Login fails on Safari and Firefox"));
        assert_eq!(merged["severity"].as_str(), Some("critical"));
        assert_eq!(oracle.merge_calls(), 1);
    }

    #[tokio::test]
    async fn oracle_failure_is_merge_error_without_fallback() {
        let oracle = MockOracle::new().failing_merge();
        let result = semantic_merge(
            &oracle,
            &feedback_schema(),
            &meta(json!({"title": "a"})),
            &meta(json!({"title": "b"})),
        )
        .await;
        assert!(matches!(result, Err(IngestError::Merge(_))));
    }

    #[tokio::test]
    async fn invalid_merge_reply_is_merge_error() {
        let oracle = MockOracle::new().merge_reply(json!({"severity": "high"}));
        let result = semantic_merge(
            &oracle,
            &feedback_schema(),
            &meta(json!({"title": "a"})),
            &meta(json!({"title": "b"})),
        )
        .await;
        assert!(matches!(result, Err(IngestError::Merge(_))));
    }

    #[test]
    fn merged_record_keeps_identity_and_protected_fields() {
        let mut existing = record(
            "org1",
            "feedback",
            json!({"title": "old", "internal_score": 7}),
        );
        let product = Uuid::new_v4();
        existing.add_related("product", product);

        let mut incoming_related = RelatedIds::new();
        let signal = Uuid::new_v4();
        incoming_related.entry("signal".into()).or_default().insert(signal);

        let merged = merged_record(
            &existing,
            meta(json!({"title": "new", "severity": null, "tags": null})),
            &feedback_schema(),
            None,
            &incoming_related,
        );

        assert_eq!(merged.id, existing.id);
        assert_eq!(merged.created_at, existing.created_at);
        assert_eq!(merged.metadata["title"].as_str(), Some("new"));
        assert_eq!(merged.metadata["internal_score"].as_f64(), Some(7.0));
        assert!(merged.references("product", product));
        assert!(merged.references("signal", signal));
    }

    #[test]
    fn structural_merge_is_idempotent() {
        let x = meta(json!({"tags": ["a", "b"], "nested": {"k": [1, 2]}, "title": "t"}));
        assert_eq!(structural_merge(&x, &x), x);
    }
}
