// Trait abstractions for the two external collaborators of the pipeline.
//
// Oracle replaces direct LLM calls: classification, extraction, merge,
// best-match selection and the open-ended analysis session.
// ObjectStore replaces direct row-store access: catalog, connections,
// record reads, similarity search and upserts.
//
// Both have in-memory mocks in `testing` so the whole pipeline runs in
// `cargo test` without network or database.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use taxon_common::{Metadata, ObjectPatch, ObjectRecord, RelatedRef, SchemaCatalog, UpsertStatus};

use crate::schema::{ExtractionSchema, TypeDescription};

// ---------------------------------------------------------------------------
// Oracle
// ---------------------------------------------------------------------------

/// Raw reply of a structured oracle call.
///
/// Only `Function` replies can become metadata; a `Text` reply means the
/// oracle ignored the forced function call.
#[derive(Debug, Clone, PartialEq)]
pub enum OracleOutput {
    Function(serde_json::Value),
    Text(String),
}

/// Result of an open-ended analysis session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionOutcome {
    pub summary: String,
    /// Records created or updated through tool calls during the session.
    pub touched: Vec<RelatedRef>,
}

#[async_trait]
pub trait Oracle: Send + Sync {
    /// Pick one object type for `payload` among `candidates`.
    async fn classify(
        &self,
        candidates: &[TypeDescription],
        payload: &serde_json::Value,
    ) -> Result<String>;

    /// Fill `schema` from `payload`.
    async fn extract(
        &self,
        schema: &ExtractionSchema,
        payload: &serde_json::Value,
        guidance: Option<&str>,
    ) -> Result<OracleOutput>;

    /// Reconcile existing and incoming metadata into one object under `schema`.
    async fn merge(
        &self,
        schema: &ExtractionSchema,
        existing: &Metadata,
        incoming: &Metadata,
    ) -> Result<OracleOutput>;

    /// Choose the candidate that best matches `target`, or none.
    async fn resolve_best_match(
        &self,
        candidates: &[ObjectRecord],
        target: &serde_json::Value,
    ) -> Result<Option<Uuid>>;

    /// Run a multi-turn session that may call back into `tools`.
    ///
    /// `deadline` bounds the oracle's own round-trips only. A tool call that
    /// has started is never cancelled.
    async fn run_session(
        &self,
        prompt: &str,
        tools: &dyn SessionTools,
        deadline: Option<Instant>,
    ) -> Result<SessionOutcome>;
}

// ---------------------------------------------------------------------------
// SessionTools: tools the oracle may call during an analysis session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[async_trait]
pub trait SessionTools: Send + Sync {
    fn definitions(&self) -> Vec<ToolDefinition>;

    async fn call(&self, name: &str, args: serde_json::Value) -> Result<serde_json::Value>;
}

/// Tool results that touched a record carry it under this key.
pub const TOUCHED_KEY: &str = "touched";

/// Read the touched record, if any, out of a tool result.
pub fn touched_from_result(result: &serde_json::Value) -> Option<RelatedRef> {
    serde_json::from_value(result.get(TOUCHED_KEY)?.clone()).ok()
}

// ---------------------------------------------------------------------------
// ObjectStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    ObjectType(String),
    OwnedBy(String),
    Global,
    ParentIs(Uuid),
}

impl Condition {
    pub fn matches(&self, record: &ObjectRecord) -> bool {
        match self {
            Self::ObjectType(t) => &record.related_object_type_id == t,
            Self::OwnedBy(o) => record.owner_organisation_id.as_deref() == Some(o.as_str()),
            Self::Global => record.owner_organisation_id.is_none(),
            Self::ParentIs(id) => record.parent_id == Some(*id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderBy {
    UpdatedAtDesc,
    CreatedAtAsc,
}

/// All of `and` must hold, and at least one of `or` when it is non-empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectQuery {
    pub and: Vec<Condition>,
    pub or: Vec<Condition>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl ObjectQuery {
    /// Records of `object_type_id` owned by `organisation_id` or global.
    pub fn in_scope(organisation_id: &str, object_type_id: &str) -> Self {
        Self {
            and: vec![Condition::ObjectType(object_type_id.to_string())],
            or: vec![
                Condition::OwnedBy(organisation_id.to_string()),
                Condition::Global,
            ],
            order_by: Some(OrderBy::UpdatedAtDesc),
            limit: None,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &ObjectRecord) -> bool {
        self.and.iter().all(|c| c.matches(record))
            && (self.or.is_empty() || self.or.iter().any(|c| c.matches(record)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityQuery {
    pub text: String,
    pub organisation_id: String,
    pub object_type_id: String,
    pub threshold: f64,
    pub top_k: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimilarObject {
    pub record: ObjectRecord,
    pub similarity: f64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Organisation that owns an inbound connection.
    async fn organisation_for_connection(&self, connection_id: &str) -> Result<Option<String>>;

    /// Global and organisation-owned configuration entities.
    async fn load_catalog(&self, organisation_id: &str) -> Result<SchemaCatalog>;

    async fn get_object(&self, id: Uuid) -> Result<Option<ObjectRecord>>;

    async fn query_objects(&self, query: &ObjectQuery) -> Result<Vec<ObjectRecord>>;

    /// Records at or above `threshold` similarity, best first.
    async fn similarity_search(&self, query: &SimilarityQuery) -> Result<Vec<SimilarObject>>;

    /// Write `patch` under `id`. With `may_already_exist` an existing row is
    /// folded with the structural patch merge; otherwise the row is replaced.
    async fn upsert_object(
        &self,
        id: Uuid,
        patch: ObjectPatch,
        may_already_exist: bool,
    ) -> Result<UpsertStatus>;
}

// ---------------------------------------------------------------------------
// TextEmbedder
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scope_query_matches_own_and_global_records() {
        let query = ObjectQuery::in_scope("org1", "product");

        let own = ObjectRecord::new(Some("org1".into()), "product", Metadata::new());
        let global = ObjectRecord::new(None, "product", Metadata::new());
        let foreign = ObjectRecord::new(Some("org2".into()), "product", Metadata::new());
        let other_type = ObjectRecord::new(Some("org1".into()), "feedback", Metadata::new());

        assert!(query.matches(&own));
        assert!(query.matches(&global));
        assert!(!query.matches(&foreign));
        assert!(!query.matches(&other_type));
    }

    #[test]
    fn touched_is_read_from_tool_result() {
        let id = Uuid::new_v4();
        let result = json!({"touched": {"objectTypeId": "signal", "id": id}, "merged": false});
        assert_eq!(touched_from_result(&result), Some(RelatedRef::new("signal", id)));
        assert_eq!(touched_from_result(&json!({"objects": []})), None);
    }
}
