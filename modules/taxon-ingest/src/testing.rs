// Test mocks for the ingestion pipeline.
//
// Two mocks matching the two collaborator boundaries:
// - MockOracle (Oracle): scripted replies, call counters, scripted sessions
// - MockObjectStore (ObjectStore): stateful in-memory record store
//
// Plus fixtures: a sample catalog and record helpers.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use uuid::Uuid;

use taxon_common::{
    metadata_from_json, metadata_to_json, IngestConfig, Metadata, ObjectPatch, ObjectRecord,
    RelatedIds, SchemaCatalog, UpsertStatus,
};

use crate::error::IngestError;
use crate::orchestrator::BatchOrchestrator;
use crate::schema::{ExtractionSchema, TypeDescription};
use crate::session::Stage;
use crate::traits::{
    touched_from_result, ObjectQuery, ObjectStore, Oracle, OracleOutput, OrderBy, SessionOutcome,
    SessionTools, SimilarObject, SimilarityQuery,
};

// ---------------------------------------------------------------------------
// MockOracle
// ---------------------------------------------------------------------------

enum BestMatch {
    FirstCandidate,
    Pick(Uuid),
    Decline,
    Fail,
}

#[derive(Default)]
struct OracleCalls {
    classify: usize,
    extract: usize,
    merge: usize,
    best_match: usize,
    sessions: usize,
    prompts: Vec<String>,
    session_errors: Vec<String>,
}

/// Scripted oracle.
///
/// Defaults: classify picks the first candidate, extract echoes the payload
/// keys that exist in the schema, merge overlays non-null incoming values on
/// the existing metadata, best match picks the first candidate, sessions do
/// nothing. Builder methods override each of these.
pub struct MockOracle {
    classify_reply: Option<String>,
    extract_replies: HashMap<String, OracleOutput>,
    extract_failures: Vec<String>,
    merge_reply: Option<serde_json::Value>,
    merge_fails: bool,
    best_match: BestMatch,
    session_script: Vec<(String, serde_json::Value)>,
    session_fails: bool,
    calls: Mutex<OracleCalls>,
}

impl Default for MockOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl MockOracle {
    pub fn new() -> Self {
        Self {
            classify_reply: None,
            extract_replies: HashMap::new(),
            extract_failures: Vec::new(),
            merge_reply: None,
            merge_fails: false,
            best_match: BestMatch::FirstCandidate,
            session_script: Vec::new(),
            session_fails: false,
            calls: Mutex::new(OracleCalls::default()),
        }
    }

    pub fn classify_as(mut self, object_type_id: &str) -> Self {
        self.classify_reply = Some(object_type_id.to_string());
        self
    }

    pub fn extract_for(mut self, object_type_id: &str, reply: serde_json::Value) -> Self {
        self.extract_replies
            .insert(object_type_id.to_string(), OracleOutput::Function(reply));
        self
    }

    pub fn extract_text_for(mut self, object_type_id: &str, text: &str) -> Self {
        self.extract_replies
            .insert(object_type_id.to_string(), OracleOutput::Text(text.to_string()));
        self
    }

    /// Fail extraction for payloads whose JSON contains `needle`.
    pub fn failing_extract_on(mut self, needle: &str) -> Self {
        self.extract_failures.push(needle.to_string());
        self
    }

    pub fn merge_reply(mut self, reply: serde_json::Value) -> Self {
        self.merge_reply = Some(reply);
        self
    }

    pub fn failing_merge(mut self) -> Self {
        self.merge_fails = true;
        self
    }

    pub fn pick_match(mut self, id: Uuid) -> Self {
        self.best_match = BestMatch::Pick(id);
        self
    }

    pub fn declining_match(mut self) -> Self {
        self.best_match = BestMatch::Decline;
        self
    }

    pub fn failing_best_match(mut self) -> Self {
        self.best_match = BestMatch::Fail;
        self
    }

    /// During a session, call `create_object` once per scripted entry.
    pub fn session_creates(mut self, object_type_id: &str, data: serde_json::Value) -> Self {
        self.session_script.push((object_type_id.to_string(), data));
        self
    }

    pub fn failing_session(mut self) -> Self {
        self.session_fails = true;
        self
    }

    pub fn classify_calls(&self) -> usize {
        self.calls.lock().unwrap().classify
    }

    pub fn extract_calls(&self) -> usize {
        self.calls.lock().unwrap().extract
    }

    pub fn merge_calls(&self) -> usize {
        self.calls.lock().unwrap().merge
    }

    pub fn best_match_calls(&self) -> usize {
        self.calls.lock().unwrap().best_match
    }

    pub fn session_calls(&self) -> usize {
        self.calls.lock().unwrap().sessions
    }

    pub fn session_prompts(&self) -> Vec<String> {
        self.calls.lock().unwrap().prompts.clone()
    }

    /// Errors returned by tools during scripted sessions.
    pub fn session_errors(&self) -> Vec<String> {
        self.calls.lock().unwrap().session_errors.clone()
    }
}

#[async_trait]
impl Oracle for MockOracle {
    async fn classify(
        &self,
        candidates: &[TypeDescription],
        _payload: &serde_json::Value,
    ) -> Result<String> {
        self.calls.lock().unwrap().classify += 1;
        match &self.classify_reply {
            Some(reply) => Ok(reply.clone()),
            None => candidates
                .first()
                .map(|c| c.id.clone())
                .ok_or_else(|| anyhow!("MockOracle: no candidates")),
        }
    }

    async fn extract(
        &self,
        schema: &ExtractionSchema,
        payload: &serde_json::Value,
        _guidance: Option<&str>,
    ) -> Result<OracleOutput> {
        self.calls.lock().unwrap().extract += 1;

        let rendered = payload.to_string();
        if let Some(needle) = self.extract_failures.iter().find(|n| rendered.contains(n.as_str())) {
            bail!("MockOracle: extraction failure injected for `{needle}`");
        }

        if let Some(reply) = self.extract_replies.get(&schema.object_type_id) {
            return Ok(reply.clone());
        }

        let echoed: serde_json::Map<String, serde_json::Value> = payload
            .as_object()
            .map(|map| {
                map.iter()
                    .filter(|(k, _)| schema.fields.contains_key(*k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(OracleOutput::Function(serde_json::Value::Object(echoed)))
    }

    async fn merge(
        &self,
        _schema: &ExtractionSchema,
        existing: &Metadata,
        incoming: &Metadata,
    ) -> Result<OracleOutput> {
        self.calls.lock().unwrap().merge += 1;

        if self.merge_fails {
            bail!("MockOracle: merge failure injected");
        }
        if let Some(reply) = &self.merge_reply {
            return Ok(OracleOutput::Function(reply.clone()));
        }

        let mut merged = existing.clone();
        for (key, value) in incoming {
            if !value.is_null() {
                merged.insert(key.clone(), value.clone());
            }
        }
        Ok(OracleOutput::Function(metadata_to_json(&merged)))
    }

    async fn resolve_best_match(
        &self,
        candidates: &[ObjectRecord],
        _target: &serde_json::Value,
    ) -> Result<Option<Uuid>> {
        self.calls.lock().unwrap().best_match += 1;
        match &self.best_match {
            BestMatch::FirstCandidate => Ok(candidates.first().map(|c| c.id)),
            BestMatch::Pick(id) => Ok(Some(*id)),
            BestMatch::Decline => Ok(None),
            BestMatch::Fail => bail!("MockOracle: best-match failure injected"),
        }
    }

    async fn run_session(
        &self,
        prompt: &str,
        tools: &dyn SessionTools,
        deadline: Option<Instant>,
    ) -> Result<SessionOutcome> {
        {
            let mut calls = self.calls.lock().unwrap();
            calls.sessions += 1;
            calls.prompts.push(prompt.to_string());
        }

        if self.session_fails {
            bail!("MockOracle: session failure injected");
        }

        let mut touched = Vec::new();
        for (object_type_id, data) in &self.session_script {
            // Each scripted call stands in for one oracle round-trip.
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(IngestError::Cancelled(Stage::Analysis).into());
            }
            let args = json!({"object_type_id": object_type_id, "data": data});
            match tools.call("create_object", args).await {
                Ok(result) => touched.extend(touched_from_result(&result)),
                Err(e) => self.calls.lock().unwrap().session_errors.push(e.to_string()),
            }
        }

        Ok(SessionOutcome {
            summary: format!("scripted session created {} object(s)", touched.len()),
            touched,
        })
    }
}

// ---------------------------------------------------------------------------
// MockObjectStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockObjectStoreInner {
    objects: HashMap<Uuid, ObjectRecord>,
    /// (id, may_already_exist) of every upsert call, in order.
    upserts: Vec<(Uuid, bool)>,
    failing_ids: HashSet<Uuid>,
    fail_all_upserts: bool,
    fail_catalog: bool,
    similarity_overrides: HashMap<Uuid, f64>,
}

/// Stateful in-memory store. Similarity is token overlap (Jaccard) of the
/// records' search text unless overridden per record.
pub struct MockObjectStore {
    catalog: SchemaCatalog,
    connections: HashMap<String, String>,
    merge_delay: Option<Duration>,
    inner: Mutex<MockObjectStoreInner>,
}

impl MockObjectStore {
    pub fn new(catalog: SchemaCatalog) -> Self {
        Self {
            catalog,
            connections: HashMap::new(),
            merge_delay: None,
            inner: Mutex::new(MockObjectStoreInner::default()),
        }
    }

    pub fn with_connection(mut self, connection_id: &str, organisation_id: &str) -> Self {
        self.connections
            .insert(connection_id.to_string(), organisation_id.to_string());
        self
    }

    pub fn with_object(self, record: ObjectRecord) -> Self {
        self.inner.lock().unwrap().objects.insert(record.id, record);
        self
    }

    pub fn with_similarity(self, id: Uuid, similarity: f64) -> Self {
        self.inner
            .lock()
            .unwrap()
            .similarity_overrides
            .insert(id, similarity);
        self
    }

    /// Delay every `may_already_exist` upsert (back-edges, analysis links).
    pub fn slow_merges(mut self, delay: Duration) -> Self {
        self.merge_delay = Some(delay);
        self
    }

    pub fn failing_upserts_for(self, id: Uuid) -> Self {
        self.inner.lock().unwrap().failing_ids.insert(id);
        self
    }

    pub fn failing_upserts(self) -> Self {
        self.inner.lock().unwrap().fail_all_upserts = true;
        self
    }

    pub fn failing_catalog(self) -> Self {
        self.inner.lock().unwrap().fail_catalog = true;
        self
    }

    pub fn upsert_calls(&self) -> usize {
        self.inner.lock().unwrap().upserts.len()
    }

    /// Upserts that replaced or created a whole record.
    pub fn full_writes(&self) -> Vec<Uuid> {
        self.inner
            .lock()
            .unwrap()
            .upserts
            .iter()
            .filter(|(_, may_already_exist)| !may_already_exist)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn object(&self, id: Uuid) -> Option<ObjectRecord> {
        self.inner.lock().unwrap().objects.get(&id).cloned()
    }

    pub fn objects_of_type(&self, object_type_id: &str) -> Vec<ObjectRecord> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<ObjectRecord> = inner
            .objects
            .values()
            .filter(|r| r.related_object_type_id == object_type_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every edge A→B in the store has its B→A counterpart.
    pub fn relationships_are_symmetric(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.objects.values().all(|a| {
            a.related_refs().iter().all(|peer| match inner.objects.get(&peer.id) {
                Some(b) => b.references(&a.related_object_type_id, a.id),
                None => true,
            })
        })
    }
}

fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn organisation_for_connection(&self, connection_id: &str) -> Result<Option<String>> {
        Ok(self.connections.get(connection_id).cloned())
    }

    async fn load_catalog(&self, _organisation_id: &str) -> Result<SchemaCatalog> {
        if self.inner.lock().unwrap().fail_catalog {
            bail!("MockObjectStore: catalog failure injected");
        }
        Ok(self.catalog.clone())
    }

    async fn get_object(&self, id: Uuid) -> Result<Option<ObjectRecord>> {
        Ok(self.object(id))
    }

    async fn query_objects(&self, query: &ObjectQuery) -> Result<Vec<ObjectRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<ObjectRecord> = inner
            .objects
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();

        match query.order_by {
            Some(OrderBy::UpdatedAtDesc) => records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at)),
            Some(OrderBy::CreatedAtAsc) => records.sort_by_key(|r| r.created_at),
            None => records.sort_by_key(|r| r.id),
        }
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn similarity_search(&self, query: &SimilarityQuery) -> Result<Vec<SimilarObject>> {
        let inner = self.inner.lock().unwrap();
        let query_tokens = tokens(&query.text);

        let mut matches: Vec<SimilarObject> = inner
            .objects
            .values()
            .filter(|r| r.owner_organisation_id.as_deref() == Some(query.organisation_id.as_str()))
            .filter(|r| r.related_object_type_id == query.object_type_id)
            .map(|r| SimilarObject {
                similarity: inner
                    .similarity_overrides
                    .get(&r.id)
                    .copied()
                    .unwrap_or_else(|| jaccard(&query_tokens, &tokens(&r.search_text()))),
                record: r.clone(),
            })
            .filter(|m| m.similarity >= query.threshold)
            .collect();

        matches.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| b.record.updated_at.cmp(&a.record.updated_at))
        });
        matches.truncate(query.top_k);
        Ok(matches)
    }

    async fn upsert_object(
        &self,
        id: Uuid,
        patch: ObjectPatch,
        may_already_exist: bool,
    ) -> Result<UpsertStatus> {
        if let (true, Some(delay)) = (may_already_exist, self.merge_delay) {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock().unwrap();
        inner.upserts.push((id, may_already_exist));

        if inner.fail_all_upserts || inner.failing_ids.contains(&id) {
            bail!("MockObjectStore: upsert failure injected for {id}");
        }

        let now = Utc::now();
        let (record, status) = match inner.objects.get(&id) {
            Some(existing) if may_already_exist => (patch.merge_into(existing, now), UpsertStatus::Updated),
            Some(existing) => {
                let created_at = existing.created_at;
                let record = patch
                    .into_record(id, created_at, now)
                    .ok_or_else(|| anyhow!("cannot replace {id} without an object type"))?;
                (record, UpsertStatus::Updated)
            }
            None => {
                let record = patch
                    .into_record(id, now, now)
                    .ok_or_else(|| anyhow!("cannot create {id} without an object type"))?;
                (record, UpsertStatus::Created)
            }
        };

        inner.objects.insert(id, record);
        Ok(status)
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Catalog with feedback, product, feature_request (child of product),
/// signal, job and message types.
pub fn sample_catalog() -> SchemaCatalog {
    serde_json::from_value(json!({
        "objectTypes": [
            {"id": "feedback", "name": "Feedback", "description": "Customer feedback about the product", "category": "standard"},
            {"id": "product", "name": "Product", "description": "A product the organisation sells", "category": "static"},
            {"id": "feature_request", "name": "Feature request", "description": "A request for new functionality", "category": "standard", "parentObjectTypeId": "product"},
            {"id": "signal", "name": "Signal", "description": "A noteworthy pattern derived from other records", "category": "signal"},
            {"id": "job", "name": "Job", "description": "A follow-up task for the team", "category": "job"},
            {"id": "message", "name": "Message", "description": "A raw inbound message", "category": "message"}
        ],
        "fieldTypes": [
            {"id": "text", "name": "Text", "kind": "string"},
            {"id": "number", "name": "Number", "kind": "number"},
            {"id": "flag", "name": "Flag", "kind": "boolean"}
        ],
        "fields": [
            {"id": "title", "name": "Title", "description": "Short summary of the feedback", "fieldTypeId": "text", "isRequired": true, "relatedObjectTypeId": "feedback"},
            {"id": "severity", "name": "Severity", "description": "How severe the problem is", "fieldTypeId": "text", "dictionaryTermType": "severity", "relatedObjectTypeId": "feedback"},
            {"id": "internal_score", "name": "Internal score", "description": "Score set by the team", "fieldTypeId": "number", "allowAiUpdate": false, "relatedObjectTypeId": "feedback"},
            {"id": "tags", "name": "Tags", "description": "Free-form labels", "fieldTypeId": "text", "isArray": true, "maxValue": 10},
            {"id": "product_name", "name": "Product name", "description": "Name of the product", "fieldTypeId": "text", "isRequired": true, "relatedObjectTypeId": "product"},
            {"id": "summary", "name": "Summary", "description": "What is being requested", "fieldTypeId": "text", "isRequired": true, "relatedObjectTypeId": "feature_request"},
            {"id": "signal_summary", "name": "Signal summary", "description": "What the signal indicates", "fieldTypeId": "text", "isRequired": true, "relatedObjectTypeId": "signal"},
            {"id": "job_title", "name": "Job title", "description": "What needs to be done", "fieldTypeId": "text", "isRequired": true, "relatedObjectTypeId": "job"},
            {"id": "body", "name": "Body", "description": "Message text", "fieldTypeId": "text", "isRequired": true, "relatedObjectTypeId": "message"},
            {"id": "private_note", "name": "Private note", "description": "Only for org2", "fieldTypeId": "text", "relatedObjectTypeId": "feedback", "ownerOrganisationId": "org2"}
        ],
        "dictionaryTerms": [
            {"id": "low", "type": "severity", "description": "Cosmetic"},
            {"id": "medium", "type": "severity", "description": "Degraded"},
            {"id": "high", "type": "severity", "description": "Broken for some users"},
            {"id": "critical", "type": "severity", "description": "Broken for everyone"}
        ]
    }))
    .expect("sample catalog is valid")
}

/// A record owned by `organisation_id` with `metadata` taken verbatim.
pub fn record(organisation_id: &str, object_type_id: &str, metadata: serde_json::Value) -> ObjectRecord {
    ObjectRecord::new(
        Some(organisation_id.to_string()),
        object_type_id,
        metadata_from_json(metadata).unwrap_or_default(),
    )
}

/// Orchestrator over the mocks with default limits.
pub fn orchestrator(oracle: &Arc<MockOracle>, store: &Arc<MockObjectStore>) -> BatchOrchestrator {
    orchestrator_with(oracle, store, IngestConfig::default())
}

pub fn orchestrator_with(
    oracle: &Arc<MockOracle>,
    store: &Arc<MockObjectStore>,
    config: IngestConfig,
) -> BatchOrchestrator {
    BatchOrchestrator::new(oracle.clone(), store.clone(), config)
}

/// `{"<type>": [id]}` shorthand for related-id hints.
pub fn related(object_type_id: &str, id: Uuid) -> RelatedIds {
    let mut ids = RelatedIds::new();
    ids.entry(object_type_id.to_string()).or_default().insert(id);
    ids
}
