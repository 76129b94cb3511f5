//! Post-store analysis: tools the oracle may call while looking at a freshly
//! stored record, and the prompt that starts the session.
//!
//! Records created here go through the full pipeline as nested, non-top-level
//! ingests, so they cannot start an analysis pass of their own.

use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use taxon_common::{metadata_to_json, ObjectRecord, ObjectTypeDef, RelatedIds, RelatedRef};

use crate::orchestrator::{BatchOrchestrator, ItemResult, RunContext};
use crate::request::IngestHints;
use crate::traits::{ObjectQuery, SessionTools, ToolDefinition, TOUCHED_KEY};

const MAX_QUERY_RESULTS: usize = 20;

#[derive(Debug, Deserialize)]
struct CreateObjectArgs {
    object_type_id: String,
    data: serde_json::Value,
    #[serde(default)]
    data_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FindObjectsArgs {
    object_type_id: String,
    #[serde(default)]
    limit: Option<usize>,
}

pub(crate) struct AnalysisToolbox<'a> {
    orchestrator: &'a BatchOrchestrator,
    run: &'a RunContext,
    source: RelatedRef,
    touched: Mutex<Vec<RelatedRef>>,
}

impl<'a> AnalysisToolbox<'a> {
    pub(crate) fn new(orchestrator: &'a BatchOrchestrator, run: &'a RunContext, source: RelatedRef) -> Self {
        Self {
            orchestrator,
            run,
            source,
            touched: Mutex::new(Vec::new()),
        }
    }

    /// Records created or updated through `create_object`.
    pub(crate) fn into_touched(self) -> Vec<RelatedRef> {
        self.touched.into_inner().unwrap_or_default()
    }

    fn derived_types(&self) -> Vec<&ObjectTypeDef> {
        self.run
            .catalog
            .object_types
            .iter()
            .filter(|t| t.category.is_derived())
            .collect()
    }

    async fn create_object(&self, args: CreateObjectArgs) -> Result<serde_json::Value> {
        if !self.derived_types().iter().any(|t| t.id == args.object_type_id) {
            bail!(
                "`{}` is not a signal or job type of this organisation",
                args.object_type_id
            );
        }

        let mut new_related_ids = RelatedIds::new();
        new_related_ids
            .entry(self.source.object_type_id.clone())
            .or_default()
            .insert(self.source.id);

        let hints = IngestHints {
            object_type_id: Some(args.object_type_id),
            data_description: args.data_description,
            new_related_ids,
            ..Default::default()
        };

        let result = self
            .orchestrator
            .ingest_nested(self.run, args.data, hints)
            .await
            .map_err(|e| anyhow!("nested ingest failed: {e}"))?;

        let record = result.record();
        let touched = RelatedRef::new(record.related_object_type_id.clone(), record.id);
        if let Ok(mut guard) = self.touched.lock() {
            guard.push(touched.clone());
        }

        info!(
            source_id = %self.source.id,
            object_id = %record.id,
            object_type_id = %record.related_object_type_id,
            "Analysis created object"
        );

        Ok(json!({
            TOUCHED_KEY: touched,
            "merged": matches!(result, ItemResult::Stored { merged: true, .. }),
            "metadata": metadata_to_json(&record.metadata),
        }))
    }

    async fn find_objects(&self, args: FindObjectsArgs) -> Result<serde_json::Value> {
        if self.run.catalog.object_type(&args.object_type_id).is_none() {
            bail!("unknown object type `{}`", args.object_type_id);
        }

        let limit = args.limit.unwrap_or(MAX_QUERY_RESULTS).min(MAX_QUERY_RESULTS);
        let query = ObjectQuery::in_scope(&self.run.organisation_id, &args.object_type_id).limit(limit);
        let records = self.orchestrator.store().query_objects(&query).await?;

        let objects: Vec<serde_json::Value> = records
            .iter()
            .map(|r| {
                json!({
                    "id": r.id,
                    "objectTypeId": r.related_object_type_id,
                    "metadata": metadata_to_json(&r.metadata),
                })
            })
            .collect();
        Ok(json!({ "objects": objects }))
    }
}

#[async_trait]
impl SessionTools for AnalysisToolbox<'_> {
    fn definitions(&self) -> Vec<ToolDefinition> {
        let all_types: Vec<&str> = self.run.catalog.object_types.iter().map(|t| t.id.as_str()).collect();
        let mut definitions = vec![ToolDefinition {
            name: "find_objects".into(),
            description: "List existing records of an object type visible to this organisation, most recently updated first.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "object_type_id": {"type": "string", "enum": all_types},
                    "limit": {"type": "integer", "minimum": 1, "maximum": MAX_QUERY_RESULTS}
                },
                "required": ["object_type_id"]
            }),
        }];

        let derived: Vec<&str> = self.derived_types().iter().map(|t| t.id.as_str()).collect();
        if !derived.is_empty() {
            definitions.push(ToolDefinition {
                name: "create_object".into(),
                description: "Create a signal or job record derived from the record under analysis. It is linked back to that record automatically.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "object_type_id": {"type": "string", "enum": derived},
                        "data": {"type": "object", "description": "Raw content of the new record"},
                        "data_description": {"type": "string", "description": "What the data represents"}
                    },
                    "required": ["object_type_id", "data"]
                }),
            });
        }
        definitions
    }

    async fn call(&self, name: &str, args: serde_json::Value) -> Result<serde_json::Value> {
        match name {
            "create_object" => self.create_object(serde_json::from_value(args)?).await,
            "find_objects" => self.find_objects(serde_json::from_value(args)?).await,
            other => Err(anyhow!("unknown tool `{other}`")),
        }
    }
}

/// Opening prompt of the analysis session for `record`.
pub(crate) fn analysis_prompt(record: &ObjectRecord, object_type: &ObjectTypeDef, run: &RunContext) -> String {
    let derived: Vec<String> = run
        .catalog
        .object_types
        .iter()
        .filter(|t| t.category.is_derived())
        .map(|t| format!("- {} ({}): {}", t.id, t.category.as_str(), t.description))
        .collect();

    format!(
        "A new `{type_name}` record was just stored for this organisation.\n\
         Type description: {type_description}\n\n\
         Record:\n{record}\n\n\
         Decide whether it warrants follow-up records. Available follow-up types:\n{derived}\n\n\
         Use find_objects to check what already exists before creating anything, and \
         create_object only for follow-ups that are clearly supported by the record. \
         Reply with a one-paragraph summary of what you did.",
        type_name = object_type.name,
        type_description = object_type.description,
        record = serde_json::to_string_pretty(&json!({
            "id": record.id,
            "objectTypeId": record.related_object_type_id,
            "metadata": metadata_to_json(&record.metadata),
        }))
        .unwrap_or_default(),
        derived = if derived.is_empty() { "(none)".to_string() } else { derived.join("\n") },
    )
}
