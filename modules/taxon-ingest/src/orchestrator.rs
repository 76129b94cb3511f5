//! Batch orchestrator: runs every item of an ingest call through
//! classify → extract → resolve parent → dedup → merge or create → persist →
//! propagate → post-store analysis.
//!
//! Items run strictly in order. A failed item is recorded and the loop moves
//! on; nothing already persisted is rolled back.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use taxon_common::{IngestConfig, ObjectPatch, ObjectRecord, ObjectTypeDef, RelatedRef, SchemaCatalog};

use crate::analysis::{analysis_prompt, AnalysisToolbox};
use crate::classifier::classify;
use crate::dedup::find_merge_target;
use crate::error::IngestError;
use crate::extractor::extract;
use crate::merger::{merged_record, semantic_merge};
use crate::parent::{check_explicit_parent, resolve_parent, ParentResolution};
use crate::propagator::{combined_related_ids, propagate, visible_related_ids};
use crate::request::{
    IngestHints, IngestRequest, IngestResponse, ItemOutcome, ItemWarning, STATUS_FAILED, STATUS_OK,
};
use crate::schema::CompiledSchema;
use crate::session::{within, IngestSession, Stage};
use crate::traits::{ObjectStore, Oracle};

/// Everything resolved once per call and shared by its items.
pub(crate) struct RunContext {
    pub(crate) organisation_id: String,
    pub(crate) catalog: SchemaCatalog,
    pub(crate) schema: CompiledSchema,
    pub(crate) dry_run: bool,
    pub(crate) deadline: Option<Instant>,
}

pub(crate) enum ItemResult {
    Stored {
        record: ObjectRecord,
        merged: bool,
        warnings: Vec<ItemWarning>,
    },
    Previewed {
        record: ObjectRecord,
        warnings: Vec<ItemWarning>,
    },
}

impl ItemResult {
    pub(crate) fn record(&self) -> &ObjectRecord {
        match self {
            Self::Stored { record, .. } | Self::Previewed { record, .. } => record,
        }
    }
}

pub struct BatchOrchestrator {
    oracle: Arc<dyn Oracle>,
    store: Arc<dyn ObjectStore>,
    config: IngestConfig,
}

impl BatchOrchestrator {
    pub fn new(oracle: Arc<dyn Oracle>, store: Arc<dyn ObjectStore>, config: IngestConfig) -> Self {
        Self {
            oracle,
            store,
            config,
        }
    }

    pub(crate) fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    /// Run one ingest call. Errors raised before the item loop become a
    /// failure response with no outcomes.
    pub async fn ingest(&self, request: IngestRequest) -> IngestResponse {
        match self.try_ingest(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Ingest aborted before processing items");
                IngestResponse::fatal(e.to_string())
            }
        }
    }

    /// Like [`ingest`](Self::ingest), but fatal errors are returned typed.
    pub async fn try_ingest(&self, request: IngestRequest) -> Result<IngestResponse, IngestError> {
        let deadline = self
            .config
            .batch_deadline_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        let run = self.prepare(&request, deadline).await?;
        let items = request.items();

        info!(
            organisation_id = %run.organisation_id,
            connection_id = %request.connection_id,
            items = items.len(),
            dry_run = run.dry_run,
            "Starting ingest run"
        );

        let mut outcomes = Vec::with_capacity(items.len());
        let mut previews = Vec::new();
        let mut failures = Vec::new();

        for (index, item) in items.iter().enumerate() {
            match self.ingest_item(&run, item, &request.hints, true).await {
                Ok(ItemResult::Stored {
                    record,
                    merged,
                    warnings,
                }) => outcomes.push(ItemOutcome::Stored {
                    index,
                    id: record.id,
                    object_type_id: record.related_object_type_id,
                    merged,
                    warnings,
                }),
                Ok(ItemResult::Previewed { record, warnings }) => {
                    previews.push(record.clone());
                    outcomes.push(ItemOutcome::Previewed {
                        index,
                        record,
                        warnings,
                    });
                }
                Err(e) => {
                    warn!(index, error = %e, "Item failed");
                    failures.push(format!("item {index}: {e}"));
                    outcomes.push(ItemOutcome::Failed {
                        index,
                        error: e.to_string(),
                    });
                }
            }
        }

        let total = items.len();
        info!(
            organisation_id = %run.organisation_id,
            total,
            failed = failures.len(),
            previewed = previews.len(),
            "Ingest run complete"
        );

        let (status, message) = if failures.is_empty() {
            let message = if run.dry_run {
                format!("Previewed {total} item(s)")
            } else {
                format!("Ingested {total} item(s)")
            };
            (STATUS_OK, message)
        } else {
            let message = IngestError::PartialBatchFailure { total, failures }.to_string();
            (STATUS_FAILED, message)
        };

        Ok(IngestResponse {
            status,
            message,
            data: run.dry_run.then_some(previews),
            outcomes,
        })
    }

    async fn prepare(
        &self,
        request: &IngestRequest,
        deadline: Option<Instant>,
    ) -> Result<RunContext, IngestError> {
        let organisation_id = match &request.organisation_id {
            Some(org) => org.clone(),
            None => self
                .store
                .organisation_for_connection(&request.connection_id)
                .await
                .map_err(|e| IngestError::OrganisationResolution(format!("{e:#}")))?
                .ok_or_else(|| {
                    IngestError::OrganisationResolution(format!(
                        "no organisation owns connection `{}`",
                        request.connection_id
                    ))
                })?,
        };

        let catalog = self
            .store
            .load_catalog(&organisation_id)
            .await
            .map_err(|e| IngestError::Catalog(format!("{e:#}")))?
            .scoped_to(&organisation_id);

        if catalog.object_types.is_empty() {
            return Err(IngestError::Catalog(format!(
                "no object types configured for organisation `{organisation_id}`"
            )));
        }

        let schema = CompiledSchema::compile(&catalog);
        if !schema.unresolved_fields.is_empty() {
            warn!(
                fields = ?schema.unresolved_fields,
                "Skipping fields with unknown field types"
            );
        }

        Ok(RunContext {
            organisation_id,
            catalog,
            schema,
            dry_run: request.dry_run,
            deadline,
        })
    }

    /// Boxed entry for ingests started from inside an analysis session.
    pub(crate) fn ingest_nested<'a>(
        &'a self,
        run: &'a RunContext,
        item: serde_json::Value,
        hints: IngestHints,
    ) -> BoxFuture<'a, Result<ItemResult, IngestError>> {
        Box::pin(async move { self.ingest_item(run, &item, &hints, false).await })
    }

    async fn ingest_item(
        &self,
        run: &RunContext,
        item: &serde_json::Value,
        hints: &IngestHints,
        top_level: bool,
    ) -> Result<ItemResult, IngestError> {
        let mut session = IngestSession::new(run.organisation_id.clone(), top_level, run.deadline);
        if session.expired() {
            return Err(IngestError::Cancelled(Stage::Queued));
        }
        let oracle = self.oracle.as_ref();
        let store = self.store.as_ref();

        let type_id = session
            .bounded(
                Stage::Classify,
                classify(oracle, &run.schema, item, hints.object_type_id.as_deref()),
            )
            .await??;
        session.object_type_id = Some(type_id.clone());

        let (Some(type_def), Some(extraction_schema)) = (
            run.catalog.object_type(&type_id),
            run.schema.extraction_schema(&type_id),
        ) else {
            return Err(IngestError::Classification(format!(
                "object type `{type_id}` has no compiled schema"
            )));
        };

        debug!(object_type_id = %type_id, stage = %Stage::Extract, "Extracting");
        let metadata = session
            .bounded(
                Stage::Extract,
                extract(oracle, extraction_schema, item, hints.data_description.as_deref()),
            )
            .await??;

        let mut candidate = ObjectRecord::new(Some(run.organisation_id.clone()), type_id.clone(), metadata);
        let mut warnings = Vec::new();

        let resolution = match (hints.parent_object_id, type_def.parent_object_type_id.as_deref()) {
            (Some(parent_id), expected) => Some(
                session
                    .bounded(
                        Stage::ResolveParent,
                        check_explicit_parent(store, &session, parent_id, expected),
                    )
                    .await??,
            ),
            (None, Some(parent_type)) => {
                let deadline = session.deadline();
                Some(
                    within(
                        deadline,
                        Stage::ResolveParent,
                        resolve_parent(
                            oracle,
                            store,
                            &mut session,
                            parent_type,
                            &candidate,
                            self.config.parent_candidate_limit,
                        ),
                    )
                    .await??,
                )
            }
            (None, None) => None,
        };

        let parent = match resolution {
            Some(ParentResolution::Resolved(parent)) => {
                candidate.parent_id = Some(parent.id);
                Some(parent)
            }
            Some(ParentResolution::Declined(reason)) => {
                let err = IngestError::ParentResolution(
                    reason.unwrap_or_else(|| "oracle found no matching parent".to_string()),
                );
                warn!(object_type_id = %type_id, error = %err, "Continuing without parent");
                warnings.extend(err.into_warning().ok());
                None
            }
            Some(ParentResolution::NoCandidates) | None => None,
        };

        let (hinted, rejected) = session
            .bounded(
                Stage::CheckRelated,
                visible_related_ids(store, &session.organisation_id, &hints.new_related_ids),
            )
            .await?
            .map_err(IngestError::storage)?;
        warnings.extend(rejected);

        let target = match hints.required_match_threshold {
            Some(threshold) => {
                session
                    .bounded(
                        Stage::DedupSearch,
                        find_merge_target(store, &session, &candidate, threshold, self.config.dedup_top_k),
                    )
                    .await??
            }
            None => None,
        };

        let (record, merged) = match target {
            Some(found) => {
                debug!(
                    existing_id = %found.record.id,
                    similarity = found.similarity,
                    stage = %Stage::Merge,
                    "Merging into existing record"
                );
                let metadata = session
                    .bounded(
                        Stage::Merge,
                        semantic_merge(oracle, extraction_schema, &found.record.metadata, &candidate.metadata),
                    )
                    .await??;
                let related = combined_related_ids(
                    &hinted,
                    parent.as_ref(),
                    &session.touched,
                    found.record.id,
                );
                (
                    merged_record(&found.record, metadata, extraction_schema, candidate.parent_id, &related),
                    true,
                )
            }
            None => {
                candidate.related_ids = combined_related_ids(
                    &hinted,
                    parent.as_ref(),
                    &session.touched,
                    candidate.id,
                );
                (candidate, false)
            }
        };

        if run.dry_run {
            return Ok(ItemResult::Previewed { record, warnings });
        }

        // From here on the item runs to completion regardless of the deadline.
        debug!(object_id = %record.id, merged, stage = %Stage::Persist, "Persisting");
        store
            .upsert_object(record.id, ObjectPatch::from(&record), false)
            .await
            .map_err(IngestError::storage)?;

        debug!(object_id = %record.id, stage = %Stage::Propagate, "Propagating");
        warnings.extend(propagate(store, &record, &record.related_refs()).await);

        if top_level && type_def.triggers_analysis() {
            warnings.extend(self.analyse(run, &mut session, &record, type_def).await);
        }

        info!(
            object_id = %record.id,
            object_type_id = %record.related_object_type_id,
            merged,
            warnings = warnings.len(),
            "Stored object"
        );
        Ok(ItemResult::Stored {
            record,
            merged,
            warnings,
        })
    }

    /// Run the analysis session for a stored record and link everything it
    /// touched back to the record.
    ///
    /// The deadline reaches only the oracle's round-trips. Records created
    /// before a failed or cancelled session are still linked.
    async fn analyse(
        &self,
        run: &RunContext,
        session: &mut IngestSession,
        record: &ObjectRecord,
        type_def: &ObjectTypeDef,
    ) -> Vec<ItemWarning> {
        let source = RelatedRef::new(record.related_object_type_id.clone(), record.id);
        let toolbox = AnalysisToolbox::new(self, run, source);
        let prompt = analysis_prompt(record, type_def, run);
        let mut warnings = Vec::new();

        let outcome = self
            .oracle
            .run_session(&prompt, &toolbox, session.deadline())
            .await;
        let mut touched = toolbox.into_touched();
        match outcome {
            Ok(outcome) => {
                debug!(object_id = %record.id, summary = %outcome.summary, "Analysis session finished");
                touched.extend(outcome.touched);
            }
            Err(e) => {
                warn!(object_id = %record.id, error = %e, "Post-store analysis failed");
                warnings.push(ItemWarning::Analysis {
                    error: format!("{e:#}"),
                });
            }
        }

        for reference in touched {
            if reference.id != record.id {
                session.touch(reference);
            }
        }

        let new_edges: Vec<RelatedRef> = session
            .touched
            .iter()
            .filter(|r| !record.references(&r.object_type_id, r.id))
            .cloned()
            .collect();
        if new_edges.is_empty() {
            return warnings;
        }

        let mut patch = ObjectPatch::default();
        for edge in &new_edges {
            patch
                .related_ids
                .entry(edge.object_type_id.clone())
                .or_default()
                .insert(edge.id);
        }

        match self.store.upsert_object(record.id, patch, true).await {
            Ok(_) => warnings.extend(propagate(self.store.as_ref(), record, &new_edges).await),
            Err(e) => {
                warn!(object_id = %record.id, error = %e, "Failed to link analysis results");
                warnings.push(ItemWarning::Analysis {
                    error: format!("linking analysis results failed: {e:#}"),
                });
            }
        }
        warnings
    }
}
