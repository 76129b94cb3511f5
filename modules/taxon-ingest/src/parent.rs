//! Parent resolution for types that declare a parent object type.

use tracing::{debug, info};
use uuid::Uuid;

use taxon_common::{ObjectRecord, RelatedRef};

use crate::error::IngestError;
use crate::session::IngestSession;
use crate::traits::{ObjectQuery, ObjectStore, Oracle};

#[derive(Debug, Clone, PartialEq)]
pub enum ParentResolution {
    Resolved(RelatedRef),
    /// No in-scope record of the parent type exists.
    NoCandidates,
    /// Oracle declined, errored, or named something that is not a candidate.
    Declined(Option<String>),
}

/// Ask the oracle to pick a parent for `candidate` among in-scope records of
/// `parent_type_id`.
///
/// Storage failures abort the item; oracle failures only leave the parent unset.
pub async fn resolve_parent(
    oracle: &dyn Oracle,
    store: &dyn ObjectStore,
    session: &mut IngestSession,
    parent_type_id: &str,
    candidate: &ObjectRecord,
    limit: usize,
) -> Result<ParentResolution, IngestError> {
    let query = ObjectQuery::in_scope(&session.organisation_id, parent_type_id).limit(limit);
    let candidates = store
        .query_objects(&query)
        .await
        .map_err(IngestError::storage)?;

    if candidates.is_empty() {
        info!(
            parent_type_id,
            organisation_id = %session.organisation_id,
            "No parent candidates in scope, leaving parent unset"
        );
        return Ok(ParentResolution::NoCandidates);
    }

    session.parent_candidates = candidates.iter().map(|c| c.id).collect();
    debug!(parent_type_id, count = candidates.len(), "Resolving parent");

    let target = match_target(candidate);
    match oracle.resolve_best_match(&candidates, &target).await {
        Ok(Some(id)) if session.parent_candidates.contains(&id) => {
            Ok(ParentResolution::Resolved(RelatedRef::new(parent_type_id, id)))
        }
        Ok(Some(id)) => Ok(ParentResolution::Declined(Some(format!(
            "oracle picked {id}, which is not a candidate"
        )))),
        Ok(None) => Ok(ParentResolution::Declined(None)),
        Err(e) => Ok(ParentResolution::Declined(Some(format!("{e:#}")))),
    }
}

/// Validate a caller-supplied parent id: it must exist, be visible to the
/// organisation and, when the type declares one, be of the parent type.
pub async fn check_explicit_parent(
    store: &dyn ObjectStore,
    session: &IngestSession,
    parent_id: Uuid,
    expected_type: Option<&str>,
) -> Result<ParentResolution, IngestError> {
    let Some(parent) = store.get_object(parent_id).await.map_err(IngestError::storage)? else {
        return Ok(ParentResolution::Declined(Some(format!(
            "parent {parent_id} does not exist"
        ))));
    };

    if !parent.visible_to(&session.organisation_id) {
        return Ok(ParentResolution::Declined(Some(format!(
            "parent {parent_id} belongs to another organisation"
        ))));
    }

    if let Some(expected) = expected_type {
        if parent.related_object_type_id != expected {
            return Ok(ParentResolution::Declined(Some(format!(
                "parent {parent_id} is a `{}`, expected `{expected}`",
                parent.related_object_type_id
            ))));
        }
    }

    Ok(ParentResolution::Resolved(RelatedRef::new(
        parent.related_object_type_id,
        parent.id,
    )))
}

/// The new record as shown to the oracle, without identity or ownership.
pub(crate) fn match_target(candidate: &ObjectRecord) -> serde_json::Value {
    let mut target = serde_json::to_value(candidate).unwrap_or_default();
    if let Some(map) = target.as_object_mut() {
        map.remove("id");
        map.remove("ownerOrganisationId");
    }
    target
}
