//! Per-item session context.
//!
//! A fresh [`IngestSession`] is created for every item and passed down the
//! pipeline by reference. Nothing about the item being processed is stored
//! on the orchestrator or its collaborators, so two batches for different
//! organisations can never see each other's state.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;

use tokio::time::Instant;
use uuid::Uuid;

use taxon_common::RelatedRef;

use crate::error::IngestError;

/// Pipeline stage of an item, used for deadline errors and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Queued,
    Classify,
    Extract,
    ResolveParent,
    CheckRelated,
    DedupSearch,
    Merge,
    Persist,
    Propagate,
    Analysis,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Queued => "queued",
            Self::Classify => "classify",
            Self::Extract => "extract",
            Self::ResolveParent => "resolve_parent",
            Self::CheckRelated => "check_related",
            Self::DedupSearch => "dedup_search",
            Self::Merge => "merge",
            Self::Persist => "persist",
            Self::Propagate => "propagate",
            Self::Analysis => "analysis",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct IngestSession {
    pub organisation_id: String,
    /// Only top-level items may start a post-store analysis pass.
    pub top_level: bool,
    pub object_type_id: Option<String>,
    pub parent_candidates: Vec<Uuid>,
    /// Records touched by oracle tool calls while processing this item.
    pub touched: BTreeSet<RelatedRef>,
    deadline: Option<Instant>,
}

impl IngestSession {
    pub fn new(organisation_id: impl Into<String>, top_level: bool, deadline: Option<Instant>) -> Self {
        Self {
            organisation_id: organisation_id.into(),
            top_level,
            object_type_id: None,
            parent_candidates: Vec::new(),
            touched: BTreeSet::new(),
            deadline,
        }
    }

    pub fn touch(&mut self, reference: RelatedRef) {
        self.touched.insert(reference);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Run a cancellable oracle/storage round-trip under the batch deadline.
    pub async fn bounded<F: Future>(&self, stage: Stage, fut: F) -> Result<F::Output, IngestError> {
        within(self.deadline, stage, fut).await
    }
}

/// Like [`IngestSession::bounded`], for futures that need the session mutably.
pub async fn within<F: Future>(
    deadline: Option<Instant>,
    stage: Stage,
    fut: F,
) -> Result<F::Output, IngestError> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| IngestError::Cancelled(stage)),
        None => Ok(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn bounded_passes_through_without_deadline() {
        let session = IngestSession::new("org1", true, None);
        let value = session.bounded(Stage::Extract, async { 7 }).await.unwrap();
        assert_eq!(value, 7);
        assert!(!session.expired());
    }

    #[tokio::test]
    async fn bounded_cancels_after_deadline() {
        let session = IngestSession::new("org1", true, Some(Instant::now() + Duration::from_millis(10)));
        let result = session
            .bounded(Stage::Classify, tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert!(matches!(result, Err(IngestError::Cancelled(Stage::Classify))));
        assert!(session.expired());
    }
}
