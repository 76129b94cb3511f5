use std::cmp::Ordering;

use tracing::debug;

use taxon_common::ObjectRecord;

use crate::error::IngestError;
use crate::session::IngestSession;
use crate::traits::{ObjectStore, SimilarObject, SimilarityQuery};

/// Find the existing record `candidate` should be merged into, if any.
///
/// Searches the session's organisation for records of the same type and
/// keeps at most one match at or above `threshold`.
pub async fn find_merge_target(
    store: &dyn ObjectStore,
    session: &IngestSession,
    candidate: &ObjectRecord,
    threshold: f64,
    top_k: usize,
) -> Result<Option<SimilarObject>, IngestError> {
    let query = SimilarityQuery {
        text: candidate.search_text(),
        organisation_id: session.organisation_id.clone(),
        object_type_id: candidate.related_object_type_id.clone(),
        threshold,
        top_k,
    };

    let matches = store
        .similarity_search(&query)
        .await
        .map_err(IngestError::storage)?;
    debug!(count = matches.len(), threshold, "Similarity search returned");

    Ok(pick_best(matches, threshold, &candidate.related_object_type_id))
}

/// Highest similarity wins; ties go to the most recently updated record,
/// then to the lowest id so the choice is stable.
pub fn pick_best(
    matches: Vec<SimilarObject>,
    threshold: f64,
    object_type_id: &str,
) -> Option<SimilarObject> {
    matches
        .into_iter()
        .filter(|m| m.similarity >= threshold)
        .filter(|m| m.record.related_object_type_id == object_type_id)
        .max_by(|a, b| {
            a.similarity
                .partial_cmp(&b.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.record.updated_at.cmp(&b.record.updated_at))
                .then_with(|| b.record.id.cmp(&a.record.id))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{record, sample_catalog, MockObjectStore};
    use chrono::Duration;
    use serde_json::json;

    fn similar(similarity: f64, type_id: &str) -> SimilarObject {
        SimilarObject {
            record: record("org1", type_id, json!({"title": "x"})),
            similarity,
        }
    }

    #[test]
    fn below_threshold_is_ignored() {
        assert!(pick_best(vec![similar(0.5, "feedback")], 0.8, "feedback").is_none());
    }

    #[test]
    fn other_types_are_never_merge_targets() {
        assert!(pick_best(vec![similar(0.99, "product")], 0.8, "feedback").is_none());
    }

    #[test]
    fn highest_similarity_wins() {
        let best = similar(0.95, "feedback");
        let picked = pick_best(
            vec![similar(0.9, "feedback"), best.clone(), similar(0.85, "feedback")],
            0.8,
            "feedback",
        )
        .unwrap();
        assert_eq!(picked.record.id, best.record.id);
    }

    #[test]
    fn ties_go_to_most_recently_updated() {
        let older = similar(0.9, "feedback");
        let mut newer = similar(0.9, "feedback");
        newer.record.updated_at = older.record.updated_at + Duration::seconds(5);

        let picked = pick_best(vec![older, newer.clone()], 0.8, "feedback").unwrap();
        assert_eq!(picked.record.id, newer.record.id);
    }

    #[test]
    fn full_ties_go_to_lowest_id() {
        let a = similar(0.9, "feedback");
        let mut b = similar(0.9, "feedback");
        b.record.updated_at = a.record.updated_at;

        let expected = a.record.id.min(b.record.id);
        let picked = pick_best(vec![a, b], 0.8, "feedback").unwrap();
        assert_eq!(picked.record.id, expected);
    }

    #[tokio::test]
    async fn search_is_scoped_to_organisation_and_type() {
        let own = record("org1", "feedback", json!({"title": "Login fails on Safari"}));
        let foreign = record("org2", "feedback", json!({"title": "Login fails on Safari"}));
        let store = MockObjectStore::new(sample_catalog())
            .with_object(own.clone())
            .with_object(foreign);

        let session = IngestSession::new("org1", true, None);
        let candidate = record("org1", "feedback", json!({"title": "Login fails on Safari"}));

        let found = find_merge_target(&store, &session, &candidate, 0.5, 5)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.record.id, own.id);
    }
}
