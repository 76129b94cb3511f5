use std::collections::BTreeSet;

use tracing::warn;

use taxon_common::{ObjectPatch, ObjectRecord, RelatedIds, RelatedRef};

use crate::request::ItemWarning;
use crate::traits::ObjectStore;

/// Caller hints ∪ resolved parent ∪ records touched during the session,
/// without the record itself.
pub fn combined_related_ids(
    hints: &RelatedIds,
    parent: Option<&RelatedRef>,
    touched: &BTreeSet<RelatedRef>,
    self_id: uuid::Uuid,
) -> RelatedIds {
    let mut combined = hints.clone();
    for r in parent.into_iter().chain(touched.iter()) {
        combined.entry(r.object_type_id.clone()).or_default().insert(r.id);
    }
    for ids in combined.values_mut() {
        ids.remove(&self_id);
    }
    combined.retain(|_, ids| !ids.is_empty());
    combined
}

/// Caller-supplied related ids that name an existing record of the stated
/// type visible to `organisation_id`. Every other id is dropped with a
/// warning, so no edge is ever written into another organisation's records.
pub async fn visible_related_ids(
    store: &dyn ObjectStore,
    organisation_id: &str,
    hints: &RelatedIds,
) -> anyhow::Result<(RelatedIds, Vec<ItemWarning>)> {
    let mut kept = RelatedIds::new();
    let mut warnings = Vec::new();

    for (object_type_id, ids) in hints {
        for &id in ids {
            let rejection = match store.get_object(id).await? {
                None => Some("record not found".to_string()),
                Some(peer) if !peer.visible_to(organisation_id) => {
                    Some("record is not visible to this organisation".to_string())
                }
                Some(peer) if &peer.related_object_type_id != object_type_id => Some(format!(
                    "record is a `{}`, not a `{object_type_id}`",
                    peer.related_object_type_id
                )),
                Some(_) => None,
            };

            match rejection {
                None => {
                    kept.entry(object_type_id.clone()).or_default().insert(id);
                }
                Some(reason) => {
                    warn!(peer_id = %id, peer_type = %object_type_id, reason = %reason, "Dropping related id");
                    warnings.push(ItemWarning::RelatedIdRejected {
                        peer: RelatedRef::new(object_type_id.clone(), id),
                        reason,
                    });
                }
            }
        }
    }

    Ok((kept, warnings))
}

/// Add a back-edge to `record` on every peer in `peers`.
///
/// Not transactional: every peer is attempted, and a failed peer becomes a
/// warning on the item rather than an error.
pub async fn propagate(
    store: &dyn ObjectStore,
    record: &ObjectRecord,
    peers: &[RelatedRef],
) -> Vec<ItemWarning> {
    let mut warnings = Vec::new();

    for peer in peers.iter().filter(|p| p.id != record.id) {
        let patch = ObjectPatch::related_edge(record.related_object_type_id.clone(), record.id);
        if let Err(e) = store.upsert_object(peer.id, patch, true).await {
            warn!(
                record_id = %record.id,
                peer_id = %peer.id,
                peer_type = %peer.object_type_id,
                error = %e,
                "Relationship propagation failed"
            );
            warnings.push(ItemWarning::Propagation {
                peer: peer.clone(),
                error: format!("{e:#}"),
            });
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{record, sample_catalog, MockObjectStore};
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn combined_ids_union_all_sources_and_exclude_self() {
        let self_id = Uuid::new_v4();
        let hinted = Uuid::new_v4();
        let parent = RelatedRef::new("product", Uuid::new_v4());
        let touched_ref = RelatedRef::new("signal", Uuid::new_v4());

        let mut hints = RelatedIds::new();
        hints.entry("message".into()).or_default().extend([hinted, self_id]);
        let touched = BTreeSet::from([touched_ref.clone()]);

        let combined = combined_related_ids(&hints, Some(&parent), &touched, self_id);

        assert_eq!(combined["message"], BTreeSet::from([hinted]));
        assert_eq!(combined["product"], BTreeSet::from([parent.id]));
        assert_eq!(combined["signal"], BTreeSet::from([touched_ref.id]));
    }

    #[tokio::test]
    async fn foreign_missing_and_mistyped_hints_are_dropped() {
        let own = record("org1", "product", json!({"product_name": "Widget"}));
        let global = ObjectRecord::new(None, "product", Default::default());
        let foreign = record("org2", "product", json!({"product_name": "Gadget"}));
        let mistyped = record("org1", "message", json!({"body": "hi"}));
        let missing = Uuid::new_v4();
        let store = MockObjectStore::new(sample_catalog())
            .with_object(own.clone())
            .with_object(global.clone())
            .with_object(foreign.clone())
            .with_object(mistyped.clone());

        let mut hints = RelatedIds::new();
        hints
            .entry("product".into())
            .or_default()
            .extend([own.id, global.id, foreign.id, mistyped.id, missing]);

        let (kept, warnings) = visible_related_ids(&store, "org1", &hints).await.unwrap();

        assert_eq!(kept["product"], BTreeSet::from([own.id, global.id]));
        let rejected: BTreeSet<Uuid> = warnings
            .iter()
            .map(|w| match w {
                ItemWarning::RelatedIdRejected { peer, .. } => peer.id,
                other => panic!("unexpected warning {other:?}"),
            })
            .collect();
        assert_eq!(rejected, BTreeSet::from([foreign.id, mistyped.id, missing]));
    }

    #[tokio::test]
    async fn peers_receive_back_edges() {
        let product = record("org1", "product", json!({"product_name": "Widget"}));
        let store = MockObjectStore::new(sample_catalog()).with_object(product.clone());

        let mut feedback = record("org1", "feedback", json!({"title": "x"}));
        feedback.add_related("product", product.id);

        let warnings = propagate(&store, &feedback, &feedback.related_refs()).await;

        assert!(warnings.is_empty());
        assert!(store.object(product.id).unwrap().references("feedback", feedback.id));
    }

    #[tokio::test]
    async fn peer_failure_is_a_warning() {
        let good = record("org1", "product", json!({"product_name": "Widget"}));
        let bad = record("org1", "product", json!({"product_name": "Gadget"}));
        let store = MockObjectStore::new(sample_catalog())
            .with_object(good.clone())
            .with_object(bad.clone())
            .failing_upserts_for(bad.id);

        let mut feedback = record("org1", "feedback", json!({"title": "x"}));
        feedback.add_related("product", good.id);
        feedback.add_related("product", bad.id);

        let warnings = propagate(&store, &feedback, &feedback.related_refs()).await;

        assert_eq!(warnings.len(), 1);
        assert!(matches!(&warnings[0], ItemWarning::Propagation { peer, .. } if peer.id == bad.id));
        assert!(store.object(good.id).unwrap().references("feedback", feedback.id));
    }
}
