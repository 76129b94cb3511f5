//! Scenario tests: whole ingest calls through the public API, against the
//! in-memory mocks from `taxon_ingest::testing`.
//!
//! Each test follows MOCK → FUNCTION → OUTPUT.

use std::sync::Arc;

use serde_json::json;

use taxon_common::{merge_metadata, metadata_from_json, Metadata};
use taxon_ingest::classifier::classify;
use taxon_ingest::testing::*;
use taxon_ingest::{CompiledSchema, IngestError, IngestHints, IngestRequest, ItemOutcome};

fn store() -> Arc<MockObjectStore> {
    Arc::new(MockObjectStore::new(sample_catalog()).with_connection("conn-1", "org1"))
}

fn metadata(value: serde_json::Value) -> Metadata {
    metadata_from_json(value).unwrap()
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hinted_type_never_reaches_the_oracle() {
    let oracle = MockOracle::new().classify_as("product");
    let schema = CompiledSchema::compile(&sample_catalog());

    for payload in [
        json!({"title": "Login fails"}),
        json!("plain text"),
        json!(null),
        json!({"product_name": "Widget"}),
    ] {
        let object_type = classify(&oracle, &schema, &payload, Some("feedback"))
            .await
            .unwrap();
        assert_eq!(object_type, "feedback");
    }

    assert_eq!(oracle.classify_calls(), 0);
}

#[tokio::test]
async fn answers_outside_the_candidates_are_rejected() {
    let schema = CompiledSchema::compile(&sample_catalog());

    // signal is in the catalog but is never a classification candidate.
    for answer in ["invoice", "signal", ""] {
        let oracle = MockOracle::new().classify_as(answer);
        let err = classify(&oracle, &schema, &json!({"x": 1}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Classification(_)), "{answer}: {err}");
    }
}

// ---------------------------------------------------------------------------
// Structural merge
// ---------------------------------------------------------------------------

#[test]
fn structural_merge_is_idempotent() {
    for value in [
        json!({}),
        json!({"title": "Login fails", "severity": "high"}),
        json!({"tags": ["a", "b"], "count": 3, "flag": false}),
        json!({"nested": {"inner": ["x"], "note": null}, "ratio": 0.5}),
    ] {
        let x = metadata(value);
        assert_eq!(merge_metadata(&x, &x), x);
    }
}

#[test]
fn structural_merge_unions_arrays() {
    let merged = merge_metadata(
        &metadata(json!({"tags": ["a", "b"]})),
        &metadata(json!({"tags": ["b", "c"]})),
    );
    assert_eq!(merged, metadata(json!({"tags": ["a", "b", "c"]})));
}

// ---------------------------------------------------------------------------
// Whole batches
// ---------------------------------------------------------------------------

#[tokio::test]
async fn feedback_dry_run_end_to_end() {
    let oracle = Arc::new(MockOracle::new());
    let store = store();

    let request = IngestRequest::builder()
        .connection_id("conn-1")
        .organisation_id("org1")
        .dry_run(true)
        .payload(json!({"title": "Login fails", "severity": "high"}))
        .hints(IngestHints::builder().object_type_id("feedback").build())
        .build();

    let response = orchestrator(&oracle, &store).ingest(request).await;

    let previews = response.data.unwrap();
    assert_eq!(previews.len(), 1);
    assert_eq!(previews[0].related_object_type_id, "feedback");
    assert!(previews[0].parent_id.is_none());
    assert!(previews[0].metadata.contains_key("title"));
    assert!(previews[0].metadata.contains_key("severity"));
    assert!(!previews[0].metadata.contains_key("internal_score"));
    assert!(!previews[0].metadata.contains_key("private_note"));
}

#[tokio::test]
async fn dry_run_writes_nothing_and_previews_every_item() {
    let oracle = Arc::new(MockOracle::new());
    let store = store();

    let request = IngestRequest::builder()
        .connection_id("conn-1")
        .dry_run(true)
        .payload(json!([{"title": "A"}, {"title": "B"}, [{"title": "C"}, {"title": "D"}]]))
        .hints(IngestHints::builder().object_type_id("feedback").build())
        .build();
    let items = request.items().len();

    let response = orchestrator(&oracle, &store).ingest(request).await;

    assert_eq!(items, 4);
    assert_eq!(response.data.unwrap().len(), items);
    assert_eq!(store.upsert_calls(), 0);
    assert!(store.is_empty());
}

#[tokio::test]
async fn dedup_merges_into_the_existing_record() {
    let existing = record("org1", "feedback", json!({"title": "Export is slow", "tags": ["export"]}));
    let oracle = Arc::new(MockOracle::new());
    let store = Arc::new(
        MockObjectStore::new(sample_catalog())
            .with_connection("conn-1", "org1")
            .with_object(existing.clone())
            .with_similarity(existing.id, 0.95),
    );

    let request = IngestRequest::builder()
        .connection_id("conn-1")
        .payload(json!({"title": "Export is very slow", "severity": "medium"}))
        .hints(
            IngestHints::builder()
                .object_type_id("feedback")
                .required_match_threshold(0.9)
                .build(),
        )
        .build();

    let response = orchestrator(&oracle, &store).ingest(request).await;

    assert!(response.is_success(), "{}", response.message);
    assert_eq!(store.objects_of_type("feedback").len(), 1);

    let merged = store.object(existing.id).unwrap();
    assert_eq!(merged.metadata["title"].as_str(), Some("Export is very slow"));
    assert_eq!(merged.metadata["severity"].as_str(), Some("medium"));
    assert_ne!(merged.metadata, existing.metadata);
}

#[tokio::test]
async fn one_failing_item_leaves_the_other_stored() {
    let oracle = Arc::new(MockOracle::new().failing_extract_on("boom"));
    let store = store();

    let request = IngestRequest::builder()
        .connection_id("conn-1")
        .payload(json!([{"title": "boom"}, {"title": "Checkout works again"}]))
        .hints(IngestHints::builder().object_type_id("feedback").build())
        .build();

    let response = orchestrator(&oracle, &store).ingest(request).await;

    assert!(!response.is_success());
    assert_eq!(response.failures().len(), 1);
    assert_eq!(response.failures()[0].index(), 0);
    assert_eq!(response.stored_ids().len(), 1);
    assert_eq!(store.len(), 1);
    assert!(matches!(&response.outcomes[1], ItemOutcome::Stored { merged: false, .. }));
}

#[tokio::test]
async fn propagated_relations_are_symmetric() {
    let product = record("org1", "product", json!({"product_name": "Widget"}));
    let other = record("org1", "feedback", json!({"title": "Widget rattles"}));
    let oracle = Arc::new(
        MockOracle::new()
            .pick_match(product.id)
            .session_creates("signal", json!({"signal_summary": "Widget demand"})),
    );
    let store = Arc::new(
        MockObjectStore::new(sample_catalog())
            .with_connection("conn-1", "org1")
            .with_object(product.clone())
            .with_object(other.clone()),
    );

    let request = IngestRequest::builder()
        .connection_id("conn-1")
        .payload(json!({"summary": "Widget in blue"}))
        .hints(
            IngestHints::builder()
                .object_type_id("feature_request")
                .new_related_ids(related("feedback", other.id))
                .build(),
        )
        .build();

    let response = orchestrator(&oracle, &store).ingest(request).await;
    let id = response.stored_ids()[0];

    let stored = store.object(id).unwrap();
    assert!(stored.references("product", product.id));
    assert!(stored.references("feedback", other.id));
    assert_eq!(store.objects_of_type("signal").len(), 1);
    assert!(store.relationships_are_symmetric());
}
