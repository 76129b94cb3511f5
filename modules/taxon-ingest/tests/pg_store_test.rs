//! Integration test: PgObjectStore against a real Postgres with pgvector.
//!
//! Requirements:
//!   - DATABASE_URL env var (Postgres with the `vector` extension available)
//!
//! Skips when the database is not reachable.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use taxon_common::{metadata_from_json, ObjectPatch, ObjectRecord, UpsertStatus};
use taxon_ingest::traits::{ObjectQuery, SimilarityQuery};
use taxon_ingest::{ObjectStore, PgObjectStore, TextEmbedder};

/// Same vector for every text, so every embedded record is a perfect match.
struct ConstantEmbedder;

#[async_trait]
impl TextEmbedder for ConstantEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![0.5; 1536])
    }
}

async fn try_store() -> Option<(PgPool, PgObjectStore)> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;
    let store = PgObjectStore::new(pool.clone()).with_embedder(Arc::new(ConstantEmbedder));
    if let Err(e) = store.migrate().await {
        eprintln!("Skipping: migrations failed: {e:#}");
        return None;
    }
    Some((pool, store))
}

/// Seed a connection and a one-field object type unique to this test run.
async fn seed_catalog(pool: &PgPool, suffix: &str) -> (String, String, String) {
    let org = format!("org_{suffix}");
    let connection = format!("conn_{suffix}");
    let object_type = format!("feedback_{suffix}");

    sqlx::query("INSERT INTO connections (id, organisation_id) VALUES ($1, $2)")
        .bind(&connection)
        .bind(&org)
        .execute(pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO object_types (id, name, category, owner_organisation_id) VALUES ($1, 'Feedback', 'standard', $2)",
    )
    .bind(&object_type)
    .bind(&org)
    .execute(pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO field_types (id, name, kind) VALUES ('text', 'Text', 'string') ON CONFLICT DO NOTHING",
    )
    .execute(pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO metadata_types (id, name, field_type_id, is_required, related_object_type_id, owner_organisation_id) \
         VALUES ($1, 'Title', 'text', TRUE, $2, $3)",
    )
    .bind(format!("title_{suffix}"))
    .bind(&object_type)
    .bind(&org)
    .execute(pool)
    .await
    .unwrap();

    (org, connection, object_type)
}

#[tokio::test]
async fn catalog_and_connections_are_scoped_to_the_organisation() {
    let Some((pool, store)) = try_store().await else {
        eprintln!("Skipping: DATABASE_URL not available");
        return;
    };
    let suffix = Uuid::new_v4().simple().to_string();
    let (org, connection, object_type) = seed_catalog(&pool, &suffix).await;

    assert_eq!(
        store.organisation_for_connection(&connection).await.unwrap(),
        Some(org.clone())
    );
    assert_eq!(store.organisation_for_connection("missing").await.unwrap(), None);

    let own = store.load_catalog(&org).await.unwrap();
    assert!(own.object_type(&object_type).is_some());
    assert_eq!(own.fields_for(&object_type).count(), 1);

    let other = store.load_catalog("someone_else").await.unwrap();
    assert!(other.object_type(&object_type).is_none());
}

#[tokio::test]
async fn upserts_create_merge_and_search() {
    let Some((pool, store)) = try_store().await else {
        eprintln!("Skipping: DATABASE_URL not available");
        return;
    };
    let suffix = Uuid::new_v4().simple().to_string();
    let (org, _, object_type) = seed_catalog(&pool, &suffix).await;

    let record = ObjectRecord::new(
        Some(org.clone()),
        object_type.as_str(),
        metadata_from_json(json!({"tags": ["a"]})).unwrap(),
    );
    let status = store
        .upsert_object(record.id, ObjectPatch::from(&record), false)
        .await
        .unwrap();
    assert_eq!(status, UpsertStatus::Created);

    let peer = Uuid::new_v4();
    let patch = ObjectPatch {
        metadata: metadata_from_json(json!({"tags": ["b"]})).unwrap(),
        ..ObjectPatch::related_edge("product", peer)
    };
    let status = store.upsert_object(record.id, patch, true).await.unwrap();
    assert_eq!(status, UpsertStatus::Updated);

    let stored = store.get_object(record.id).await.unwrap().unwrap();
    assert!(stored.references("product", peer));
    assert_eq!(stored.metadata, metadata_from_json(json!({"tags": ["a", "b"]})).unwrap());
    assert_eq!(stored.related_object_type_id, object_type);

    let listed = store
        .query_objects(&ObjectQuery::in_scope(&org, &object_type).limit(5))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    let similar = store
        .similarity_search(&SimilarityQuery {
            text: "anything".into(),
            organisation_id: org.clone(),
            object_type_id: object_type.clone(),
            threshold: 0.9,
            top_k: 3,
        })
        .await
        .unwrap();
    assert_eq!(similar.len(), 1);
    assert_eq!(similar[0].record.id, record.id);
    assert!(similar[0].similarity > 0.99);
}
