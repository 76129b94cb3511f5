use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use pgvector::Vector;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info, warn};
use uuid::Uuid;

use taxon_common::{
    metadata_to_json, FieldTypeDef, ObjectPatch, ObjectRecord, ObjectTypeDef, SchemaCatalog,
    UpsertStatus,
};

use super::rows::{
    FieldRow, FieldTypeRow, ObjectRow, ObjectTypeRow, SimilarRow, TermRow, OBJECT_COLUMNS,
};
use crate::traits::{
    Condition, ObjectQuery, ObjectStore, OrderBy, SimilarObject, SimilarityQuery, TextEmbedder,
};

pub struct PgObjectStore {
    pool: PgPool,
    embedder: Option<Arc<dyn TextEmbedder>>,
}

impl PgObjectStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            embedder: None,
        }
    }

    /// Embed records on write and enable similarity search.
    pub fn with_embedder(mut self, embedder: Arc<dyn TextEmbedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("Failed to connect to Postgres")?;
        Ok(Self::new(pool))
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;
        info!("Migrations applied");
        Ok(())
    }

    /// Refresh the stored embedding. Failures leave the old vector in place.
    async fn refresh_embedding(&self, record: &ObjectRecord) {
        let Some(embedder) = &self.embedder else {
            return;
        };

        let embedding = match embedder.embed(&record.search_text()).await {
            Ok(v) => Vector::from(v),
            Err(e) => {
                warn!(id = %record.id, error = %e, "Failed to embed object");
                return;
            }
        };

        let result = sqlx::query("UPDATE objects SET embedding = $2 WHERE id = $1")
            .bind(record.id)
            .bind(&embedding)
            .execute(&self.pool)
            .await;

        if let Err(e) = result {
            warn!(id = %record.id, error = %e, "Failed to store embedding");
        }
    }
}

fn push_condition(qb: &mut QueryBuilder<'_, Postgres>, condition: &Condition) {
    match condition {
        Condition::ObjectType(t) => {
            qb.push("related_object_type_id = ").push_bind(t.clone());
        }
        Condition::OwnedBy(o) => {
            qb.push("owner_organisation_id = ").push_bind(o.clone());
        }
        Condition::Global => {
            qb.push("owner_organisation_id IS NULL");
        }
        Condition::ParentIs(id) => {
            qb.push("parent_id = ").push_bind(*id);
        }
    }
}

fn build_object_query(query: &ObjectQuery) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!("SELECT {OBJECT_COLUMNS} FROM objects WHERE TRUE"));

    for condition in &query.and {
        qb.push(" AND ");
        push_condition(&mut qb, condition);
    }

    if !query.or.is_empty() {
        qb.push(" AND (");
        for (i, condition) in query.or.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            push_condition(&mut qb, condition);
        }
        qb.push(")");
    }

    match query.order_by {
        Some(OrderBy::UpdatedAtDesc) => {
            qb.push(" ORDER BY updated_at DESC, id");
        }
        Some(OrderBy::CreatedAtAsc) => {
            qb.push(" ORDER BY created_at ASC, id");
        }
        None => {}
    }

    if let Some(limit) = query.limit {
        qb.push(" LIMIT ").push_bind(limit as i64);
    }

    qb
}

#[async_trait]
impl ObjectStore for PgObjectStore {
    async fn organisation_for_connection(&self, connection_id: &str) -> Result<Option<String>> {
        let org = sqlx::query_scalar::<_, String>(
            "SELECT organisation_id FROM connections WHERE id = $1",
        )
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(org)
    }

    async fn load_catalog(&self, organisation_id: &str) -> Result<SchemaCatalog> {
        let object_types = sqlx::query_as::<_, ObjectTypeRow>(
            r#"
            SELECT id, name, description, category, parent_object_type_id,
                   owner_organisation_id, triggers_analysis
            FROM object_types
            WHERE owner_organisation_id IS NULL OR owner_organisation_id = $1
            ORDER BY id
            "#,
        )
        .bind(organisation_id)
        .fetch_all(&self.pool)
        .await?;

        let fields = sqlx::query_as::<_, FieldRow>(
            r#"
            SELECT id, name, description, field_type_id, is_array, is_required,
                   allow_ai_update, dictionary_term_type, max_value,
                   related_object_type_id, owner_organisation_id
            FROM metadata_types
            WHERE owner_organisation_id IS NULL OR owner_organisation_id = $1
            ORDER BY id
            "#,
        )
        .bind(organisation_id)
        .fetch_all(&self.pool)
        .await?;

        let field_types = sqlx::query_as::<_, FieldTypeRow>(
            "SELECT id, name, kind, is_array FROM field_types ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        let terms = sqlx::query_as::<_, TermRow>(
            r#"
            SELECT id, term_type, description, owner_organisation_id
            FROM dictionary_terms
            WHERE owner_organisation_id IS NULL OR owner_organisation_id = $1
            ORDER BY term_type, id
            "#,
        )
        .bind(organisation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(SchemaCatalog {
            object_types: object_types
                .into_iter()
                .map(ObjectTypeDef::try_from)
                .collect::<Result<_>>()?,
            fields: fields.into_iter().map(Into::into).collect(),
            field_types: field_types
                .into_iter()
                .map(FieldTypeDef::try_from)
                .collect::<Result<_>>()?,
            dictionary_terms: terms.into_iter().map(Into::into).collect(),
        })
    }

    async fn get_object(&self, id: Uuid) -> Result<Option<ObjectRecord>> {
        let row = sqlx::query_as::<_, ObjectRow>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn query_objects(&self, query: &ObjectQuery) -> Result<Vec<ObjectRecord>> {
        let mut qb = build_object_query(query);
        let rows = qb
            .build_query_as::<ObjectRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn similarity_search(&self, query: &SimilarityQuery) -> Result<Vec<SimilarObject>> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| anyhow!("similarity search requires an embedder"))?;
        let embedding = Vector::from(embedder.embed(&query.text).await?);

        let rows = sqlx::query_as::<_, SimilarRow>(&format!(
            r#"
            SELECT {OBJECT_COLUMNS}, 1 - (embedding <=> $1) AS similarity
            FROM objects
            WHERE embedding IS NOT NULL
              AND related_object_type_id = $2
              AND owner_organisation_id = $3
              AND 1 - (embedding <=> $1) >= $4
            ORDER BY similarity DESC, updated_at DESC
            LIMIT $5
            "#
        ))
        .bind(&embedding)
        .bind(&query.object_type_id)
        .bind(&query.organisation_id)
        .bind(query.threshold)
        .bind(query.top_k as i64)
        .fetch_all(&self.pool)
        .await?;

        debug!(
            object_type_id = %query.object_type_id,
            matches = rows.len(),
            "Similarity search"
        );
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn upsert_object(
        &self,
        id: Uuid,
        patch: ObjectPatch,
        may_already_exist: bool,
    ) -> Result<UpsertStatus> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let existing: Option<ObjectRecord> = sqlx::query_as::<_, ObjectRow>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .map(Into::into);

        let record = match (&existing, may_already_exist) {
            (Some(current), true) => patch.merge_into(current, now),
            (current, _) => {
                let created_at = current.as_ref().map_or(now, |c| c.created_at);
                match patch.into_record(id, created_at, now) {
                    Some(record) => record,
                    None => bail!("patch for object {id} has no object type"),
                }
            }
        };

        sqlx::query(
            r#"
            INSERT INTO objects
                (id, owner_organisation_id, related_object_type_id, metadata,
                 parent_id, related_ids, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                owner_organisation_id = EXCLUDED.owner_organisation_id,
                related_object_type_id = EXCLUDED.related_object_type_id,
                metadata = EXCLUDED.metadata,
                parent_id = EXCLUDED.parent_id,
                related_ids = EXCLUDED.related_ids,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.id)
        .bind(&record.owner_organisation_id)
        .bind(&record.related_object_type_id)
        .bind(metadata_to_json(&record.metadata))
        .bind(record.parent_id)
        .bind(Json(&record.related_ids))
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let metadata_changed = existing
            .as_ref()
            .map_or(true, |e| e.metadata != record.metadata);
        if metadata_changed {
            self.refresh_embedding(&record).await;
        }

        Ok(if existing.is_some() {
            UpsertStatus::Updated
        } else {
            UpsertStatus::Created
        })
    }
}
