//! `PgStore`: the `Store` trait backed by a pooled async Postgres connection.
//!
//! Uses runtime-bound `sqlx::query`/`query_as` rather than the `query!`
//! compile-time macros, since those need a live `DATABASE_URL` at build
//! time — not available (or desired) for this crate's build.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{IdentitySummary, MatchLogEntry, NewTemplateRow, Store, StoreError, TemplateRow};
use crate::gallery::EyeSide;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(dsn: &str, min: u32, max: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .min_connections(min)
            .max_connections(max)
            .connect(dsn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        super::schema::apply(&pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn eye_side_to_str(e: EyeSide) -> &'static str {
    match e {
        EyeSide::Left => "left",
        EyeSide::Right => "right",
    }
}

fn eye_side_from_str(s: &str) -> EyeSide {
    match s {
        "right" => EyeSide::Right,
        _ => EyeSide::Left,
    }
}

fn row_to_template_row(row: sqlx::postgres::PgRow) -> Result<TemplateRow, StoreError> {
    Ok(TemplateRow {
        template_id: row.try_get("template_id").map_err(pg_err)?,
        identity_id: row.try_get("identity_id").map_err(pg_err)?,
        identity_name: row.try_get("name").map_err(pg_err)?,
        eye_side: eye_side_from_str(row.try_get::<String, _>("eye_side").map_err(pg_err)?.as_str()),
        iris_codes: row.try_get("iris_codes").map_err(pg_err)?,
        mask_codes: row.try_get("mask_codes").map_err(pg_err)?,
        width: row.try_get("width").map_err(pg_err)?,
        height: row.try_get("height").map_err(pg_err)?,
        n_scales: row.try_get("n_scales").map_err(pg_err)?,
        quality_score: row.try_get("quality_score").map_err(pg_err)?,
        device_id: row.try_get("device_id").map_err(pg_err)?,
        enrolled_at: row.try_get("enrolled_at").map_err(pg_err)?,
        iris_popcount: row
            .try_get::<Vec<i32>, _>("iris_popcount")
            .map_err(pg_err)?
            .into_iter()
            .map(|v| v as u32)
            .collect(),
        mask_popcount: row
            .try_get::<Vec<i32>, _>("mask_popcount")
            .map_err(pg_err)?
            .into_iter()
            .map(|v| v as u32)
            .collect(),
    })
}

fn pg_err(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn to_pg_i32_array(popcounts: &[u32]) -> Vec<i32> {
    popcounts.iter().map(|&v| v as i32).collect()
}

#[async_trait]
impl Store for PgStore {
    async fn ensure_identity(&self, identity_id: Uuid, name: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO identities (identity_id, name) VALUES ($1, $2) \
             ON CONFLICT (identity_id) DO UPDATE SET name = EXCLUDED.name",
        )
        .bind(identity_id)
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn delete_identity(&self, identity_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM identities WHERE identity_id = $1")
            .bind(identity_id)
            .execute(&self.pool)
            .await
            .map_err(pg_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn persist_template(&self, row: NewTemplateRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO templates \
             (template_id, identity_id, eye_side, iris_codes, mask_codes, width, height, \
              n_scales, quality_score, device_id, iris_popcount, mask_popcount) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(row.template_id)
        .bind(row.identity_id)
        .bind(eye_side_to_str(row.eye_side))
        .bind(&row.iris_codes)
        .bind(&row.mask_codes)
        .bind(row.width)
        .bind(row.height)
        .bind(row.n_scales)
        .bind(row.quality_score)
        .bind(&row.device_id)
        .bind(to_pg_i32_array(&row.iris_popcount))
        .bind(to_pg_i32_array(&row.mask_popcount))
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn load_all_templates(&self) -> Result<Vec<TemplateRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT t.*, i.name FROM templates t JOIN identities i ON i.identity_id = t.identity_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;
        rows.into_iter().map(row_to_template_row).collect()
    }

    async fn load_template(&self, template_id: Uuid) -> Result<Option<TemplateRow>, StoreError> {
        let row = sqlx::query(
            "SELECT t.*, i.name FROM templates t JOIN identities i ON i.identity_id = t.identity_id \
             WHERE t.template_id = $1",
        )
        .bind(template_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;
        row.map(row_to_template_row).transpose()
    }

    async fn list_identities(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        let rows = sqlx::query("SELECT identity_id, name, created_at FROM identities")
            .fetch_all(&self.pool)
            .await
            .map_err(pg_err)?;
        rows.into_iter()
            .map(|row| {
                Ok(IdentitySummary {
                    identity_id: row.try_get("identity_id").map_err(pg_err)?,
                    name: row.try_get("name").map_err(pg_err)?,
                    created_at: row.try_get("created_at").map_err(pg_err)?,
                })
            })
            .collect()
    }

    async fn insert_match_log_batch(&self, entries: &[MatchLogEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(pg_err)?;
        for entry in entries {
            sqlx::query(
                "INSERT INTO match_log \
                 (probe_frame_id, matched_template_id, matched_identity_id, hamming_distance, \
                  is_match, device_id, latency_ms) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(&entry.probe_frame_id)
            .bind(entry.matched_template_id)
            .bind(entry.matched_identity_id)
            .bind(entry.hamming_distance)
            .bind(entry.is_match)
            .bind(&entry.device_id)
            .bind(entry.latency_ms)
            .execute(&mut *tx)
            .await
            .map_err(pg_err)?;
        }
        tx.commit().await.map_err(pg_err)?;
        Ok(())
    }

    async fn upsert_identities_batch(&self, identities: &[(Uuid, String)]) -> Result<(), StoreError> {
        if identities.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(pg_err)?;
        for (identity_id, name) in identities {
            sqlx::query(
                "INSERT INTO identities (identity_id, name) VALUES ($1, $2) \
                 ON CONFLICT (identity_id) DO UPDATE SET name = EXCLUDED.name",
            )
            .bind(identity_id)
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(pg_err)?;
        }
        tx.commit().await.map_err(pg_err)?;
        Ok(())
    }

    async fn insert_templates_batch(&self, rows: &[NewTemplateRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(pg_err)?;
        for row in rows {
            sqlx::query(
                "INSERT INTO templates \
                 (template_id, identity_id, eye_side, iris_codes, mask_codes, width, height, \
                  n_scales, quality_score, device_id, iris_popcount, mask_popcount) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            )
            .bind(row.template_id)
            .bind(row.identity_id)
            .bind(eye_side_to_str(row.eye_side))
            .bind(&row.iris_codes)
            .bind(&row.mask_codes)
            .bind(row.width)
            .bind(row.height)
            .bind(row.n_scales)
            .bind(row.quality_score)
            .bind(&row.device_id)
            .bind(to_pg_i32_array(&row.iris_popcount))
            .bind(to_pg_i32_array(&row.mask_popcount))
            .execute(&mut *tx)
            .await
            .map_err(pg_err)?;
        }
        tx.commit().await.map_err(pg_err)?;
        Ok(())
    }
}
