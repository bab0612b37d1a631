//! Durable store (C3): identities, templates, and the match log, behind an
//! async connection pool.
//!
//! `Store` is a trait rather than a concrete `PgPool` wrapper so tests can
//! run the gallery/enroll/writer logic against [`mock::InMemoryStore`]
//! without a live Postgres instance.

pub mod queries;
pub mod schema;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::codec::IrisTemplate;
use crate::gallery::{EyeSide, GalleryEntry, GalleryPayload};
use crate::he::HeTemplate;

pub use queries::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("codec error while decoding stored row: {0}")]
    Codec(String),
}

impl From<crate::codec::CodecError> for StoreError {
    fn from(e: crate::codec::CodecError) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<StoreError> for crate::error::IrisRegError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => Self::StoreUnavailable(msg),
            StoreError::NotFound(msg) => Self::NotFound(msg),
            StoreError::Codec(msg) => Self::Decode(msg),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdentitySummary {
    pub identity_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A template row ready for insertion. Byte columns are the packed codec
/// output (plain-archive or HE blob bytes), already encoded by the caller.
#[derive(Debug, Clone)]
pub struct NewTemplateRow {
    pub template_id: Uuid,
    pub identity_id: Uuid,
    pub eye_side: EyeSide,
    pub iris_codes: Vec<u8>,
    pub mask_codes: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub n_scales: i32,
    pub quality_score: f64,
    pub device_id: String,
    /// Per-scale popcounts of the plaintext that produced `iris_codes`/
    /// `mask_codes`. Empty for plaintext rows; populated for HE-mode rows,
    /// where the ciphertext alone can't answer "how many bits are set".
    pub iris_popcount: Vec<u32>,
    pub mask_popcount: Vec<u32>,
}

/// A template row as read back from the store, with its owning identity's
/// name joined in. `iris_popcount`/`mask_popcount` are only meaningful (and
/// only populated) for HE-mode rows; plaintext rows leave them empty.
#[derive(Debug, Clone)]
pub struct TemplateRow {
    pub template_id: Uuid,
    pub identity_id: Uuid,
    pub identity_name: String,
    pub eye_side: EyeSide,
    pub iris_codes: Vec<u8>,
    pub mask_codes: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub n_scales: i32,
    pub quality_score: f64,
    pub device_id: String,
    pub enrolled_at: DateTime<Utc>,
    pub iris_popcount: Vec<u32>,
    pub mask_popcount: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct MatchLogEntry {
    pub probe_frame_id: String,
    pub matched_template_id: Option<Uuid>,
    pub matched_identity_id: Option<Uuid>,
    pub hamming_distance: f64,
    pub is_match: bool,
    pub device_id: String,
    pub latency_ms: f64,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn ensure_identity(&self, identity_id: Uuid, name: &str) -> Result<(), StoreError>;
    async fn delete_identity(&self, identity_id: Uuid) -> Result<bool, StoreError>;
    async fn persist_template(&self, row: NewTemplateRow) -> Result<(), StoreError>;
    async fn load_all_templates(&self) -> Result<Vec<TemplateRow>, StoreError>;
    async fn load_template(&self, template_id: Uuid) -> Result<Option<TemplateRow>, StoreError>;
    async fn list_identities(&self) -> Result<Vec<IdentitySummary>, StoreError>;
    async fn insert_match_log_batch(&self, entries: &[MatchLogEntry]) -> Result<(), StoreError>;
    async fn upsert_identities_batch(&self, identities: &[(Uuid, String)]) -> Result<(), StoreError>;
    async fn insert_templates_batch(&self, rows: &[NewTemplateRow]) -> Result<(), StoreError>;
}

/// Decodes a stored [`TemplateRow`]'s byte columns into a [`GalleryEntry`],
/// dispatching on blob prefix the way the codec itself does. HE-mode rows
/// need `he_ctx` to deserialize ciphertexts; if one isn't supplied for an
/// HE row, that's a configuration error the caller should surface rather
/// than silently drop.
pub fn decode_row(row: TemplateRow, he_ctx: Option<&crate::he::HeContext>) -> Result<GalleryEntry, StoreError> {
    if crate::he::blob::is_he_blob(&row.iris_codes) {
        let ctx = he_ctx.ok_or_else(|| {
            StoreError::Codec("encountered an HE-mode template row but no HE context is configured".into())
        })?;
        let iris_cts = crate::he::blob::unpack_he_codes(ctx, &row.iris_codes)
            .map_err(|e| StoreError::Codec(e.to_string()))?;
        let mask_cts = crate::he::blob::unpack_he_codes(ctx, &row.mask_codes)
            .map_err(|e| StoreError::Codec(e.to_string()))?;
        return Ok(GalleryEntry {
            identity_id: row.identity_id,
            template_id: row.template_id,
            identity_name: row.identity_name,
            eye_side: row.eye_side,
            payload: GalleryPayload::He(HeTemplate {
                iris_cts,
                mask_cts,
                iris_popcount: row.iris_popcount,
                mask_popcount: row.mask_popcount,
            }),
        });
    }

    let iris_codes = crate::codec::unpack(&row.iris_codes)?;
    let mask_codes = crate::codec::unpack(&row.mask_codes)?;
    let template = IrisTemplate { iris_codes, mask_codes };
    template.validate()?;
    Ok(GalleryEntry {
        identity_id: row.identity_id,
        template_id: row.template_id,
        identity_name: row.identity_name,
        eye_side: row.eye_side,
        payload: GalleryPayload::Plain(template),
    })
}
