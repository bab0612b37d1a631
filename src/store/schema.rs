//! DDL for the three tables described in spec §6. Applied once at startup;
//! `IF NOT EXISTS` everywhere so it's safe to call against an
//! already-migrated database.

pub const CREATE_IDENTITIES: &str = r#"
CREATE TABLE IF NOT EXISTS identities (
    identity_id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

pub const CREATE_TEMPLATES: &str = r#"
CREATE TABLE IF NOT EXISTS templates (
    template_id UUID PRIMARY KEY,
    identity_id UUID NOT NULL REFERENCES identities(identity_id) ON DELETE CASCADE,
    eye_side TEXT NOT NULL,
    iris_codes BYTEA NOT NULL,
    mask_codes BYTEA NOT NULL,
    width INTEGER NOT NULL,
    height INTEGER NOT NULL,
    n_scales INTEGER NOT NULL,
    quality_score DOUBLE PRECISION NOT NULL DEFAULT 0,
    device_id TEXT NOT NULL,
    enrolled_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    iris_popcount INTEGER[] NOT NULL DEFAULT '{}',
    mask_popcount INTEGER[] NOT NULL DEFAULT '{}'
)
"#;

pub const CREATE_TEMPLATES_IDENTITY_IDX: &str =
    "CREATE INDEX IF NOT EXISTS templates_identity_id_idx ON templates(identity_id)";

pub const CREATE_MATCH_LOG: &str = r#"
CREATE TABLE IF NOT EXISTS match_log (
    log_id BIGSERIAL PRIMARY KEY,
    probe_frame_id TEXT NOT NULL,
    matched_template_id UUID,
    matched_identity_id UUID,
    hamming_distance DOUBLE PRECISION NOT NULL,
    is_match BOOLEAN NOT NULL,
    device_id TEXT NOT NULL,
    latency_ms DOUBLE PRECISION NOT NULL,
    logged_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

pub async fn apply(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(CREATE_IDENTITIES).execute(pool).await?;
    sqlx::query(CREATE_TEMPLATES).execute(pool).await?;
    sqlx::query(CREATE_TEMPLATES_IDENTITY_IDX).execute(pool).await?;
    sqlx::query(CREATE_MATCH_LOG).execute(pool).await?;
    Ok(())
}
