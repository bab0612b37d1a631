//! Typed runtime configuration.
//!
//! Mirrors the original service's environment-prefixed settings object, but
//! as a single flat struct with exactly the options spec'd — nothing else.
//! The AES-256-GCM key is deliberately *not* a field here: `codec::aes` reads
//! it straight from the environment so it can never end up in a `Debug` dump
//! or a serialized config snapshot.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IrisRegError, Result};

/// Environment variable holding the raw template encryption key, as hex or
/// base64. Absent means the codec runs in passthrough mode.
pub const ENCRYPTION_KEY_ENV: &str = "IRISREG_ENCRYPTION_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Recognition threshold: distances below this are reported as a match.
    pub match_threshold: f64,
    /// Deduplication threshold, stricter than `match_threshold`.
    pub dedup_threshold: f64,
    /// Maximum rotation shift `R` searched in each direction.
    pub rotation_shift: i32,
    /// `N0` in the score-normalization formula.
    pub norm_mean: f64,
    /// `m` in the score-normalization formula.
    pub norm_gradient: f64,

    pub pipeline_pool_size: usize,
    pub batch_workers: usize,
    pub batch_db_size: usize,
    #[serde(with = "duration_secs_f64")]
    pub batch_db_interval: Duration,

    pub he_enabled: bool,
    pub he_key_dir: Option<String>,

    pub store_url: String,
    pub store_pool_min: u32,
    pub store_pool_max: u32,

    pub redis_url: Option<String>,
    pub bus_url: Option<String>,
    pub bus_subject_prefix: String,
    pub he_key_service_subject: String,

    pub match_log_queue_capacity: usize,
    pub match_log_batch_max: usize,

    #[serde(with = "duration_secs_f64")]
    pub reload_debounce: Duration,
    pub max_cts_per_request: usize,
    #[serde(with = "duration_secs_f64")]
    pub he_request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            match_threshold: 0.39,
            dedup_threshold: 0.32,
            rotation_shift: 15,
            norm_mean: 0.45 * 8192.0,
            norm_gradient: 5e-5,
            pipeline_pool_size: 4,
            batch_workers: 8,
            batch_db_size: 50,
            batch_db_interval: Duration::from_secs(2),
            he_enabled: false,
            he_key_dir: None,
            store_url: "postgres://localhost/irisreg".to_owned(),
            store_pool_min: 1,
            store_pool_max: 10,
            redis_url: None,
            bus_url: None,
            bus_subject_prefix: "irisreg.gallery".to_owned(),
            he_key_service_subject: "irisreg.he".to_owned(),
            match_log_queue_capacity: 1000,
            match_log_batch_max: 50,
            reload_debounce: Duration::from_millis(500),
            max_cts_per_request: 16,
            he_request_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Loads configuration from environment variables, falling back to
    /// [`Config::default`] for anything unset. Numeric/bool fields that are
    /// set but unparsable fail fast with [`IrisRegError::Config`].
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        macro_rules! env_f64 {
            ($key:literal, $field:ident) => {
                if let Ok(raw) = std::env::var($key) {
                    cfg.$field = raw
                        .parse()
                        .map_err(|_| IrisRegError::Config(format!("{} must be a float", $key)))?;
                }
            };
        }
        macro_rules! env_usize {
            ($key:literal, $field:ident) => {
                if let Ok(raw) = std::env::var($key) {
                    cfg.$field = raw
                        .parse()
                        .map_err(|_| IrisRegError::Config(format!("{} must be an integer", $key)))?;
                }
            };
        }

        env_f64!("IRISREG_MATCH_THRESHOLD", match_threshold);
        env_f64!("IRISREG_DEDUP_THRESHOLD", dedup_threshold);
        env_f64!("IRISREG_NORM_MEAN", norm_mean);
        env_f64!("IRISREG_NORM_GRADIENT", norm_gradient);
        env_usize!("IRISREG_PIPELINE_POOL_SIZE", pipeline_pool_size);
        env_usize!("IRISREG_BATCH_WORKERS", batch_workers);
        env_usize!("IRISREG_BATCH_DB_SIZE", batch_db_size);
        env_usize!("IRISREG_MAX_CTS_PER_REQUEST", max_cts_per_request);
        env_usize!("IRISREG_MATCH_LOG_QUEUE_CAPACITY", match_log_queue_capacity);
        env_usize!("IRISREG_MATCH_LOG_BATCH_MAX", match_log_batch_max);

        if let Ok(raw) = std::env::var("IRISREG_ROTATION_SHIFT") {
            cfg.rotation_shift = raw
                .parse()
                .map_err(|_| IrisRegError::Config("IRISREG_ROTATION_SHIFT must be an integer".into()))?;
        }
        if let Ok(raw) = std::env::var("IRISREG_HE_ENABLED") {
            cfg.he_enabled = matches!(raw.as_str(), "1" | "true" | "yes");
        }
        if let Ok(raw) = std::env::var("IRISREG_HE_KEY_DIR") {
            cfg.he_key_dir = Some(raw);
        }
        if let Ok(raw) = std::env::var("IRISREG_STORE_URL") {
            cfg.store_url = raw;
        }
        if let Ok(raw) = std::env::var("IRISREG_STORE_POOL_MIN") {
            cfg.store_pool_min = raw
                .parse()
                .map_err(|_| IrisRegError::Config("IRISREG_STORE_POOL_MIN must be an integer".into()))?;
        }
        if let Ok(raw) = std::env::var("IRISREG_STORE_POOL_MAX") {
            cfg.store_pool_max = raw
                .parse()
                .map_err(|_| IrisRegError::Config("IRISREG_STORE_POOL_MAX must be an integer".into()))?;
        }
        if let Ok(raw) = std::env::var("IRISREG_REDIS_URL") {
            cfg.redis_url = Some(raw);
        }
        if let Ok(raw) = std::env::var("IRISREG_BUS_URL") {
            cfg.bus_url = Some(raw);
        }
        if let Ok(raw) = std::env::var("IRISREG_BUS_SUBJECT_PREFIX") {
            cfg.bus_subject_prefix = raw;
        }
        if let Ok(raw) = std::env::var("IRISREG_HE_KEY_SERVICE_SUBJECT") {
            cfg.he_key_service_subject = raw;
        }
        if let Ok(raw) = std::env::var("IRISREG_RELOAD_DEBOUNCE_MS") {
            let ms: u64 = raw
                .parse()
                .map_err(|_| IrisRegError::Config("IRISREG_RELOAD_DEBOUNCE_MS must be an integer".into()))?;
            cfg.reload_debounce = Duration::from_millis(ms);
        }
        if let Ok(raw) = std::env::var("IRISREG_HE_REQUEST_TIMEOUT_SECS") {
            let secs: f64 = raw
                .parse()
                .map_err(|_| IrisRegError::Config("IRISREG_HE_REQUEST_TIMEOUT_SECS must be a float".into()))?;
            cfg.he_request_timeout = Duration::from_secs_f64(secs);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.match_threshold) {
            return Err(IrisRegError::Config("match_threshold must be in [0,1]".into()));
        }
        if !(0.0..=1.0).contains(&self.dedup_threshold) {
            return Err(IrisRegError::Config("dedup_threshold must be in [0,1]".into()));
        }
        if self.store_pool_min > self.store_pool_max {
            return Err(IrisRegError::Config("store_pool_min must be <= store_pool_max".into()));
        }
        if self.pipeline_pool_size == 0 {
            return Err(IrisRegError::Config("pipeline_pool_size must be > 0".into()));
        }
        Ok(())
    }
}

mod duration_secs_f64 {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs_f64().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
