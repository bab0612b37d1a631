//! Bulk enrollment (C9.2): fan a dataset of work items out across a bounded
//! pool of workers, stream per-item results back in completion order, and
//! publish a single `bulk_enrolled` change event when the run finishes.
//!
//! Grounded on `core.py`'s bulk-enrollment path: deterministic identity ids
//! (`uuid5` chained off the dataset name, so re-running the same dataset
//! never creates duplicate identities), worker concurrency bounded to the
//! pipeline pool's size, and one aggregated change event at the end instead
//! of one per item (spec §4.9, §9).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures::future::AssertUnwindSafe;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::bus::ChangeBus;
use crate::codec::{self, IrisTemplate, PackMode};
use crate::error::IrisRegError;
use crate::gallery::{EyeSide, Gallery, GalleryPayload};
use crate::he::{self, blob as he_blob, HeContext};
use crate::matcher::plaintext::PlaintextMatcher;
use crate::pipeline_pool::PipelinePool;
use crate::store::{NewTemplateRow, Store};
use crate::writers::enroll_drain::{push_enrollment, PendingEnrollment};

const BULK_NAMESPACE_PREFIX: &str = "eyed:bulk:";

/// Display name for a bulk-enrolled identity: `{dataset}:{subject_id}`,
/// matching the original's `core.py` bulk path so re-running the same
/// dataset produces the same identity id *and* the same display name.
pub fn bulk_display_name(dataset: &str, subject_id: &str) -> String {
    format!("{dataset}:{subject_id}")
}

/// Deterministic namespace for one dataset, derived from the URL namespace
/// per spec §4.9: `uuid5(NAMESPACE_URL, "eyed:bulk:" + dataset)`.
pub fn bulk_namespace(dataset: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("{BULK_NAMESPACE_PREFIX}{dataset}").as_bytes())
}

/// Deterministic identity id for one subject within a dataset: re-running
/// the same dataset against an empty gallery reproduces the same ids, so
/// repeated bulk loads dedupe identities instead of multiplying them.
pub fn deterministic_identity_id(dataset: &str, subject_id: &str) -> Uuid {
    Uuid::new_v5(&bulk_namespace(dataset), subject_id.as_bytes())
}

/// One unit of bulk-enrollment work: a subject plus a pointer to its raw
/// image. Feature extraction itself is delegated to a [`FeatureExtractor`]
/// borrowed from the pipeline pool.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub subject_id: String,
    pub eye_side: EyeSide,
    pub raw_image_path: String,
    pub device_id: String,
}

/// Per-item outcome streamed back to the caller, in completion order (not
/// submission order).
#[derive(Debug, Clone)]
pub struct BatchItemResult {
    pub subject_id: String,
    pub identity_id: Uuid,
    pub template_id: Option<Uuid>,
    pub duplicate_of: Option<Uuid>,
    pub error: Option<String>,
}

impl BatchItemResult {
    fn enrolled(subject_id: String, identity_id: Uuid, template_id: Uuid) -> Self {
        Self {
            subject_id,
            identity_id,
            template_id: Some(template_id),
            duplicate_of: None,
            error: None,
        }
    }

    fn duplicate(subject_id: String, identity_id: Uuid, existing: Uuid) -> Self {
        Self {
            subject_id,
            identity_id,
            template_id: None,
            duplicate_of: Some(existing),
            error: None,
        }
    }

    fn error(subject_id: String, identity_id: Uuid, message: String) -> Self {
        Self {
            subject_id,
            identity_id,
            template_id: None,
            duplicate_of: None,
            error: Some(message),
        }
    }
}

/// Final tally delivered once every item has resolved (or the run was
/// cancelled early by the caller dropping the result receiver).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub enrolled: usize,
    pub duplicates: usize,
    pub errors: usize,
}

/// Extracts iris/mask code grids from a raw image file. A real deployment
/// wires this to the feature-extraction pipeline; tests substitute a stub.
/// `extract` runs on a blocking thread borrowed from the pipeline pool, so
/// implementors are free to do CPU-heavy or blocking-I/O work.
pub trait FeatureExtractor: Send + 'static {
    fn extract(&mut self, raw_image_path: &str) -> Result<IrisTemplate, String>;
}

/// Drives a bulk-enrollment run: bounded worker concurrency, panic
/// isolation per item, completion-order streaming, and cooperative
/// cancellation when the caller drops the result channel.
pub struct BatchOrchestrator<S: Store, P: FeatureExtractor> {
    gallery: Arc<Gallery<S>>,
    store: Arc<S>,
    bus: Option<Arc<ChangeBus>>,
    he_ctx: Option<HeContext>,
    pool: Arc<PipelinePool<P>>,
    matcher: PlaintextMatcher,
    dedup_threshold: f64,
    redis: Option<redis::aio::ConnectionManager>,
    acquire_timeout: Duration,
}

impl<S: Store + 'static, P: FeatureExtractor> BatchOrchestrator<S, P> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gallery: Arc<Gallery<S>>,
        store: Arc<S>,
        bus: Option<Arc<ChangeBus>>,
        pool: Arc<PipelinePool<P>>,
        matcher: PlaintextMatcher,
        dedup_threshold: f64,
        redis: Option<redis::aio::ConnectionManager>,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            gallery,
            store,
            bus,
            he_ctx: None,
            pool,
            matcher,
            dedup_threshold,
            redis,
            acquire_timeout,
        }
    }

    /// Same as [`Self::new`], but every item this run enrolls is encrypted
    /// under `he_ctx` before it reaches the gallery or the store — the bulk
    /// counterpart to `SingleEnroller::with_he_context`.
    #[allow(clippy::too_many_arguments)]
    pub fn with_he_context(
        gallery: Arc<Gallery<S>>,
        store: Arc<S>,
        bus: Option<Arc<ChangeBus>>,
        he_ctx: HeContext,
        pool: Arc<PipelinePool<P>>,
        matcher: PlaintextMatcher,
        dedup_threshold: f64,
        redis: Option<redis::aio::ConnectionManager>,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            gallery,
            store,
            bus,
            he_ctx: Some(he_ctx),
            pool,
            matcher,
            dedup_threshold,
            redis,
            acquire_timeout,
        }
    }

    /// Spawns the run and returns a result stream plus a summary future.
    /// Dropping the result receiver aborts every still-pending item task;
    /// the summary then reflects only what completed before cancellation.
    #[instrument(skip(self, items))]
    pub fn run(
        self: Arc<Self>,
        dataset: String,
        items: Vec<WorkItem>,
    ) -> (mpsc::Receiver<BatchItemResult>, oneshot::Receiver<BatchSummary>) {
        let total = items.len();
        let (result_tx, result_rx) = mpsc::channel(total.max(1));
        let (summary_tx, summary_rx) = oneshot::channel();
        let concurrency = self.pool.size().max(1);

        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(concurrency));
            let enrolled = Arc::new(AtomicUsize::new(0));
            let duplicates = Arc::new(AtomicUsize::new(0));
            let errors = Arc::new(AtomicUsize::new(0));
            let mut set: JoinSet<()> = JoinSet::new();
            let monitor_tx = result_tx.clone();

            for item in items {
                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let this = Arc::clone(&self);
                let dataset = dataset.clone();
                let result_tx = result_tx.clone();
                let enrolled = Arc::clone(&enrolled);
                let duplicates = Arc::clone(&duplicates);
                let errors = Arc::clone(&errors);

                set.spawn(async move {
                    let _permit = permit;
                    let identity_id = deterministic_identity_id(&dataset, &item.subject_id);
                    let subject_id = item.subject_id.clone();

                    let outcome = AssertUnwindSafe(this.process_item(identity_id, &dataset, &item))
                        .catch_unwind()
                        .await;

                    let result = match outcome {
                        Ok(Ok(r)) => r,
                        Ok(Err(e)) => BatchItemResult::error(subject_id, identity_id, e.to_string()),
                        Err(_) => BatchItemResult::error(subject_id, identity_id, "feature extraction worker panicked".into()),
                    };

                    if result.error.is_some() {
                        errors.fetch_add(1, Ordering::Relaxed);
                    } else if result.duplicate_of.is_some() {
                        duplicates.fetch_add(1, Ordering::Relaxed);
                    } else {
                        enrolled.fetch_add(1, Ordering::Relaxed);
                    }

                    let _ = result_tx.send(result).await;
                });
            }
            drop(result_tx);

            loop {
                tokio::select! {
                    biased;
                    _ = monitor_tx.closed() => {
                        warn!("batch result receiver dropped, aborting remaining work items");
                        set.abort_all();
                        break;
                    }
                    joined = set.join_next() => {
                        if joined.is_none() {
                            break;
                        }
                    }
                }
            }
            drop(monitor_tx);
            while set.join_next().await.is_some() {}

            let summary = BatchSummary {
                total,
                enrolled: enrolled.load(Ordering::Relaxed),
                duplicates: duplicates.load(Ordering::Relaxed),
                errors: errors.load(Ordering::Relaxed),
            };

            if summary.enrolled > 0 {
                if let Some(bus) = &self.bus {
                    if let Err(e) = bus.publish_bulk_enrolled(summary.enrolled).await {
                        warn!(error = %e, "failed to publish bulk_enrolled event");
                    }
                }
            }

            let _ = summary_tx.send(summary);
        });

        (result_rx, summary_rx)
    }

    async fn process_item(&self, identity_id: Uuid, dataset: &str, item: &WorkItem) -> Result<BatchItemResult, IrisRegError> {
        let display_name = bulk_display_name(dataset, &item.subject_id);
        let raw_image_path = item.raw_image_path.clone();
        let pool = Arc::clone(&self.pool);
        let acquire_timeout = self.acquire_timeout;

        let template = tokio::task::spawn_blocking(move || -> Result<IrisTemplate, String> {
            let mut guard = pool.acquire(acquire_timeout).map_err(|e| e.to_string())?;
            guard.extract(&raw_image_path)
        })
        .await
        .map_err(|e| IrisRegError::Decode(format!("feature extraction task panicked: {e}")))?
        .map_err(IrisRegError::Decode)?;

        template.validate()?;

        let snapshot = self.gallery.snapshot();
        let (width, height, n_scales) = template.dims();

        let (payload, iris_codes_bytes, mask_codes_bytes, iris_popcount, mask_popcount) = match &self.he_ctx {
            Some(ctx) => {
                let he_template = he::encrypt_template(ctx, &template.iris_codes, &template.mask_codes)?;
                let he_matcher = crate::matcher::he::HeMatcher::new(ctx.clone());
                let probe = he_matcher.encrypt_probe(&template.iris_codes, &template.mask_codes)?;
                let dup = he_matcher.match_1n_local(&probe, &snapshot, self.dedup_threshold)?;
                if dup.is_match {
                    let existing = dup.matched_identity_id.expect("is_match implies identity");
                    return Ok(BatchItemResult::duplicate(item.subject_id.clone(), identity_id, existing));
                }
                let iris_codes_bytes = he_blob::pack_he_codes(&he_template.iris_cts)?;
                let mask_codes_bytes = he_blob::pack_he_codes(&he_template.mask_cts)?;
                let iris_popcount = he_template.iris_popcount.clone();
                let mask_popcount = he_template.mask_popcount.clone();
                (GalleryPayload::He(he_template), iris_codes_bytes, mask_codes_bytes, iris_popcount, mask_popcount)
            }
            None => {
                let dup = self.matcher.match_1n(&template, &snapshot, self.dedup_threshold);
                if dup.is_match {
                    let existing = dup.matched_identity_id.expect("is_match implies identity");
                    return Ok(BatchItemResult::duplicate(item.subject_id.clone(), identity_id, existing));
                }
                let iris_codes_bytes = codec::pack(&template.iris_codes, PackMode::Plain)?;
                let mask_codes_bytes = codec::pack(&template.mask_codes, PackMode::Plain)?;
                (GalleryPayload::Plain(template), iris_codes_bytes, mask_codes_bytes, Vec::new(), Vec::new())
            }
        };

        let template_id = self.gallery.enroll(identity_id, display_name.clone(), item.eye_side, payload);

        match &self.redis {
            Some(conn) => {
                let mut conn = conn.clone();
                let pending = PendingEnrollment {
                    template_id,
                    identity_id,
                    identity_name: display_name.clone(),
                    eye_side: item.eye_side,
                    iris_codes_b64: base64::engine::general_purpose::STANDARD.encode(&iris_codes_bytes),
                    mask_codes_b64: base64::engine::general_purpose::STANDARD.encode(&mask_codes_bytes),
                    width,
                    height,
                    n_scales,
                    quality_score: 0.0,
                    device_id: item.device_id.clone(),
                    iris_popcount,
                    mask_popcount,
                };
                push_enrollment(&mut conn, &pending)
                    .await
                    .map_err(|e| IrisRegError::StoreUnavailable(e.to_string()))?;
            }
            None => {
                self.store.ensure_identity(identity_id, &display_name).await?;
                self.store
                    .persist_template(NewTemplateRow {
                        template_id,
                        identity_id,
                        eye_side: item.eye_side,
                        iris_codes: iris_codes_bytes,
                        mask_codes: mask_codes_bytes,
                        width,
                        height,
                        n_scales,
                        quality_score: 0.0,
                        device_id: item.device_id.clone(),
                        iris_popcount,
                        mask_popcount,
                    })
                    .await?;
            }
        }

        Ok(BatchItemResult::enrolled(item.subject_id.clone(), identity_id, template_id))
    }
}
