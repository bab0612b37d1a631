//! Bulk-enrollment drain (C4.2): a periodic task that pops a batch from the
//! Redis write-through queue and bulk-inserts it into the durable store.
//! Modeled directly on `redis_cache.py`/`db_drain.py`: `LRANGE`+`LTRIM` in
//! one pipeline for atomicity, dedup identities within the batch, upsert
//! then insert.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::gallery::EyeSide;
use crate::store::{NewTemplateRow, Store};

const QUEUE_KEY: &str = "irisreg:enroll:pending";

/// The JSON shape pushed to Redis by the enrollment path when C4.2 is
/// configured, mirroring the original's `push_enrollment` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEnrollment {
    pub template_id: Uuid,
    pub identity_id: Uuid,
    pub identity_name: String,
    pub eye_side: EyeSide,
    pub iris_codes_b64: String,
    pub mask_codes_b64: String,
    pub width: i32,
    pub height: i32,
    pub n_scales: i32,
    pub quality_score: f64,
    pub device_id: String,
    #[serde(default)]
    pub iris_popcount: Vec<u32>,
    #[serde(default)]
    pub mask_popcount: Vec<u32>,
}

pub struct EnrollmentDrainWriter {
    stop_flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
    join: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    pending_len: Arc<AtomicI64>,
}

impl EnrollmentDrainWriter {
    pub fn start<S: Store + 'static>(
        store: Arc<S>,
        conn: ConnectionManager,
        interval: Duration,
        batch_size: usize,
    ) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        let pending_len = Arc::new(AtomicI64::new(0));

        let join = tokio::spawn(drain_loop(
            store,
            conn,
            interval,
            batch_size,
            Arc::clone(&stop_flag),
            Arc::clone(&notify),
            Arc::clone(&pending_len),
        ));

        Self {
            stop_flag,
            notify,
            join: tokio::sync::Mutex::new(Some(join)),
            pending_len,
        }
    }

    /// Operational visibility into the write-through queue's depth (spec §9
    /// open question (ii) for C4.2).
    pub fn pending_len(&self) -> i64 {
        self.pending_len.load(Ordering::Relaxed)
    }

    #[instrument(skip(self))]
    pub async fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.notify.notify_one();
        if let Some(join) = self.join.lock().await.take() {
            let _ = join.await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn drain_loop<S: Store>(
    store: Arc<S>,
    mut conn: ConnectionManager,
    interval: Duration,
    batch_size: usize,
    stop_flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
    pending_len: Arc<AtomicI64>,
) {
    loop {
        if let Err(e) = flush(&store, &mut conn, batch_size, &pending_len).await {
            warn!(error = %e, "enrollment drain error, will retry next tick");
        }
        if stop_flag.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = notify.notified() => {}
        }
        if stop_flag.load(Ordering::SeqCst) {
            // Final flush to catch anything pushed after the last poll.
            let _ = flush(&store, &mut conn, batch_size, &pending_len).await;
            break;
        }
    }
}

async fn flush<S: Store>(
    store: &Arc<S>,
    conn: &mut ConnectionManager,
    batch_size: usize,
    pending_len: &Arc<AtomicI64>,
) -> redis::RedisResult<()> {
    let items = pop_enrollments(conn, batch_size).await?;
    if let Ok(len) = conn.llen::<_, i64>(QUEUE_KEY).await {
        pending_len.store(len, Ordering::Relaxed);
    }
    if items.is_empty() {
        return Ok(());
    }
    batch_insert(store, items).await;
    Ok(())
}

async fn pop_enrollments(conn: &mut ConnectionManager, batch_size: usize) -> redis::RedisResult<Vec<PendingEnrollment>> {
    let upper = (batch_size as isize).saturating_sub(1);
    let (raw_items,): (Vec<Vec<u8>>,) = redis::pipe()
        .lrange(QUEUE_KEY, 0, upper)
        .ltrim(QUEUE_KEY, batch_size as isize, -1)
        .ignore()
        .query_async(conn)
        .await?;

    let mut items = Vec::with_capacity(raw_items.len());
    for raw in raw_items {
        match serde_json::from_slice::<PendingEnrollment>(&raw) {
            Ok(item) => items.push(item),
            Err(_) => warn!("skipping malformed enrollment record in write-through queue"),
        }
    }
    Ok(items)
}

async fn batch_insert<S: Store>(store: &Arc<S>, items: Vec<PendingEnrollment>) {
    use base64::Engine;

    let mut seen = HashSet::new();
    let identities: Vec<(Uuid, String)> = items
        .iter()
        .filter(|i| seen.insert(i.identity_id))
        .map(|i| (i.identity_id, i.identity_name.clone()))
        .collect();

    if let Err(e) = store.upsert_identities_batch(&identities).await {
        warn!(error = %e, "failed to upsert identities during enrollment drain");
        return;
    }

    let mut rows = Vec::with_capacity(items.len());
    for item in &items {
        let (Ok(iris_codes), Ok(mask_codes)) = (
            base64::engine::general_purpose::STANDARD.decode(&item.iris_codes_b64),
            base64::engine::general_purpose::STANDARD.decode(&item.mask_codes_b64),
        ) else {
            warn!(template_id = %item.template_id, "skipping enrollment record with bad base64 payload");
            continue;
        };
        rows.push(NewTemplateRow {
            template_id: item.template_id,
            identity_id: item.identity_id,
            eye_side: item.eye_side,
            iris_codes,
            mask_codes,
            width: item.width,
            height: item.height,
            n_scales: item.n_scales,
            quality_score: item.quality_score,
            device_id: item.device_id.clone(),
            iris_popcount: item.iris_popcount.clone(),
            mask_popcount: item.mask_popcount.clone(),
        });
    }

    let count = rows.len();
    if let Err(e) = store.insert_templates_batch(&rows).await {
        warn!(error = %e, "failed to batch-insert templates during enrollment drain");
    } else {
        tracing::info!(count, "batch-inserted enrollment records");
    }
}

/// Pushes one record onto the write-through queue; used by the enrollment
/// orchestrator when C4.2 is configured instead of a direct store write.
pub async fn push_enrollment(conn: &mut ConnectionManager, item: &PendingEnrollment) -> redis::RedisResult<()> {
    let payload = serde_json::to_vec(item).expect("PendingEnrollment always serializes");
    conn.rpush(QUEUE_KEY, payload).await
}
