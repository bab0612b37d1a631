//! Change bus (C7): publish/subscribe of gallery mutation events, with a
//! debounced, self-excluding reload on the subscriber side.
//!
//! Grounded on `nats_service.py`: every running node tags its own events
//! with a short random `node_id` so it can filter out events it originated
//! itself, coalesces a burst of remote events into a single debounced
//! `gallery.reload_from_store()` call, and rate-limits its "things are
//! being dropped" logging rather than logging every single occurrence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::gallery::Gallery;
use crate::store::Store;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("change bus transport error: {0}")]
    Transport(String),
}

impl From<BusError> for crate::error::IrisRegError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::Transport(msg) => Self::Transport(msg),
        }
    }
}

/// This process's short node id, used to self-filter change-bus events.
/// Mirrors the original's `uuid4().hex[:12]`.
pub fn new_node_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Enrolled { template_id: Uuid, identity_id: Uuid },
    BulkEnrolled { count: usize },
    Deleted { identity_id: Uuid },
}

/// Wire form (spec §6): `{node_id, event, ...}` with event-specific fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEvent {
    node_id: String,
    event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    template_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    identity_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<usize>,
}

impl WireEvent {
    fn from_event(node_id: &str, event: &ChangeEvent) -> Self {
        match *event {
            ChangeEvent::Enrolled { template_id, identity_id } => Self {
                node_id: node_id.to_owned(),
                event: "enrolled".to_owned(),
                template_id: Some(template_id),
                identity_id: Some(identity_id),
                count: None,
            },
            ChangeEvent::BulkEnrolled { count } => Self {
                node_id: node_id.to_owned(),
                event: "bulk_enrolled".to_owned(),
                template_id: None,
                identity_id: None,
                count: Some(count),
            },
            ChangeEvent::Deleted { identity_id } => Self {
                node_id: node_id.to_owned(),
                event: "deleted".to_owned(),
                template_id: None,
                identity_id: Some(identity_id),
                count: None,
            },
        }
    }

    /// Parses back into `(originating node id, event)`. Unrecognized event
    /// names or missing required fields return `None` rather than erroring
    /// — the subscriber treats a malformed message the same as a dropped
    /// one (spec §7: change-bus handler errors are logged only).
    fn into_event(self) -> Option<(String, ChangeEvent)> {
        let event = match self.event.as_str() {
            "enrolled" => ChangeEvent::Enrolled {
                template_id: self.template_id?,
                identity_id: self.identity_id?,
            },
            "bulk_enrolled" => ChangeEvent::BulkEnrolled { count: self.count? },
            "deleted" => ChangeEvent::Deleted {
                identity_id: self.identity_id?,
            },
            _ => return None,
        };
        Some((self.node_id, event))
    }
}

/// A NATS-backed publish/subscribe handle for gallery mutation events.
pub struct ChangeBus {
    client: async_nats::Client,
    subject: String,
    node_id: String,
}

impl ChangeBus {
    pub async fn connect(url: &str, subject: impl Into<String>, node_id: impl Into<String>) -> Result<Self, BusError> {
        let client = async_nats::connect(url).await.map_err(|e| BusError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            subject: subject.into(),
            node_id: node_id.into(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn publish(&self, event: ChangeEvent) -> Result<(), BusError> {
        let wire = WireEvent::from_event(&self.node_id, &event);
        let payload = serde_json::to_vec(&wire).map_err(|e| BusError::Transport(e.to_string()))?;
        self.client
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| BusError::Transport(e.to_string()))
    }

    pub async fn publish_enrolled(&self, template_id: Uuid, identity_id: Uuid) -> Result<(), BusError> {
        self.publish(ChangeEvent::Enrolled { template_id, identity_id }).await
    }

    pub async fn publish_bulk_enrolled(&self, count: usize) -> Result<(), BusError> {
        self.publish(ChangeEvent::BulkEnrolled { count }).await
    }

    pub async fn publish_deleted(&self, identity_id: Uuid) -> Result<(), BusError> {
        self.publish(ChangeEvent::Deleted { identity_id }).await
    }

    /// Subscribes to mutation events and spawns the debounced-reload loop.
    /// Self-originated events (matching `node_id`) never touch the
    /// debounce timer. At-least-once delivery is assumed from the
    /// transport; reloads are idempotent, so duplicate or reordered events
    /// just trigger an extra no-op reload.
    #[instrument(skip(self, gallery))]
    pub async fn subscribe_reload<S: Store + 'static>(
        &self,
        gallery: Arc<Gallery<S>>,
        debounce: Duration,
    ) -> Result<tokio::task::JoinHandle<()>, BusError> {
        let mut subscriber = self
            .client
            .subscribe(self.subject.clone())
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        let node_id = self.node_id.clone();

        Ok(tokio::spawn(async move {
            let debounce_task: Arc<AsyncMutex<Option<tokio::task::JoinHandle<()>>>> = Arc::new(AsyncMutex::new(None));
            let dropped = AtomicU64::new(0);
            let mut last_log = Instant::now() - Duration::from_secs(60);

            while let Some(msg) = subscriber.next().await {
                let wire: WireEvent = match serde_json::from_slice(&msg.payload) {
                    Ok(w) => w,
                    Err(_) => {
                        note_dropped(&dropped, &mut last_log);
                        continue;
                    }
                };
                let Some((source, event)) = wire.into_event() else {
                    note_dropped(&dropped, &mut last_log);
                    continue;
                };
                if source == node_id {
                    continue;
                }
                info!(source = %source, event = ?event, "template change from remote node");

                let gallery = Arc::clone(&gallery);
                let mut guard = debounce_task.lock().await;
                if let Some(task) = guard.take() {
                    task.abort();
                }
                *guard = Some(tokio::spawn(async move {
                    tokio::time::sleep(debounce).await;
                    match gallery.reload_from_store().await {
                        Ok(count) => info!(count, "gallery reloaded from store"),
                        Err(e) => warn!(error = %e, "gallery reload failed, store likely unavailable"),
                    }
                }));
            }
        }))
    }
}

/// Counts a malformed/unrecognized message and logs a rate-limited summary
/// instead of one line per occurrence (mirrors the original's
/// `_on_nats_error` "slow consumer" throttling).
fn note_dropped(dropped: &AtomicU64, last_log: &mut Instant) {
    let count = dropped.fetch_add(1, Ordering::Relaxed) + 1;
    if last_log.elapsed() >= Duration::from_secs(10) {
        warn!(count, "change bus: malformed or unrecognized messages dropped");
        *last_log = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_event_round_trips_enrolled() {
        let event = ChangeEvent::Enrolled {
            template_id: Uuid::new_v4(),
            identity_id: Uuid::new_v4(),
        };
        let wire = WireEvent::from_event("node-a", &event);
        let json = serde_json::to_vec(&wire).unwrap();
        let restored: WireEvent = serde_json::from_slice(&json).unwrap();
        let (source, restored_event) = restored.into_event().unwrap();
        assert_eq!(source, "node-a");
        assert_eq!(restored_event, event);
    }

    #[test]
    fn wire_event_round_trips_bulk_enrolled() {
        let event = ChangeEvent::BulkEnrolled { count: 9 };
        let wire = WireEvent::from_event("node-b", &event);
        let (source, restored_event) = wire.into_event().unwrap();
        assert_eq!(source, "node-b");
        assert_eq!(restored_event, event);
    }

    #[test]
    fn unrecognized_event_name_parses_to_none() {
        let wire = WireEvent {
            node_id: "node-c".into(),
            event: "something_else".into(),
            template_id: None,
            identity_id: None,
            count: None,
        };
        assert!(wire.into_event().is_none());
    }

    #[test]
    fn node_ids_are_twelve_hex_characters() {
        let id = new_node_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
