//! Explicit component lifecycle (spec §9 design note: "module-level
//! singletons → explicit lifecycle"). `System` owns every long-lived handle
//! this crate's components need and brings them up in the documented order
//! — pipeline pool (pre-loaded by the caller, since its element type is
//! deployment-specific) → HE context → store → gallery reload → match-log
//! writer → bus subscribe — reversing that order on [`System::shutdown`].
//!
//! There are no mutable globals to reset between tests: a test that needs a
//! clean slate simply builds a fresh `System` against a fresh [`Store`]
//! (typically [`crate::store::mock::InMemoryStore`]) rather than calling a
//! reset hook on shared state.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::bus::{new_node_id, ChangeBus};
use crate::config::Config;
use crate::enroll::FeatureExtractor;
use crate::error::Result;
use crate::gallery::Gallery;
use crate::he::{ContextConfig, HeContext, SecurityLevel};
use crate::pipeline_pool::PipelinePool;
use crate::store::Store;
use crate::writers::{EnrollmentDrainWriter, MatchLogWriter};

/// Every long-lived handle a running node needs, wired together per
/// `config`. `S` is the durable store implementation (`PgStore` in
/// production, `store::mock::InMemoryStore` in tests); `P` is the
/// feature-extraction pipeline's per-instance resource type, opaque to this
/// crate (spec §1: the image→template pipeline is an external
/// collaborator).
pub struct System<S: Store + 'static, P: FeatureExtractor> {
    pub node_id: String,
    pub pipeline_pool: Arc<PipelinePool<P>>,
    pub he_ctx: Option<HeContext>,
    pub store: Arc<S>,
    pub gallery: Arc<Gallery<S>>,
    pub match_log: Arc<MatchLogWriter>,
    pub enroll_drain: Option<Arc<EnrollmentDrainWriter>>,
    pub bus: Option<Arc<ChangeBus>>,
    bus_subscription: Option<tokio::task::JoinHandle<()>>,
}

impl<S: Store + 'static, P: FeatureExtractor> System<S, P> {
    /// Brings up every component in the order spec §9 prescribes. The
    /// pipeline pool and the store connection are accepted pre-built
    /// (`PipelinePool::load` blocks the calling thread and a `Store`'s
    /// connection setup is implementation-specific — `PgStore::connect` for
    /// production) since this type has no way to construct either generic
    /// parameter itself; everything downstream of them is sequenced here.
    #[instrument(skip_all)]
    pub async fn start(
        config: &Config,
        store: Arc<S>,
        pipeline_pool: Arc<PipelinePool<P>>,
        redis: Option<redis::aio::ConnectionManager>,
    ) -> Result<Self> {
        let node_id = new_node_id();

        let he_ctx = if config.he_enabled {
            Some(match &config.he_key_dir {
                Some(dir) => {
                    info!(dir, "loading HE context from key directory");
                    HeContext::from_key_dir(std::path::Path::new(dir), SecurityLevel::Standard128)?
                }
                None => {
                    info!("no he_key_dir configured, generating an ephemeral HE context");
                    HeContext::new(ContextConfig {
                        security_level: SecurityLevel::Standard128,
                        ephemeral_keys: true,
                    })?
                }
            })
        } else {
            None
        };

        let gallery = Arc::new(match &he_ctx {
            Some(ctx) => Gallery::with_he_context(Arc::clone(&store), ctx.clone()),
            None => Gallery::new(Arc::clone(&store)),
        });
        let loaded = gallery.reload_from_store().await?;
        info!(loaded, "initial gallery load complete");

        let match_log = Arc::new(MatchLogWriter::start(
            Arc::clone(&store),
            config.match_log_queue_capacity,
            config.match_log_batch_max,
        ));

        let enroll_drain = redis.map(|conn| {
            Arc::new(EnrollmentDrainWriter::start(
                Arc::clone(&store),
                conn,
                config.batch_db_interval,
                config.batch_db_size,
            ))
        });

        let bus = match &config.bus_url {
            Some(url) => Some(Arc::new(
                ChangeBus::connect(url, config.bus_subject_prefix.clone(), node_id.clone()).await?,
            )),
            None => None,
        };
        let bus_subscription = match &bus {
            Some(bus) => Some(bus.subscribe_reload(Arc::clone(&gallery), config.reload_debounce).await?),
            None => None,
        };

        info!(node_id = %node_id, he_enabled = config.he_enabled, "system started");

        Ok(Self {
            node_id,
            pipeline_pool,
            he_ctx,
            store,
            gallery,
            match_log,
            enroll_drain,
            bus,
            bus_subscription,
        })
    }

    /// Reverses the startup order: bus unsubscribe, then enroll-drain stop
    /// (drain-and-flush), then match-log stop (drain-and-flush). The
    /// pipeline pool, HE context, and store own no background tasks of
    /// their own and are simply dropped along with `self`.
    #[instrument(skip(self))]
    pub async fn shutdown(self) {
        if let Some(handle) = self.bus_subscription {
            handle.abort();
        }
        if let Some(drain) = self.enroll_drain {
            drain.stop().await;
        }
        self.match_log.stop().await;
        info!(node_id = %self.node_id, "system shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::IrisTemplate;
    use crate::store::mock::InMemoryStore;

    struct StubExtractor;
    impl FeatureExtractor for StubExtractor {
        fn extract(&mut self, _raw_image_path: &str) -> std::result::Result<IrisTemplate, String> {
            Err("stub extractor never called in this test".into())
        }
    }

    #[tokio::test]
    async fn start_then_shutdown_without_he_or_bus() {
        let config = Config {
            he_enabled: false,
            bus_url: None,
            ..Config::default()
        };
        let store = Arc::new(InMemoryStore::new());
        let pool = Arc::new(PipelinePool::load(1, |_| StubExtractor));

        let system = System::start(&config, store, pool, None).await.unwrap();
        assert!(system.he_ctx.is_none());
        assert!(system.bus.is_none());
        assert_eq!(system.gallery.size(), 0);

        system.shutdown().await;
    }

    #[tokio::test]
    async fn start_with_he_enabled_and_no_key_dir_uses_an_ephemeral_context() {
        let config = Config {
            he_enabled: true,
            he_key_dir: None,
            bus_url: None,
            ..Config::default()
        };
        let store = Arc::new(InMemoryStore::new());
        let pool = Arc::new(PipelinePool::load(1, |_| StubExtractor));

        let system = System::start(&config, store, pool, None).await.unwrap();
        let ctx = system.he_ctx.as_ref().expect("he_ctx should be present when he_enabled");
        assert!(ctx.has_secret_key().unwrap());

        system.shutdown().await;
    }
}
