use std::sync::Arc;

use chrono::Utc;
use cronbridge_core::config::{BridgeConfig, CacheMode, Direction};
use cronbridge_core::types::{ActionStatus, CycleKind};
use cronbridge_core::Result;
use cronbridge_hooks::{HookEngine, PollApi, QueueApi};
use cronbridge_scheduler::{PollScheduler, QueueScheduler, RunReport};
use cronbridge_store::{
    activate, revert, CacheSchema, Database, ManifestCache, OptionStore, SqliteTable,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::diagnostics::{DebugTrace, FaultLogger, DEBUG_TRACE_HOOK, FAULT_LOGGER_HOOK};
use crate::floor::{CatalogExtension, IntervalFloor, CATALOG_EXTENSION_HOOK, INTERVAL_FLOOR_HOOK};
use crate::poll_to_queue::{PollToQueueRouter, POLL_TO_QUEUE_HOOK};
use crate::queue_to_poll::{QueueToPollRouter, QUEUE_TO_POLL_HOOK};
use crate::reconcile::CatalogReconciler;

/// Routers run before any other interceptor.
const ROUTER_PRIORITY: i32 = 10;
/// Catalog additions and the floor run late so they override built-ins.
const LATE_PRIORITY: i32 = 1000;

/// Both schedulers plus every bridge component, wired per configuration.
pub struct Bridge {
    pub config: BridgeConfig,
    pub db: Database,
    pub engine: Arc<HookEngine>,
    pub options: OptionStore,
    /// `None` unless the cache is enabled.
    pub cache: Option<Arc<ManifestCache>>,
    pub poll: Arc<PollScheduler>,
    pub queue: Arc<QueueScheduler>,
    pub reconciler: Arc<CatalogReconciler>,
}

/// Snapshot for `cronbridge status`.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub direction: Direction,
    pub cache_mode: CacheMode,
    pub cache_schema: String,
    pub flush_pending: bool,
    pub manifest_events: usize,
    pub pending_actions: usize,
    pub catalog_entries: usize,
    pub reconciled_entries: usize,
}

impl Bridge {
    /// Open the configured database file and install everything.
    pub fn open(config: BridgeConfig) -> Result<Self> {
        let db = Database::open(&config.database.path)?;
        Self::install(config, db)
    }

    pub fn install(config: BridgeConfig, db: Database) -> Result<Self> {
        let engine = Arc::new(HookEngine::new());
        let options = OptionStore::new(db.clone());
        let poll = Arc::new(PollScheduler::new(
            engine.clone(),
            options.clone(),
            &config.poll,
        ));
        let queue = Arc::new(QueueScheduler::new(
            engine.clone(),
            db.clone(),
            config.queue.clone(),
        )?);

        let cache = match config.cache.mode {
            CacheMode::Enabled => {
                let cache = Arc::new(ManifestCache::new(Arc::new(SqliteTable::cache(db.clone()))));
                let activation = activate(&db, &options, &cache)?;
                ManifestCache::install(&cache, &engine);
                info!(
                    upgraded_schema = activation.upgraded_schema,
                    migrated_legacy = activation.migrated_legacy,
                    "manifest cache enabled"
                );
                Some(cache)
            }
            CacheMode::Revert => {
                if db.cache_schema()? != CacheSchema::Missing {
                    let cache = ManifestCache::new(Arc::new(SqliteTable::cache(db.clone())));
                    let restored = revert(&engine, &cache, &options)?;
                    info!(restored, "manifest cache reverted");
                }
                None
            }
            CacheMode::Disabled => None,
        };

        engine.register_catalog(
            CATALOG_EXTENSION_HOOK,
            LATE_PRIORITY,
            Arc::new(CatalogExtension::new(config.poll.schedules.clone())),
        );
        if config.poll.minimum_interval > 0 {
            engine.register_commit(
                INTERVAL_FLOOR_HOOK,
                LATE_PRIORITY,
                Arc::new(IntervalFloor::new(config.poll.minimum_interval)),
            );
        }

        let poll_api: Arc<dyn PollApi> = poll.clone();
        let reconciler = Arc::new(CatalogReconciler::load(
            Arc::downgrade(&poll_api),
            options.clone(),
        )?);
        CatalogReconciler::install(&reconciler, &engine);

        match config.routing.direction {
            Direction::PollToQueue => {
                let queue_api: Arc<dyn QueueApi> = queue.clone();
                engine.register_poll(
                    POLL_TO_QUEUE_HOOK,
                    ROUTER_PRIORITY,
                    Arc::new(PollToQueueRouter::new(
                        Arc::downgrade(&queue_api),
                        reconciler.clone(),
                    )),
                );
            }
            Direction::QueueToPoll => {
                engine.register_queue(
                    QUEUE_TO_POLL_HOOK,
                    ROUTER_PRIORITY,
                    Arc::new(QueueToPollRouter::new(
                        Arc::downgrade(&poll_api),
                        reconciler.clone(),
                    )),
                );
            }
            Direction::Off => {}
        }

        if config.logging.debug {
            let trace = Arc::new(DebugTrace);
            engine.register_poll(DEBUG_TRACE_HOOK, i32::MAX, trace.clone());
            engine.register_queue(DEBUG_TRACE_HOOK, i32::MAX, trace);
        }
        if config.logging.log_errors {
            engine.register_fault(FAULT_LOGGER_HOOK, 0, Arc::new(FaultLogger));
        }

        queue.attach_runner(poll.as_ref())?;

        info!(
            direction = ?config.routing.direction,
            cache = ?config.cache.mode,
            "bridge installed"
        );
        Ok(Self {
            config,
            db,
            engine,
            options,
            cache,
            poll,
            queue,
            reconciler,
        })
    }

    /// Run `work` as one inbound request.
    ///
    /// Manifest writes made inside are flushed once when the request cycle
    /// closes. The poll scheduler gets its request trigger after `work`.
    pub fn request<T>(&self, work: impl FnOnce(&Self) -> T) -> T {
        let _cycle = self.engine.begin_cycle(CycleKind::Request);
        let out = work(self);
        if let Err(e) = self.poll.on_request(Utc::now().timestamp()) {
            warn!(error = %e, "request-triggered poll run failed");
        }
        out
    }

    /// One externally triggered poll run followed by queue cleanup.
    pub fn run(&self, now: i64) -> Result<RunReport> {
        let report = self.poll.run_due(now)?;
        self.queue.cleanup(now)?;
        Ok(report)
    }

    pub fn status(&self) -> Result<Status> {
        let cache_schema = match self.db.cache_schema()? {
            CacheSchema::Missing => "missing",
            CacheSchema::Text => "text",
            CacheSchema::Blob => "blob",
        };
        Ok(Status {
            direction: self.config.routing.direction,
            cache_mode: self.config.cache.mode,
            cache_schema: cache_schema.to_string(),
            flush_pending: self
                .cache
                .as_ref()
                .is_some_and(|cache| cache.is_flush_pending()),
            manifest_events: self.poll.manifest()?.len(),
            pending_actions: self.queue.count_by_status(ActionStatus::Pending)?,
            catalog_entries: self.poll.schedules().len(),
            reconciled_entries: self.reconciler.entries().len(),
        })
    }
}
