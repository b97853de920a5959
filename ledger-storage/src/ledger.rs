//! Ledger assembly: configuration, substrate, clock and id source wired together.

use std::sync::Arc;

use ledger_core::{
    truncate_to_micros, Clock, IdGenerator, LedgerConfig, LedgerResult, MonotonicClock,
    StoreBackend, SystemClock, Timestamp, UuidV7Generator,
};

use crate::maintenance::IndexMaintenance;
use crate::notifier::ChangeNotifier;
use crate::query::Queries;
use crate::repository::Repository;
use crate::store::{InMemoryItemStore, ItemStore, LmdbItemStore};

/// Shared state behind every handle of one ledger.
pub(crate) struct LedgerContext {
    pub(crate) maintenance: IndexMaintenance,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) config: LedgerConfig,
}

impl LedgerContext {
    pub(crate) fn now(&self) -> Timestamp {
        truncate_to_micros(self.clock.now())
    }
}

/// Builder for a [`Ledger`] with injectable substrate, clock and id source.
pub struct LedgerBuilder {
    config: LedgerConfig,
    store: Option<Arc<dyn ItemStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl LedgerBuilder {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            store: None,
            clock: None,
            ids: None,
        }
    }

    /// Use an existing substrate instead of the configured backend.
    pub fn with_store(mut self, store: Arc<dyn ItemStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Validate the configuration and open the substrate.
    pub fn build(self) -> LedgerResult<Ledger> {
        self.config.validate()?;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new(SystemClock)));
        let store = match self.store {
            Some(store) => store,
            None => open_backend(&self.config.backend, clock.clone())?,
        };
        let ids = self.ids.unwrap_or_else(|| Arc::new(UuidV7Generator));
        let maintenance =
            IndexMaintenance::new(store, self.config.retry.clone(), self.config.scan_page_size);

        tracing::info!(
            environment = %self.config.environment,
            table = %self.config.table_name,
            consistency = %self.config.consistency,
            "Ledger opened"
        );
        Ok(Ledger {
            ctx: Arc::new(LedgerContext {
                maintenance,
                clock,
                ids,
                config: self.config,
            }),
        })
    }
}

fn open_backend(backend: &StoreBackend, clock: Arc<dyn Clock>) -> LedgerResult<Arc<dyn ItemStore>> {
    match backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryItemStore::with_clock(clock))),
        StoreBackend::Lmdb { path, max_size_mb } => {
            let store = LmdbItemStore::open(path, *max_size_mb)?.with_clock(clock);
            Ok(Arc::new(store))
        }
    }
}

/// A decision ledger: repository, queries and change feed over one substrate.
///
/// # Example
///
/// ```ignore
/// let ledger = Ledger::open(LedgerConfig::from_env()?)?;
/// let project = ledger
///     .repository()
///     .create_project(NewProject::new("Backend Rewrite", UserId::new("U001")?))
///     .await?;
/// let decisions = ledger
///     .queries()
///     .list_decisions_for_project(project.id, TimeRange::all())
///     .await?;
/// ```
#[derive(Clone)]
pub struct Ledger {
    ctx: Arc<LedgerContext>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("table", &self.ctx.config.table_name)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    pub fn builder(config: LedgerConfig) -> LedgerBuilder {
        LedgerBuilder::new(config)
    }

    /// Open a ledger on the configured backend with the production clock and ids.
    pub fn open(config: LedgerConfig) -> LedgerResult<Self> {
        LedgerBuilder::new(config).build()
    }

    /// A fresh in-memory ledger with default configuration.
    pub fn in_memory() -> LedgerResult<Self> {
        Self::open(LedgerConfig::default())
    }

    pub fn repository(&self) -> Repository {
        Repository::new(self.ctx.clone())
    }

    pub fn queries(&self) -> Queries {
        Queries::new(self.ctx.clone())
    }

    /// A change notifier starting at the beginning of the feed.
    pub fn notifier(&self) -> ChangeNotifier {
        ChangeNotifier::new(
            self.ctx.maintenance.store().clone(),
            self.ctx.config.retry.clone(),
            self.ctx.maintenance.subscribe(),
            self.ctx.config.change_batch_size,
        )
    }

    /// Index maintenance engine, for reconcile and repair.
    pub fn maintenance(&self) -> &IndexMaintenance {
        &self.ctx.maintenance
    }

    pub fn store(&self) -> &Arc<dyn ItemStore> {
        self.ctx.maintenance.store()
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.ctx.config
    }
}
