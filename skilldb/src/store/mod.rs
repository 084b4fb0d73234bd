mod batch;

pub use batch::{Batch, BatchCollection, BatchOp, BatchOutcome};

use crate::config::StoreConfig;
use crate::error::Result;
use crate::filter::Filter;
use crate::model::Model;
use crate::mutation::{BatchResult, WriteData};
use crate::query::{
    self, AggregateArgs, AggregateResult, FindManyArgs, FindUniqueArgs, GroupByArgs, GroupRow,
    UniqueWhere,
};
use crate::record::{Record, Row};
use crate::relation::{deletion_impact, DeleteImpact};
use crate::schema::SchemaRegistry;
use crate::storage::{Storage, View};
use crate::transaction::{self, Admission, LockManager, Transaction, TransactionOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) struct StoreInner {
    pub(crate) storage: Storage,
    pub(crate) locks: LockManager,
    pub(crate) admission: Arc<Admission>,
    pub(crate) config: StoreConfig,
    pub(crate) next_tx: AtomicU64,
}

/// The main entry point: an open store over the schema registry.
///
/// Reads outside a transaction see the latest committed state. Every write
/// outside a transaction runs in its own implicit transaction with the
/// configured default budget. Clones share the same store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Open a store over the built-in schema.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        Self::open_with_registry(SchemaRegistry::builtin()?, config)
    }

    pub fn open_with_registry(registry: Arc<SchemaRegistry>, config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let storage = Storage::open(registry, config.database_path.as_deref())?;
        log::info!(
            "store ready (schema {}, {}, isolation {})",
            storage.registry().schema_hash(),
            match storage.journal_path() {
                Some(path) => format!("journal {}", path.display()),
                None => "in memory".to_string(),
            },
            config.isolation_level
        );
        Ok(Store {
            inner: Arc::new(StoreInner {
                storage,
                locks: LockManager::new(),
                admission: Arc::new(Admission::new(config.max_concurrent_transactions)),
                config: config.clone(),
                next_tx: AtomicU64::new(0),
            }),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(&StoreConfig::in_memory())
    }

    /// Open a store journaled to the SQLite file at `path`.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(&StoreConfig::at_path(path.as_ref()))
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        self.inner.storage.registry()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn default_options(&self) -> TransactionOptions {
        self.inner.config.transaction_options()
    }

    /// Get a handle for one entity.
    pub fn collection(&self, entity: &str) -> Result<Collection<'_>> {
        self.registry().entity(entity)?;
        Ok(Collection {
            store: self,
            entity: entity.to_string(),
        })
    }

    // ── Transactions ─────────────────────────────────────────────────

    /// Run `body` as one all-or-nothing unit. The writes it stages become
    /// visible together when it returns `Ok`; any error discards them.
    pub fn transaction<T>(
        &self,
        options: TransactionOptions,
        body: impl FnOnce(&mut Transaction) -> Result<T>,
    ) -> Result<T> {
        transaction::run(&self.inner, options, body)
    }

    /// [`transaction`](Self::transaction) with the configured default options.
    pub fn transact<T>(&self, body: impl FnOnce(&mut Transaction) -> Result<T>) -> Result<T> {
        self.transaction(self.default_options(), body)
    }

    /// Create a batch for all-or-nothing execution of queued writes.
    pub fn batch(&self) -> Batch<'_> {
        Batch::new(self)
    }

    // ── Reads ────────────────────────────────────────────────────────

    fn read<T>(&self, f: impl FnOnce(&View<'_>) -> Result<T>) -> Result<T> {
        let view = View::new(self.registry(), self.inner.storage.snapshot()?);
        f(&view)
    }

    pub fn find_unique(&self, entity: &str, args: impl Into<FindUniqueArgs>) -> Result<Option<Row>> {
        let args = args.into();
        self.read(|view| query::find_unique(view, entity, &args))
    }

    pub fn find_unique_or_throw(&self, entity: &str, args: impl Into<FindUniqueArgs>) -> Result<Row> {
        let args = args.into();
        self.read(|view| query::find_unique_or_throw(view, entity, &args))
    }

    pub fn find_many(&self, entity: &str, args: &FindManyArgs) -> Result<Vec<Row>> {
        self.read(|view| query::find_many(view, entity, args))
    }

    pub fn find_first(&self, entity: &str, args: &FindManyArgs) -> Result<Option<Row>> {
        self.read(|view| query::find_first(view, entity, args))
    }

    pub fn find_first_or_throw(&self, entity: &str, args: &FindManyArgs) -> Result<Row> {
        self.read(|view| query::find_first_or_throw(view, entity, args))
    }

    pub fn count(&self, entity: &str, args: &FindManyArgs) -> Result<u64> {
        self.read(|view| query::count(view, entity, args))
    }

    pub fn aggregate(&self, entity: &str, args: &AggregateArgs) -> Result<AggregateResult> {
        self.read(|view| query::aggregate(view, entity, args))
    }

    pub fn group_by(&self, entity: &str, args: &GroupByArgs) -> Result<Vec<GroupRow>> {
        self.read(|view| query::group_by(view, entity, args))
    }

    /// What deleting the row at `key` would remove, clear or be blocked by.
    pub fn deletion_impact(&self, entity: &str, key: &UniqueWhere) -> Result<DeleteImpact> {
        self.read(|view| deletion_impact(view, entity, key))
    }

    // ── Typed reads ──────────────────────────────────────────────────

    pub fn find_unique_as<T: Model>(&self, key: UniqueWhere) -> Result<Option<T>> {
        self.find_unique(T::ENTITY, key)?
            .map(Row::into_model)
            .transpose()
    }

    pub fn find_many_as<T: Model>(&self, args: &FindManyArgs) -> Result<Vec<T>> {
        self.find_many(T::ENTITY, args)?
            .into_iter()
            .map(Row::into_model)
            .collect()
    }

    pub fn create_as<T: Model>(&self, data: WriteData) -> Result<T> {
        self.create(T::ENTITY, data)?.into_model()
    }

    // ── Writes ───────────────────────────────────────────────────────

    pub fn create(&self, entity: &str, data: WriteData) -> Result<Record> {
        self.transact(|tx| tx.create(entity, data))
    }

    pub fn create_many(
        &self,
        entity: &str,
        data: Vec<WriteData>,
        skip_duplicates: bool,
    ) -> Result<BatchResult> {
        self.transact(|tx| tx.create_many(entity, data, skip_duplicates))
    }

    pub fn update(&self, entity: &str, key: &UniqueWhere, data: WriteData) -> Result<Record> {
        self.transact(|tx| tx.update(entity, key, data))
    }

    pub fn update_many(
        &self,
        entity: &str,
        filter: Option<&Filter>,
        data: WriteData,
        limit: Option<usize>,
    ) -> Result<BatchResult> {
        self.transact(|tx| tx.update_many(entity, filter, data, limit))
    }

    pub fn upsert(
        &self,
        entity: &str,
        key: &UniqueWhere,
        create: WriteData,
        update: WriteData,
    ) -> Result<Record> {
        self.transact(|tx| tx.upsert(entity, key, create, update))
    }

    pub fn delete(&self, entity: &str, key: &UniqueWhere) -> Result<Record> {
        self.transact(|tx| tx.delete(entity, key))
    }

    pub fn delete_many(
        &self,
        entity: &str,
        filter: Option<&Filter>,
        limit: Option<usize>,
    ) -> Result<BatchResult> {
        self.transact(|tx| tx.delete_many(entity, filter, limit))
    }

    /// Status information: schema hash, commit sequence, row counts and
    /// transaction activity.
    pub fn status(&self) -> Result<serde_json::Value> {
        let snapshot = self.inner.storage.snapshot()?;
        let mut entities = serde_json::Map::new();
        for name in self.registry().entity_names() {
            let count = snapshot.table(name).map(|t| t.len()).unwrap_or(0);
            entities.insert(name.to_string(), serde_json::json!({ "count": count }));
        }
        let persisted = self.inner.storage.persisted_counts()?.map(|counts| {
            counts
                .into_iter()
                .map(|(entity, count)| (entity, serde_json::Value::from(count)))
                .collect::<serde_json::Map<_, _>>()
        });

        Ok(serde_json::json!({
            "schema_hash": self.registry().schema_hash(),
            "database_path": self.inner.storage.journal_path().map(|p| p.display().to_string()),
            "commit_seq": snapshot.seq(),
            "entities": entities,
            "persisted": persisted,
            "isolation_level": self.inner.config.isolation_level.as_str(),
            "active_transactions": self.inner.admission.active(),
            "held_locks": self.inner.locks.held_count(),
            "transactions_started": self.inner.next_tx.load(Ordering::SeqCst),
        }))
    }
}

/// A handle to one entity of a store.
pub struct Collection<'a> {
    store: &'a Store,
    entity: String,
}

impl<'a> Collection<'a> {
    pub fn name(&self) -> &str {
        &self.entity
    }

    /// Get a row by id, `NotFound` when absent.
    pub fn get(&self, id: &str) -> Result<Row> {
        self.store.find_unique_or_throw(&self.entity, UniqueWhere::id(id))
    }

    pub fn find_unique(&self, args: impl Into<FindUniqueArgs>) -> Result<Option<Row>> {
        self.store.find_unique(&self.entity, args)
    }

    /// Every row, in id order.
    pub fn list(&self) -> Result<Vec<Row>> {
        self.store.find_many(&self.entity, &FindManyArgs::new())
    }

    pub fn find_many(&self, args: &FindManyArgs) -> Result<Vec<Row>> {
        self.store.find_many(&self.entity, args)
    }

    pub fn count(&self, filter: Option<Filter>) -> Result<u64> {
        let args = FindManyArgs {
            filter,
            ..FindManyArgs::default()
        };
        self.store.count(&self.entity, &args)
    }

    pub fn create(&self, data: WriteData) -> Result<Record> {
        self.store.create(&self.entity, data)
    }

    /// Create a row from a JSON payload.
    pub fn create_json(&self, json: &serde_json::Value) -> Result<Record> {
        let data = WriteData::from_json(self.store.registry(), &self.entity, json)?;
        self.create(data)
    }

    pub fn update(&self, id: &str, data: WriteData) -> Result<Record> {
        self.store.update(&self.entity, &UniqueWhere::id(id), data)
    }

    /// Update a row from a JSON payload.
    pub fn update_json(&self, id: &str, json: &serde_json::Value) -> Result<Record> {
        let data = WriteData::from_json(self.store.registry(), &self.entity, json)?;
        self.update(id, data)
    }

    pub fn delete(&self, id: &str) -> Result<Record> {
        self.store.delete(&self.entity, &UniqueWhere::id(id))
    }
}
