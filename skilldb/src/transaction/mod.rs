//! Transaction coordinator: flat, all-or-nothing units of reads and writes.
//!
//! A transaction stages its writes in an overlay and takes row and
//! unique-key locks as it goes; nothing is visible to other readers until
//! [`Storage::commit`](crate::storage::Storage::commit) publishes the whole
//! overlay at once. Dropping a transaction without committing discards it.

mod locks;
mod options;

pub use locks::{Admission, LockKey, LockManager, Permit};
pub use options::{CancelToken, IsolationLevel, TransactionOptions, DEFAULT_MAX_WAIT, DEFAULT_TIMEOUT};

use crate::error::{Result, SkillDbError};
use crate::mutation::{self, BatchResult, WriteData};
use crate::query::{
    self, AggregateArgs, AggregateResult, FindManyArgs, FindUniqueArgs, GroupByArgs, GroupRow,
    UniqueWhere,
};
use crate::record::{Record, Row};
use crate::filter::Filter;
use crate::schema::SchemaRegistry;
use crate::storage::{ChangeSet, DataSource, Overlay, Tables, View};
use crate::store::StoreInner;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

thread_local! {
    static IN_TRANSACTION: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running a transaction body.
struct NestedGuard;

impl NestedGuard {
    fn enter() -> Result<Self> {
        if IN_TRANSACTION.with(Cell::get) {
            return Err(SkillDbError::NestedTransaction);
        }
        IN_TRANSACTION.with(|flag| flag.set(true));
        Ok(NestedGuard)
    }
}

impl Drop for NestedGuard {
    fn drop(&mut self) {
        IN_TRANSACTION.with(|flag| flag.set(false));
    }
}

pub struct Transaction {
    inner: Arc<StoreInner>,
    id: u64,
    isolation: IsolationLevel,
    snapshot: Arc<Tables>,
    writes: Overlay,
    /// Table versions read under `Serializable`.
    reads: RefCell<BTreeMap<String, u64>>,
    held: Vec<LockKey>,
    deadline: Instant,
    timeout: Duration,
    cancel: Option<CancelToken>,
    _permit: Permit,
}

/// Run `body` in a fresh transaction and commit it when the body succeeds.
/// Any error, including one from the commit itself, leaves no trace.
pub(crate) fn run<T>(
    inner: &Arc<StoreInner>,
    options: TransactionOptions,
    body: impl FnOnce(&mut Transaction) -> Result<T>,
) -> Result<T> {
    let _guard = NestedGuard::enter()?;
    let permit = inner
        .admission
        .acquire(options.max_wait, options.cancel.as_ref())?;
    let mut tx = Transaction::begin(inner, options, permit)?;
    match body(&mut tx) {
        Ok(value) => {
            tx.commit()?;
            Ok(value)
        }
        Err(e) => {
            log::debug!("transaction {} rolled back: {e}", tx.id);
            Err(e)
        }
    }
}

impl Transaction {
    fn begin(inner: &Arc<StoreInner>, options: TransactionOptions, permit: Permit) -> Result<Self> {
        let id = inner.next_tx.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = inner.storage.snapshot()?;
        log::debug!(
            "transaction {id} begins at commit {} ({})",
            snapshot.seq(),
            options.isolation_level
        );
        Ok(Transaction {
            inner: Arc::clone(inner),
            id,
            isolation: options.isolation_level,
            snapshot,
            writes: Overlay::new(),
            reads: RefCell::new(BTreeMap::new()),
            held: Vec::new(),
            deadline: Instant::now() + options.timeout,
            timeout: options.timeout,
            cancel: options.cancel,
            _permit: permit,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    /// Number of rows staged so far.
    pub fn pending_writes(&self) -> usize {
        self.writes.values().map(BTreeMap::len).sum()
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn find_unique(&self, entity: &str, args: impl Into<FindUniqueArgs>) -> Result<Option<Row>> {
        let view = self.read_view()?;
        query::find_unique(&view, entity, &args.into())
    }

    pub fn find_unique_or_throw(&self, entity: &str, args: impl Into<FindUniqueArgs>) -> Result<Row> {
        let view = self.read_view()?;
        query::find_unique_or_throw(&view, entity, &args.into())
    }

    pub fn find_many(&self, entity: &str, args: &FindManyArgs) -> Result<Vec<Row>> {
        let view = self.read_view()?;
        query::find_many(&view, entity, args)
    }

    pub fn find_first(&self, entity: &str, args: &FindManyArgs) -> Result<Option<Row>> {
        let view = self.read_view()?;
        query::find_first(&view, entity, args)
    }

    pub fn find_first_or_throw(&self, entity: &str, args: &FindManyArgs) -> Result<Row> {
        let view = self.read_view()?;
        query::find_first_or_throw(&view, entity, args)
    }

    pub fn count(&self, entity: &str, args: &FindManyArgs) -> Result<u64> {
        let view = self.read_view()?;
        query::count(&view, entity, args)
    }

    pub fn aggregate(&self, entity: &str, args: &AggregateArgs) -> Result<AggregateResult> {
        let view = self.read_view()?;
        query::aggregate(&view, entity, args)
    }

    pub fn group_by(&self, entity: &str, args: &GroupByArgs) -> Result<Vec<GroupRow>> {
        let view = self.read_view()?;
        query::group_by(&view, entity, args)
    }

    // ── Writes ───────────────────────────────────────────────────────

    pub fn create(&mut self, entity: &str, data: WriteData) -> Result<Record> {
        mutation::create(self, entity, &data)
    }

    pub fn create_many(
        &mut self,
        entity: &str,
        data: Vec<WriteData>,
        skip_duplicates: bool,
    ) -> Result<BatchResult> {
        mutation::create_many(self, entity, &data, skip_duplicates)
    }

    pub fn update(&mut self, entity: &str, key: &UniqueWhere, data: WriteData) -> Result<Record> {
        mutation::update(self, entity, key, &data)
    }

    pub fn update_many(
        &mut self,
        entity: &str,
        filter: Option<&Filter>,
        data: WriteData,
        limit: Option<usize>,
    ) -> Result<BatchResult> {
        mutation::update_many(self, entity, filter, &data, limit)
    }

    pub fn upsert(
        &mut self,
        entity: &str,
        key: &UniqueWhere,
        create: WriteData,
        update: WriteData,
    ) -> Result<Record> {
        mutation::upsert(self, entity, key, &create, &update)
    }

    pub fn delete(&mut self, entity: &str, key: &UniqueWhere) -> Result<Record> {
        mutation::delete(self, entity, key)
    }

    pub fn delete_many(
        &mut self,
        entity: &str,
        filter: Option<&Filter>,
        limit: Option<usize>,
    ) -> Result<BatchResult> {
        mutation::delete_many(self, entity, filter, limit)
    }

    /// Run `body` as a unit inside this transaction: when it fails, the
    /// writes it staged are discarded and the transaction continues.
    pub fn atomic<T>(&mut self, body: impl FnOnce(&mut Transaction) -> Result<T>) -> Result<T> {
        let saved = self.writes.clone();
        match body(self) {
            Ok(value) => Ok(value),
            Err(e) => {
                self.writes = saved;
                Err(e)
            }
        }
    }

    // ── Engine access ────────────────────────────────────────────────

    pub(crate) fn registry(&self) -> Arc<SchemaRegistry> {
        Arc::clone(self.inner.storage.registry())
    }

    /// Fail when the caller cancelled or the time budget ran out.
    pub(crate) fn check_live(&self) -> Result<()> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(SkillDbError::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(SkillDbError::TransactionTimeout(format!(
                "transaction {} exceeded {:?}",
                self.id, self.timeout
            )));
        }
        Ok(())
    }

    /// View used by reads: the latest commit or the begin snapshot depending
    /// on isolation, with this transaction's writes on top.
    pub(crate) fn read_view(&self) -> Result<View<'_>> {
        self.check_live()?;
        let registry = self.inner.storage.registry();
        let view = match self.isolation {
            IsolationLevel::ReadUncommitted | IsolationLevel::ReadCommitted => {
                View::new(registry, self.inner.storage.snapshot()?)
            }
            IsolationLevel::RepeatableRead => View::new(registry, Arc::clone(&self.snapshot)),
            IsolationLevel::Serializable => {
                View::new(registry, Arc::clone(&self.snapshot)).tracking_reads(&self.reads)
            }
        };
        Ok(view.with_overlay(&self.writes))
    }

    /// View used by writes to locate rows: always the latest commit, so a
    /// locked row is never acted on in a stale state.
    pub(crate) fn latest_view(&self) -> Result<View<'_>> {
        self.check_live()?;
        Ok(View::new(self.inner.storage.registry(), self.inner.storage.snapshot()?)
            .with_overlay(&self.writes))
    }

    pub(crate) fn lock(&mut self, key: LockKey) -> Result<()> {
        if self.held.contains(&key) {
            return Ok(());
        }
        self.inner
            .locks
            .acquire(&key, self.id, self.deadline, self.cancel.as_ref())?;
        self.held.push(key);
        Ok(())
    }

    /// Lock a row for writing and return its current state, `None` when it
    /// does not exist. Snapshot isolation levels fail when the row changed
    /// after the transaction began.
    pub(crate) fn lock_row(&mut self, entity: &str, id: &str) -> Result<Option<Record>> {
        self.check_live()?;
        self.lock(LockKey::row(entity, id))?;
        let latest = self.inner.storage.snapshot()?;
        if self.isolation.uses_snapshot() && !self.is_staged(entity, id) {
            let version = |tables: &Tables| {
                tables
                    .table(entity)
                    .and_then(|t| t.get(id))
                    .map(|row| row.version)
            };
            if version(&self.snapshot) != version(&latest) {
                return Err(SkillDbError::TransactionConflict(format!(
                    "{entity} {id} was changed by a concurrent commit"
                )));
            }
        }
        View::new(self.inner.storage.registry(), latest)
            .with_overlay(&self.writes)
            .get(entity, id)
    }

    pub(crate) fn is_staged(&self, entity: &str, id: &str) -> bool {
        self.writes
            .get(entity)
            .map(|rows| rows.contains_key(id))
            .unwrap_or(false)
    }

    pub(crate) fn stage(&mut self, entity: &str, id: &str, row: Option<Record>) {
        self.writes
            .entry(entity.to_string())
            .or_default()
            .insert(id.to_string(), row);
    }

    fn commit(&mut self) -> Result<u64> {
        let reads = if self.isolation == IsolationLevel::Serializable {
            self.reads.borrow().clone()
        } else {
            BTreeMap::new()
        };
        let seq = self.inner.storage.commit(
            ChangeSet {
                writes: &self.writes,
                read_tables: &reads,
            },
            || self.check_live(),
        )?;
        log::debug!(
            "transaction {} committed {} rows at {seq}",
            self.id,
            self.pending_writes()
        );
        Ok(seq)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.inner.locks.release_all(self.id, &self.held);
    }
}
