//! Backing store: immutable table snapshots swapped atomically on commit.
//!
//! Readers clone an `Arc<Tables>` and never block writers. A commit builds
//! the next snapshot from the current one plus a transaction's staged writes,
//! re-checks unique and foreign-key constraints against the result, writes it
//! through to the journal when one is configured and only then publishes it.

mod journal;

pub use journal::{Journal, JournalRow};

use crate::error::{Result, SkillDbError};
use crate::filter::{CompiledFilter, RelatedRows};
use crate::record::Record;
use crate::schema::{EntityDescriptor, RelationDescriptor, RelationSide, SchemaRegistry, ID_FIELD};
use crate::value::Value;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

/// Staged writes: entity -> id -> new row, `None` for a delete.
pub type Overlay = BTreeMap<String, BTreeMap<String, Option<Record>>>;

/// Read access used by the query executor and relation resolver.
pub trait DataSource {
    fn registry(&self) -> &SchemaRegistry;

    fn get(&self, entity: &str, id: &str) -> Result<Option<Record>>;

    /// Rows of `entity` in id order, restricted to `field == value` when an
    /// equality is given.
    fn scan(&self, entity: &str, eq: Option<(&str, &Value)>) -> Result<Vec<Record>>;

    /// Number of rows of `entity` with `field == value` that pass `filter`,
    /// evaluated against the stored rows without copying them out.
    fn count_matching(
        &self,
        entity: &str,
        eq: (&str, &Value),
        filter: &CompiledFilter,
    ) -> Result<u64>;
}

impl<S: DataSource> RelatedRows for S {
    fn related(&self, relation: &RelationDescriptor, record: &Record) -> Result<Vec<Record>> {
        match &relation.side {
            RelationSide::Owning { foreign_key, .. } => match record.get(foreign_key).as_str() {
                Some(parent) => Ok(self.get(&relation.target, parent)?.into_iter().collect()),
                None => Ok(Vec::new()),
            },
            RelationSide::Inverse { foreign_key, .. } => {
                let key = Value::String(record.id().to_string());
                self.scan(&relation.target, Some((foreign_key, &key)))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredRow {
    pub record: Arc<Record>,
    /// Commit sequence that last wrote this row.
    pub version: u64,
}

#[derive(Debug, Clone)]
struct Index {
    fields: Vec<String>,
    entries: HashMap<String, BTreeSet<String>>,
}

/// Rows of one entity plus secondary indexes on its unique keys and foreign
/// keys. Null keys are not indexed.
#[derive(Debug, Clone)]
pub struct Table {
    rows: BTreeMap<String, StoredRow>,
    indexes: Vec<Index>,
    version: u64,
}

/// Index key for a tuple of values, `None` when any of them is null.
pub(crate) fn composite_key(values: &[&Value]) -> Option<String> {
    if values.iter().any(|v| v.is_null()) {
        return None;
    }
    let keys: Vec<String> = values.iter().map(|v| v.index_key()).collect();
    Some(keys.join("\u{1e}"))
}

impl Table {
    pub fn new(entity: &EntityDescriptor) -> Self {
        let mut index_fields: Vec<Vec<String>> = entity
            .unique_constraints
            .iter()
            .filter(|c| c.fields != [ID_FIELD])
            .map(|c| c.fields.clone())
            .collect();
        for relation in entity.owning_relations() {
            let fk = vec![relation.foreign_key().to_string()];
            if !index_fields.contains(&fk) {
                index_fields.push(fk);
            }
        }
        Table {
            rows: BTreeMap::new(),
            indexes: index_fields
                .into_iter()
                .map(|fields| Index {
                    fields,
                    entries: HashMap::new(),
                })
                .collect(),
            version: 0,
        }
    }

    pub fn get(&self, id: &str) -> Option<&StoredRow> {
        self.rows.get(id)
    }

    pub fn rows(&self) -> impl Iterator<Item = &StoredRow> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Commit sequence of the last write to this table.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_indexed(&self, fields: &[&str]) -> bool {
        self.index_for(fields).is_some()
    }

    fn index_for(&self, fields: &[&str]) -> Option<&Index> {
        self.indexes
            .iter()
            .find(|idx| idx.fields.iter().map(String::as_str).eq(fields.iter().copied()))
    }

    /// Ids of rows whose `fields` equal `values`, or `None` when no index
    /// covers exactly these fields.
    pub fn lookup(&self, fields: &[&str], values: &[&Value]) -> Option<Vec<&str>> {
        let index = self.index_for(fields)?;
        let Some(key) = composite_key(values) else {
            return Some(Vec::new());
        };
        Some(
            index
                .entries
                .get(&key)
                .map(|ids| ids.iter().map(String::as_str).collect())
                .unwrap_or_default(),
        )
    }

    fn put(&mut self, record: Record, version: u64) {
        let id = record.id().to_string();
        self.remove(&id);
        for index in &mut self.indexes {
            let values: Vec<&Value> = index.fields.iter().map(|f| record.get(f)).collect();
            if let Some(key) = composite_key(&values) {
                index.entries.entry(key).or_default().insert(id.clone());
            }
        }
        self.rows.insert(
            id,
            StoredRow {
                record: Arc::new(record),
                version,
            },
        );
    }

    fn remove(&mut self, id: &str) {
        let Some(old) = self.rows.remove(id) else {
            return;
        };
        for index in &mut self.indexes {
            let values: Vec<&Value> = index.fields.iter().map(|f| old.record.get(f)).collect();
            if let Some(key) = composite_key(&values) {
                if let Some(ids) = index.entries.get_mut(&key) {
                    ids.remove(id);
                    if ids.is_empty() {
                        index.entries.remove(&key);
                    }
                }
            }
        }
    }
}

/// One immutable snapshot of every table.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    tables: BTreeMap<String, Arc<Table>>,
    seq: u64,
}

impl Tables {
    pub fn new(registry: &SchemaRegistry) -> Result<Self> {
        let mut tables = BTreeMap::new();
        for name in registry.entity_names() {
            tables.insert(name.to_string(), Arc::new(Table::new(registry.entity(name)?)));
        }
        Ok(Tables { tables, seq: 0 })
    }

    pub fn table(&self, entity: &str) -> Option<&Table> {
        self.tables.get(entity).map(|t| &**t)
    }

    /// Sequence number of the commit that produced this snapshot.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// Writes and read-set of a transaction, handed to [`Storage::commit`].
pub struct ChangeSet<'a> {
    pub writes: &'a Overlay,
    /// Table versions observed by a serializable transaction.
    pub read_tables: &'a BTreeMap<String, u64>,
}

pub struct Storage {
    registry: Arc<SchemaRegistry>,
    state: RwLock<Arc<Tables>>,
    /// Serializes commits; holds the journal when the store is persistent.
    journal: Mutex<Option<Journal>>,
    journal_path: Option<PathBuf>,
}

impl Storage {
    /// Open storage, replaying the journal at `path` when one is given.
    pub fn open(registry: Arc<SchemaRegistry>, path: Option<&Path>) -> Result<Self> {
        let mut tables = Tables::new(&registry)?;
        let journal = match path {
            Some(path) => {
                let journal = Journal::open(path)?;
                let hash = registry.schema_hash();
                match journal.last_schema_hash()? {
                    Some(last) if last == hash => {}
                    last => {
                        if last.is_some() {
                            log::info!("schema changed since last open, now {hash}");
                        }
                        journal.record_schema(hash)?;
                    }
                }
                let (seq, rows) = journal.load()?;
                replay(&registry, &mut tables, rows)?;
                tables.seq = seq;
                log::info!(
                    "opened journal {} at commit {seq}",
                    path.display()
                );
                Some(journal)
            }
            None => None,
        };

        Ok(Storage {
            registry,
            state: RwLock::new(Arc::new(tables)),
            journal: Mutex::new(journal),
            journal_path: path.map(Path::to_path_buf),
        })
    }

    pub fn in_memory(registry: Arc<SchemaRegistry>) -> Result<Self> {
        Self::open(registry, None)
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal_path.as_deref()
    }

    /// Live row counts per entity as recorded in the journal, `None` for an
    /// in-memory store.
    pub fn persisted_counts(&self) -> Result<Option<Vec<(String, u64)>>> {
        let journal = self
            .journal
            .lock()
            .map_err(|_| SkillDbError::poisoned("commit latch"))?;
        journal.as_ref().map(Journal::counts).transpose()
    }

    /// The latest committed snapshot.
    pub fn snapshot(&self) -> Result<Arc<Tables>> {
        self.state
            .read()
            .map(|state| Arc::clone(&state))
            .map_err(|_| SkillDbError::poisoned("table state"))
    }

    /// Apply a change set atomically and return the new commit sequence.
    ///
    /// `gate` runs after every check has passed and before anything becomes
    /// visible; an error from it abandons the commit with no effect.
    pub fn commit(
        &self,
        changes: ChangeSet<'_>,
        gate: impl FnOnce() -> Result<()>,
    ) -> Result<u64> {
        let mut journal = self
            .journal
            .lock()
            .map_err(|_| SkillDbError::poisoned("commit latch"))?;
        let current = self.snapshot()?;

        for (entity, seen) in changes.read_tables {
            let now = current.table(entity).map(Table::version).unwrap_or(0);
            if now != *seen {
                return Err(SkillDbError::TransactionConflict(format!(
                    "{entity} was modified by a concurrent commit"
                )));
            }
        }

        let row_count: usize = changes.writes.values().map(BTreeMap::len).sum();
        if row_count == 0 {
            gate()?;
            return Ok(current.seq);
        }

        let seq = current.seq + 1;
        let mut next = (*current).clone();
        for (entity, rows) in changes.writes {
            let base = next.tables.get(entity).ok_or_else(|| {
                SkillDbError::Schema(format!("Unknown entity '{entity}'"))
            })?;
            let mut table = (**base).clone();
            for (id, row) in rows {
                match row {
                    Some(record) => table.put(record.clone(), seq),
                    None => table.remove(id),
                }
            }
            table.version = seq;
            next.tables.insert(entity.clone(), Arc::new(table));
        }
        next.seq = seq;

        self.check_constraints(&next, changes.writes)?;
        gate()?;

        if let Some(journal) = journal.as_mut() {
            journal.persist(seq, changes.writes)?;
        }
        let mut state = self
            .state
            .write()
            .map_err(|_| SkillDbError::poisoned("table state"))?;
        *state = Arc::new(next);
        log::debug!("committed seq {seq} ({row_count} rows)");
        Ok(seq)
    }

    fn check_constraints(&self, next: &Tables, writes: &Overlay) -> Result<()> {
        for (entity, rows) in writes {
            let descriptor = self.registry.entity(entity)?;
            let Some(table) = next.table(entity) else {
                continue;
            };
            for (id, row) in rows {
                match row {
                    Some(record) => check_row(next, descriptor, table, record)?,
                    None => {
                        let key = Value::String(id.clone());
                        for incoming in self.registry.incoming_relations(entity) {
                            let fk = incoming.foreign_key();
                            let referencing = next
                                .table(&incoming.entity)
                                .map(|t| orphan_count(t, fk, &key))
                                .unwrap_or(0);
                            if referencing > 0 {
                                return Err(SkillDbError::integrity(&incoming.entity, fk));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Unique keys and foreign keys of one row stored in `table`, checked
/// against the whole snapshot.
fn check_row(
    tables: &Tables,
    descriptor: &EntityDescriptor,
    table: &Table,
    record: &Record,
) -> Result<()> {
    let entity = descriptor.name.as_str();
    for constraint in &descriptor.unique_constraints {
        if constraint.fields == [ID_FIELD] {
            continue;
        }
        let fields: Vec<&str> = constraint.fields.iter().map(String::as_str).collect();
        let values: Vec<&Value> = fields.iter().map(|f| record.get(f)).collect();
        let holders = table.lookup(&fields, &values).unwrap_or_default();
        if holders.len() > 1 {
            return Err(SkillDbError::unique(entity, &constraint.name));
        }
    }
    for relation in descriptor.owning_relations() {
        let fk = relation.foreign_key();
        if let Some(parent) = record.get(fk).as_str() {
            let exists = tables
                .table(&relation.target)
                .map(|t| t.get(parent).is_some())
                .unwrap_or(false);
            if !exists {
                return Err(SkillDbError::integrity(entity, fk));
            }
        }
    }
    Ok(())
}

fn orphan_count(table: &Table, fk: &str, key: &Value) -> usize {
    match table.lookup(&[fk], &[key]) {
        Some(ids) => ids.len(),
        None => table.rows().filter(|r| r.record.get(fk) == key).count(),
    }
}

/// Rebuild tables from journal rows. Rows the schema cannot read are
/// skipped; the rebuilt tables must still satisfy every constraint.
fn replay(registry: &SchemaRegistry, tables: &mut Tables, rows: Vec<JournalRow>) -> Result<()> {
    let mut staged: BTreeMap<String, Table> = BTreeMap::new();
    for row in rows {
        let Ok(descriptor) = registry.entity(&row.entity) else {
            log::warn!("skipping journal row {}/{}: unknown entity", row.entity, row.id);
            continue;
        };
        let json: serde_json::Value = match serde_json::from_str(&row.data_json) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("skipping journal row {}/{}: {e}", row.entity, row.id);
                continue;
            }
        };
        let record = match Record::from_json(descriptor, &json) {
            Ok(record) => record,
            Err(e) => {
                log::warn!("skipping journal row {}/{}: {e}", row.entity, row.id);
                continue;
            }
        };
        let table = staged
            .entry(row.entity.clone())
            .or_insert_with(|| Table::new(descriptor));
        table.version = table.version.max(row.version);
        table.put(record, row.version);
    }
    for (entity, table) in staged {
        tables.tables.insert(entity, Arc::new(table));
    }

    for (entity, table) in &tables.tables {
        let descriptor = registry.entity(entity)?;
        for row in table.rows() {
            check_row(tables, descriptor, table, &row.record).map_err(|e| {
                SkillDbError::StorageUnavailable(format!(
                    "journal row {entity}/{} is inconsistent: {e}",
                    row.record.id()
                ))
            })?;
        }
    }
    Ok(())
}

/// A read view: a committed snapshot, optionally overlaid with a
/// transaction's staged writes.
pub struct View<'a> {
    registry: &'a SchemaRegistry,
    base: Arc<Tables>,
    overlay: Option<&'a Overlay>,
    reads: Option<&'a RefCell<BTreeMap<String, u64>>>,
}

impl<'a> View<'a> {
    pub fn new(registry: &'a SchemaRegistry, base: Arc<Tables>) -> Self {
        View {
            registry,
            base,
            overlay: None,
            reads: None,
        }
    }

    pub fn with_overlay(mut self, overlay: &'a Overlay) -> Self {
        self.overlay = Some(overlay);
        self
    }

    /// Record the version of every table this view reads.
    pub fn tracking_reads(mut self, reads: &'a RefCell<BTreeMap<String, u64>>) -> Self {
        self.reads = Some(reads);
        self
    }

    pub fn base(&self) -> &Arc<Tables> {
        &self.base
    }

    fn table(&self, entity: &str) -> Result<&Table> {
        let table = self
            .base
            .table(entity)
            .ok_or_else(|| SkillDbError::Schema(format!("Unknown entity '{entity}'")))?;
        if let Some(reads) = self.reads {
            reads
                .borrow_mut()
                .entry(entity.to_string())
                .or_insert(table.version());
        }
        Ok(table)
    }

    fn staged(&self, entity: &str) -> Option<&'a BTreeMap<String, Option<Record>>> {
        self.overlay.and_then(|o| o.get(entity))
    }
}

impl DataSource for View<'_> {
    fn registry(&self) -> &SchemaRegistry {
        self.registry
    }

    fn get(&self, entity: &str, id: &str) -> Result<Option<Record>> {
        if let Some(slot) = self.staged(entity).and_then(|rows| rows.get(id)) {
            return Ok(slot.clone());
        }
        Ok(self.table(entity)?.get(id).map(|row| (*row.record).clone()))
    }

    fn scan(&self, entity: &str, eq: Option<(&str, &Value)>) -> Result<Vec<Record>> {
        let table = self.table(entity)?;
        let staged = self.staged(entity);
        let is_staged =
            |id: &str| -> bool { staged.map(|rows| rows.contains_key(id)).unwrap_or(false) };
        let wanted = |record: &Record| -> bool {
            match eq {
                Some((field, value)) => record.get(field).matches(value, false),
                None => true,
            }
        };

        let mut out: Vec<Record> = match eq.and_then(|(f, v)| table.lookup(&[f], &[v])) {
            Some(ids) => ids
                .into_iter()
                .filter(|id| !is_staged(*id))
                .filter_map(|id| table.get(id))
                .map(|row| (*row.record).clone())
                .collect(),
            None => table
                .rows()
                .filter(|row| !is_staged(row.record.id()) && wanted(row.record.as_ref()))
                .map(|row| (*row.record).clone())
                .collect(),
        };
        if let Some(rows) = staged {
            out.extend(rows.values().flatten().filter(|r| wanted(*r)).cloned());
        }
        out.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(out)
    }

    fn count_matching(
        &self,
        entity: &str,
        (field, value): (&str, &Value),
        filter: &CompiledFilter,
    ) -> Result<u64> {
        let table = self.table(entity)?;
        let staged = self.staged(entity);
        let is_staged =
            |id: &str| -> bool { staged.map(|rows| rows.contains_key(id)).unwrap_or(false) };

        let mut n = 0;
        match table.lookup(&[field], &[value]) {
            Some(ids) => {
                for id in ids.into_iter().filter(|id| !is_staged(*id)) {
                    if filter.is_trivial() {
                        n += 1;
                    } else if let Some(row) = table.get(id) {
                        if filter.matches(row.record.as_ref(), self)? {
                            n += 1;
                        }
                    }
                }
            }
            None => {
                for row in table.rows() {
                    let record = row.record.as_ref();
                    if !is_staged(record.id())
                        && record.get(field).matches(value, false)
                        && filter.matches(record, self)?
                    {
                        n += 1;
                    }
                }
            }
        }
        if let Some(rows) = staged {
            for record in rows.values().flatten() {
                if record.get(field).matches(value, false) && filter.matches(record, self)? {
                    n += 1;
                }
            }
        }
        Ok(n)
    }
}
