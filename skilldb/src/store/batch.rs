use super::Store;
use crate::error::Result;
use crate::filter::Filter;
use crate::mutation::{BatchResult, WriteData};
use crate::query::UniqueWhere;
use crate::record::Record;
use crate::transaction::{Transaction, TransactionOptions};
use serde::Serialize;

/// A deferred write operation for batch execution.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Create {
        entity: String,
        data: WriteData,
    },
    CreateMany {
        entity: String,
        data: Vec<WriteData>,
        skip_duplicates: bool,
    },
    Update {
        entity: String,
        key: UniqueWhere,
        data: WriteData,
    },
    UpdateMany {
        entity: String,
        filter: Option<Filter>,
        data: WriteData,
        limit: Option<usize>,
    },
    Upsert {
        entity: String,
        key: UniqueWhere,
        create: WriteData,
        update: WriteData,
    },
    Delete {
        entity: String,
        key: UniqueWhere,
    },
    DeleteMany {
        entity: String,
        filter: Option<Filter>,
        limit: Option<usize>,
    },
}

impl BatchOp {
    fn run(&self, tx: &mut Transaction) -> Result<BatchOutcome> {
        Ok(match self {
            BatchOp::Create { entity, data } => BatchOutcome::Record(tx.create(entity, data.clone())?),
            BatchOp::CreateMany {
                entity,
                data,
                skip_duplicates,
            } => BatchOutcome::Count(tx.create_many(entity, data.clone(), *skip_duplicates)?),
            BatchOp::Update { entity, key, data } => {
                BatchOutcome::Record(tx.update(entity, key, data.clone())?)
            }
            BatchOp::UpdateMany {
                entity,
                filter,
                data,
                limit,
            } => BatchOutcome::Count(tx.update_many(entity, filter.as_ref(), data.clone(), *limit)?),
            BatchOp::Upsert {
                entity,
                key,
                create,
                update,
            } => BatchOutcome::Record(tx.upsert(entity, key, create.clone(), update.clone())?),
            BatchOp::Delete { entity, key } => BatchOutcome::Record(tx.delete(entity, key)?),
            BatchOp::DeleteMany {
                entity,
                filter,
                limit,
            } => BatchOutcome::Count(tx.delete_many(entity, filter.as_ref(), *limit)?),
        })
    }
}

/// Result of one queued operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BatchOutcome {
    Record(Record),
    Count(BatchResult),
}

impl BatchOutcome {
    pub fn record(&self) -> Option<&Record> {
        match self {
            BatchOutcome::Record(record) => Some(record),
            BatchOutcome::Count(_) => None,
        }
    }

    pub fn count(&self) -> Option<u64> {
        match self {
            BatchOutcome::Count(result) => Some(result.count),
            BatchOutcome::Record(_) => None,
        }
    }
}

/// A batch of write operations that execute all-or-nothing in one
/// transaction.
pub struct Batch<'a> {
    store: &'a Store,
    ops: Vec<BatchOp>,
    options: Option<TransactionOptions>,
}

/// A scoped handle for queuing batch writes to one entity.
pub struct BatchCollection<'a, 'b> {
    batch: &'b mut Batch<'a>,
    entity: String,
}

impl<'a> Batch<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Batch {
            store,
            ops: Vec::new(),
            options: None,
        }
    }

    /// Get a handle for queuing operations on an entity.
    pub fn collection(&mut self, entity: &str) -> BatchCollection<'a, '_> {
        BatchCollection {
            batch: self,
            entity: entity.to_string(),
        }
    }

    pub fn push(&mut self, op: BatchOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    /// Run with these options instead of the store defaults.
    pub fn with_options(mut self, options: TransactionOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Execute all queued operations in order, in one transaction. The
    /// first failure discards every earlier operation as well.
    pub fn execute(self) -> Result<Vec<BatchOutcome>> {
        let options = self
            .options
            .unwrap_or_else(|| self.store.default_options());
        let ops = self.ops;
        self.store.transaction(options, |tx| {
            let mut outcomes = Vec::with_capacity(ops.len());
            for (i, op) in ops.iter().enumerate() {
                let outcome = op.run(tx).map_err(|e| {
                    log::debug!("batch operation {i} failed: {e}");
                    e
                })?;
                outcomes.push(outcome);
            }
            Ok(outcomes)
        })
    }
}

impl<'a, 'b> BatchCollection<'a, 'b> {
    pub fn create(&mut self, data: WriteData) -> &mut Self {
        self.batch.ops.push(BatchOp::Create {
            entity: self.entity.clone(),
            data,
        });
        self
    }

    pub fn create_many(&mut self, data: Vec<WriteData>, skip_duplicates: bool) -> &mut Self {
        self.batch.ops.push(BatchOp::CreateMany {
            entity: self.entity.clone(),
            data,
            skip_duplicates,
        });
        self
    }

    pub fn update(&mut self, key: UniqueWhere, data: WriteData) -> &mut Self {
        self.batch.ops.push(BatchOp::Update {
            entity: self.entity.clone(),
            key,
            data,
        });
        self
    }

    pub fn update_many(
        &mut self,
        filter: Option<Filter>,
        data: WriteData,
        limit: Option<usize>,
    ) -> &mut Self {
        self.batch.ops.push(BatchOp::UpdateMany {
            entity: self.entity.clone(),
            filter,
            data,
            limit,
        });
        self
    }

    pub fn upsert(&mut self, key: UniqueWhere, create: WriteData, update: WriteData) -> &mut Self {
        self.batch.ops.push(BatchOp::Upsert {
            entity: self.entity.clone(),
            key,
            create,
            update,
        });
        self
    }

    pub fn delete(&mut self, key: UniqueWhere) -> &mut Self {
        self.batch.ops.push(BatchOp::Delete {
            entity: self.entity.clone(),
            key,
        });
        self
    }

    pub fn delete_many(&mut self, filter: Option<Filter>, limit: Option<usize>) -> &mut Self {
        self.batch.ops.push(BatchOp::DeleteMany {
            entity: self.entity.clone(),
            filter,
            limit,
        });
        self
    }
}
