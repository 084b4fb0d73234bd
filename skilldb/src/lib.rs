pub mod config;
pub mod error;
pub mod filter;
pub mod model;
pub mod mutation;
pub mod query;
pub mod record;
pub mod relation;
pub mod schema;
pub mod storage;
pub mod store;
pub mod transaction;
pub mod value;

pub use config::StoreConfig;
pub use error::{ErrorKind, Result, SkillDbError};
pub use filter::Filter;
pub use model::Model;
pub use mutation::{BatchResult, FieldUpdate, NestedWrite, WriteData};
pub use query::{FindManyArgs, FindUniqueArgs, OrderBy, UniqueWhere};
pub use record::{Record, Row};
pub use relation::Include;
pub use schema::SchemaRegistry;
pub use store::{Batch, Collection, Store};
pub use transaction::{CancelToken, IsolationLevel, Transaction, TransactionOptions};
pub use value::Value;
