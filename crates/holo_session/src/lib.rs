//! HoloSession: interactive, statement-at-a-time SQL sessions over a backend
//! whose read/write transactions are one-shot callbacks.
//!
//! The backend runs a callback inside a transaction, may retry it, and commits
//! atomically once it returns. It has no savepoints, no partial rollback and a
//! hard per-commit mutation ceiling. This crate layers on top of it:
//! - a transaction worker thread that drives the callback interactively,
//! - a session facade over the read/write, read-only and batch read-only
//!   primitives,
//! - savepoints emulated over the buffered mutation log,
//! - a planner that turns key-addressed DML into point mutations and hands
//!   everything else to the DML compiler, which can opt into committing large
//!   statements in batches on a side connection.

pub mod backend;
pub mod batch_size;
pub mod config;
pub mod connection;
pub mod dml;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod metadata;
pub mod mutation;
pub mod params;
pub mod predicates;
pub mod savepoint;
pub mod session;
pub mod statement;
pub mod worker;

pub use backend::{
    BatchReadOnlyTransaction, BatchTransactionId, DatabaseClient, Partition, PartitionOptions,
    QueryStatement, ReadOnlyTransaction, ResultSet, SchemaCatalog, Timestamp, TransactionContext,
    TransactionWork,
};
pub use config::SessionConfig;
pub use connection::{Connection, ExecuteResult};
pub use dml::{run_dml, ConversionResult, TablePartKind, TablePartWorker};
pub use error::{BackendError, ErrorCode, SessionError, SessionResult};
#[cfg(any(test, feature = "testing"))]
pub use memory::{CommitRecord, MemoryDatabase, TableDefinition};
pub use mutation::{Key, Mutation, MutationBuilder, MutationOp};
pub use params::ParameterStore;
pub use savepoint::{Savepoint, SavepointLedger};
pub use session::{TransactionMode, TransactionSession};
pub use worker::{InterruptHandle, TransactionWorker, WorkerState};
