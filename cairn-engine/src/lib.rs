//! The per-variable transaction engine.
//!
//! Every replicated variable is a single-threaded state machine: a stack
//! of [frames](frame) tracking committed and proposed states, advanced by
//! transaction outcomes and persisted through the storage contract. A
//! [`VarDispatcher`] owns the executor, partitioned by variable uuid, so
//! that at most one task at a time ever runs against a given variable.

#![warn(clippy::pedantic)]

mod error;
mod fjall_store;
mod frame;
mod manager;
mod poisson;
mod storage;
mod var;

pub use error::EngineError;
pub use fjall_store::FjallStorage;
pub use manager::{LocalAction, OutcomeDelivery, VarDispatcher, VarEvent};
pub use poisson::Poisson;
pub use storage::{MemoryStorage, Snapshot, Storage, StorageError, WriteBatch};
