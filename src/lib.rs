//! Operation-log reconciliation and synchronization for replicated
//! documents.
//!
//! Every document is an append-only log of operations per scope. Replicas
//! exchange batches of operations (strands); the [`engine::Engine`]
//! rebases incoming batches onto the stored history, applies them through
//! a registered [`replay::DocumentModel`], persists the result and fans
//! the new revisions out to listeners. Conflicting edits are detected by
//! comparing per-operation state hashes and surface as
//! [`engine::OperationError::Conflict`] instead of corrupting the log.

pub mod document;
pub mod drive;
pub mod engine;
pub mod history;
pub mod listener;
pub mod queue;
pub mod replay;
pub mod storage;
pub mod sync;
pub mod transmitter;

pub use document::{Action, Document, Operation, Scope};
pub use engine::{Engine, EngineError, EngineOptions, OperationError, OperationResult};
pub use replay::{DocumentModel, ModelRegistry};
pub use storage::{memory::MemoryStorage, Storage, StorageError};
pub use sync::{SyncStatus, SyncUnitId};
