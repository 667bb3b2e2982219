//! Offline mutation queue.
//!
//! Writes that fail with a retryable error are queued durably and replayed
//! in order once the backend is reachable again.

mod mutation;
mod queue;
mod storage;

pub use mutation::{MutationExecutor, MutationKind, MutationTarget, QueuedMutation};
pub use queue::{OfflineQueue, ReplayReport, QUEUE_KEY};
pub use storage::{DurableStore, MemoryStore, SqliteStore};
