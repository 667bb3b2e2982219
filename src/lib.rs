//! Request orchestration and offline resilience for the business backend.
//!
//! Reads are deduplicated, cached and retried by [`request::RequestManager`].
//! Writes that cannot reach the backend wait in [`offline::OfflineQueue`]
//! until they can be replayed. Calls to rate-sensitive providers go through
//! [`throttle::ThrottledClient`].

pub mod business;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod offline;
pub mod query;
pub mod remote;
pub mod request;
pub mod throttle;

pub use business::BusinessClient;
pub use coordinator::{Coordinator, MutationOutcome};
pub use error::{ErrorClass, FetchError, PersistenceError};
