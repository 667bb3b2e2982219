//! Query cache: typed keys, entry lifetimes and invalidation generations.
//!
//! - Entries go stale after `stale_after` and are dropped after `expire_after`
//! - Invalidation bumps a per-key generation, so results of fetches that
//!   started before it are never stored
//! - Keys are `resource:operation[:digest]`, invalidated by resource prefix

pub mod coordinator;
pub mod entry;
pub mod key;
pub mod store;
mod traits;

pub use coordinator::QueryCache;
pub use key::ResourceQuery;
pub use traits::{CacheResult, CacheSource, QueryKey};
