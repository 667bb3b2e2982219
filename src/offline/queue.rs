//! Durable queue of writes made while the backend was unreachable.
//!
//! Every change to the pending list is written to the durable store before
//! the call returns. Storage failures are logged and the queue keeps going
//! in memory.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use super::mutation::{MutationExecutor, MutationKind, MutationTarget, QueuedMutation};
use super::storage::DurableStore;
use crate::error::PersistenceError;

/// Durable store key holding the serialized pending list
pub const QUEUE_KEY: &str = "offline_mutations";

/// Outcome of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
  pub applied: usize,
  /// Still queued after failing
  pub failed: usize,
  /// Removed because the target no longer exists
  pub abandoned: usize,
  /// Removed because an earlier delete in the same pass made them moot
  pub dropped: usize,
  /// Not attempted, an earlier write to the same record failed this pass
  pub held: usize,
  pub remaining: usize,
}

pub struct OfflineQueue {
  store: Arc<dyn DurableStore>,
  pending: Mutex<Vec<QueuedMutation>>,
  replaying: AtomicBool,
}

/// Clears the replay flag even if the replay future is dropped.
struct ReplayGuard<'a>(&'a AtomicBool);

impl Drop for ReplayGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

impl OfflineQueue {
  /// Open the queue and load whatever the store holds.
  pub fn open(store: Arc<dyn DurableStore>) -> Self {
    let queue = Self {
      store,
      pending: Mutex::new(Vec::new()),
      replaying: AtomicBool::new(false),
    };
    queue.reload();
    queue
  }

  /// Replace the in-memory list with the durable one.
  pub fn reload(&self) -> usize {
    let loaded = match self.load() {
      Ok(loaded) => loaded,
      Err(e) => {
        warn!(error = %e, "failed to load offline queue, starting empty");
        Vec::new()
      }
    };
    let count = loaded.len();
    *self.lock() = loaded;
    if count > 0 {
      info!(count, "loaded pending offline mutations");
    }
    count
  }

  /// Append a mutation. Returns its id once it has been persisted.
  pub fn enqueue(&self, mutation: QueuedMutation) -> String {
    let id = mutation.id.clone();
    let mut pending = self.lock();
    debug!(id = %id, kind = %mutation.kind, target = %mutation.target, "queueing mutation");
    pending.push(mutation);
    self.persist(&pending);
    id
  }

  /// Replay pending mutations in order.
  ///
  /// Returns `None` when another replay is already running.
  pub async fn process_queue(&self, executor: &dyn MutationExecutor) -> Option<ReplayReport> {
    if self
      .replaying
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!("replay already running");
      return None;
    }
    let _guard = ReplayGuard(&self.replaying);

    let snapshot = self.pending();
    let mut report = ReplayReport::default();
    let mut deleted: HashSet<(String, String)> = HashSet::new();
    let mut blocked: HashSet<(String, String)> = HashSet::new();

    for mutation in snapshot {
      let record = mutation
        .target
        .record_id
        .clone()
        .map(|id| (mutation.target.table.clone(), id));

      if mutation.kind != MutationKind::Create
        && record.as_ref().is_some_and(|r| deleted.contains(r))
      {
        info!(id = %mutation.id, target = %mutation.target, "dropping mutation on deleted record");
        self.remove(&mutation.id);
        report.dropped += 1;
        continue;
      }

      // Later writes to a record must not overtake an earlier failed one.
      if record.as_ref().is_some_and(|r| blocked.contains(r)) {
        debug!(id = %mutation.id, target = %mutation.target, "holding mutation behind failed write");
        report.held += 1;
        continue;
      }

      match executor.apply(&mutation).await {
        Ok(_) => {
          debug!(id = %mutation.id, "replayed mutation");
          self.remove(&mutation.id);
          report.applied += 1;
          if mutation.kind == MutationKind::Delete {
            deleted.extend(record);
          }
        }
        Err(e) if e.is_missing_target() => {
          warn!(id = %mutation.id, target = %mutation.target, error = %e, "abandoning mutation, target is gone");
          self.remove(&mutation.id);
          report.abandoned += 1;
          deleted.extend(record);
        }
        Err(e) => {
          warn!(id = %mutation.id, target = %mutation.target, error = %e, "replay failed, keeping mutation queued");
          self.record_failure(&mutation.id, &e.to_string());
          report.failed += 1;
          blocked.extend(record);
        }
      }
    }

    report.remaining = self.len();
    info!(
      applied = report.applied,
      failed = report.failed,
      abandoned = report.abandoned,
      dropped = report.dropped,
      held = report.held,
      remaining = report.remaining,
      "offline replay finished"
    );
    Some(report)
  }

  /// Discard every pending mutation.
  pub fn clear_queue(&self) -> usize {
    let mut pending = self.lock();
    let count = pending.len();
    pending.clear();
    self.persist(&pending);
    info!(count, "cleared offline queue");
    count
  }

  /// Discard one pending mutation.
  pub fn abandon(&self, id: &str) -> bool {
    let removed = self.remove(id);
    if removed {
      info!(id, "abandoned queued mutation");
    }
    removed
  }

  /// Whether a write to the same record is waiting for replay.
  pub fn has_pending_for(&self, target: &MutationTarget) -> bool {
    target.record_id.is_some() && self.lock().iter().any(|m| m.target == *target)
  }

  pub fn pending(&self) -> Vec<QueuedMutation> {
    self.lock().clone()
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  fn lock(&self) -> MutexGuard<'_, Vec<QueuedMutation>> {
    self.pending.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn remove(&self, id: &str) -> bool {
    let mut pending = self.lock();
    let before = pending.len();
    pending.retain(|m| m.id != id);
    let removed = pending.len() != before;
    if removed {
      self.persist(&pending);
    }
    removed
  }

  fn record_failure(&self, id: &str, error: &str) {
    let mut pending = self.lock();
    if let Some(mutation) = pending.iter_mut().find(|m| m.id == id) {
      mutation.attempts += 1;
      mutation.last_error = Some(error.to_string());
      self.persist(&pending);
    }
  }

  fn load(&self) -> Result<Vec<QueuedMutation>, PersistenceError> {
    match self.store.get(QUEUE_KEY)? {
      Some(raw) => Ok(serde_json::from_str(&raw)?),
      None => Ok(Vec::new()),
    }
  }

  fn persist(&self, pending: &[QueuedMutation]) {
    let result = if pending.is_empty() {
      self.store.remove(QUEUE_KEY)
    } else {
      serde_json::to_string(pending)
        .map_err(PersistenceError::from)
        .and_then(|raw| self.store.put(QUEUE_KEY, &raw))
    };
    if let Err(e) = result {
      warn!(error = %e, count = pending.len(), "failed to persist offline queue");
    }
  }
}
