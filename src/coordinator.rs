//! Process-wide orchestration state with an explicit lifecycle.
//!
//! A [`Coordinator`] owns the query cache, the offline queue and the replay
//! loop. Create one with [`Coordinator::init`], pass it where it is needed,
//! and call [`Coordinator::teardown`] before exit.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheResult, QueryCache, QueryKey};
use crate::config::Config;
use crate::error::FetchError;
use crate::offline::{
  DurableStore, MemoryStore, MutationExecutor, OfflineQueue, QueuedMutation, ReplayReport,
  SqliteStore,
};
use crate::remote::types::Resource;
use crate::request::{ExecuteOptions, ManagerSettings, RequestManager, RequestStatCounters};

/// What happened to a write.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
  /// Applied by the backend, with the returned row
  Applied(Value),
  /// Backend unreachable; stored for replay
  Queued { id: String, reason: FetchError },
  /// Not attempted; queued behind earlier writes to the same record
  Deferred { id: String },
}

pub struct Coordinator {
  cache: QueryCache<Value>,
  queue: Arc<OfflineQueue>,
  executor: Arc<dyn MutationExecutor>,
  replay_task: Mutex<Option<JoinHandle<()>>>,
  shutdown: CancellationToken,
}

impl Coordinator {
  /// Build the coordinator and load pending mutations from `store`.
  pub fn init(
    config: &Config,
    executor: Arc<dyn MutationExecutor>,
    store: Arc<dyn DurableStore>,
  ) -> Self {
    let manager = RequestManager::new(ManagerSettings::from_config(config));
    let queue = Arc::new(OfflineQueue::open(store));
    info!(pending = queue.len(), "coordinator initialized");

    Self {
      cache: QueryCache::new(manager),
      queue,
      executor,
      replay_task: Mutex::new(None),
      shutdown: CancellationToken::new(),
    }
  }

  /// Open the durable queue at the configured location and initialize.
  ///
  /// Falls back to an in-memory queue when the database cannot be opened.
  pub fn open(config: &Config, executor: Arc<dyn MutationExecutor>) -> Self {
    let opened = match &config.queue.path {
      Some(path) => SqliteStore::open_at(path),
      None => SqliteStore::open(),
    };
    let store: Arc<dyn DurableStore> = match opened {
      Ok(store) => Arc::new(store),
      Err(e) => {
        warn!(error = %e, "offline queue storage unavailable, keeping queue in memory");
        Arc::new(MemoryStore::new())
      }
    };
    Self::init(config, executor, store)
  }

  pub fn cache(&self) -> &QueryCache<Value> {
    &self.cache
  }

  pub fn queue(&self) -> &OfflineQueue {
    &self.queue
  }

  pub fn stats(&self) -> RequestStatCounters {
    self.cache.manager().stats()
  }

  /// Cached read, decoded into `T`.
  pub async fn read<T, K, F, Fut>(
    &self,
    query: &K,
    fetcher: F,
    options: ExecuteOptions,
  ) -> Result<CacheResult<T>, FetchError>
  where
    T: DeserializeOwned,
    K: QueryKey + ?Sized,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
  {
    let result = self.cache.read(query, fetcher, options).await?;
    let data = serde_json::from_value(result.data.clone()).map_err(|e| {
      FetchError::permanent(
        None,
        format!("unexpected response for {}: {e}", query.description()),
      )
    })?;
    Ok(result.map(|_| data))
  }

  /// Apply a write, or queue it when the backend is unreachable.
  ///
  /// A write to a record with pending writes is queued behind them
  /// without being attempted.
  pub async fn mutate(&self, mutation: QueuedMutation) -> Result<MutationOutcome, FetchError> {
    if self.queue.has_pending_for(&mutation.target) {
      debug!(target = %mutation.target, "record has queued writes, deferring");
      let id = self.queue.enqueue(mutation);
      return Ok(MutationOutcome::Deferred { id });
    }

    match self.executor.apply(&mutation).await {
      Ok(row) => {
        invalidate_table(&self.cache, &mutation.target.table);
        Ok(MutationOutcome::Applied(row))
      }
      Err(e) if e.is_retryable() => {
        warn!(target = %mutation.target, error = %e, "write failed, queueing for replay");
        let id = self.queue.enqueue(mutation);
        Ok(MutationOutcome::Queued { id, reason: e })
      }
      Err(e) => Err(e),
    }
  }

  /// Replay the offline queue now.
  ///
  /// Returns `None` when a replay is already running.
  pub async fn replay(&self) -> Option<ReplayReport> {
    replay_once(&self.queue, self.executor.as_ref(), &self.cache).await
  }

  /// Replay the queue every `period` until teardown.
  pub fn spawn_replay_loop(&self, period: Duration) {
    let queue = Arc::clone(&self.queue);
    let executor = Arc::clone(&self.executor);
    let cache = self.cache.clone();
    let shutdown = self.shutdown.clone();

    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          _ = shutdown.cancelled() => break,
          _ = ticker.tick() => {
            if !queue.is_empty() {
              replay_once(&queue, executor.as_ref(), &cache).await;
            }
          }
        }
      }
      debug!("replay loop stopped");
    });

    let previous = self
      .replay_task
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .replace(handle);
    if let Some(previous) = previous {
      previous.abort();
    }
  }

  /// Drop cached data and statistics. The offline queue is kept.
  pub fn reset(&self) {
    self.cache.manager().reset();
    info!("coordinator reset");
  }

  /// Stop background work.
  pub async fn teardown(&self) {
    self.shutdown.cancel();
    let handle = self
      .replay_task
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(handle) = handle {
      if let Err(e) = handle.await {
        if !e.is_cancelled() {
          warn!(error = %e, "replay loop ended abnormally");
        }
      }
    }
    info!(pending = self.queue.len(), "coordinator stopped");
  }
}

async fn replay_once(
  queue: &OfflineQueue,
  executor: &dyn MutationExecutor,
  cache: &QueryCache<Value>,
) -> Option<ReplayReport> {
  let mut tables: Vec<String> = queue
    .pending()
    .into_iter()
    .map(|m| m.target.table)
    .collect();
  tables.sort();
  tables.dedup();

  let report = queue.process_queue(executor).await?;
  if report.applied > 0 || report.abandoned > 0 {
    for table in &tables {
      invalidate_table(cache, table);
    }
  }
  Some(report)
}

fn invalidate_table(cache: &QueryCache<Value>, table: &str) {
  match Resource::from_table(table) {
    Some(resource) => cache.invalidate_resource(resource),
    None => cache.invalidate(table),
  };
}
