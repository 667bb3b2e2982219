//! Poll-driven query handle for interactive callers.
//!
//! A `Query<T>` runs its fetcher on a background task and exposes the
//! outcome as a [`QueryState`] that can be checked on every tick without
//! blocking.
//!
//! ```ignore
//! let business = business.clone();
//! let mut query = Query::new(move |cancel| {
//!     let business = business.clone();
//!     async move {
//!         business
//!             .list_clients(ExecuteOptions::new().with_cancel(cancel))
//!             .await
//!     }
//! });
//!
//! query.fetch();
//! // on each tick
//! if query.poll() {
//!     render(query.state());
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;

/// The state of a query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState<T> {
  /// Not started, or the last fetch was cancelled
  Idle,
  Loading,
  Success(T),
  /// Failed; holds the message to show the user
  Error(String),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, FetchError>> + Send>>;

type FetcherFn<T> = Box<dyn Fn(CancellationToken) -> BoxFuture<T> + Send + Sync>;

struct Pending<T> {
  receiver: oneshot::Receiver<Result<T, FetchError>>,
  cancel: CancellationToken,
}

/// Async query with loading, success and error states.
///
/// The fetcher receives a cancellation token that fires when the query is
/// refetched or cancelled. Pass it on to the request layer so the caller
/// detaches without stopping the shared fetch.
pub struct Query<T> {
  state: QueryState<T>,
  fetcher: FetcherFn<T>,
  pending: Option<Pending<T>>,
  fetched_at: Option<Instant>,
  stale_time: Duration,
}

impl<T: Send + 'static> Query<T> {
  pub fn new<F, Fut>(fetcher: F) -> Self
  where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    Self {
      state: QueryState::Idle,
      fetcher: Box::new(move |cancel| Box::pin(fetcher(cancel))),
      pending: None,
      fetched_at: None,
      stale_time: Duration::from_secs(60),
    }
  }

  pub fn with_stale_time(mut self, duration: Duration) -> Self {
    self.stale_time = duration;
    self
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error()
  }

  /// Check if the data is older than the stale time.
  pub fn is_stale(&self) -> bool {
    match &self.state {
      QueryState::Success(_) => self
        .fetched_at
        .map(|t| t.elapsed() > self.stale_time)
        .unwrap_or(true),
      _ => false,
    }
  }

  /// Start fetching unless a fetch is already running.
  pub fn fetch(&mut self) {
    if self.state.is_loading() {
      return;
    }
    self.start_fetch();
  }

  /// Cancel any running fetch and start a new one.
  pub fn refetch(&mut self) {
    self.cancel_pending();
    self.start_fetch();
  }

  /// Cancel the running fetch, if any, and go back to idle.
  pub fn cancel(&mut self) {
    if self.cancel_pending() {
      self.state = QueryState::Idle;
    }
  }

  /// Check for a finished fetch. Returns `true` if the state changed.
  pub fn poll(&mut self) -> bool {
    let Some(pending) = &mut self.pending else {
      return false;
    };

    let outcome = match pending.receiver.try_recv() {
      Ok(outcome) => outcome,
      Err(oneshot::error::TryRecvError::Empty) => return false,
      Err(oneshot::error::TryRecvError::Closed) => Err(FetchError::Aborted),
    };
    self.pending = None;

    self.state = match outcome {
      Ok(data) => {
        self.fetched_at = Some(Instant::now());
        QueryState::Success(data)
      }
      Err(e) => match e.user_message() {
        Some(message) => QueryState::Error(message),
        None => QueryState::Idle,
      },
    };
    true
  }

  fn cancel_pending(&mut self) -> bool {
    match self.pending.take() {
      Some(pending) => {
        pending.cancel.cancel();
        true
      }
      None => false,
    }
  }

  fn start_fetch(&mut self) {
    let (sender, receiver) = oneshot::channel();
    let cancel = CancellationToken::new();
    self.pending = Some(Pending {
      receiver,
      cancel: cancel.clone(),
    });
    self.state = QueryState::Loading;

    let future = (self.fetcher)(cancel);
    tokio::spawn(async move {
      let result = future.await;
      // Receiver is gone after a refetch or cancel.
      let _ = sender.send(result);
    });
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("state", &self.state)
      .field("fetched_at", &self.fetched_at)
      .field("stale_time", &self.stale_time)
      .finish_non_exhaustive()
  }
}
