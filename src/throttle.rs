//! Per-destination outbound throttle.
//!
//! Calls are queued and sent one at a time by a single drain task, at most
//! one per `min_interval`, in the order they were queued. A rate-limited
//! call is retransmitted once after the provider's retry-after.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{header, Method};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};
use url::Url;

use crate::config::MessagingConfig;
use crate::error::FetchError;
use crate::remote::client::{classify_response, map_reqwest_error};
use crate::remote::RemoteOutcome;

/// Wait applied when a rate-limit response carries no retry-after
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);
/// Longest wait before the single retransmission
const MAX_RETRY_AFTER_WAIT: Duration = Duration::from_secs(10);

/// One outbound call, relative to the destination's base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
  pub method: Method,
  pub path: String,
  pub body: Option<Value>,
}

impl OutboundRequest {
  pub fn post(path: impl Into<String>, body: Value) -> Self {
    Self {
      method: Method::POST,
      path: path.into(),
      body: Some(body),
    }
  }
}

/// Sends a single request and classifies the response.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: &OutboundRequest) -> Result<RemoteOutcome<Value>, FetchError>;
}

/// HTTPS transport with bearer authentication.
pub struct HttpTransport {
  http: reqwest::Client,
  base: Url,
  token: String,
}

impl HttpTransport {
  pub fn new(base_url: &str, token: String) -> Result<Self> {
    let raw = if base_url.ends_with('/') {
      base_url.to_string()
    } else {
      format!("{base_url}/")
    };
    let base = Url::parse(&raw).map_err(|e| eyre!("Invalid url {}: {}", base_url, e))?;

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(30))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { http, base, token })
  }

  pub fn for_messaging(config: &MessagingConfig, token: String) -> Result<Self> {
    Self::new(&config.url, token)
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: &OutboundRequest) -> Result<RemoteOutcome<Value>, FetchError> {
    let url = self
      .base
      .join(request.path.trim_start_matches('/'))
      .map_err(|e| FetchError::permanent(None, format!("invalid path {}: {e}", request.path)))?;

    let mut builder = self
      .http
      .request(request.method.clone(), url)
      .header(header::AUTHORIZATION, format!("Bearer {}", self.token));
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder.send().await.map_err(map_reqwest_error)?;
    Ok(classify_response(response).await)
  }
}

/// Result of a throttled call.
#[derive(Debug, Clone, PartialEq)]
pub enum Throttled<T> {
  Delivered(T),
  /// Rate-limited again after the one retransmission
  RateLimited,
}

impl<T> Throttled<T> {
  pub fn into_result(self) -> Result<T, FetchError> {
    match self {
      Self::Delivered(value) => Ok(value),
      Self::RateLimited => Err(FetchError::rate_limited(None)),
    }
  }
}

struct Job {
  request: OutboundRequest,
  reply: oneshot::Sender<Result<Throttled<Value>, FetchError>>,
}

/// Handle to the drain task of one destination. Clones share the queue.
#[derive(Clone)]
pub struct ThrottledClient {
  destination: Arc<str>,
  sender: mpsc::UnboundedSender<Job>,
  drain: AbortHandle,
}

impl ThrottledClient {
  /// Start the drain task for `destination`. Must be called within a runtime.
  pub fn spawn(
    destination: impl Into<String>,
    transport: Arc<dyn Transport>,
    min_interval: Duration,
  ) -> Self {
    let destination: String = destination.into();
    let destination: Arc<str> = destination.into();
    let (sender, receiver) = mpsc::unbounded_channel();
    let handle = tokio::spawn(drain(
      Arc::clone(&destination),
      transport,
      min_interval,
      receiver,
    ));

    Self {
      destination,
      sender,
      drain: handle.abort_handle(),
    }
  }

  pub fn for_messaging(config: &MessagingConfig, token: String) -> Result<Self> {
    let transport = HttpTransport::for_messaging(config, token)?;
    Ok(Self::spawn(
      config.url.clone(),
      Arc::new(transport),
      Duration::from_millis(config.min_interval_ms),
    ))
  }

  pub fn destination(&self) -> &str {
    &self.destination
  }

  /// Queue a call and wait for its turn and response.
  pub async fn request(&self, request: OutboundRequest) -> Result<Throttled<Value>, FetchError> {
    let (reply, response) = oneshot::channel();
    self
      .sender
      .send(Job { request, reply })
      .map_err(|_| self.stopped())?;
    response.await.map_err(|_| self.stopped())?
  }

  /// Stop the drain task. Queued and later calls fail.
  pub fn shutdown(&self) {
    self.drain.abort();
  }

  fn stopped(&self) -> FetchError {
    FetchError::transient(format!("throttle for {} is not running", self.destination))
  }
}

async fn drain(
  destination: Arc<str>,
  transport: Arc<dyn Transport>,
  min_interval: Duration,
  mut receiver: mpsc::UnboundedReceiver<Job>,
) {
  let mut last_dispatch: Option<Instant> = None;
  while let Some(job) = receiver.recv().await {
    let result = dispatch(
      &destination,
      transport.as_ref(),
      &job.request,
      min_interval,
      &mut last_dispatch,
    )
    .await;
    // Caller may have stopped waiting.
    let _ = job.reply.send(result);
  }
  debug!(destination = %destination, "throttle drain stopped");
}

async fn dispatch(
  destination: &str,
  transport: &dyn Transport,
  request: &OutboundRequest,
  min_interval: Duration,
  last_dispatch: &mut Option<Instant>,
) -> Result<Throttled<Value>, FetchError> {
  wait_for_slot(min_interval, last_dispatch).await;
  let retry_after = match transport.send(request).await? {
    RemoteOutcome::RateLimited { retry_after } => retry_after,
    outcome => return outcome.into_result().map(Throttled::Delivered),
  };

  let wait = retry_after
    .unwrap_or(DEFAULT_RETRY_AFTER)
    .min(MAX_RETRY_AFTER_WAIT);
  warn!(
    destination,
    path = %request.path,
    wait_ms = wait.as_millis() as u64,
    "rate limited, retransmitting once"
  );
  sleep(wait).await;
  wait_for_slot(min_interval, last_dispatch).await;

  match transport.send(request).await? {
    RemoteOutcome::RateLimited { .. } => {
      warn!(destination, path = %request.path, "still rate limited, giving up");
      Ok(Throttled::RateLimited)
    }
    outcome => outcome.into_result().map(Throttled::Delivered),
  }
}

async fn wait_for_slot(min_interval: Duration, last_dispatch: &mut Option<Instant>) {
  if let Some(last) = *last_dispatch {
    sleep_until(last + min_interval).await;
  }
  *last_dispatch = Some(Instant::now());
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::collections::VecDeque;
  use std::sync::Mutex;

  /// Transport replaying scripted outcomes and recording dispatch times.
  #[derive(Default)]
  struct ScriptedTransport {
    script: Mutex<VecDeque<RemoteOutcome<Value>>>,
    sent: Mutex<Vec<(Instant, String)>>,
  }

  impl ScriptedTransport {
    fn new(script: Vec<RemoteOutcome<Value>>) -> Arc<Self> {
      Arc::new(Self {
        script: Mutex::new(script.into()),
        sent: Mutex::default(),
      })
    }

    fn sent(&self) -> Vec<(Instant, String)> {
      self.sent.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl Transport for ScriptedTransport {
    async fn send(&self, request: &OutboundRequest) -> Result<RemoteOutcome<Value>, FetchError> {
      self
        .sent
        .lock()
        .unwrap()
        .push((Instant::now(), request.path.clone()));
      let next = self.script.lock().unwrap().pop_front();
      Ok(next.unwrap_or(RemoteOutcome::Ok(json!({"ok": true}))))
    }
  }

  fn message(path: &str) -> OutboundRequest {
    OutboundRequest::post(path, json!({"to": "+15550100", "body": "hi"}))
  }

  #[tokio::test(start_paused = true)]
  async fn test_dispatches_are_spaced_and_ordered() {
    let transport = ScriptedTransport::new(vec![]);
    let client = ThrottledClient::spawn("chat", transport.clone(), Duration::from_secs(1));

    let (a, b, c) = tokio::join!(
      client.request(message("a")),
      client.request(message("b")),
      client.request(message("c")),
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());

    let sent = transport.sent();
    let paths: Vec<&str> = sent.iter().map(|(_, p)| p.as_str()).collect();
    assert_eq!(paths, vec!["a", "b", "c"]);
    for pair in sent.windows(2) {
      assert!(pair[1].0.duration_since(pair[0].0) >= Duration::from_secs(1));
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_after_is_honored_once() {
    let transport = ScriptedTransport::new(vec![RemoteOutcome::RateLimited {
      retry_after: Some(Duration::from_secs(2)),
    }]);
    let client = ThrottledClient::spawn("chat", transport.clone(), Duration::from_secs(1));

    let result = client.request(message("messages")).await.unwrap();
    assert_eq!(result, Throttled::Delivered(json!({"ok": true})));

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    let gap = sent[1].0.duration_since(sent[0].0);
    assert!(gap >= Duration::from_secs(2) && gap <= Duration::from_secs(10));
  }

  #[tokio::test(start_paused = true)]
  async fn test_second_rate_limit_returns_sentinel() {
    let limited = RemoteOutcome::RateLimited {
      retry_after: Some(Duration::from_secs(30)),
    };
    let transport = ScriptedTransport::new(vec![limited.clone(), limited]);
    let client = ThrottledClient::spawn("chat", transport.clone(), Duration::from_secs(1));

    let result = client.request(message("messages")).await.unwrap();
    assert_eq!(result, Throttled::RateLimited);
    assert_eq!(
      result.into_result().unwrap_err().class(),
      crate::error::ErrorClass::RateLimited
    );

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    // Provider asked for 30s, wait is capped.
    assert_eq!(sent[1].0.duration_since(sent[0].0), Duration::from_secs(10));
  }

  #[tokio::test(start_paused = true)]
  async fn test_client_errors_are_not_retried() {
    let transport = ScriptedTransport::new(vec![RemoteOutcome::ClientError {
      code: 400,
      message: "invalid number".into(),
    }]);
    let client = ThrottledClient::spawn("chat", transport.clone(), Duration::from_secs(1));

    let err = client.request(message("messages")).await.unwrap_err();
    assert_eq!(err, FetchError::permanent(Some(400), "invalid number"));
    assert_eq!(transport.sent().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stopped_drain_fails_fast() {
    let transport = ScriptedTransport::new(vec![]);
    let client = ThrottledClient::spawn("chat", transport.clone(), Duration::from_secs(1));
    client.shutdown();
    tokio::task::yield_now().await;

    let err = client.request(message("messages")).await.unwrap_err();
    assert_eq!(err.class(), crate::error::ErrorClass::Transient);
    assert!(transport.sent().is_empty());
  }
}
