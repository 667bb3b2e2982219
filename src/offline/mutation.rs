//! Queued write operations.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
  Create,
  Update,
  Delete,
}

impl fmt::Display for MutationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Create => "create",
      Self::Update => "update",
      Self::Delete => "delete",
    })
  }
}

/// Table and row a mutation applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationTarget {
  pub table: String,
  /// Required for update and delete
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub record_id: Option<String>,
}

impl MutationTarget {
  pub fn table(table: impl Into<String>) -> Self {
    Self {
      table: table.into(),
      record_id: None,
    }
  }

  pub fn record(table: impl Into<String>, id: impl Into<String>) -> Self {
    Self {
      table: table.into(),
      record_id: Some(id.into()),
    }
  }
}

impl fmt::Display for MutationTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.record_id {
      Some(id) => write!(f, "{}/{}", self.table, id),
      None => f.write_str(&self.table),
    }
  }
}

/// A write waiting to be replayed against the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
  /// `<unix millis>-<8 hex>`, unique within the queue
  pub id: String,
  pub kind: MutationKind,
  pub target: MutationTarget,
  pub payload: Value,
  pub enqueued_at: DateTime<Utc>,
  #[serde(default)]
  pub attempts: u32,
  #[serde(default)]
  pub last_error: Option<String>,
}

impl QueuedMutation {
  pub fn new(kind: MutationKind, target: MutationTarget, payload: Value) -> Self {
    let enqueued_at = Utc::now();
    let suffix: u32 = rand::thread_rng().gen();
    Self {
      id: format!("{}-{:08x}", enqueued_at.timestamp_millis(), suffix),
      kind,
      target,
      payload,
      enqueued_at,
      attempts: 0,
      last_error: None,
    }
  }
}

impl fmt::Display for QueuedMutation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{:<22} {:<6} {:<40} {}",
      self.id,
      self.kind,
      self.target.to_string(),
      self.enqueued_at.format("%Y-%m-%d %H:%M:%S")
    )?;
    if self.attempts > 0 {
      write!(f, "  attempts={}", self.attempts)?;
    }
    if let Some(err) = &self.last_error {
      write!(f, "  last error: {err}")?;
    }
    Ok(())
  }
}

/// Applies a queued mutation to the backend.
#[async_trait]
pub trait MutationExecutor: Send + Sync {
  async fn apply(&self, mutation: &QueuedMutation) -> Result<Value, FetchError>;
}
