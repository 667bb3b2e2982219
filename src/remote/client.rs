use std::time::Duration;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{header, Method, RequestBuilder};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::{BackendConfig, Config};
use crate::error::FetchError;
use crate::offline::{MutationExecutor, MutationKind, QueuedMutation};
use crate::remote::outcome::RemoteOutcome;

/// Comparison operators understood by the REST backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOp {
  Eq,
  Gte,
  Lte,
  Ilike,
}

impl FilterOp {
  fn as_str(self) -> &'static str {
    match self {
      Self::Eq => "eq",
      Self::Gte => "gte",
      Self::Lte => "lte",
      Self::Ilike => "ilike",
    }
  }
}

/// A single column filter, rendered as `column=op.value`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Filter {
  pub column: String,
  pub op: FilterOp,
  pub value: String,
}

impl Filter {
  pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<String>) -> Self {
    Self {
      column: column.into(),
      op,
      value: value.into(),
    }
  }

  pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
    Self::new(column, FilterOp::Eq, value)
  }

  pub fn rendered(&self) -> (String, String) {
    (
      self.column.clone(),
      format!("{}.{}", self.op.as_str(), self.value),
    )
  }
}

/// HTTPS client for the hosted resource API (tables + RPC).
#[derive(Clone)]
pub struct ResourceClient {
  http: reqwest::Client,
  base: Url,
  api_key: String,
  access_token: Option<String>,
}

impl ResourceClient {
  pub fn new(config: &Config) -> Result<Self> {
    let api_key = Config::get_api_key()?;
    let access_token = Config::get_access_token();
    Self::with_credentials(&config.backend, api_key, access_token)
  }

  pub fn with_credentials(
    backend: &BackendConfig,
    api_key: String,
    access_token: Option<String>,
  ) -> Result<Self> {
    // Joining relative paths needs a trailing slash on the base.
    let raw = if backend.url.ends_with('/') {
      backend.url.clone()
    } else {
      format!("{}/", backend.url)
    };
    let base =
      Url::parse(&raw).map_err(|e| eyre!("Invalid backend url {}: {}", backend.url, e))?;

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(backend.timeout_secs))
      .user_agent(concat!("bizsync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base,
      api_key,
      access_token,
    })
  }

  /// Bulk query a table.
  pub async fn select(
    &self,
    table: &str,
    filters: &[Filter],
    order: Option<&str>,
  ) -> Result<Value, FetchError> {
    let mut url = self.table_url(table)?;
    {
      let mut pairs = url.query_pairs_mut();
      pairs.append_pair("select", "*");
      for filter in filters {
        let (column, value) = filter.rendered();
        pairs.append_pair(&column, &value);
      }
      if let Some(order) = order {
        pairs.append_pair("order", order);
      }
    }
    self.send(self.request(Method::GET, url)).await
  }

  /// Insert one row and return it.
  pub async fn insert(&self, table: &str, payload: &Value) -> Result<Value, FetchError> {
    let url = self.table_url(table)?;
    let rows = self
      .send(self.request(Method::POST, url).json(payload))
      .await?;
    Ok(first_row(rows))
  }

  /// Patch one row by id and return it.
  ///
  /// An empty representation means no row matched, which is reported as 404.
  pub async fn update(&self, table: &str, id: &str, payload: &Value) -> Result<Value, FetchError> {
    let url = self.row_url(table, id)?;
    let rows = self
      .send(self.request(Method::PATCH, url).json(payload))
      .await?;
    if is_empty_rows(&rows) {
      return Err(FetchError::permanent(
        Some(404),
        format!("{table} record {id} no longer exists"),
      ));
    }
    Ok(first_row(rows))
  }

  /// Delete one row by id. Deleting a missing row succeeds.
  pub async fn delete(&self, table: &str, id: &str) -> Result<Value, FetchError> {
    let url = self.row_url(table, id)?;
    let rows = self.send(self.request(Method::DELETE, url)).await?;
    if is_empty_rows(&rows) {
      debug!(table, id, "delete matched no rows");
    }
    Ok(rows)
  }

  /// Call a stored procedure.
  pub async fn rpc(&self, function: &str, args: &Value) -> Result<Value, FetchError> {
    let url = self
      .base
      .join(&format!("rest/v1/rpc/{function}"))
      .map_err(|e| FetchError::permanent(None, format!("invalid rpc name {function}: {e}")))?;
    self.send(self.request(Method::POST, url).json(args)).await
  }

  fn table_url(&self, table: &str) -> Result<Url, FetchError> {
    self
      .base
      .join(&format!("rest/v1/{table}"))
      .map_err(|e| FetchError::permanent(None, format!("invalid table {table}: {e}")))
  }

  fn row_url(&self, table: &str, id: &str) -> Result<Url, FetchError> {
    let mut url = self.table_url(table)?;
    url.query_pairs_mut().append_pair("id", &format!("eq.{id}"));
    Ok(url)
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
    self
      .http
      .request(method, url)
      .header("apikey", &self.api_key)
      .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
      .header("Prefer", "return=representation")
  }

  async fn send(&self, builder: RequestBuilder) -> Result<Value, FetchError> {
    let response = builder.send().await.map_err(map_reqwest_error)?;
    classify_response(response).await.into_result()
  }
}

/// Turn an HTTP response into a [`RemoteOutcome`].
pub(crate) async fn classify_response(response: reqwest::Response) -> RemoteOutcome<Value> {
  let status = response.status().as_u16();
  let retry_after = response
    .headers()
    .get(header::RETRY_AFTER)
    .and_then(|v| v.to_str().ok())
    .map(String::from);

  let body = match response.text().await {
    Ok(text) if text.trim().is_empty() => Value::Null,
    Ok(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
    Err(e) => {
      return RemoteOutcome::ServerError {
        status,
        message: format!("failed to read response body: {e}"),
      }
    }
  };

  RemoteOutcome::from_response(status, retry_after.as_deref(), body)
}

pub(crate) fn map_reqwest_error(e: reqwest::Error) -> FetchError {
  if e.is_builder() {
    FetchError::permanent(None, format!("invalid request: {e}"))
  } else {
    FetchError::transient(format!("network error: {e}"))
  }
}

fn is_empty_rows(rows: &Value) -> bool {
  matches!(rows, Value::Array(a) if a.is_empty())
}

fn first_row(rows: Value) -> Value {
  match rows {
    Value::Array(mut a) if !a.is_empty() => a.swap_remove(0),
    other => other,
  }
}

#[async_trait]
impl MutationExecutor for ResourceClient {
  async fn apply(&self, mutation: &QueuedMutation) -> Result<Value, FetchError> {
    let table = mutation.target.table.as_str();
    match (mutation.kind, mutation.target.record_id.as_deref()) {
      (MutationKind::Create, _) => self.insert(table, &mutation.payload).await,
      (MutationKind::Update, Some(id)) => self.update(table, id, &mutation.payload).await,
      (MutationKind::Delete, Some(id)) => self.delete(table, id).await,
      (kind, None) => Err(FetchError::permanent(
        None,
        format!("{kind:?} on {table} requires a record id"),
      )),
    }
  }
}
