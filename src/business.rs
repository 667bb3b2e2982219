//! Typed business API over the backend with caching and offline writes.

use std::sync::Arc;

use chrono::NaiveDate;
use color_eyre::Result;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use crate::cache::{QueryKey, ResourceQuery};
use crate::config::{Config, PaymentsConfig};
use crate::coordinator::{Coordinator, MutationOutcome};
use crate::error::FetchError;
use crate::offline::{MutationKind, MutationTarget, QueuedMutation};
use crate::remote::types::{
  Appointment, CheckoutSession, Client, InventoryItem, NewClient, OutboundMessage, Payment,
  Resource, RevenueSummary,
};
use crate::remote::{CheckoutClient, CheckoutRequest, Filter, FilterOp, ResourceClient};
use crate::request::ExecuteOptions;
use crate::throttle::{OutboundRequest, ThrottledClient};

const REVENUE_FUNCTION: &str = "revenue_summary";

/// Business client with transparent caching, dedup and offline writes.
///
/// Reads go through the shared query cache. Writes are applied directly
/// and queued for replay when the backend is unreachable.
#[derive(Clone)]
pub struct BusinessClient {
  remote: ResourceClient,
  coordinator: Arc<Coordinator>,
  messaging: Option<ThrottledClient>,
  checkout: Option<(CheckoutClient, PaymentsConfig)>,
}

impl BusinessClient {
  /// Build every client the configuration enables. Must run inside a runtime.
  pub fn new(config: &Config) -> Result<Self> {
    let remote = ResourceClient::new(config)?;
    let coordinator = Arc::new(Coordinator::open(config, Arc::new(remote.clone())));

    let messaging = match &config.messaging {
      Some(messaging) => Some(ThrottledClient::for_messaging(
        messaging,
        Config::get_messaging_token()?,
      )?),
      None => None,
    };

    let checkout = match &config.payments {
      Some(payments) => match CheckoutClient::new(config) {
        Ok(client) => Some((client, payments.clone())),
        Err(e) => {
          debug!(error = %e, "checkout disabled");
          None
        }
      },
      None => None,
    };

    Ok(Self {
      remote,
      coordinator,
      messaging,
      checkout,
    })
  }

  pub fn coordinator(&self) -> &Arc<Coordinator> {
    &self.coordinator
  }

  pub async fn list_clients(&self, options: ExecuteOptions) -> Result<Vec<Client>, FetchError> {
    let query = ResourceQuery::List {
      resource: Resource::Clients,
      filters: Vec::new(),
      order: Some("name.asc".to_string()),
    };
    self.list(query, options).await
  }

  pub async fn get_client(&self, id: &str) -> Result<Client, FetchError> {
    self
      .get(ResourceQuery::detail(Resource::Clients, id), ExecuteOptions::new())
      .await
  }

  /// Appointments, optionally for one client and from a given day on.
  pub async fn list_appointments(
    &self,
    client_id: Option<&str>,
    from: Option<NaiveDate>,
    options: ExecuteOptions,
  ) -> Result<Vec<Appointment>, FetchError> {
    let query = ResourceQuery::List {
      resource: Resource::Appointments,
      filters: appointment_filters(client_id, from),
      order: Some("starts_at.asc".to_string()),
    };
    self.list(query, options).await
  }

  pub async fn list_payments(
    &self,
    client_id: Option<&str>,
    options: ExecuteOptions,
  ) -> Result<Vec<Payment>, FetchError> {
    let query = ResourceQuery::List {
      resource: Resource::Payments,
      filters: client_id
        .map(|id| vec![Filter::eq("client_id", id)])
        .unwrap_or_default(),
      order: Some("paid_at.desc".to_string()),
    };
    self.list(query, options).await
  }

  pub async fn list_inventory(
    &self,
    options: ExecuteOptions,
  ) -> Result<Vec<InventoryItem>, FetchError> {
    let query = ResourceQuery::List {
      resource: Resource::Inventory,
      filters: Vec::new(),
      order: Some("name.asc".to_string()),
    };
    self.list(query, options).await
  }

  /// Revenue totals for an inclusive date range.
  pub async fn revenue_summary(
    &self,
    from: NaiveDate,
    to: NaiveDate,
    options: ExecuteOptions,
  ) -> Result<RevenueSummary, FetchError> {
    if to < from {
      return Err(FetchError::permanent(
        None,
        format!("revenue range ends ({to}) before it starts ({from})"),
      ));
    }

    let remote = self.remote.clone();
    let args = json!({ "from_date": from, "to_date": to });
    let result = self
      .coordinator
      .read(
        &ResourceQuery::Revenue { from, to },
        move || {
          let remote = remote.clone();
          let args = args.clone();
          async move { remote.rpc(REVENUE_FUNCTION, &args).await.map(first_row) }
        },
        options,
      )
      .await?;
    Ok(result.data)
  }

  pub async fn create_client(&self, client: &NewClient) -> Result<MutationOutcome, FetchError> {
    let payload = serde_json::to_value(client)
      .map_err(|e| FetchError::permanent(None, format!("invalid client: {e}")))?;
    self.create(Resource::Clients, payload).await
  }

  pub async fn create(
    &self,
    resource: Resource,
    payload: Value,
  ) -> Result<MutationOutcome, FetchError> {
    let mutation = QueuedMutation::new(
      MutationKind::Create,
      MutationTarget::table(resource.table()),
      payload,
    );
    self.coordinator.mutate(mutation).await
  }

  pub async fn update(
    &self,
    resource: Resource,
    id: &str,
    payload: Value,
  ) -> Result<MutationOutcome, FetchError> {
    let mutation = QueuedMutation::new(
      MutationKind::Update,
      MutationTarget::record(resource.table(), id),
      payload,
    );
    self.coordinator.mutate(mutation).await
  }

  pub async fn delete(&self, resource: Resource, id: &str) -> Result<MutationOutcome, FetchError> {
    let mutation = QueuedMutation::new(
      MutationKind::Delete,
      MutationTarget::record(resource.table(), id),
      Value::Null,
    );
    self.coordinator.mutate(mutation).await
  }

  /// Send a chat message through the throttled messaging provider.
  pub async fn send_message(&self, message: &OutboundMessage) -> Result<Value, FetchError> {
    let messaging = self.messaging.as_ref().ok_or_else(|| {
      FetchError::permanent(None, "messaging is not configured")
    })?;
    let request = message_request(message)?;
    messaging.request(request).await?.into_result()
  }

  /// Create a hosted checkout session for `price_id`.
  pub async fn checkout(
    &self,
    price_id: &str,
    customer_email: Option<String>,
  ) -> Result<CheckoutSession, FetchError> {
    let (client, payments) = self.checkout.as_ref().ok_or_else(|| {
      FetchError::permanent(
        None,
        "checkout needs a payments section and a signed-in user",
      )
    })?;
    let request = CheckoutRequest {
      price_id: price_id.to_string(),
      success_url: payments.success_url.clone(),
      cancel_url: payments.cancel_url.clone(),
      customer_email,
    };
    client.create_session(&request).await
  }

  /// Stop background work.
  pub async fn shutdown(&self) {
    if let Some(messaging) = &self.messaging {
      messaging.shutdown();
    }
    self.coordinator.teardown().await;
  }

  async fn list<T: DeserializeOwned>(
    &self,
    query: ResourceQuery,
    options: ExecuteOptions,
  ) -> Result<Vec<T>, FetchError> {
    let ResourceQuery::List {
      resource,
      filters,
      order,
    } = query.clone()
    else {
      return Err(FetchError::permanent(
        None,
        format!("{} is not a list query", query.description()),
      ));
    };

    let remote = self.remote.clone();
    let result = self
      .coordinator
      .read(
        &query,
        move || {
          let remote = remote.clone();
          let filters = filters.clone();
          let order = order.clone();
          async move {
            remote
              .select(resource.table(), &filters, order.as_deref())
              .await
          }
        },
        options,
      )
      .await?;
    Ok(result.data)
  }

  async fn get<T: DeserializeOwned>(
    &self,
    query: ResourceQuery,
    options: ExecuteOptions,
  ) -> Result<T, FetchError> {
    let ResourceQuery::Detail { resource, id } = query.clone() else {
      return Err(FetchError::permanent(
        None,
        format!("{} is not a detail query", query.description()),
      ));
    };

    let remote = self.remote.clone();
    let result = self
      .coordinator
      .read(
        &query,
        move || {
          let remote = remote.clone();
          let id = id.clone();
          async move {
            let rows = remote
              .select(resource.table(), &[Filter::eq("id", id.as_str())], None)
              .await?;
            single_row(rows, resource, &id)
          }
        },
        options,
      )
      .await?;
    Ok(result.data)
  }
}

fn appointment_filters(client_id: Option<&str>, from: Option<NaiveDate>) -> Vec<Filter> {
  let mut filters = Vec::new();
  if let Some(id) = client_id {
    filters.push(Filter::eq("client_id", id));
  }
  if let Some(day) = from {
    filters.push(Filter::new("starts_at", FilterOp::Gte, day.to_string()));
  }
  filters
}

fn message_request(message: &OutboundMessage) -> Result<OutboundRequest, FetchError> {
  if message.to.trim().is_empty() {
    return Err(FetchError::permanent(None, "message recipient is empty"));
  }
  if message.body.trim().is_empty() {
    return Err(FetchError::permanent(None, "message body is empty"));
  }
  let body = serde_json::to_value(message)
    .map_err(|e| FetchError::permanent(None, format!("invalid message: {e}")))?;
  Ok(OutboundRequest::post("messages", body))
}

/// RPCs returning a set come back as an array of one row.
fn first_row(value: Value) -> Value {
  match value {
    Value::Array(mut rows) if !rows.is_empty() => rows.swap_remove(0),
    other => other,
  }
}

fn single_row(rows: Value, resource: Resource, id: &str) -> Result<Value, FetchError> {
  match rows {
    Value::Array(mut rows) if !rows.is_empty() => Ok(rows.swap_remove(0)),
    Value::Array(_) => Err(FetchError::permanent(
      Some(404),
      format!("{resource} record {id} not found"),
    )),
    other => Ok(other),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_appointment_filters() {
    assert!(appointment_filters(None, None).is_empty());

    let filters = appointment_filters(Some("c1"), NaiveDate::from_ymd_opt(2026, 3, 1));
    let rendered: Vec<(String, String)> = filters.iter().map(Filter::rendered).collect();
    assert_eq!(
      rendered,
      vec![
        ("client_id".to_string(), "eq.c1".to_string()),
        ("starts_at".to_string(), "gte.2026-03-01".to_string()),
      ]
    );
  }

  #[test]
  fn test_message_request_shape() {
    let request = message_request(&OutboundMessage {
      to: "+15550100".to_string(),
      body: "Your appointment is tomorrow at 10:00".to_string(),
    })
    .unwrap();
    assert_eq!(request.path, "messages");
    assert_eq!(request.body.unwrap()["to"], "+15550100");

    let err = message_request(&OutboundMessage {
      to: "+15550100".to_string(),
      body: "  ".to_string(),
    })
    .unwrap_err();
    assert_eq!(err.class(), crate::error::ErrorClass::Permanent);
  }

  #[test]
  fn test_row_unwrapping() {
    assert_eq!(first_row(json!([{"total_cents": 5}])), json!({"total_cents": 5}));
    assert_eq!(first_row(json!({"total_cents": 5})), json!({"total_cents": 5}));

    let err = single_row(json!([]), Resource::Clients, "c9").unwrap_err();
    assert!(err.is_missing_target());
    assert_eq!(
      single_row(json!([{"id": "c1"}]), Resource::Clients, "c1").unwrap(),
      json!({"id": "c1"})
    );
  }

  #[test]
  fn test_revenue_and_list_keys_share_invalidation() {
    let revenue = ResourceQuery::Revenue {
      from: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
      to: NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
    };
    assert!(revenue.cache_key().starts_with("payments:"));
  }
}
