//! Query keys for backend reads.

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

use crate::cache::QueryKey;
use crate::remote::types::Resource;
use crate::remote::Filter;

/// Hex characters of the digest kept in a key
const DIGEST_LEN: usize = 16;

/// Identity of a read against the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceQuery {
  /// Rows of a table, optionally filtered and ordered
  List {
    resource: Resource,
    filters: Vec<Filter>,
    order: Option<String>,
  },
  /// A single row by id
  Detail { resource: Resource, id: String },
  /// `revenue_summary` RPC over a date range
  Revenue { from: NaiveDate, to: NaiveDate },
}

impl ResourceQuery {
  pub fn list(resource: Resource) -> Self {
    Self::List {
      resource,
      filters: Vec::new(),
      order: None,
    }
  }

  pub fn detail(resource: Resource, id: impl Into<String>) -> Self {
    Self::Detail {
      resource,
      id: id.into(),
    }
  }

  /// Table whose writes invalidate this query.
  pub fn resource(&self) -> Resource {
    match self {
      Self::List { resource, .. } | Self::Detail { resource, .. } => *resource,
      Self::Revenue { .. } => Resource::Payments,
    }
  }
}

impl QueryKey for ResourceQuery {
  fn cache_key(&self) -> String {
    match self {
      Self::List {
        resource,
        filters,
        order,
      } => {
        if filters.is_empty() && order.is_none() {
          return format!("{}:list", resource.table());
        }
        // Filter order does not change the result set.
        let mut parts: Vec<String> = filters
          .iter()
          .map(|f| {
            let (column, expr) = f.rendered();
            format!("{column}={expr}")
          })
          .collect();
        parts.sort();
        let input = format!(
          "{}|order={}",
          parts.join("&"),
          order.as_deref().map(str::trim).unwrap_or("")
        );
        format!("{}:list:{}", resource.table(), digest(&input))
      }
      Self::Detail { resource, id } => format!("{}:detail:{}", resource.table(), id.trim()),
      Self::Revenue { from, to } => format!(
        "{}:revenue:{}",
        Resource::Payments.table(),
        digest(&format!("{from}..{to}"))
      ),
    }
  }

  fn description(&self) -> String {
    match self {
      Self::List {
        resource, filters, ..
      } => {
        if filters.is_empty() {
          format!("all {resource}")
        } else {
          format!("{resource} ({} filters)", filters.len())
        }
      }
      Self::Detail { resource, id } => format!("{resource} {id}"),
      Self::Revenue { from, to } => format!("revenue {from} to {to}"),
    }
  }
}

fn digest(input: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  let mut hash = hex::encode(hasher.finalize());
  hash.truncate(DIGEST_LEN);
  hash
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::store::key_matches;
  use crate::remote::FilterOp;

  fn filtered(filters: Vec<Filter>) -> ResourceQuery {
    ResourceQuery::List {
      resource: Resource::Appointments,
      filters,
      order: Some("starts_at.asc".to_string()),
    }
  }

  #[test]
  fn test_plain_list_key() {
    assert_eq!(
      ResourceQuery::list(Resource::Inventory).cache_key(),
      "inventory_items:list"
    );
  }

  #[test]
  fn test_filter_order_is_irrelevant() {
    let a = filtered(vec![
      Filter::eq("client_id", "c1"),
      Filter::new("starts_at", FilterOp::Gte, "2026-01-01"),
    ]);
    let b = filtered(vec![
      Filter::new("starts_at", FilterOp::Gte, "2026-01-01"),
      Filter::eq("client_id", "c1"),
    ]);
    assert_eq!(a.cache_key(), b.cache_key());
    assert_ne!(
      a.cache_key(),
      filtered(vec![Filter::eq("client_id", "c2")]).cache_key()
    );
  }

  #[test]
  fn test_keys_fall_under_resource_prefix() {
    let list = filtered(vec![Filter::eq("client_id", "c1")]).cache_key();
    assert!(key_matches(&list, "appointments"));
    assert_eq!(list.len(), "appointments:list:".len() + DIGEST_LEN);

    let detail = ResourceQuery::detail(Resource::Clients, "c1").cache_key();
    assert_eq!(detail, "clients:detail:c1");

    let revenue = ResourceQuery::Revenue {
      from: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
      to: NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
    };
    assert!(key_matches(&revenue.cache_key(), "payments"));
    assert_eq!(revenue.resource(), Resource::Payments);
  }
}
