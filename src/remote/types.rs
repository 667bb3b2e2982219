//! Domain types for the business backend.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Backend tables the client knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
  Clients,
  Appointments,
  Payments,
  Inventory,
}

impl Resource {
  /// Table name on the backend, also the cache key prefix.
  pub fn table(self) -> &'static str {
    match self {
      Self::Clients => "clients",
      Self::Appointments => "appointments",
      Self::Payments => "payments",
      Self::Inventory => "inventory_items",
    }
  }

  pub fn from_table(table: &str) -> Option<Self> {
    match table {
      "clients" => Some(Self::Clients),
      "appointments" => Some(Self::Appointments),
      "payments" => Some(Self::Payments),
      "inventory_items" => Some(Self::Inventory),
      _ => None,
    }
  }

  /// Resources whose cached reads embed data from this one.
  ///
  /// Appointments and payments are listed with the client name joined in.
  pub fn dependents(self) -> &'static [Resource] {
    match self {
      Self::Clients => &[Resource::Appointments, Resource::Payments],
      Self::Appointments => &[Resource::Payments],
      Self::Payments | Self::Inventory => &[],
    }
  }
}

impl fmt::Display for Resource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.table())
  }
}

/// A customer of the business
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
  pub id: String,
  pub name: String,
  pub email: Option<String>,
  pub phone: Option<String>,
  #[serde(default)]
  pub notes: Option<String>,
  pub created_at: Option<DateTime<Utc>>,
}

/// Fields accepted when creating a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewClient {
  pub name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub email: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub phone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
  Scheduled,
  Confirmed,
  Completed,
  Cancelled,
  NoShow,
}

/// A booked service slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
  pub id: String,
  pub client_id: String,
  pub service: String,
  pub starts_at: DateTime<Utc>,
  pub duration_minutes: u32,
  pub status: AppointmentStatus,
  #[serde(default)]
  pub price_cents: Option<i64>,
}

/// A recorded payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
  pub id: String,
  pub client_id: Option<String>,
  pub appointment_id: Option<String>,
  pub amount_cents: i64,
  pub method: String,
  pub paid_at: DateTime<Utc>,
}

/// Stock item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
  pub id: String,
  pub name: String,
  pub quantity: i64,
  #[serde(default)]
  pub reorder_level: Option<i64>,
  #[serde(default)]
  pub unit_cost_cents: Option<i64>,
}

impl InventoryItem {
  pub fn needs_reorder(&self) -> bool {
    self
      .reorder_level
      .map(|level| self.quantity <= level)
      .unwrap_or(false)
  }
}

/// Result of the `revenue_summary` RPC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevenueSummary {
  pub from: NaiveDate,
  pub to: NaiveDate,
  pub total_cents: i64,
  pub payment_count: u64,
  pub appointment_count: u64,
}

/// Reference to a hosted checkout page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSession {
  pub session_id: String,
  pub url: String,
}

/// Outbound chat message for the messaging provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
  pub to: String,
  pub body: String,
}

impl fmt::Display for Client {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:<38} {}", self.id, self.name)?;
    if let Some(email) = &self.email {
      write!(f, " <{email}>")?;
    }
    if let Some(phone) = &self.phone {
      write!(f, " {phone}")?;
    }
    Ok(())
  }
}

impl fmt::Display for Appointment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{:<38} {} {:>4}m {:<20} {:?}",
      self.id,
      self.starts_at.format("%Y-%m-%d %H:%M"),
      self.duration_minutes,
      self.service,
      self.status
    )
  }
}

impl fmt::Display for Payment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{:<38} {} {:>10} {}",
      self.id,
      self.paid_at.format("%Y-%m-%d"),
      format_cents(self.amount_cents),
      self.method
    )
  }
}

impl fmt::Display for InventoryItem {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:<38} {:<24} {:>6}", self.id, self.name, self.quantity)?;
    if self.needs_reorder() {
      f.write_str("  (reorder)")?;
    }
    Ok(())
  }
}

pub fn format_cents(cents: i64) -> String {
  let sign = if cents < 0 { "-" } else { "" };
  let abs = cents.unsigned_abs();
  format!("{sign}{}.{:02}", abs / 100, abs % 100)
}
