//! Client for the server function that opens payment checkout sessions.
//!
//! The function authenticates the bearer token, finds or creates the billing
//! customer for that user and asks the payments provider for a session. We
//! only see the resulting session reference.

use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use reqwest::header;
use serde::Serialize;
use url::Url;

use crate::config::{Config, PaymentsConfig};
use crate::error::FetchError;
use crate::remote::client::{classify_response, map_reqwest_error};
use crate::remote::types::CheckoutSession;

/// Body of a checkout request
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutRequest {
  pub price_id: String,
  pub success_url: String,
  pub cancel_url: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub customer_email: Option<String>,
}

#[derive(Clone)]
pub struct CheckoutClient {
  http: reqwest::Client,
  endpoint: Url,
  api_key: String,
  access_token: String,
}

impl CheckoutClient {
  pub fn new(config: &Config) -> Result<Self> {
    let payments = config
      .payments
      .as_ref()
      .ok_or_else(|| eyre!("No payments section in configuration"))?;
    let access_token = Config::get_access_token().ok_or_else(|| {
      eyre!("Checkout requires a signed-in user. Set BIZSYNC_ACCESS_TOKEN.")
    })?;
    Self::with_credentials(payments, Config::get_api_key()?, access_token)
  }

  pub fn with_credentials(
    payments: &PaymentsConfig,
    api_key: String,
    access_token: String,
  ) -> Result<Self> {
    let base = Url::parse(&payments.functions_url)
      .map_err(|e| eyre!("Invalid functions url {}: {}", payments.functions_url, e))?;
    let endpoint = base
      .join(&payments.checkout_function)
      .map_err(|e| eyre!("Invalid checkout function name: {}", e))?;

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(30))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      endpoint,
      api_key,
      access_token,
    })
  }

  pub fn endpoint(&self) -> &Url {
    &self.endpoint
  }

  /// Create a hosted checkout session.
  pub async fn create_session(&self, request: &CheckoutRequest) -> Result<CheckoutSession, FetchError> {
    let response = self
      .http
      .post(self.endpoint.clone())
      .header("apikey", &self.api_key)
      .header(header::AUTHORIZATION, format!("Bearer {}", self.access_token))
      .json(request)
      .send()
      .await
      .map_err(map_reqwest_error)?;

    let body = classify_response(response).await.into_result()?;
    serde_json::from_value(body)
      .map_err(|e| FetchError::permanent(None, format!("unexpected checkout response: {e}")))
  }
}
