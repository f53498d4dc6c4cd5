//! Payment provider interface.
//!
//! Card storage, charging and webhooks live in the payment service;
//! the billing core only resolves a default payment method and asks
//! for one charge attempt per invoice.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use service_core::observability::TracedClientExt;
use service_core::retry::{RetryConfig, retry_call};

use crate::config::PaymentProviderConfig;
use crate::error::BillingError;
use crate::models::Invoice;

/// Result of a charge attempt that reached the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    Succeeded,
    Declined { reason: String },
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// The customer's default payment method, or `NotFound` when none
    /// is on file.
    async fn default_payment_method(
        &self,
        project_id: Uuid,
        customer_id: Uuid,
    ) -> Result<String, BillingError>;

    /// Attempts one charge. A decline is a successful call with a
    /// declined outcome; `Err` means the attempt never settled.
    async fn charge(
        &self,
        payment_method_id: &str,
        invoice: &Invoice,
    ) -> Result<ChargeOutcome, BillingError>;
}

#[derive(Debug, Deserialize)]
struct PaymentMethodResponse {
    payment_method_id: String,
}

#[derive(Debug, Serialize)]
struct ChargeRequest<'a> {
    payment_method_id: &'a str,
    invoice_id: Uuid,
    /// Fixed-point decimal string, never a float.
    amount: String,
    currency: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChargeResponse {
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

/// Payment provider backed by the payment service's HTTP API.
pub struct HttpPaymentProvider {
    client: Client,
    base_url: String,
    api_key: Secret<String>,
    retry: RetryConfig,
}

impl HttpPaymentProvider {
    pub fn new(config: &PaymentProviderConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            retry: RetryConfig::quick(),
        })
    }

    fn external(reason: impl ToString) -> BillingError {
        BillingError::ExternalService {
            service: "payment-provider",
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn default_payment_method(
        &self,
        project_id: Uuid,
        customer_id: Uuid,
    ) -> Result<String, BillingError> {
        let url = format!(
            "{}/v1/customers/{}/default-payment-method",
            self.base_url, customer_id
        );
        retry_call(
            &self.retry,
            "default_payment_method",
            |err: &BillingError| matches!(err, BillingError::ExternalService { .. }),
            || async {
                let response = self
                    .client
                    .traced_get(&url)
                    .query(&[("project_id", project_id.to_string())])
                    .bearer_auth(self.api_key.expose_secret())
                    .send()
                    .await
                    .map_err(Self::external)?;

                let status = response.status();
                if status == StatusCode::NOT_FOUND {
                    return Err(BillingError::not_found("payment method", customer_id));
                }
                if !status.is_success() {
                    return Err(Self::external(format!(
                        "payment provider returned {status}"
                    )));
                }

                let body: PaymentMethodResponse =
                    response.json().await.map_err(Self::external)?;
                Ok(body.payment_method_id)
            },
        )
        .await
    }

    async fn charge(
        &self,
        payment_method_id: &str,
        invoice: &Invoice,
    ) -> Result<ChargeOutcome, BillingError> {
        // One attempt only. A charge is not idempotent and the dunning
        // cadence around declines lives outside this service.
        let url = format!("{}/v1/charges", self.base_url);
        let request = ChargeRequest {
            payment_method_id,
            invoice_id: invoice.invoice_id,
            amount: invoice.total.to_string(),
            currency: &invoice.currency,
        };

        let response = self
            .client
            .traced_post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(Self::external)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::external(format!(
                "payment provider returned {status}"
            )));
        }

        let body: ChargeResponse = response.json().await.map_err(Self::external)?;
        match body.status.as_str() {
            "succeeded" => Ok(ChargeOutcome::Succeeded),
            "declined" => Ok(ChargeOutcome::Declined {
                reason: body.reason.unwrap_or_else(|| "declined".to_string()),
            }),
            other => Err(Self::external(format!("unknown charge status {other}"))),
        }
    }
}

pub mod mock {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Test double with a configurable method and scripted outcomes.
    pub struct MockPaymentProvider {
        method: Mutex<Option<String>>,
        outcomes: Mutex<VecDeque<Result<ChargeOutcome, BillingError>>>,
        charges: Mutex<Vec<Uuid>>,
    }

    impl Default for MockPaymentProvider {
        fn default() -> Self {
            Self {
                method: Mutex::new(Some("pm_test".to_string())),
                outcomes: Mutex::new(VecDeque::new()),
                charges: Mutex::new(Vec::new()),
            }
        }
    }

    impl MockPaymentProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn without_payment_method(&self) {
            if let Ok(mut method) = self.method.lock() {
                *method = None;
            }
        }

        /// Queues the outcome of the next charge. Unscripted charges
        /// succeed.
        pub fn push_outcome(&self, outcome: Result<ChargeOutcome, BillingError>) {
            if let Ok(mut outcomes) = self.outcomes.lock() {
                outcomes.push_back(outcome);
            }
        }

        /// Invoice ids charged so far, in call order.
        pub fn charged_invoices(&self) -> Vec<Uuid> {
            self.charges.lock().map(|c| c.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl PaymentProvider for MockPaymentProvider {
        async fn default_payment_method(
            &self,
            _project_id: Uuid,
            customer_id: Uuid,
        ) -> Result<String, BillingError> {
            self.method
                .lock()
                .ok()
                .and_then(|method| method.clone())
                .ok_or_else(|| BillingError::not_found("payment method", customer_id))
        }

        async fn charge(
            &self,
            _payment_method_id: &str,
            invoice: &Invoice,
        ) -> Result<ChargeOutcome, BillingError> {
            if let Ok(mut charges) = self.charges.lock() {
                charges.push(invoice.invoice_id);
            }
            self.outcomes
                .lock()
                .ok()
                .and_then(|mut outcomes| outcomes.pop_front())
                .unwrap_or(Ok(ChargeOutcome::Succeeded))
        }
    }
}
