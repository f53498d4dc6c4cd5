//! Usage read interface.
//!
//! The analytics store is external; the billing core only ever sees
//! aggregated totals per feature and period through this trait.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use service_core::observability::TracedClientExt;
use service_core::retry::{RetryConfig, retry_call};

use crate::config::UsageReaderConfig;
use crate::error::BillingError;

/// Aggregated consumption for one feature over one window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageTotals {
    pub sum: Decimal,
    pub max: Decimal,
    pub count: i64,
    pub last_during_period: Option<Decimal>,
}

impl UsageTotals {
    /// The billable quantity under one aggregation rule. Unknown rules
    /// fall back to `sum`.
    pub fn quantity(&self, aggregation: Option<&str>) -> Decimal {
        match aggregation.unwrap_or("sum") {
            "max" => self.max,
            "count" => Decimal::from(self.count),
            "last" => self.last_during_period.unwrap_or(Decimal::ZERO),
            _ => self.sum,
        }
    }
}

#[async_trait]
pub trait UsageReader: Send + Sync {
    /// Aggregated usage for one feature over `[start, end)`. Missing
    /// data comes back as zeros, not as an error.
    async fn get_usage(
        &self,
        project_id: Uuid,
        customer_id: Uuid,
        feature_slug: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UsageTotals, BillingError>;
}

#[derive(Debug, Error)]
enum FetchError {
    #[error("{0}")]
    Transient(String),
    #[error(transparent)]
    Permanent(BillingError),
}

#[derive(Debug, Deserialize)]
struct UsageResponse {
    #[serde(default)]
    sum: Decimal,
    #[serde(default)]
    max: Decimal,
    #[serde(default)]
    count: i64,
    #[serde(default)]
    last_during_period: Option<Decimal>,
}

/// Usage reader backed by the analytics service's HTTP API.
pub struct HttpUsageReader {
    client: Client,
    base_url: String,
    retry: RetryConfig,
}

impl HttpUsageReader {
    pub fn new(config: &UsageReaderConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry: RetryConfig::with_max_retries(config.max_retries),
        })
    }
}

#[async_trait]
impl UsageReader for HttpUsageReader {
    async fn get_usage(
        &self,
        project_id: Uuid,
        customer_id: Uuid,
        feature_slug: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UsageTotals, BillingError> {
        let url = format!("{}/v1/usage", self.base_url);
        let result = retry_call(
            &self.retry,
            "get_usage",
            |err: &FetchError| matches!(err, FetchError::Transient(_)),
            || async {
                let response = self
                    .client
                    .traced_get(&url)
                    .query(&[
                        ("project_id", project_id.to_string()),
                        ("customer_id", customer_id.to_string()),
                        ("feature", feature_slug.to_string()),
                        ("start", start.to_rfc3339_opts(SecondsFormat::Millis, true)),
                        ("end", end.to_rfc3339_opts(SecondsFormat::Millis, true)),
                    ])
                    .send()
                    .await
                    .map_err(|err| FetchError::Transient(err.to_string()))?;

                let status = response.status();
                if status == StatusCode::NOT_FOUND {
                    return Ok(UsageTotals::default());
                }
                if status.is_server_error() {
                    return Err(FetchError::Transient(format!(
                        "usage reader returned {status}"
                    )));
                }
                if !status.is_success() {
                    return Err(FetchError::Permanent(BillingError::ExternalService {
                        service: "usage-reader",
                        reason: format!("unexpected status {status}"),
                    }));
                }

                let body: UsageResponse = response
                    .json()
                    .await
                    .map_err(|err| FetchError::Transient(err.to_string()))?;
                Ok(UsageTotals {
                    sum: body.sum,
                    max: body.max,
                    count: body.count,
                    last_during_period: body.last_during_period,
                })
            },
        )
        .await;

        result.map_err(|err| match err {
            FetchError::Transient(reason) => BillingError::ExternalService {
                service: "usage-reader",
                reason,
            },
            FetchError::Permanent(inner) => inner,
        })
    }
}

pub mod mock {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Test double serving preloaded totals per (customer, feature).
    #[derive(Default)]
    pub struct MockUsageReader {
        totals: Mutex<HashMap<(Uuid, String), UsageTotals>>,
        failing: Mutex<bool>,
        windows: Mutex<Vec<(String, DateTime<Utc>, DateTime<Utc>)>>,
    }

    impl MockUsageReader {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_sum(&self, customer_id: Uuid, feature_slug: &str, sum: Decimal) {
            self.set_totals(
                customer_id,
                feature_slug,
                UsageTotals {
                    sum,
                    ..Default::default()
                },
            );
        }

        pub fn set_totals(&self, customer_id: Uuid, feature_slug: &str, totals: UsageTotals) {
            if let Ok(mut map) = self.totals.lock() {
                map.insert((customer_id, feature_slug.to_string()), totals);
            }
        }

        /// When set, every read fails as if the service were down.
        pub fn set_failing(&self, failing: bool) {
            if let Ok(mut flag) = self.failing.lock() {
                *flag = failing;
            }
        }

        /// Windows queried so far, in call order.
        pub fn queried_windows(&self) -> Vec<(String, DateTime<Utc>, DateTime<Utc>)> {
            self.windows.lock().map(|w| w.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl UsageReader for MockUsageReader {
        async fn get_usage(
            &self,
            _project_id: Uuid,
            customer_id: Uuid,
            feature_slug: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<UsageTotals, BillingError> {
            if self.failing.lock().map(|flag| *flag).unwrap_or(false) {
                return Err(BillingError::ExternalService {
                    service: "usage-reader",
                    reason: "usage reader unavailable".to_string(),
                });
            }
            if let Ok(mut windows) = self.windows.lock() {
                windows.push((feature_slug.to_string(), start, end));
            }
            Ok(self
                .totals
                .lock()
                .ok()
                .and_then(|map| map.get(&(customer_id, feature_slug.to_string())).copied())
                .unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_follows_aggregation_rule() {
        let totals = UsageTotals {
            sum: Decimal::from(100),
            max: Decimal::from(40),
            count: 7,
            last_during_period: Some(Decimal::from(12)),
        };

        assert_eq!(totals.quantity(None), Decimal::from(100));
        assert_eq!(totals.quantity(Some("sum")), Decimal::from(100));
        assert_eq!(totals.quantity(Some("max")), Decimal::from(40));
        assert_eq!(totals.quantity(Some("count")), Decimal::from(7));
        assert_eq!(totals.quantity(Some("last")), Decimal::from(12));
    }

    #[test]
    fn last_aggregation_without_data_is_zero() {
        let totals = UsageTotals::default();
        assert_eq!(totals.quantity(Some("last")), Decimal::ZERO);
    }
}
