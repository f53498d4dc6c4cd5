//! Batch billing sweep.
//!
//! Walks subscriptions whose trial end, invoice instant or cycle end
//! has passed and drives each one through the state machine, recording
//! a per-subscription audit trail. A failure on one subscription never
//! aborts the sweep.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::BillingError;
use crate::models::{
    BillingRun, BillingRunResult, RunStatus, RunType, Subscription, SubscriptionStatus,
};
use crate::services::lifecycle::PhaseStateMachine;
use crate::services::metrics::{record_billing_run, record_error};
use crate::services::store::BillingStore;

/// Upper bound on subscriptions handled per sweep. Anything beyond it
/// is picked up by the next run.
const SWEEP_BATCH_LIMIT: i64 = 500;

/// Drives due subscriptions through trial end, invoicing and renewal.
pub struct BillingRunner {
    store: Arc<dyn BillingStore>,
    machine: Arc<PhaseStateMachine>,
}

impl BillingRunner {
    pub fn new(store: Arc<dyn BillingStore>, machine: Arc<PhaseStateMachine>) -> Self {
        Self { store, machine }
    }

    #[instrument(skip(self), fields(run_type = run_type.as_str(), as_of = %as_of))]
    pub async fn run(
        &self,
        run_type: RunType,
        as_of: DateTime<Utc>,
    ) -> Result<(BillingRun, Vec<BillingRunResult>), BillingError> {
        let mut run = self
            .store
            .create_billing_run(BillingRun {
                run_id: Uuid::new_v4(),
                run_type: run_type.as_str().to_string(),
                status: RunStatus::Running.as_str().to_string(),
                as_of,
                started_utc: Utc::now(),
                completed_utc: None,
                subscriptions_processed: 0,
                subscriptions_succeeded: 0,
                subscriptions_failed: 0,
                error_message: None,
            })
            .await?;

        info!(run_id = %run.run_id, "Billing run started");

        match self.sweep(&mut run, as_of).await {
            Ok(results) => {
                run.status = RunStatus::Completed.as_str().to_string();
                run.completed_utc = Some(Utc::now());
                self.store.finish_billing_run(&run).await?;
                record_billing_run(&run.run_type, "completed");
                info!(
                    run_id = %run.run_id,
                    processed = run.subscriptions_processed,
                    succeeded = run.subscriptions_succeeded,
                    failed = run.subscriptions_failed,
                    "Billing run completed"
                );
                Ok((run, results))
            }
            Err(e) => {
                run.status = RunStatus::Failed.as_str().to_string();
                run.completed_utc = Some(Utc::now());
                run.error_message = Some(e.to_string());
                self.store.finish_billing_run(&run).await.ok();
                record_billing_run(&run.run_type, "failed");
                record_error(e.kind(), "billing_run");
                Err(e)
            }
        }
    }

    /// Storage failures abort the sweep; billing failures on a single
    /// subscription are recorded and the sweep moves on.
    async fn sweep(
        &self,
        run: &mut BillingRun,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<BillingRunResult>, BillingError> {
        let due = self.store.due_subscriptions(as_of, SWEEP_BATCH_LIMIT).await?;
        let mut results = Vec::new();

        for subscription in due {
            run.subscriptions_processed += 1;
            let rows = self
                .process_subscription(run.run_id, subscription, as_of)
                .await?;
            if rows.iter().any(|r| r.status == "failed") {
                run.subscriptions_failed += 1;
            } else if rows.iter().any(|r| r.status == "succeeded") {
                run.subscriptions_succeeded += 1;
            }
            results.extend(rows);
        }

        for invoice in self.store.open_invoices_past_due(as_of).await? {
            run.subscriptions_processed += 1;
            match self
                .machine
                .mark_past_due(invoice.project_id, invoice.invoice_id, as_of)
                .await
            {
                Ok(updated) => {
                    run.subscriptions_succeeded += 1;
                    results.push(
                        self.record(
                            run.run_id,
                            invoice.subscription_id,
                            "mark_past_due",
                            "succeeded",
                            Some(updated.invoice_id),
                            None,
                        )
                        .await?,
                    );
                }
                Err(e) => {
                    let status = step_status(&e);
                    if status == "failed" {
                        warn!(
                            invoice_id = %invoice.invoice_id,
                            error = %e,
                            "Failed to mark invoice past due"
                        );
                        run.subscriptions_failed += 1;
                    }
                    results.push(
                        self.record(
                            run.run_id,
                            invoice.subscription_id,
                            "mark_past_due",
                            status,
                            Some(invoice.invoice_id),
                            Some(e.to_string()),
                        )
                        .await?,
                    );
                }
            }
        }

        Ok(results)
    }

    /// Runs the due transitions for one subscription in order: trial
    /// end, then invoicing, then renewal. Later steps only run when the
    /// earlier ones leave the subscription in a state that needs them.
    async fn process_subscription(
        &self,
        run_id: Uuid,
        subscription: Subscription,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<BillingRunResult>, BillingError> {
        let mut results = Vec::new();
        let mut current = subscription;

        if current.status() == SubscriptionStatus::Trialing {
            match self
                .machine
                .end_trial(current.project_id, current.subscription_id, as_of)
                .await
            {
                Ok(updated) => {
                    results.push(
                        self.record(
                            run_id,
                            updated.subscription_id,
                            "end_trial",
                            "succeeded",
                            None,
                            None,
                        )
                        .await?,
                    );
                    current = updated;
                }
                Err(e) => {
                    warn!(
                        subscription_id = %current.subscription_id,
                        error = %e,
                        "Trial end failed during sweep"
                    );
                    results.push(
                        self.record(
                            run_id,
                            current.subscription_id,
                            "end_trial",
                            step_status(&e),
                            None,
                            Some(e.to_string()),
                        )
                        .await?,
                    );
                    return Ok(results);
                }
            }
        }

        let billable = matches!(
            current.status(),
            SubscriptionStatus::Active | SubscriptionStatus::TrialEnded
        );
        let invoice_due = current.invoice_at.is_some_and(|at| at <= as_of);
        if billable && invoice_due {
            match self
                .machine
                .invoice(current.project_id, current.subscription_id, as_of)
                .await
            {
                Ok(invoice) => {
                    results.push(
                        self.record(
                            run_id,
                            current.subscription_id,
                            "invoice",
                            "succeeded",
                            Some(invoice.invoice_id),
                            None,
                        )
                        .await?,
                    );
                }
                Err(e) => {
                    warn!(
                        subscription_id = %current.subscription_id,
                        error = %e,
                        "Invoicing failed during sweep"
                    );
                    results.push(
                        self.record(
                            run_id,
                            current.subscription_id,
                            "invoice",
                            step_status(&e),
                            None,
                            Some(e.to_string()),
                        )
                        .await?,
                    );
                    return Ok(results);
                }
            }
        }

        if current.status() == SubscriptionStatus::Active && current.current_cycle_end_at <= as_of {
            match self
                .machine
                .renew(current.project_id, current.subscription_id, as_of)
                .await
            {
                Ok(_) => {
                    results.push(
                        self.record(
                            run_id,
                            current.subscription_id,
                            "renew",
                            "succeeded",
                            None,
                            None,
                        )
                        .await?,
                    );
                }
                Err(e) => {
                    warn!(
                        subscription_id = %current.subscription_id,
                        error = %e,
                        "Renewal failed during sweep"
                    );
                    results.push(
                        self.record(
                            run_id,
                            current.subscription_id,
                            "renew",
                            step_status(&e),
                            None,
                            Some(e.to_string()),
                        )
                        .await?,
                    );
                }
            }
        }

        if results.is_empty() {
            results.push(
                self.record(run_id, current.subscription_id, "noop", "skipped", None, None)
                    .await?,
            );
        }

        Ok(results)
    }

    async fn record(
        &self,
        run_id: Uuid,
        subscription_id: Uuid,
        action: &str,
        status: &str,
        invoice_id: Option<Uuid>,
        error_message: Option<String>,
    ) -> Result<BillingRunResult, BillingError> {
        let result = BillingRunResult {
            result_id: Uuid::new_v4(),
            run_id,
            subscription_id,
            status: status.to_string(),
            action: action.to_string(),
            invoice_id,
            error_message,
            created_utc: Utc::now(),
        };
        self.store.insert_run_result(result.clone()).await?;
        Ok(result)
    }
}

/// Transitions refused by a state guard are expected during a sweep;
/// anything else counts as a failure.
fn step_status(e: &BillingError) -> &'static str {
    match e {
        BillingError::InvalidTransition { .. } => "skipped",
        _ => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_refusals_are_skips_not_failures() {
        let refused = BillingError::InvalidTransition {
            subscription_id: Uuid::new_v4(),
            attempted: "renew",
            current_status: "past_due".to_string(),
            reason: "only active subscriptions renew".to_string(),
        };
        assert_eq!(step_status(&refused), "skipped");

        let contended = BillingError::ConcurrentModification(Uuid::new_v4());
        assert_eq!(step_status(&contended), "failed");

        let broken = BillingError::Storage(anyhow::anyhow!("connection reset"));
        assert_eq!(step_status(&broken), "failed");
    }
}
