//! Subscription phase state machine.
//!
//! Owns every status transition: trial end, invoicing, renewal,
//! cancellation and payment settlement. Each transition validates its
//! guard, computes the new snapshot, and persists all writes in one
//! transaction; external calls happen before anything is written so a
//! failure leaves no partial state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::BillingError;
use crate::models::{
    BillingPeriod, CreateSubscription, FeatureType, Invoice, InvoiceLine, InvoiceStatus,
    InvoiceType, LineType, PlanVersion, PlanVersionFeature, Subscription, SubscriptionItem,
    SubscriptionPhase, SubscriptionStatus, WhenToBill,
};
use crate::services::cycle::{self, CycleWindow};
use crate::services::guard::TransitionGuard;
use crate::services::metrics;
use crate::services::payment::{ChargeOutcome, PaymentProvider};
use crate::services::pricing::{self, PricingConfig};
use crate::services::store::{BillingStore, StoreTx, SubscriptionSeed};
use crate::services::usage::UsageReader;

/// When a cancellation takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelEffective {
    Immediate,
    EndOfCycle,
}

pub struct PhaseStateMachine {
    store: Arc<dyn BillingStore>,
    usage: Arc<dyn UsageReader>,
    payments: Arc<dyn PaymentProvider>,
    guard: TransitionGuard,
}

impl PhaseStateMachine {
    pub fn new(
        store: Arc<dyn BillingStore>,
        usage: Arc<dyn UsageReader>,
        payments: Arc<dyn PaymentProvider>,
        guard: TransitionGuard,
    ) -> Self {
        Self {
            store,
            usage,
            payments,
            guard,
        }
    }

    /// Creates a subscription with its first phase and default items.
    #[instrument(skip(self, input), fields(project_id = %input.project_id))]
    pub async fn create_subscription(
        &self,
        input: CreateSubscription,
        now: DateTime<Utc>,
    ) -> Result<Subscription, BillingError> {
        let plan = self
            .store
            .get_plan_version(input.project_id, input.plan_version_id)
            .await?;
        let features = self.store.plan_features(plan.plan_version_id).await?;

        let start_at = input.start_at.unwrap_or(now);
        let period = plan.billing_period();
        let anchor = input
            .billing_cycle_start
            .unwrap_or_else(|| default_anchor(start_at, period));
        let trial_days = input.trial_days.unwrap_or(plan.trial_days);
        let window = cycle::compute_cycle(start_at, period, anchor, Some(trial_days), input.end_at);

        let status = if window.trial_ends_at.is_some() {
            SubscriptionStatus::Trialing
        } else {
            SubscriptionStatus::Active
        };
        let invoice_at = match (window.trial_ends_at, input.when_to_bill) {
            (Some(_), _) => None,
            (None, WhenToBill::PayInAdvance) => Some(window.cycle_start),
            (None, WhenToBill::PayInArrear) => Some(window.cycle_end),
        };

        let subscription_id = Uuid::new_v4();
        let subscription = Subscription {
            subscription_id,
            project_id: input.project_id,
            customer_id: input.customer_id,
            status: status.as_str().to_string(),
            plan_version_id: plan.plan_version_id,
            current_cycle_start_at: window.cycle_start,
            current_cycle_end_at: window.cycle_end,
            invoice_at,
            timezone: input.timezone.clone(),
            proration_factor: window.proration_factor,
            cancel_at: None,
            created_utc: now,
            updated_utc: now,
        };
        let phase = SubscriptionPhase {
            phase_id: Uuid::new_v4(),
            subscription_id,
            plan_version_id: plan.plan_version_id,
            status: status.as_str().to_string(),
            when_to_bill: input.when_to_bill.as_str().to_string(),
            billing_cycle_start: anchor,
            grace_period_days: input.grace_period_days,
            trial_days,
            trial_ends_at: window.trial_ends_at,
            started_at: start_at,
            end_at: input.end_at,
            ended_at: None,
            created_utc: now,
            updated_utc: now,
        };
        let items = default_items(subscription_id, &features, now)?;

        let subscription = self
            .store
            .create_subscription(SubscriptionSeed {
                subscription,
                phase,
                items,
            })
            .await?;
        info!(
            subscription_id = %subscription.subscription_id,
            status = %subscription.status,
            "Subscription created"
        );
        Ok(subscription)
    }

    /// Ends the trial. Billing in arrear activates immediately; billing
    /// in advance holds at `trial_ended` until the first invoice is
    /// paid. The first paid cycle starts where the trial ended, even
    /// when this transition runs late.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn end_trial(
        &self,
        project_id: Uuid,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Subscription, BillingError> {
        let result = async {
            let _permit = self.guard.acquire(subscription_id)?;
            let mut tx = self.store.begin().await?;
            let mut subscription = tx.subscription_for_update(subscription_id).await?;
            check_project(&subscription, project_id)?;

            if subscription.status() != SubscriptionStatus::Trialing {
                return Err(invalid(
                    &subscription,
                    "end_trial",
                    "only trialing subscriptions have a trial to end",
                ));
            }
            let mut phase = tx.live_phase_for_update(subscription_id).await?;
            let trial_ends_at = phase
                .trial_ends_at
                .ok_or_else(|| invalid(&subscription, "end_trial", "no trial is configured"))?;
            if now < trial_ends_at {
                return Err(invalid(
                    &subscription,
                    "end_trial",
                    format!("trial runs until {trial_ends_at}"),
                ));
            }

            let plan = tx.plan_version(subscription.plan_version_id).await?;
            let window = cycle::compute_cycle(
                trial_ends_at,
                plan.billing_period(),
                phase.billing_cycle_start,
                None,
                phase.end_at,
            );
            let status = match phase.when_to_bill() {
                WhenToBill::PayInArrear => SubscriptionStatus::Active,
                WhenToBill::PayInAdvance => SubscriptionStatus::TrialEnded,
            };
            apply_window(&mut subscription, &window, phase.when_to_bill());
            subscription.status = status.as_str().to_string();
            subscription.updated_utc = now;
            phase.status = status.as_str().to_string();
            phase.updated_utc = now;

            tx.update_subscription(&subscription).await?;
            tx.update_phase(&phase).await?;
            tx.commit().await?;

            info!(
                subscription_id = %subscription.subscription_id,
                status = %subscription.status,
                "Trial ended"
            );
            Ok(subscription)
        }
        .await;
        record_outcome("end_trial", &result);
        result
    }

    /// Invoices the current cycle. Arrear phases invoice at cycle end,
    /// advance phases at cycle start; calling earlier is rejected with
    /// no invoice created. A cycle already covered by a non-void
    /// invoice returns that invoice unchanged.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn invoice(
        &self,
        project_id: Uuid,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Invoice, BillingError> {
        let result = async {
            let _permit = self.guard.acquire(subscription_id)?;
            let mut tx = self.store.begin().await?;
            let mut subscription = tx.subscription_for_update(subscription_id).await?;
            check_project(&subscription, project_id)?;

            if !matches!(
                subscription.status(),
                SubscriptionStatus::Active | SubscriptionStatus::TrialEnded
            ) {
                return Err(invalid(
                    &subscription,
                    "invoice",
                    "subscription is not in a billable state",
                ));
            }
            let phase = tx.live_phase_for_update(subscription_id).await?;
            let billing_at = match phase.when_to_bill() {
                WhenToBill::PayInArrear => subscription.current_cycle_end_at,
                WhenToBill::PayInAdvance => subscription.current_cycle_start_at,
            };
            if now < billing_at {
                return Err(invalid(&subscription, "invoice", "not ready to be invoiced"));
            }

            if let Some(existing) = tx
                .invoice_for_cycle(subscription_id, subscription.current_cycle_start_at)
                .await?
            {
                info!(invoice_id = %existing.invoice_id, "Cycle already invoiced");
                return Ok(existing);
            }

            let plan = tx.plan_version(subscription.plan_version_id).await?;
            let features = tx.plan_features(plan.plan_version_id).await?;
            let items = tx.items_for_subscription(subscription_id).await?;

            let invoice_id = Uuid::new_v4();
            let (lines, has_flat, has_usage) = self
                .build_lines(invoice_id, &subscription, &phase, &plan, &features, &items, now)
                .await?;

            let invoice_type = match phase.when_to_bill() {
                WhenToBill::PayInAdvance => InvoiceType::Flat,
                WhenToBill::PayInArrear => match (has_flat, has_usage) {
                    (true, true) => InvoiceType::Hybrid,
                    (false, true) => InvoiceType::Usage,
                    _ => InvoiceType::Flat,
                },
            };
            let due_at = billing_at;
            let past_due_at = due_at + Duration::days(phase.grace_period_days as i64);
            let total: Decimal = lines.iter().map(|line| line.amount).sum();

            let invoice = Invoice {
                invoice_id,
                subscription_id,
                project_id,
                customer_id: subscription.customer_id,
                cycle_start_at: subscription.current_cycle_start_at,
                cycle_end_at: subscription.current_cycle_end_at,
                invoice_type: invoice_type.as_str().to_string(),
                status: InvoiceStatus::Draft.as_str().to_string(),
                currency: plan.currency.clone(),
                total,
                due_at,
                past_due_at,
                paid_at: None,
                created_utc: now,
                updated_utc: now,
            };
            tx.insert_invoice(&invoice, &lines).await?;

            subscription.invoice_at = match phase.when_to_bill() {
                WhenToBill::PayInAdvance => Some(subscription.current_cycle_end_at),
                WhenToBill::PayInArrear => None,
            };
            subscription.updated_utc = now;
            tx.update_subscription(&subscription).await?;
            tx.commit().await?;

            metrics::record_invoice_created(invoice_type.as_str());
            metrics::record_invoice_amount(
                &invoice.currency,
                invoice_type.as_str(),
                total.to_f64().unwrap_or(0.0),
            );
            info!(
                invoice_id = %invoice.invoice_id,
                invoice_type = %invoice.invoice_type,
                total = %invoice.total,
                "Invoice created"
            );
            Ok(invoice)
        }
        .await;
        record_outcome("invoice", &result);
        result
    }

    /// Advances to the next cycle. An arrear cycle must be invoiced
    /// before it can roll over; a reached `cancel_at` or phase end
    /// terminates instead of renewing.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn renew(
        &self,
        project_id: Uuid,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Subscription, BillingError> {
        let result = async {
            let _permit = self.guard.acquire(subscription_id)?;
            let mut tx = self.store.begin().await?;
            let mut subscription = tx.subscription_for_update(subscription_id).await?;
            check_project(&subscription, project_id)?;

            if subscription.status() != SubscriptionStatus::Active {
                return Err(invalid(&subscription, "renew", "only active subscriptions renew"));
            }
            if now < subscription.current_cycle_end_at {
                return Err(invalid(&subscription, "renew", "the current cycle has not ended"));
            }
            let mut phase = tx.live_phase_for_update(subscription_id).await?;

            if phase.when_to_bill() == WhenToBill::PayInArrear {
                let invoiced = tx
                    .invoice_for_cycle(subscription_id, subscription.current_cycle_start_at)
                    .await?;
                if invoiced.is_none() {
                    return Err(invalid(&subscription, "renew", "invoice the current cycle first"));
                }
            }

            if let Some(cancel_at) = subscription.cancel_at {
                if cancel_at <= now {
                    finish(&mut subscription, &mut phase, SubscriptionStatus::Canceled, cancel_at, now);
                    tx.update_subscription(&subscription).await?;
                    tx.update_phase(&phase).await?;
                    tx.commit().await?;
                    info!(
                        subscription_id = %subscription.subscription_id,
                        "Subscription canceled at cycle end"
                    );
                    return Ok(subscription);
                }
            }
            if let Some(end_at) = phase.end_at {
                if end_at <= now {
                    finish(&mut subscription, &mut phase, SubscriptionStatus::Ended, end_at, now);
                    tx.update_subscription(&subscription).await?;
                    tx.update_phase(&phase).await?;
                    tx.commit().await?;
                    info!(subscription_id = %subscription.subscription_id, "Subscription ended");
                    return Ok(subscription);
                }
            }

            let plan = tx.plan_version(subscription.plan_version_id).await?;
            let window = cycle::compute_cycle(
                subscription.current_cycle_end_at,
                plan.billing_period(),
                phase.billing_cycle_start,
                None,
                phase.end_at,
            );
            apply_window(&mut subscription, &window, phase.when_to_bill());
            subscription.updated_utc = now;
            tx.update_subscription(&subscription).await?;
            tx.commit().await?;

            info!(
                subscription_id = %subscription.subscription_id,
                cycle_end = %subscription.current_cycle_end_at,
                "Cycle renewed"
            );
            Ok(subscription)
        }
        .await;
        record_outcome("renew", &result);
        result
    }

    /// Cancels the subscription, either right away or when the current
    /// cycle ends.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn cancel(
        &self,
        project_id: Uuid,
        subscription_id: Uuid,
        effective: CancelEffective,
        now: DateTime<Utc>,
    ) -> Result<Subscription, BillingError> {
        let result = async {
            let _permit = self.guard.acquire(subscription_id)?;
            let mut tx = self.store.begin().await?;
            let mut subscription = tx.subscription_for_update(subscription_id).await?;
            check_project(&subscription, project_id)?;

            if subscription.status().is_terminal() {
                return Err(invalid(&subscription, "cancel", "subscription already ended"));
            }
            match effective {
                CancelEffective::Immediate => {
                    let mut phase = tx.live_phase_for_update(subscription_id).await?;
                    subscription.cancel_at = Some(now);
                    finish(&mut subscription, &mut phase, SubscriptionStatus::Canceled, now, now);
                    tx.update_subscription(&subscription).await?;
                    tx.update_phase(&phase).await?;
                }
                CancelEffective::EndOfCycle => {
                    subscription.cancel_at = Some(subscription.current_cycle_end_at);
                    subscription.updated_utc = now;
                    tx.update_subscription(&subscription).await?;
                }
            }
            tx.commit().await?;

            info!(
                subscription_id = %subscription.subscription_id,
                effective = ?effective,
                "Cancellation recorded"
            );
            Ok(subscription)
        }
        .await;
        record_outcome("cancel", &result);
        result
    }

    /// Attempts to settle an invoice with the customer's default
    /// payment method. Success activates a `trial_ended` or `past_due`
    /// subscription; a decline past the grace period marks both the
    /// invoice and the subscription past due.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn pay_invoice(
        &self,
        project_id: Uuid,
        invoice_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Invoice, BillingError> {
        let result = async {
            let located = self.store.get_invoice(project_id, invoice_id).await?;
            let _permit = self.guard.acquire(located.subscription_id)?;
            let mut tx = self.store.begin().await?;
            let mut invoice = tx.invoice_for_update(invoice_id).await?;
            let mut subscription = tx.subscription_for_update(invoice.subscription_id).await?;

            match invoice.status() {
                InvoiceStatus::Paid => {
                    info!(invoice_id = %invoice.invoice_id, "Invoice already paid");
                    return Ok(invoice);
                }
                InvoiceStatus::Void => {
                    return Err(invalid(&subscription, "pay", "the invoice is void"));
                }
                _ => {}
            }

            let method = self
                .payments
                .default_payment_method(project_id, invoice.customer_id)
                .await?;
            let outcome = self.payments.charge(&method, &invoice).await?;

            match outcome {
                ChargeOutcome::Succeeded => {
                    invoice.status = InvoiceStatus::Paid.as_str().to_string();
                    invoice.paid_at = Some(now);
                    invoice.updated_utc = now;
                    tx.update_invoice(&invoice).await?;

                    if matches!(
                        subscription.status(),
                        SubscriptionStatus::TrialEnded | SubscriptionStatus::PastDue
                    ) {
                        subscription.status = SubscriptionStatus::Active.as_str().to_string();
                        subscription.updated_utc = now;
                        tx.update_subscription(&subscription).await?;
                        mirror_phase(&mut *tx, &subscription, now).await?;
                    }
                    info!(invoice_id = %invoice.invoice_id, "Invoice paid");
                }
                ChargeOutcome::Declined { reason } => {
                    warn!(invoice_id = %invoice.invoice_id, reason = %reason, "Charge declined");
                    if now > invoice.past_due_at {
                        invoice.status = InvoiceStatus::PastDue.as_str().to_string();
                        invoice.updated_utc = now;
                        tx.update_invoice(&invoice).await?;

                        if subscription
                            .status()
                            .can_transition_to(SubscriptionStatus::PastDue)
                        {
                            subscription.status = SubscriptionStatus::PastDue.as_str().to_string();
                            subscription.updated_utc = now;
                            tx.update_subscription(&subscription).await?;
                            mirror_phase(&mut *tx, &subscription, now).await?;
                        }
                    } else {
                        invoice.status = InvoiceStatus::Open.as_str().to_string();
                        invoice.updated_utc = now;
                        tx.update_invoice(&invoice).await?;
                    }
                }
            }
            tx.commit().await?;
            Ok(invoice)
        }
        .await;
        record_outcome("pay", &result);
        result
    }

    /// Marks an overdue unpaid invoice past due and cascades the status
    /// to the subscription. A no-op for invoices that are settled or
    /// still within their grace period.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn mark_past_due(
        &self,
        project_id: Uuid,
        invoice_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Invoice, BillingError> {
        let result = async {
            let located = self.store.get_invoice(project_id, invoice_id).await?;
            let _permit = self.guard.acquire(located.subscription_id)?;
            let mut tx = self.store.begin().await?;
            let mut invoice = tx.invoice_for_update(invoice_id).await?;

            let overdue = matches!(invoice.status(), InvoiceStatus::Draft | InvoiceStatus::Open)
                && now > invoice.past_due_at;
            if !overdue {
                return Ok(invoice);
            }

            invoice.status = InvoiceStatus::PastDue.as_str().to_string();
            invoice.updated_utc = now;
            tx.update_invoice(&invoice).await?;

            let mut subscription = tx.subscription_for_update(invoice.subscription_id).await?;
            if subscription
                .status()
                .can_transition_to(SubscriptionStatus::PastDue)
            {
                subscription.status = SubscriptionStatus::PastDue.as_str().to_string();
                subscription.updated_utc = now;
                tx.update_subscription(&subscription).await?;
                mirror_phase(&mut *tx, &subscription, now).await?;
            }
            tx.commit().await?;

            warn!(
                invoice_id = %invoice.invoice_id,
                subscription_id = %invoice.subscription_id,
                "Invoice past due"
            );
            Ok(invoice)
        }
        .await;
        record_outcome("mark_past_due", &result);
        result
    }

    async fn build_lines(
        &self,
        invoice_id: Uuid,
        subscription: &Subscription,
        phase: &SubscriptionPhase,
        plan: &PlanVersion,
        features: &[PlanVersionFeature],
        items: &[SubscriptionItem],
        now: DateTime<Utc>,
    ) -> Result<(Vec<InvoiceLine>, bool, bool), BillingError> {
        let by_feature: HashMap<Uuid, &PlanVersionFeature> =
            features.iter().map(|f| (f.feature_id, f)).collect();
        let mut lines = Vec::new();
        let mut has_flat = false;
        let mut has_usage = false;

        for item in items {
            let feature = *by_feature.get(&item.feature_plan_version_id).ok_or_else(|| {
                BillingError::not_found("plan feature", item.feature_plan_version_id)
            })?;
            let feature_type = feature.feature_type();
            if feature_type.is_usage() {
                continue;
            }
            let config = PricingConfig::from_value(&feature.pricing)?;
            let quantity = item.units.or(feature.default_units).unwrap_or(Decimal::ZERO);
            let priced = pricing::price_for_feature(feature_type, &config, quantity)?;

            let factor = subscription.proration_factor;
            let is_prorated = factor < Decimal::ONE;
            let amount = if is_prorated {
                (priced.total_price * factor).round_dp(2)
            } else {
                priced.total_price.round_dp(2)
            };
            has_flat = true;
            lines.push(InvoiceLine {
                line_id: Uuid::new_v4(),
                invoice_id,
                feature_plan_version_id: Some(feature.feature_id),
                line_type: LineType::Flat.as_str().to_string(),
                description: feature.name.clone(),
                quantity,
                unit_price: priced.unit_price,
                amount,
                is_prorated,
                proration_factor: if is_prorated { Some(factor) } else { None },
                created_utc: now,
            });
        }

        // Arrear bills the cycle just completed; advance bills usage
        // one cycle behind, and never for time inside the trial.
        let billing_started_at = phase.trial_ends_at.unwrap_or(phase.started_at);
        let usage_window = match phase.when_to_bill() {
            WhenToBill::PayInArrear => Some((
                subscription.current_cycle_start_at,
                subscription.current_cycle_end_at,
            )),
            WhenToBill::PayInAdvance => {
                if subscription.current_cycle_start_at > billing_started_at {
                    let previous = cycle::previous_cycle_start(
                        subscription.current_cycle_start_at,
                        plan.billing_period(),
                        phase.billing_cycle_start,
                    );
                    Some((
                        previous.max(billing_started_at),
                        subscription.current_cycle_start_at,
                    ))
                } else {
                    None
                }
            }
        };

        if let Some((start, end)) = usage_window {
            for item in items {
                let feature = match by_feature.get(&item.feature_plan_version_id) {
                    Some(feature) if feature.feature_type().is_usage() => *feature,
                    _ => continue,
                };
                let config = PricingConfig::from_value(&feature.pricing)?;
                let totals = self
                    .usage
                    .get_usage(
                        subscription.project_id,
                        subscription.customer_id,
                        &feature.feature_slug,
                        start,
                        end,
                    )
                    .await?;
                let mut quantity = totals.quantity(feature.aggregation.as_deref());
                if let Some(limit) = feature.usage_limit {
                    quantity = quantity.min(limit);
                }
                let priced = pricing::price_for_feature(FeatureType::Usage, &config, quantity)?;
                has_usage = true;
                lines.push(InvoiceLine {
                    line_id: Uuid::new_v4(),
                    invoice_id,
                    feature_plan_version_id: Some(feature.feature_id),
                    line_type: LineType::Usage.as_str().to_string(),
                    description: feature.name.clone(),
                    quantity,
                    unit_price: priced.unit_price,
                    amount: priced.total_price.round_dp(2),
                    is_prorated: false,
                    proration_factor: None,
                    created_utc: now,
                });
            }
        }

        Ok((lines, has_flat, has_usage))
    }
}

fn check_project(subscription: &Subscription, project_id: Uuid) -> Result<(), BillingError> {
    if subscription.project_id != project_id {
        return Err(BillingError::not_found(
            "subscription",
            subscription.subscription_id,
        ));
    }
    Ok(())
}

fn invalid(
    subscription: &Subscription,
    attempted: &'static str,
    reason: impl Into<String>,
) -> BillingError {
    BillingError::InvalidTransition {
        subscription_id: subscription.subscription_id,
        attempted,
        current_status: subscription.status.clone(),
        reason: reason.into(),
    }
}

fn apply_window(subscription: &mut Subscription, window: &CycleWindow, when_to_bill: WhenToBill) {
    subscription.current_cycle_start_at = window.cycle_start;
    subscription.current_cycle_end_at = window.cycle_end;
    subscription.proration_factor = window.proration_factor;
    subscription.invoice_at = Some(match when_to_bill {
        WhenToBill::PayInAdvance => window.cycle_start,
        WhenToBill::PayInArrear => window.cycle_end,
    });
}

fn finish(
    subscription: &mut Subscription,
    phase: &mut SubscriptionPhase,
    status: SubscriptionStatus,
    effective_at: DateTime<Utc>,
    now: DateTime<Utc>,
) {
    subscription.status = status.as_str().to_string();
    subscription.invoice_at = None;
    subscription.updated_utc = now;
    phase.status = status.as_str().to_string();
    phase.ended_at = Some(effective_at);
    phase.updated_utc = now;
}

async fn mirror_phase(
    tx: &mut dyn StoreTx,
    subscription: &Subscription,
    now: DateTime<Utc>,
) -> Result<(), BillingError> {
    let mut phase = tx.live_phase_for_update(subscription.subscription_id).await?;
    phase.status = subscription.status.clone();
    phase.updated_utc = now;
    tx.update_phase(&phase).await
}

fn default_anchor(start_at: DateTime<Utc>, period: BillingPeriod) -> i32 {
    match period {
        BillingPeriod::Week => start_at.weekday().num_days_from_monday() as i32,
        BillingPeriod::Day => 1,
        _ => start_at.day() as i32,
    }
}

fn default_items(
    subscription_id: Uuid,
    features: &[PlanVersionFeature],
    now: DateTime<Utc>,
) -> Result<Vec<SubscriptionItem>, BillingError> {
    features
        .iter()
        .map(|feature| {
            let units = if feature.feature_type().is_usage() {
                None
            } else {
                Some(pricing::default_quantity(feature)?)
            };
            Ok(SubscriptionItem {
                item_id: Uuid::new_v4(),
                subscription_id,
                feature_plan_version_id: feature.feature_id,
                units,
                created_utc: now,
                updated_utc: now,
            })
        })
        .collect()
}

fn record_outcome<T>(transition: &str, result: &Result<T, BillingError>) {
    match result {
        Ok(_) => metrics::record_transition(transition, "success"),
        Err(err) => {
            metrics::record_transition(transition, "error");
            metrics::record_error(err.kind(), transition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn default_anchor_follows_billing_period() {
        // 2026-03-04 is a Wednesday.
        let start = Utc.with_ymd_and_hms(2026, 3, 4, 0, 0, 0).unwrap();
        assert_eq!(default_anchor(start, BillingPeriod::Month), 4);
        assert_eq!(default_anchor(start, BillingPeriod::Week), 2);
        assert_eq!(default_anchor(start, BillingPeriod::Day), 1);
    }

    #[test]
    fn default_items_leave_usage_units_unset() {
        let now = Utc::now();
        let subscription_id = Uuid::new_v4();
        let features = vec![
            PlanVersionFeature {
                feature_id: Uuid::new_v4(),
                plan_version_id: Uuid::new_v4(),
                feature_slug: "seats".to_string(),
                name: "Seats".to_string(),
                feature_type: "tier".to_string(),
                pricing: json!({}),
                default_units: Some(Decimal::from(5)),
                usage_limit: None,
                aggregation: None,
                position: 0,
                created_utc: now,
            },
            PlanVersionFeature {
                feature_id: Uuid::new_v4(),
                plan_version_id: Uuid::new_v4(),
                feature_slug: "api-calls".to_string(),
                name: "API calls".to_string(),
                feature_type: "usage".to_string(),
                pricing: json!({}),
                default_units: None,
                usage_limit: None,
                aggregation: Some("sum".to_string()),
                position: 1,
                created_utc: now,
            },
        ];

        let items = default_items(subscription_id, &features, now).unwrap();
        assert_eq!(items[0].units, Some(Decimal::from(5)));
        assert_eq!(items[1].units, None);
    }

    #[test]
    fn default_items_fall_back_to_free_allowance() {
        let now = Utc::now();
        let features = vec![PlanVersionFeature {
            feature_id: Uuid::new_v4(),
            plan_version_id: Uuid::new_v4(),
            feature_slug: "alerts".to_string(),
            name: "Alerts".to_string(),
            feature_type: "tier".to_string(),
            pricing: json!({
                "type": "tier",
                "mode": "graduated",
                "tiers": [
                    {"first_unit": "1", "last_unit": "20", "unit_price": "0"},
                    {"first_unit": "21", "unit_price": "0.50"}
                ]
            }),
            default_units: None,
            usage_limit: None,
            aggregation: None,
            position: 0,
            created_utc: now,
        }];

        let items = default_items(Uuid::new_v4(), &features, now).unwrap();
        assert_eq!(items[0].units, Some(Decimal::from(20)));
    }
}
