//! Plan change coordination.
//!
//! A change is proposed first: the coordinator classifies it as an
//! upgrade or downgrade, computes the item-level diff against the
//! target plan and parks the subscription in `changing`. Applying the
//! staged diff swaps the plan, supersedes the live phase and restarts
//! the billing cycle at the change instant.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::BillingError;
use crate::models::{
    ChangeStatus, ChangeType, ItemChangeType, PlanVersionFeature, ProposeChange, ProposeItemUnits,
    SubscriptionChange, SubscriptionItem, SubscriptionItemChange, SubscriptionPhase,
    SubscriptionStatus, WhenToBill,
};
use crate::services::cycle;
use crate::services::guard::TransitionGuard;
use crate::services::metrics;
use crate::services::pricing::{self, PricingError};
use crate::services::store::BillingStore;

pub struct SubscriptionChangeCoordinator {
    store: Arc<dyn BillingStore>,
    guard: TransitionGuard,
}

impl SubscriptionChangeCoordinator {
    /// The guard must be the same instance the phase state machine
    /// uses, so a change and a lifecycle transition on one subscription
    /// cannot interleave.
    pub fn new(store: Arc<dyn BillingStore>, guard: TransitionGuard) -> Self {
        Self { store, guard }
    }

    /// Stages a plan change. A change effective now is applied before
    /// returning; a future-dated one stays pending with the
    /// subscription parked in `changing` until applied or canceled.
    #[instrument(skip(self, input), fields(subscription_id = %input.subscription_id))]
    pub async fn propose_change(
        &self,
        input: ProposeChange,
        now: DateTime<Utc>,
    ) -> Result<(SubscriptionChange, Vec<SubscriptionItemChange>), BillingError> {
        let result = self.propose(&input, now).await;
        match result {
            Ok((change, staged)) if change.status() == ChangeStatus::Changing => {
                let applied = self.apply_change(input.project_id, change.change_id, now).await?;
                Ok((applied, staged))
            }
            Err(err) => {
                metrics::record_error(err.kind(), "propose_change");
                Err(err)
            }
            other => other,
        }
    }

    async fn propose(
        &self,
        input: &ProposeChange,
        now: DateTime<Utc>,
    ) -> Result<(SubscriptionChange, Vec<SubscriptionItemChange>), BillingError> {
        let _permit = self.guard.acquire(input.subscription_id)?;
        let mut tx = self.store.begin().await?;
        let mut subscription = tx.subscription_for_update(input.subscription_id).await?;
        if subscription.project_id != input.project_id {
            return Err(BillingError::not_found("subscription", input.subscription_id));
        }
        if !matches!(
            subscription.status(),
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        ) {
            return Err(BillingError::InvalidTransition {
                subscription_id: subscription.subscription_id,
                attempted: "propose_change",
                current_status: subscription.status.clone(),
                reason: "only active or trialing subscriptions can change plans".to_string(),
            });
        }
        let mut phase = tx.live_phase_for_update(input.subscription_id).await?;

        let old_plan = tx.plan_version(subscription.plan_version_id).await?;
        let old_features = tx.plan_features(old_plan.plan_version_id).await?;
        let new_plan = tx.plan_version(input.new_plan_version_id).await?;
        if new_plan.project_id != input.project_id {
            return Err(BillingError::not_found("plan version", input.new_plan_version_id));
        }
        let new_features = tx.plan_features(new_plan.plan_version_id).await?;

        if old_plan.currency != new_plan.currency {
            return Err(PricingError::InvalidConfig(format!(
                "cannot change plans across currencies ({} to {})",
                old_plan.currency, new_plan.currency
            ))
            .into());
        }

        // Ties count as upgrades so lateral moves take the cheaper,
        // immediate path.
        let old_total = pricing::total_price_plan(&old_plan, &old_features)?;
        let new_total = pricing::total_price_plan(&new_plan, &new_features)?;
        let change_type = if new_total.total.amount >= old_total.total.amount {
            ChangeType::Upgrade
        } else {
            ChangeType::Downgrade
        };

        let current_items = tx.items_for_subscription(input.subscription_id).await?;
        let change_id = Uuid::new_v4();
        let staged = stage_items(
            change_id,
            &input.items,
            &current_items,
            &old_features,
            &new_features,
            now,
        )?;

        let change_at = input.change_at.unwrap_or(now);
        let status = if change_at <= now {
            ChangeStatus::Changing
        } else {
            ChangeStatus::Pending
        };
        let change = SubscriptionChange {
            change_id,
            subscription_id: subscription.subscription_id,
            project_id: subscription.project_id,
            previous_plan_version_id: old_plan.plan_version_id,
            new_plan_version_id: new_plan.plan_version_id,
            change_type: change_type.as_str().to_string(),
            status: status.as_str().to_string(),
            change_at,
            applied_at: None,
            created_utc: now,
            updated_utc: now,
        };
        tx.insert_change(&change, &staged).await?;

        subscription.status = SubscriptionStatus::Changing.as_str().to_string();
        subscription.updated_utc = now;
        tx.update_subscription(&subscription).await?;
        phase.status = subscription.status.clone();
        phase.updated_utc = now;
        tx.update_phase(&phase).await?;
        tx.commit().await?;

        metrics::record_plan_change(change_type.as_str(), "proposed");
        info!(
            change_id = %change.change_id,
            change_type = %change.change_type,
            staged = staged.len(),
            "Plan change proposed"
        );
        Ok((change, staged))
    }

    /// Applies a staged change: replays the item diff, supersedes the
    /// live phase and restarts the cycle at the change instant. Applying
    /// an already applied change returns it unchanged.
    #[instrument(skip(self), fields(change_id = %change_id))]
    pub async fn apply_change(
        &self,
        project_id: Uuid,
        change_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionChange, BillingError> {
        let result = async {
            let located = self.store.get_change(project_id, change_id).await?;
            let _permit = self.guard.acquire(located.subscription_id)?;
            let mut tx = self.store.begin().await?;
            let mut change = tx.change_for_update(change_id).await?;

            match change.status() {
                ChangeStatus::Applied => {
                    info!(change_id = %change.change_id, "Change already applied");
                    return Ok(change);
                }
                ChangeStatus::Canceled => {
                    return Err(BillingError::InvalidTransition {
                        subscription_id: change.subscription_id,
                        attempted: "apply_change",
                        current_status: change.status.clone(),
                        reason: "the change was canceled".to_string(),
                    });
                }
                _ => {}
            }
            if now < change.change_at {
                return Err(BillingError::InvalidTransition {
                    subscription_id: change.subscription_id,
                    attempted: "apply_change",
                    current_status: change.status.clone(),
                    reason: format!("change is scheduled for {}", change.change_at),
                });
            }

            let mut subscription = tx.subscription_for_update(change.subscription_id).await?;
            if subscription.status() != SubscriptionStatus::Changing {
                return Err(BillingError::InvalidTransition {
                    subscription_id: subscription.subscription_id,
                    attempted: "apply_change",
                    current_status: subscription.status.clone(),
                    reason: "subscription is not staged for a plan change".to_string(),
                });
            }
            let mut old_phase = tx.live_phase_for_update(change.subscription_id).await?;
            let new_plan = tx.plan_version(change.new_plan_version_id).await?;
            let staged = tx.item_changes(change_id).await?;
            let current_items = tx.items_for_subscription(change.subscription_id).await?;
            let by_feature: HashMap<Uuid, &SubscriptionItem> = current_items
                .iter()
                .map(|item| (item.feature_plan_version_id, item))
                .collect();

            for entry in &staged {
                match entry.change_type() {
                    ItemChangeType::Remove => {
                        let item = entry
                            .previous_feature_plan_version_id
                            .and_then(|id| by_feature.get(&id));
                        if let Some(item) = item {
                            tx.delete_item(item.item_id).await?;
                        }
                    }
                    ItemChangeType::Update => {
                        let previous_id =
                            entry.previous_feature_plan_version_id.ok_or_else(|| {
                                BillingError::not_found("subscription item", &entry.feature_slug)
                            })?;
                        let item = by_feature.get(&previous_id).ok_or_else(|| {
                            BillingError::not_found("subscription item", &entry.feature_slug)
                        })?;
                        let new_feature_id =
                            entry.new_feature_plan_version_id.ok_or_else(|| {
                                BillingError::not_found("plan feature", &entry.feature_slug)
                            })?;
                        let mut updated = (*item).clone();
                        updated.feature_plan_version_id = new_feature_id;
                        updated.units = entry.new_units;
                        updated.updated_utc = now;
                        tx.update_item(&updated).await?;
                    }
                    ItemChangeType::Add => {
                        let new_feature_id =
                            entry.new_feature_plan_version_id.ok_or_else(|| {
                                BillingError::not_found("plan feature", &entry.feature_slug)
                            })?;
                        tx.insert_item(&SubscriptionItem {
                            item_id: Uuid::new_v4(),
                            subscription_id: change.subscription_id,
                            feature_plan_version_id: new_feature_id,
                            units: entry.new_units,
                            created_utc: now,
                            updated_utc: now,
                        })
                        .await?;
                    }
                }
            }

            let window = cycle::compute_cycle(
                change.change_at,
                new_plan.billing_period(),
                old_phase.billing_cycle_start,
                None,
                old_phase.end_at,
            );

            // Supersede the live phase before inserting its replacement
            // so at most one phase is ever live.
            let when_to_bill = old_phase.when_to_bill();
            old_phase.status = SubscriptionStatus::Ended.as_str().to_string();
            old_phase.ended_at = Some(change.change_at);
            old_phase.updated_utc = now;
            tx.update_phase(&old_phase).await?;

            let new_phase = SubscriptionPhase {
                phase_id: Uuid::new_v4(),
                subscription_id: change.subscription_id,
                plan_version_id: new_plan.plan_version_id,
                status: SubscriptionStatus::Active.as_str().to_string(),
                when_to_bill: old_phase.when_to_bill.clone(),
                billing_cycle_start: old_phase.billing_cycle_start,
                grace_period_days: old_phase.grace_period_days,
                trial_days: 0,
                trial_ends_at: None,
                started_at: change.change_at,
                end_at: old_phase.end_at,
                ended_at: None,
                created_utc: now,
                updated_utc: now,
            };
            tx.insert_phase(&new_phase).await?;

            subscription.plan_version_id = new_plan.plan_version_id;
            subscription.status = SubscriptionStatus::Active.as_str().to_string();
            subscription.current_cycle_start_at = window.cycle_start;
            subscription.current_cycle_end_at = window.cycle_end;
            subscription.proration_factor = window.proration_factor;
            subscription.invoice_at = Some(match when_to_bill {
                WhenToBill::PayInAdvance => window.cycle_start,
                WhenToBill::PayInArrear => window.cycle_end,
            });
            subscription.updated_utc = now;
            tx.update_subscription(&subscription).await?;

            change.status = ChangeStatus::Applied.as_str().to_string();
            change.applied_at = Some(now);
            change.updated_utc = now;
            tx.update_change(&change).await?;
            tx.commit().await?;

            metrics::record_plan_change(&change.change_type, "applied");
            info!(
                change_id = %change.change_id,
                subscription_id = %change.subscription_id,
                plan_version_id = %new_plan.plan_version_id,
                "Plan change applied"
            );
            Ok(change)
        }
        .await;
        if let Err(err) = &result {
            metrics::record_error(err.kind(), "apply_change");
        }
        result
    }

    /// Cancels a staged change and releases the subscription back to
    /// `active`. Canceling an already canceled change is a no-op.
    #[instrument(skip(self), fields(change_id = %change_id))]
    pub async fn cancel_change(
        &self,
        project_id: Uuid,
        change_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionChange, BillingError> {
        let result = async {
            let located = self.store.get_change(project_id, change_id).await?;
            let _permit = self.guard.acquire(located.subscription_id)?;
            let mut tx = self.store.begin().await?;
            let mut change = tx.change_for_update(change_id).await?;

            match change.status() {
                ChangeStatus::Canceled => return Ok(change),
                ChangeStatus::Applied => {
                    return Err(BillingError::InvalidTransition {
                        subscription_id: change.subscription_id,
                        attempted: "cancel_change",
                        current_status: change.status.clone(),
                        reason: "the change was already applied".to_string(),
                    });
                }
                _ => {}
            }

            let mut subscription = tx.subscription_for_update(change.subscription_id).await?;
            if subscription.status() == SubscriptionStatus::Changing {
                subscription.status = SubscriptionStatus::Active.as_str().to_string();
                subscription.updated_utc = now;
                tx.update_subscription(&subscription).await?;
                let mut phase = tx.live_phase_for_update(change.subscription_id).await?;
                phase.status = subscription.status.clone();
                phase.updated_utc = now;
                tx.update_phase(&phase).await?;
            }

            change.status = ChangeStatus::Canceled.as_str().to_string();
            change.updated_utc = now;
            tx.update_change(&change).await?;
            tx.commit().await?;

            metrics::record_plan_change(&change.change_type, "canceled");
            info!(change_id = %change.change_id, "Plan change canceled");
            Ok(change)
        }
        .await;
        if let Err(err) = &result {
            metrics::record_error(err.kind(), "cancel_change");
        }
        result
    }
}

/// Diffs the current items against the target plan, keyed by feature
/// slug so renamed feature ids across plan versions still line up.
/// Quantities the caller did not override fall back to
/// [`pricing::default_quantity`].
fn stage_items(
    change_id: Uuid,
    overrides: &[ProposeItemUnits],
    current_items: &[SubscriptionItem],
    old_features: &[PlanVersionFeature],
    new_features: &[PlanVersionFeature],
    now: DateTime<Utc>,
) -> Result<Vec<SubscriptionItemChange>, PricingError> {
    let old_by_id: HashMap<Uuid, &PlanVersionFeature> =
        old_features.iter().map(|f| (f.feature_id, f)).collect();
    let override_units: HashMap<&str, Decimal> = overrides
        .iter()
        .map(|o| (o.feature_slug.as_str(), o.units))
        .collect();

    let mut current_by_slug: HashMap<&str, &SubscriptionItem> = HashMap::new();
    for item in current_items {
        if let Some(feature) = old_by_id.get(&item.feature_plan_version_id) {
            current_by_slug.insert(feature.feature_slug.as_str(), item);
        }
    }

    let mut staged = Vec::new();
    for feature in new_features {
        let new_units = if feature.feature_type().is_usage() {
            None
        } else {
            match override_units.get(feature.feature_slug.as_str()).copied() {
                Some(units) => Some(units),
                None => Some(pricing::default_quantity(feature)?),
            }
        };
        match current_by_slug.remove(feature.feature_slug.as_str()) {
            Some(item) => staged.push(SubscriptionItemChange {
                item_change_id: Uuid::new_v4(),
                change_id,
                change_type: ItemChangeType::Update.as_str().to_string(),
                feature_slug: feature.feature_slug.clone(),
                previous_feature_plan_version_id: Some(item.feature_plan_version_id),
                new_feature_plan_version_id: Some(feature.feature_id),
                previous_units: item.units,
                new_units,
                created_utc: now,
            }),
            None => staged.push(SubscriptionItemChange {
                item_change_id: Uuid::new_v4(),
                change_id,
                change_type: ItemChangeType::Add.as_str().to_string(),
                feature_slug: feature.feature_slug.clone(),
                previous_feature_plan_version_id: None,
                new_feature_plan_version_id: Some(feature.feature_id),
                previous_units: None,
                new_units,
                created_utc: now,
            }),
        }
    }

    let mut removed: Vec<(&str, &SubscriptionItem)> = current_by_slug.into_iter().collect();
    removed.sort_by_key(|(slug, _)| *slug);
    for (slug, item) in removed {
        staged.push(SubscriptionItemChange {
            item_change_id: Uuid::new_v4(),
            change_id,
            change_type: ItemChangeType::Remove.as_str().to_string(),
            feature_slug: slug.to_string(),
            previous_feature_plan_version_id: Some(item.feature_plan_version_id),
            new_feature_plan_version_id: None,
            previous_units: item.units,
            new_units: None,
            created_utc: now,
        });
    }
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feature(slug: &str, feature_type: &str, default_units: Option<Decimal>) -> PlanVersionFeature {
        PlanVersionFeature {
            feature_id: Uuid::new_v4(),
            plan_version_id: Uuid::new_v4(),
            feature_slug: slug.to_string(),
            name: slug.to_string(),
            feature_type: feature_type.to_string(),
            pricing: json!({}),
            default_units,
            usage_limit: None,
            aggregation: None,
            position: 0,
            created_utc: Utc::now(),
        }
    }

    fn item(subscription_id: Uuid, feature_id: Uuid, units: Option<Decimal>) -> SubscriptionItem {
        let now = Utc::now();
        SubscriptionItem {
            item_id: Uuid::new_v4(),
            subscription_id,
            feature_plan_version_id: feature_id,
            units,
            created_utc: now,
            updated_utc: now,
        }
    }

    #[test]
    fn stage_items_classifies_add_update_remove() {
        let subscription_id = Uuid::new_v4();
        let seats_old = feature("seats", "tier", Some(Decimal::ONE));
        let storage = feature("storage", "flat", Some(Decimal::ONE));
        let seats_new = feature("seats", "tier", Some(Decimal::ONE));
        let api_calls = feature("api-calls", "usage", None);

        let current = vec![
            item(subscription_id, seats_old.feature_id, Some(Decimal::from(5))),
            item(subscription_id, storage.feature_id, Some(Decimal::ONE)),
        ];
        let staged = stage_items(
            Uuid::new_v4(),
            &[],
            &current,
            &[seats_old.clone(), storage.clone()],
            &[seats_new.clone(), api_calls.clone()],
            Utc::now(),
        )
        .unwrap();

        assert_eq!(staged.len(), 3);

        let seats = staged.iter().find(|s| s.feature_slug == "seats").unwrap();
        assert_eq!(seats.change_type(), ItemChangeType::Update);
        assert_eq!(seats.previous_feature_plan_version_id, Some(seats_old.feature_id));
        assert_eq!(seats.new_feature_plan_version_id, Some(seats_new.feature_id));
        assert_eq!(seats.previous_units, Some(Decimal::from(5)));

        let usage = staged.iter().find(|s| s.feature_slug == "api-calls").unwrap();
        assert_eq!(usage.change_type(), ItemChangeType::Add);
        assert_eq!(usage.new_units, None);

        let removed = staged.iter().find(|s| s.feature_slug == "storage").unwrap();
        assert_eq!(removed.change_type(), ItemChangeType::Remove);
        assert_eq!(removed.previous_feature_plan_version_id, Some(storage.feature_id));
        assert_eq!(removed.new_feature_plan_version_id, None);
    }

    #[test]
    fn stage_items_applies_unit_overrides() {
        let seats = feature("seats", "tier", Some(Decimal::from(3)));
        let staged = stage_items(
            Uuid::new_v4(),
            &[ProposeItemUnits {
                feature_slug: "seats".to_string(),
                units: Decimal::from(12),
            }],
            &[],
            &[],
            &[seats],
            Utc::now(),
        )
        .unwrap();

        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].change_type(), ItemChangeType::Add);
        assert_eq!(staged[0].new_units, Some(Decimal::from(12)));
    }

    #[test]
    fn stage_items_falls_back_to_free_allowance() {
        let mut alerts = feature("alerts", "tier", None);
        alerts.pricing = json!({
            "type": "tier",
            "mode": "graduated",
            "tiers": [
                {"first_unit": "1", "last_unit": "20", "unit_price": "0"},
                {"first_unit": "21", "unit_price": "0.50"}
            ]
        });

        let staged = stage_items(Uuid::new_v4(), &[], &[], &[], &[alerts], Utc::now()).unwrap();

        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].change_type(), ItemChangeType::Add);
        assert_eq!(staged[0].new_units, Some(Decimal::from(20)));
    }
}
