//! In-memory [`BillingStore`] used by the test suite.
//!
//! State lives behind one async mutex, so transactions serialise; the
//! per-subscription conflicts the tests care about surface through the
//! transition guard, not here. A transaction clones the state at begin
//! and restores the clone on drop unless committed, matching the
//! rollback behaviour of the Postgres store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::BillingError;
use crate::models::{
    BillingRun, BillingRunResult, CreatePlanVersion, Invoice, InvoiceLine, InvoiceStatus,
    ListInvoicesFilter, ListPlanVersionsFilter, ListSubscriptionsFilter, PlanVersion,
    PlanVersionFeature, Subscription, SubscriptionChange, SubscriptionItem, SubscriptionItemChange,
    SubscriptionPhase, SubscriptionStatus,
};
use crate::services::store::{BillingStore, StoreTx, SubscriptionSeed};

#[derive(Debug, Default, Clone)]
struct MemoryInner {
    plans: HashMap<Uuid, PlanVersion>,
    plan_features: HashMap<Uuid, Vec<PlanVersionFeature>>,
    subscriptions: HashMap<Uuid, Subscription>,
    phases: HashMap<Uuid, SubscriptionPhase>,
    items: HashMap<Uuid, SubscriptionItem>,
    invoices: HashMap<Uuid, Invoice>,
    invoice_lines: HashMap<Uuid, Vec<InvoiceLine>>,
    changes: HashMap<Uuid, SubscriptionChange>,
    item_changes: HashMap<Uuid, Vec<SubscriptionItemChange>>,
    runs: HashMap<Uuid, BillingRun>,
    run_results: HashMap<Uuid, Vec<BillingRunResult>>,
}

impl MemoryInner {
    fn live_phase(&self, subscription_id: Uuid) -> Result<SubscriptionPhase, BillingError> {
        self.phases
            .values()
            .find(|phase| phase.subscription_id == subscription_id && phase.status().is_live())
            .cloned()
            .ok_or_else(|| BillingError::not_found("live phase", subscription_id))
    }

    fn subscription_items(&self, subscription_id: Uuid) -> Vec<SubscriptionItem> {
        let mut items: Vec<SubscriptionItem> = self
            .items
            .values()
            .filter(|item| item.subscription_id == subscription_id)
            .cloned()
            .collect();
        items.sort_by_key(|item| (item.created_utc, item.item_id));
        items
    }

    fn plan_features(&self, plan_version_id: Uuid) -> Vec<PlanVersionFeature> {
        let mut features = self
            .plan_features
            .get(&plan_version_id)
            .cloned()
            .unwrap_or_default();
        features.sort_by_key(|f| f.position);
        features
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Keyset pagination over the id column, matching the Postgres store.
fn page<T>(
    mut rows: Vec<T>,
    id: impl Fn(&T) -> Uuid,
    page_size: i32,
    page_token: Option<Uuid>,
) -> Vec<T> {
    rows.sort_by_key(|row| id(row));
    let size = page_size.clamp(1, 100) as usize;
    rows.into_iter()
        .filter(|row| page_token.is_none_or(|token| id(row) > token))
        .take(size)
        .collect()
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, BillingError> {
        let guard = self.inner.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            snapshot,
            committed: false,
        }))
    }

    async fn health_check(&self) -> Result<(), BillingError> {
        Ok(())
    }

    async fn create_plan_version(
        &self,
        input: CreatePlanVersion,
    ) -> Result<(PlanVersion, Vec<PlanVersionFeature>), BillingError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let plan = PlanVersion {
            plan_version_id: Uuid::new_v4(),
            project_id: input.project_id,
            name: input.name,
            description: input.description,
            version: input.version,
            currency: input.currency,
            billing_period: input.billing_period.as_str().to_string(),
            plan_type: input.plan_type.as_str().to_string(),
            trial_days: input.trial_days,
            created_utc: now,
        };
        let features: Vec<PlanVersionFeature> = input
            .features
            .into_iter()
            .enumerate()
            .map(|(position, f)| PlanVersionFeature {
                feature_id: Uuid::new_v4(),
                plan_version_id: plan.plan_version_id,
                feature_slug: f.feature_slug,
                name: f.name,
                feature_type: f.feature_type.as_str().to_string(),
                pricing: f.pricing,
                default_units: f.default_units,
                usage_limit: f.usage_limit,
                aggregation: f.aggregation,
                position: position as i32,
                created_utc: now,
            })
            .collect();
        inner.plans.insert(plan.plan_version_id, plan.clone());
        inner
            .plan_features
            .insert(plan.plan_version_id, features.clone());
        Ok((plan, features))
    }

    async fn get_plan_version(
        &self,
        project_id: Uuid,
        plan_version_id: Uuid,
    ) -> Result<PlanVersion, BillingError> {
        let inner = self.inner.lock().await;
        inner
            .plans
            .get(&plan_version_id)
            .filter(|plan| plan.project_id == project_id)
            .cloned()
            .ok_or_else(|| BillingError::not_found("plan version", plan_version_id))
    }

    async fn plan_features(
        &self,
        plan_version_id: Uuid,
    ) -> Result<Vec<PlanVersionFeature>, BillingError> {
        let inner = self.inner.lock().await;
        Ok(inner.plan_features(plan_version_id))
    }

    async fn list_plan_versions(
        &self,
        project_id: Uuid,
        filter: ListPlanVersionsFilter,
    ) -> Result<Vec<PlanVersion>, BillingError> {
        let inner = self.inner.lock().await;
        let rows: Vec<PlanVersion> = inner
            .plans
            .values()
            .filter(|plan| plan.project_id == project_id)
            .cloned()
            .collect();
        Ok(page(
            rows,
            |plan| plan.plan_version_id,
            filter.page_size,
            filter.page_token,
        ))
    }

    async fn create_subscription(
        &self,
        seed: SubscriptionSeed,
    ) -> Result<Subscription, BillingError> {
        let mut inner = self.inner.lock().await;
        if !inner.plans.contains_key(&seed.subscription.plan_version_id) {
            return Err(BillingError::not_found(
                "plan version",
                seed.subscription.plan_version_id,
            ));
        }
        let subscription = seed.subscription.clone();
        inner
            .subscriptions
            .insert(subscription.subscription_id, seed.subscription);
        inner.phases.insert(seed.phase.phase_id, seed.phase);
        for item in seed.items {
            inner.items.insert(item.item_id, item);
        }
        Ok(subscription)
    }

    async fn get_subscription(
        &self,
        project_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Subscription, BillingError> {
        let inner = self.inner.lock().await;
        inner
            .subscriptions
            .get(&subscription_id)
            .filter(|sub| sub.project_id == project_id)
            .cloned()
            .ok_or_else(|| BillingError::not_found("subscription", subscription_id))
    }

    async fn list_subscriptions(
        &self,
        project_id: Uuid,
        filter: ListSubscriptionsFilter,
    ) -> Result<Vec<Subscription>, BillingError> {
        let inner = self.inner.lock().await;
        let rows: Vec<Subscription> = inner
            .subscriptions
            .values()
            .filter(|sub| sub.project_id == project_id)
            .filter(|sub| filter.status.is_none_or(|status| sub.status() == status))
            .filter(|sub| {
                filter
                    .customer_id
                    .is_none_or(|customer| sub.customer_id == customer)
            })
            .cloned()
            .collect();
        Ok(page(
            rows,
            |sub| sub.subscription_id,
            filter.page_size,
            filter.page_token,
        ))
    }

    async fn subscription_items(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionItem>, BillingError> {
        let inner = self.inner.lock().await;
        Ok(inner.subscription_items(subscription_id))
    }

    async fn live_phase(&self, subscription_id: Uuid) -> Result<SubscriptionPhase, BillingError> {
        let inner = self.inner.lock().await;
        inner.live_phase(subscription_id)
    }

    async fn get_invoice(
        &self,
        project_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Invoice, BillingError> {
        let inner = self.inner.lock().await;
        inner
            .invoices
            .get(&invoice_id)
            .filter(|invoice| invoice.project_id == project_id)
            .cloned()
            .ok_or_else(|| BillingError::not_found("invoice", invoice_id))
    }

    async fn invoice_lines(&self, invoice_id: Uuid) -> Result<Vec<InvoiceLine>, BillingError> {
        let inner = self.inner.lock().await;
        Ok(inner.invoice_lines.get(&invoice_id).cloned().unwrap_or_default())
    }

    async fn list_invoices(
        &self,
        project_id: Uuid,
        subscription_id: Uuid,
        filter: ListInvoicesFilter,
    ) -> Result<Vec<Invoice>, BillingError> {
        let inner = self.inner.lock().await;
        let rows: Vec<Invoice> = inner
            .invoices
            .values()
            .filter(|invoice| {
                invoice.project_id == project_id && invoice.subscription_id == subscription_id
            })
            .filter(|invoice| filter.status.is_none_or(|status| invoice.status() == status))
            .cloned()
            .collect();
        Ok(page(
            rows,
            |invoice| invoice.invoice_id,
            filter.page_size,
            filter.page_token,
        ))
    }

    async fn get_change(
        &self,
        project_id: Uuid,
        change_id: Uuid,
    ) -> Result<SubscriptionChange, BillingError> {
        let inner = self.inner.lock().await;
        inner
            .changes
            .get(&change_id)
            .filter(|change| change.project_id == project_id)
            .cloned()
            .ok_or_else(|| BillingError::not_found("change", change_id))
    }

    async fn list_changes(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionChange>, BillingError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<SubscriptionChange> = inner
            .changes
            .values()
            .filter(|change| change.subscription_id == subscription_id)
            .cloned()
            .collect();
        rows.sort_by_key(|change| (change.created_utc, change.change_id));
        Ok(rows)
    }

    async fn item_changes(
        &self,
        change_id: Uuid,
    ) -> Result<Vec<SubscriptionItemChange>, BillingError> {
        let inner = self.inner.lock().await;
        Ok(inner.item_changes.get(&change_id).cloned().unwrap_or_default())
    }

    async fn due_subscriptions(
        &self,
        as_of: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Subscription>, BillingError> {
        let inner = self.inner.lock().await;
        let mut due: Vec<Subscription> = inner
            .subscriptions
            .values()
            .filter(|sub| sub.status().is_live())
            .filter(|sub| {
                let trial_due = sub.status() == SubscriptionStatus::Trialing
                    && inner
                        .phases
                        .values()
                        .any(|phase| {
                            phase.subscription_id == sub.subscription_id
                                && phase.status().is_live()
                                && phase.trial_ends_at.is_some_and(|at| at <= as_of)
                        });
                trial_due
                    || sub.invoice_at.is_some_and(|at| at <= as_of)
                    || sub.current_cycle_end_at <= as_of
            })
            .cloned()
            .collect();
        due.sort_by_key(|sub| (sub.created_utc, sub.subscription_id));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn open_invoices_past_due(
        &self,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<Invoice>, BillingError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<Invoice> = inner
            .invoices
            .values()
            .filter(|invoice| {
                matches!(invoice.status(), InvoiceStatus::Draft | InvoiceStatus::Open)
                    && invoice.past_due_at < as_of
            })
            .cloned()
            .collect();
        rows.sort_by_key(|invoice| (invoice.past_due_at, invoice.invoice_id));
        Ok(rows)
    }

    async fn create_billing_run(&self, run: BillingRun) -> Result<BillingRun, BillingError> {
        let mut inner = self.inner.lock().await;
        inner.runs.insert(run.run_id, run.clone());
        Ok(run)
    }

    async fn finish_billing_run(&self, run: &BillingRun) -> Result<(), BillingError> {
        let mut inner = self.inner.lock().await;
        inner.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn insert_run_result(&self, result: BillingRunResult) -> Result<(), BillingError> {
        let mut inner = self.inner.lock().await;
        inner
            .run_results
            .entry(result.run_id)
            .or_default()
            .push(result);
        Ok(())
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryInner>,
    snapshot: MemoryInner,
    committed: bool,
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.committed {
            *self.guard = std::mem::take(&mut self.snapshot);
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn subscription_for_update(
        &mut self,
        subscription_id: Uuid,
    ) -> Result<Subscription, BillingError> {
        self.guard
            .subscriptions
            .get(&subscription_id)
            .cloned()
            .ok_or_else(|| BillingError::not_found("subscription", subscription_id))
    }

    async fn live_phase_for_update(
        &mut self,
        subscription_id: Uuid,
    ) -> Result<SubscriptionPhase, BillingError> {
        self.guard.live_phase(subscription_id)
    }

    async fn items_for_subscription(
        &mut self,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionItem>, BillingError> {
        Ok(self.guard.subscription_items(subscription_id))
    }

    async fn plan_version(&mut self, plan_version_id: Uuid) -> Result<PlanVersion, BillingError> {
        self.guard
            .plans
            .get(&plan_version_id)
            .cloned()
            .ok_or_else(|| BillingError::not_found("plan version", plan_version_id))
    }

    async fn plan_features(
        &mut self,
        plan_version_id: Uuid,
    ) -> Result<Vec<PlanVersionFeature>, BillingError> {
        Ok(self.guard.plan_features(plan_version_id))
    }

    async fn invoice_for_cycle(
        &mut self,
        subscription_id: Uuid,
        cycle_start_at: DateTime<Utc>,
    ) -> Result<Option<Invoice>, BillingError> {
        Ok(self
            .guard
            .invoices
            .values()
            .find(|invoice| {
                invoice.subscription_id == subscription_id
                    && invoice.cycle_start_at == cycle_start_at
                    && invoice.status().counts_for_cycle()
            })
            .cloned())
    }

    async fn insert_invoice(
        &mut self,
        invoice: &Invoice,
        lines: &[InvoiceLine],
    ) -> Result<(), BillingError> {
        self.guard.invoices.insert(invoice.invoice_id, invoice.clone());
        self.guard
            .invoice_lines
            .insert(invoice.invoice_id, lines.to_vec());
        Ok(())
    }

    async fn invoice_for_update(&mut self, invoice_id: Uuid) -> Result<Invoice, BillingError> {
        self.guard
            .invoices
            .get(&invoice_id)
            .cloned()
            .ok_or_else(|| BillingError::not_found("invoice", invoice_id))
    }

    async fn update_invoice(&mut self, invoice: &Invoice) -> Result<(), BillingError> {
        self.guard.invoices.insert(invoice.invoice_id, invoice.clone());
        Ok(())
    }

    async fn update_subscription(
        &mut self,
        subscription: &Subscription,
    ) -> Result<(), BillingError> {
        self.guard
            .subscriptions
            .insert(subscription.subscription_id, subscription.clone());
        Ok(())
    }

    async fn insert_phase(&mut self, phase: &SubscriptionPhase) -> Result<(), BillingError> {
        self.guard.phases.insert(phase.phase_id, phase.clone());
        Ok(())
    }

    async fn update_phase(&mut self, phase: &SubscriptionPhase) -> Result<(), BillingError> {
        self.guard.phases.insert(phase.phase_id, phase.clone());
        Ok(())
    }

    async fn insert_item(&mut self, item: &SubscriptionItem) -> Result<(), BillingError> {
        self.guard.items.insert(item.item_id, item.clone());
        Ok(())
    }

    async fn update_item(&mut self, item: &SubscriptionItem) -> Result<(), BillingError> {
        self.guard.items.insert(item.item_id, item.clone());
        Ok(())
    }

    async fn delete_item(&mut self, item_id: Uuid) -> Result<(), BillingError> {
        self.guard.items.remove(&item_id);
        Ok(())
    }

    async fn insert_change(
        &mut self,
        change: &SubscriptionChange,
        item_changes: &[SubscriptionItemChange],
    ) -> Result<(), BillingError> {
        self.guard.changes.insert(change.change_id, change.clone());
        self.guard
            .item_changes
            .insert(change.change_id, item_changes.to_vec());
        Ok(())
    }

    async fn change_for_update(
        &mut self,
        change_id: Uuid,
    ) -> Result<SubscriptionChange, BillingError> {
        self.guard
            .changes
            .get(&change_id)
            .cloned()
            .ok_or_else(|| BillingError::not_found("change", change_id))
    }

    async fn update_change(&mut self, change: &SubscriptionChange) -> Result<(), BillingError> {
        self.guard.changes.insert(change.change_id, change.clone());
        Ok(())
    }

    async fn item_changes(
        &mut self,
        change_id: Uuid,
    ) -> Result<Vec<SubscriptionItemChange>, BillingError> {
        Ok(self
            .guard
            .item_changes
            .get(&change_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), BillingError> {
        self.committed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BillingPeriod, CreatePlanVersionFeature, FeatureType, PlanType};
    use rust_decimal::Decimal;
    use serde_json::json;

    fn plan_input(project_id: Uuid) -> CreatePlanVersion {
        CreatePlanVersion {
            project_id,
            name: "Starter".to_string(),
            description: None,
            version: 1,
            currency: "USD".to_string(),
            billing_period: BillingPeriod::Month,
            plan_type: PlanType::Recurring,
            trial_days: 0,
            features: vec![CreatePlanVersionFeature {
                feature_slug: "base".to_string(),
                name: "Base fee".to_string(),
                feature_type: FeatureType::Flat,
                pricing: json!({"type": "flat", "price": "10"}),
                default_units: Some(Decimal::ONE),
                usage_limit: None,
                aggregation: None,
            }],
        }
    }

    #[tokio::test]
    async fn plan_versions_are_scoped_by_project() {
        let store = MemoryStore::new();
        let project_id = Uuid::new_v4();
        let (plan, _) = store.create_plan_version(plan_input(project_id)).await.unwrap();

        assert!(store.get_plan_version(project_id, plan.plan_version_id).await.is_ok());
        let err = store
            .get_plan_version(Uuid::new_v4(), plan.plan_version_id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound { .. }));
    }

    fn change_row(project_id: Uuid, plan_version_id: Uuid) -> SubscriptionChange {
        let now = Utc::now();
        SubscriptionChange {
            change_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            project_id,
            previous_plan_version_id: plan_version_id,
            new_plan_version_id: plan_version_id,
            change_type: "upgrade".to_string(),
            status: "pending".to_string(),
            change_at: now,
            applied_at: None,
            created_utc: now,
            updated_utc: now,
        }
    }

    #[tokio::test]
    async fn uncommitted_transaction_rolls_back() {
        let store = MemoryStore::new();
        let project_id = Uuid::new_v4();
        let (plan, _) = store.create_plan_version(plan_input(project_id)).await.unwrap();
        let change = change_row(project_id, plan.plan_version_id);

        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_change(&change, &[]).await.unwrap();
            assert!(tx.change_for_update(change.change_id).await.is_ok());
            // Dropped without commit.
        }

        let mut tx = store.begin().await.unwrap();
        let err = tx.change_for_update(change.change_id).await.unwrap_err();
        assert!(matches!(err, BillingError::NotFound { .. }));
    }

    #[tokio::test]
    async fn committed_transaction_persists() {
        let store = MemoryStore::new();
        let project_id = Uuid::new_v4();
        let (plan, _) = store.create_plan_version(plan_input(project_id)).await.unwrap();
        let change = change_row(project_id, plan.plan_version_id);

        let mut tx = store.begin().await.unwrap();
        tx.insert_change(&change, &[]).await.unwrap();
        tx.commit().await.unwrap();

        let stored = store.get_change(project_id, change.change_id).await.unwrap();
        assert_eq!(stored.change_id, change.change_id);
    }
}
