//! Persistence interface for billing state.
//!
//! Two traits: [`BillingStore`] for pool-level reads and simple
//! creates, [`StoreTx`] for the transactional mutations the state
//! machine and change coordinator run. Implementations: Postgres for
//! production, an in-memory store for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::BillingError;
use crate::models::{
    BillingRun, BillingRunResult, CreatePlanVersion, Invoice, InvoiceLine, ListInvoicesFilter,
    ListPlanVersionsFilter, ListSubscriptionsFilter, PlanVersion, PlanVersionFeature, Subscription,
    SubscriptionChange, SubscriptionItem, SubscriptionItemChange, SubscriptionPhase,
};

/// A fully computed new subscription: the aggregate row, its first
/// phase and its items, persisted together in one transaction.
#[derive(Debug, Clone)]
pub struct SubscriptionSeed {
    pub subscription: Subscription,
    pub phase: SubscriptionPhase,
    pub items: Vec<SubscriptionItem>,
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Opens a transaction. Row locks taken inside it fail fast when
    /// another transition holds them.
    async fn begin(&self) -> Result<Box<dyn StoreTx>, BillingError>;

    async fn health_check(&self) -> Result<(), BillingError>;

    async fn create_plan_version(
        &self,
        input: CreatePlanVersion,
    ) -> Result<(PlanVersion, Vec<PlanVersionFeature>), BillingError>;

    async fn get_plan_version(
        &self,
        project_id: Uuid,
        plan_version_id: Uuid,
    ) -> Result<PlanVersion, BillingError>;

    async fn plan_features(
        &self,
        plan_version_id: Uuid,
    ) -> Result<Vec<PlanVersionFeature>, BillingError>;

    async fn list_plan_versions(
        &self,
        project_id: Uuid,
        filter: ListPlanVersionsFilter,
    ) -> Result<Vec<PlanVersion>, BillingError>;

    async fn create_subscription(
        &self,
        seed: SubscriptionSeed,
    ) -> Result<Subscription, BillingError>;

    async fn get_subscription(
        &self,
        project_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Subscription, BillingError>;

    async fn list_subscriptions(
        &self,
        project_id: Uuid,
        filter: ListSubscriptionsFilter,
    ) -> Result<Vec<Subscription>, BillingError>;

    async fn subscription_items(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionItem>, BillingError>;

    /// The single non-terminal phase of a subscription.
    async fn live_phase(&self, subscription_id: Uuid) -> Result<SubscriptionPhase, BillingError>;

    async fn get_invoice(
        &self,
        project_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Invoice, BillingError>;

    async fn invoice_lines(&self, invoice_id: Uuid) -> Result<Vec<InvoiceLine>, BillingError>;

    async fn list_invoices(
        &self,
        project_id: Uuid,
        subscription_id: Uuid,
        filter: ListInvoicesFilter,
    ) -> Result<Vec<Invoice>, BillingError>;

    async fn get_change(
        &self,
        project_id: Uuid,
        change_id: Uuid,
    ) -> Result<SubscriptionChange, BillingError>;

    async fn list_changes(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionChange>, BillingError>;

    async fn item_changes(
        &self,
        change_id: Uuid,
    ) -> Result<Vec<SubscriptionItemChange>, BillingError>;

    /// Live subscriptions with a trial end, invoice instant or cycle
    /// end at or before `as_of`.
    async fn due_subscriptions(
        &self,
        as_of: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Subscription>, BillingError>;

    async fn open_invoices_past_due(
        &self,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<Invoice>, BillingError>;

    async fn create_billing_run(&self, run: BillingRun) -> Result<BillingRun, BillingError>;

    async fn finish_billing_run(&self, run: &BillingRun) -> Result<(), BillingError>;

    async fn insert_run_result(&self, result: BillingRunResult) -> Result<(), BillingError>;
}

/// One open transaction. All writes become visible together at
/// [`StoreTx::commit`]; dropping the transaction rolls them back.
#[async_trait]
pub trait StoreTx: Send {
    /// Reads a subscription with a row lock, failing fast with
    /// [`BillingError::ConcurrentModification`] when already locked.
    async fn subscription_for_update(
        &mut self,
        subscription_id: Uuid,
    ) -> Result<Subscription, BillingError>;

    async fn live_phase_for_update(
        &mut self,
        subscription_id: Uuid,
    ) -> Result<SubscriptionPhase, BillingError>;

    async fn items_for_subscription(
        &mut self,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionItem>, BillingError>;

    async fn plan_version(&mut self, plan_version_id: Uuid) -> Result<PlanVersion, BillingError>;

    async fn plan_features(
        &mut self,
        plan_version_id: Uuid,
    ) -> Result<Vec<PlanVersionFeature>, BillingError>;

    /// The non-void invoice covering the cycle starting at
    /// `cycle_start_at`, if one exists.
    async fn invoice_for_cycle(
        &mut self,
        subscription_id: Uuid,
        cycle_start_at: DateTime<Utc>,
    ) -> Result<Option<Invoice>, BillingError>;

    async fn insert_invoice(
        &mut self,
        invoice: &Invoice,
        lines: &[InvoiceLine],
    ) -> Result<(), BillingError>;

    async fn invoice_for_update(&mut self, invoice_id: Uuid) -> Result<Invoice, BillingError>;

    async fn update_invoice(&mut self, invoice: &Invoice) -> Result<(), BillingError>;

    async fn update_subscription(&mut self, subscription: &Subscription)
        -> Result<(), BillingError>;

    async fn insert_phase(&mut self, phase: &SubscriptionPhase) -> Result<(), BillingError>;

    async fn update_phase(&mut self, phase: &SubscriptionPhase) -> Result<(), BillingError>;

    async fn insert_item(&mut self, item: &SubscriptionItem) -> Result<(), BillingError>;

    async fn update_item(&mut self, item: &SubscriptionItem) -> Result<(), BillingError>;

    async fn delete_item(&mut self, item_id: Uuid) -> Result<(), BillingError>;

    async fn insert_change(
        &mut self,
        change: &SubscriptionChange,
        item_changes: &[SubscriptionItemChange],
    ) -> Result<(), BillingError>;

    async fn change_for_update(
        &mut self,
        change_id: Uuid,
    ) -> Result<SubscriptionChange, BillingError>;

    async fn update_change(&mut self, change: &SubscriptionChange) -> Result<(), BillingError>;

    async fn item_changes(
        &mut self,
        change_id: Uuid,
    ) -> Result<Vec<SubscriptionItemChange>, BillingError>;

    async fn commit(self: Box<Self>) -> Result<(), BillingError>;
}
