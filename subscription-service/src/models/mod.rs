//! Domain models for subscription-service.

mod change;
mod invoice;
mod money;
mod phase;
mod plan;
mod run;
mod subscription;

pub use change::{
    ChangeStatus, ChangeType, ItemChangeType, ProposeChange, ProposeItemUnits, SubscriptionChange,
    SubscriptionItemChange,
};
pub use invoice::{
    Invoice, InvoiceLine, InvoiceStatus, InvoiceType, LineType, ListInvoicesFilter,
};
pub use money::{CurrencyMismatch, Money};
pub use phase::{SubscriptionItem, SubscriptionPhase};
pub use plan::{
    BillingPeriod, CreatePlanVersion, CreatePlanVersionFeature, FeatureType, ListPlanVersionsFilter,
    PlanType, PlanVersion, PlanVersionFeature,
};
pub use run::{BillingRun, BillingRunResult, RunStatus, RunType};
pub use subscription::{
    CreateSubscription, ListSubscriptionsFilter, Subscription, SubscriptionStatus, WhenToBill,
};
