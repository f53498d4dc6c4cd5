//! Services module for subscription-service.

pub mod change;
pub mod cycle;
pub mod database;
pub mod guard;
pub mod lifecycle;
pub mod memory;
pub mod metrics;
pub mod payment;
pub mod pricing;
pub mod run;
pub mod store;
pub mod usage;

pub use change::SubscriptionChangeCoordinator;
pub use database::PostgresStore;
pub use guard::TransitionGuard;
pub use lifecycle::{CancelEffective, PhaseStateMachine};
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use payment::{ChargeOutcome, HttpPaymentProvider, PaymentProvider};
pub use run::BillingRunner;
pub use store::{BillingStore, StoreTx, SubscriptionSeed};
pub use usage::{HttpUsageReader, UsageReader, UsageTotals};
