//! In-process transition serialization.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use crate::error::BillingError;

/// Fails a transition fast when another one is already in flight for
/// the same subscription in this process. The database row lock is the
/// real isolation boundary; this avoids opening a transaction that is
/// certain to conflict.
#[derive(Clone, Default)]
pub struct TransitionGuard {
    in_flight: Arc<DashMap<Uuid, ()>>,
}

impl TransitionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the subscription for one transition. The claim is
    /// released when the returned permit drops.
    pub fn acquire(&self, subscription_id: Uuid) -> Result<TransitionPermit, BillingError> {
        match self.in_flight.entry(subscription_id) {
            Entry::Occupied(_) => Err(BillingError::ConcurrentModification(subscription_id)),
            Entry::Vacant(entry) => {
                entry.insert(());
                Ok(TransitionPermit {
                    subscription_id,
                    in_flight: Arc::clone(&self.in_flight),
                })
            }
        }
    }
}

pub struct TransitionPermit {
    subscription_id: Uuid,
    in_flight: Arc<DashMap<Uuid, ()>>,
}

impl Drop for TransitionPermit {
    fn drop(&mut self) {
        self.in_flight.remove(&self.subscription_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_conflicts_until_first_permit_drops() {
        let guard = TransitionGuard::new();
        let subscription_id = Uuid::new_v4();

        let permit = guard.acquire(subscription_id).unwrap();
        assert!(matches!(
            guard.acquire(subscription_id),
            Err(BillingError::ConcurrentModification(_))
        ));

        drop(permit);
        assert!(guard.acquire(subscription_id).is_ok());
    }

    #[test]
    fn distinct_subscriptions_do_not_contend() {
        let guard = TransitionGuard::new();
        let _first = guard.acquire(Uuid::new_v4()).unwrap();
        assert!(guard.acquire(Uuid::new_v4()).is_ok());
    }
}
