use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::engine::models::{
    CustomerScope, CustomerSnapshot, DeductError, DeductionResult,
};
use crate::engine::store::FastStore;

/// key: engine-cache -> caller snapshot patching

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("balance record {0} is not present in the snapshot")]
    UnknownBalance(Uuid),
    #[error("rollover {0} is not present in the snapshot")]
    UnknownRollover(Uuid),
    #[error("customer is no longer resident in the fast-path store")]
    Evicted,
}

/// Patch a caller-held snapshot with the outcome of one deduction.
///
/// Validation runs over the whole result before anything is written, so a
/// stale snapshot is left untouched rather than half-patched. A deduction
/// only mutates rows that already existed, which makes an unknown id proof
/// of staleness.
pub fn apply_result(
    snapshot: &mut CustomerSnapshot,
    result: &DeductionResult,
) -> Result<(), SyncError> {
    for record in &result.balances {
        if !snapshot.balances.contains_key(&record.id) {
            return Err(SyncError::UnknownBalance(record.id));
        }
    }
    for rollover in &result.rollovers {
        if !snapshot.rollovers.contains_key(&rollover.id) {
            return Err(SyncError::UnknownRollover(rollover.id));
        }
    }
    for record in &result.balances {
        snapshot.balances.insert(record.id, record.clone());
    }
    for rollover in &result.rollovers {
        snapshot.rollovers.insert(rollover.id, rollover.clone());
    }
    Ok(())
}

/// Keeps caller snapshots aligned with the fast-path store. When a patch
/// cannot apply, the syncer rebuilds the snapshot from the store instead of
/// guessing.
pub struct CacheSyncer {
    store: Arc<dyn FastStore>,
}

impl CacheSyncer {
    pub fn new(store: Arc<dyn FastStore>) -> Self {
        Self { store }
    }

    /// Patch in place, or rebuild from the store when the snapshot is stale.
    pub async fn sync(
        &self,
        scope: &CustomerScope,
        snapshot: &mut CustomerSnapshot,
        result: &DeductionResult,
    ) -> Result<(), DeductError> {
        match apply_result(snapshot, result) {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::debug!(?err, customer_id = %scope.customer_id, "snapshot stale, rebuilding");
                let account = self
                    .store
                    .account(scope)
                    .await?
                    .ok_or(DeductError::CustomerNotFound)?;
                *snapshot = CustomerSnapshot::from_account(scope.customer_id, &account);
                Ok(())
            }
        }
    }

    /// Build a fresh snapshot for a resident customer.
    pub async fn snapshot(&self, scope: &CustomerScope) -> Result<CustomerSnapshot, DeductError> {
        let account = self
            .store
            .account(scope)
            .await?
            .ok_or(DeductError::CustomerNotFound)?;
        Ok(CustomerSnapshot::from_account(scope.customer_id, &account))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::models::{
        BalanceRecord, CustomerAccount, EntitlementGrant, FeatureKind, GrantKind,
    };

    fn grant() -> EntitlementGrant {
        EntitlementGrant {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            feature_id: "messages".to_string(),
            feature_kind: FeatureKind::Metered,
            kind: GrantKind::Resettable,
            granted: 100,
            unlimited: false,
            overage_allowed: false,
            max_purchase: None,
            reset_interval: "month".to_string(),
        }
    }

    #[test]
    fn patch_replaces_known_records() {
        let g = grant();
        let record = BalanceRecord::fresh(&g);
        let mut account = CustomerAccount::default();
        account.grants.insert(g.id, g.clone());
        account.balances.insert(record.id, record.clone());
        let mut snapshot = CustomerSnapshot::from_account(g.customer_id, &account);

        let mut updated = record.clone();
        updated.balance = 90;
        updated.usage = 10;
        let result = DeductionResult {
            balances: vec![updated.clone()],
            rollovers: Vec::new(),
            events: Vec::new(),
        };

        apply_result(&mut snapshot, &result).unwrap();
        assert_eq!(snapshot.balances[&record.id], updated);
    }

    #[test]
    fn unknown_record_leaves_snapshot_untouched() {
        let g = grant();
        let record = BalanceRecord::fresh(&g);
        let mut account = CustomerAccount::default();
        account.grants.insert(g.id, g.clone());
        account.balances.insert(record.id, record.clone());
        let mut snapshot = CustomerSnapshot::from_account(g.customer_id, &account);

        let mut known = record.clone();
        known.balance = 90;
        known.usage = 10;
        let foreign = BalanceRecord::fresh(&grant());
        let result = DeductionResult {
            balances: vec![known, foreign.clone()],
            rollovers: Vec::new(),
            events: Vec::new(),
        };

        let err = apply_result(&mut snapshot, &result).unwrap_err();
        assert_eq!(err, SyncError::UnknownBalance(foreign.id));
        assert_eq!(snapshot.balances[&record.id], record);
    }

    #[tokio::test]
    async fn stale_snapshot_is_rebuilt_from_the_store() {
        use std::collections::HashMap;

        use crate::engine::store::InProcessStore;

        let g = grant();
        let record = BalanceRecord::fresh(&g);
        let mut account = CustomerAccount::default();
        account.grants.insert(g.id, g.clone());
        account.balances.insert(record.id, record.clone());
        let scope = CustomerScope {
            org_id: Uuid::new_v4(),
            env: "live".to_string(),
            customer_id: g.customer_id,
        };
        let store = Arc::new(InProcessStore::new());
        store.put_account(&scope, account).await.unwrap();
        let syncer = CacheSyncer::new(store as Arc<dyn FastStore>);

        // A snapshot taken before the record existed cannot be patched, so
        // the syncer reloads the whole account.
        let mut snapshot = CustomerSnapshot {
            customer_id: g.customer_id,
            balances: HashMap::new(),
            rollovers: HashMap::new(),
        };
        let result = DeductionResult {
            balances: vec![record.clone()],
            rollovers: Vec::new(),
            events: Vec::new(),
        };
        syncer.sync(&scope, &mut snapshot, &result).await.unwrap();
        assert_eq!(snapshot.balances[&record.id], record);
    }
}
