use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::models::{
    BalanceRecord, BalanceShortfall, CustomerAccount, DeductError, DeductionItem,
    DeductionRequest, DeductionResult, EntitlementGrant, EntityBalance, FeatureKind, GrantKind,
    OveragePolicy, Replaceable, Rollover, UsageEvent,
};

pub const SCRIPT_NAME: &str = "engine.deduct";
pub const SCRIPT_VERSION: u32 = 1;

/// key: engine-script -> embedded deduction program identity
///
/// The deduction program is compiled into the binary and registered with the
/// fast store once at startup. Invocations address it by digest; a digest the
/// store never registered is rejected, so a stale client can never run a
/// program the store does not carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptHandle {
    sha: String,
}

impl ScriptHandle {
    pub fn embedded() -> Self {
        let mut hasher = Sha256::new();
        hasher.update(SCRIPT_NAME.as_bytes());
        hasher.update(SCRIPT_VERSION.to_be_bytes());
        Self {
            sha: hex::encode(hasher.finalize()),
        }
    }

    pub fn from_sha(sha: impl Into<String>) -> Self {
        Self { sha: sha.into() }
    }

    pub fn sha(&self) -> &str {
        &self.sha
    }
}

/// Execute the deduction program against one customer's account.
///
/// The caller holds the account entry exclusively for the duration of the
/// call. Either every item in the request applies or none does: work happens
/// on a private copy that only replaces the account after the last item
/// succeeds.
pub fn run(
    account: &mut CustomerAccount,
    request: &DeductionRequest,
    now: DateTime<Utc>,
) -> Result<DeductionResult, DeductError> {
    if account.grants.is_empty() {
        return Err(DeductError::NoCustomerProducts);
    }

    let mut work = account.clone();
    let mut touched_balances = BTreeSet::new();
    let mut touched_rollovers = BTreeSet::new();
    let mut events = Vec::with_capacity(request.items.len());

    for item in &request.items {
        let event = apply_item(
            &mut work,
            request,
            item,
            now,
            &mut touched_balances,
            &mut touched_rollovers,
        )?;
        events.push(event);
    }

    let balances = touched_balances
        .iter()
        .filter_map(|id| work.balances.get(id).cloned())
        .collect();
    let rollovers = touched_rollovers
        .iter()
        .filter_map(|id| work.rollovers.get(id).cloned())
        .collect();
    *account = work;

    Ok(DeductionResult {
        balances,
        rollovers,
        events,
    })
}

fn apply_item(
    work: &mut CustomerAccount,
    request: &DeductionRequest,
    item: &DeductionItem,
    now: DateTime<Utc>,
    touched_balances: &mut BTreeSet<Uuid>,
    touched_rollovers: &mut BTreeSet<Uuid>,
) -> Result<UsageEvent, DeductError> {
    let mut feature_grants: Vec<EntitlementGrant> = work
        .grants
        .values()
        .filter(|grant| grant.feature_id == item.feature_id)
        .cloned()
        .collect();
    feature_grants.sort_by_key(|grant| grant.id);
    if feature_grants.is_empty() {
        return Err(DeductError::NoCustomerProducts);
    }

    let servable: Vec<EntitlementGrant> = feature_grants
        .into_iter()
        .filter(|grant| grant.kind != GrantKind::PaidAllocation)
        .collect();
    let Some(primary) = servable.first().cloned() else {
        return Err(DeductError::PaidAllocated(item.feature_id.clone()));
    };

    if let Some(unlimited) = servable.iter().find(|grant| grant.unlimited) {
        return Ok(make_event(request, item, unlimited.id, now));
    }

    let entity = request.entity_id.as_deref();

    if item.amount < 0 {
        let credit = -item.amount;
        let record_id = base_record_id(work, primary.id)?;
        let record = work
            .balances
            .get_mut(&record_id)
            .ok_or(DeductError::NoCustomerProducts)?;
        let BalanceRecord {
            balance,
            usage,
            entities,
            replaceables,
            ..
        } = record;
        let (bal, usg) = source_slots(balance, usage, entities.as_mut(), entity)?;
        *bal += credit;
        *usg -= credit;
        if primary.feature_kind == FeatureKind::ContinuousUse {
            for _ in 0..credit {
                replaceables.push(Replaceable {
                    id: Uuid::new_v4(),
                    from_entity: request.entity_id.clone(),
                    created_at: now,
                });
            }
        }
        touched_balances.insert(record_id);
        return Ok(make_event(request, item, primary.id, now));
    }

    // Funding sources in draw order: active rollovers soonest-expiring first
    // (undated last, ties by id), then base records by grant id.
    let servable_ids: Vec<Uuid> = servable.iter().map(|grant| grant.id).collect();
    let mut roll_ids: Vec<(Option<DateTime<Utc>>, Uuid)> = work
        .rollovers
        .values()
        .filter(|roll| servable_ids.contains(&roll.grant_id) && roll.is_active(now))
        .map(|roll| (roll.expires_at, roll.id))
        .collect();
    roll_ids.sort_by(|a, b| match (a.0, b.0) {
        (Some(x), Some(y)) => x.cmp(&y).then(a.1.cmp(&b.1)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.1.cmp(&b.1),
    });

    let mut base_ids: Vec<(Uuid, Uuid)> = Vec::new();
    for grant in &servable {
        if let Some(record) = work
            .balances
            .values()
            .find(|record| record.grant_id == grant.id)
        {
            base_ids.push((record.id, grant.id));
        }
    }
    if base_ids.is_empty() {
        return Err(DeductError::NoCustomerProducts);
    }

    let mut available: i64 = 0;
    for (_, id) in &roll_ids {
        if let Some(roll) = work.rollovers.get(id) {
            available += source_available(roll.balance, roll.entities.as_ref(), entity)?.max(0);
        }
    }
    for (record_id, _) in &base_ids {
        if let Some(record) = work.balances.get(record_id) {
            available +=
                source_available(record.balance, record.entities.as_ref(), entity)?.max(0);
        }
    }

    let overage_target = if request.policy == OveragePolicy::Allow {
        base_ids
            .iter()
            .find(|(_, grant_id)| {
                servable
                    .iter()
                    .any(|grant| grant.id == *grant_id && grant.overage_allowed)
            })
            .copied()
    } else {
        None
    };

    // None means unbounded overage; Some(h) allows the target balance to go
    // h units further negative.
    let headroom: Option<i64> = match overage_target {
        Some((record_id, grant_id)) => {
            let limit = servable
                .iter()
                .find(|grant| grant.id == grant_id)
                .and_then(|grant| grant.max_purchase);
            match limit {
                Some(limit) => {
                    let record = work
                        .balances
                        .get(&record_id)
                        .ok_or(DeductError::NoCustomerProducts)?;
                    let (bal, _) = source_values(record, entity)?;
                    let overdrawn = (-bal).max(0);
                    Some((limit - overdrawn).max(0))
                }
                None => None,
            }
        }
        None => Some(0),
    };

    let within = match headroom {
        None => true,
        Some(headroom) => item.amount <= available.saturating_add(headroom),
    };
    if !within {
        return Err(DeductError::InsufficientBalance(BalanceShortfall {
            feature_id: item.feature_id.clone(),
            requested: item.amount,
            remaining: available.saturating_add(headroom.unwrap_or(0)),
        }));
    }

    let mut rem = item.amount;
    for (_, id) in &roll_ids {
        if rem == 0 {
            break;
        }
        let Some(roll) = work.rollovers.get_mut(id) else {
            continue;
        };
        let Rollover {
            balance,
            usage,
            entities,
            ..
        } = roll;
        let (bal, usg) = source_slots(balance, usage, entities.as_mut(), entity)?;
        let take = rem.min((*bal).max(0));
        if take > 0 {
            *bal -= take;
            *usg += take;
            rem -= take;
            touched_rollovers.insert(*id);
        }
    }
    for (record_id, _) in &base_ids {
        if rem == 0 {
            break;
        }
        let Some(record) = work.balances.get_mut(record_id) else {
            continue;
        };
        let BalanceRecord {
            balance,
            usage,
            entities,
            ..
        } = record;
        let (bal, usg) = source_slots(balance, usage, entities.as_mut(), entity)?;
        let take = rem.min((*bal).max(0));
        if take > 0 {
            *bal -= take;
            *usg += take;
            rem -= take;
            touched_balances.insert(*record_id);
        }
    }
    if rem > 0 {
        let Some((record_id, _)) = overage_target else {
            return Err(DeductError::InsufficientBalance(BalanceShortfall {
                feature_id: item.feature_id.clone(),
                requested: item.amount,
                remaining: available,
            }));
        };
        let record = work
            .balances
            .get_mut(&record_id)
            .ok_or(DeductError::NoCustomerProducts)?;
        let BalanceRecord {
            balance,
            usage,
            entities,
            ..
        } = record;
        let (bal, usg) = source_slots(balance, usage, entities.as_mut(), entity)?;
        *bal -= rem;
        *usg += rem;
        touched_balances.insert(record_id);
    }

    // A positive deduction on a continuous-use grant reuses freed allocation
    // units: one marker deleted per unit, oldest first.
    if item.amount > 0 && primary.feature_kind == FeatureKind::ContinuousUse {
        if let Some((record_id, _)) = base_ids.first() {
            if let Some(record) = work.balances.get_mut(record_id) {
                let consumed = record.replaceables.len().min(item.amount as usize);
                if consumed > 0 {
                    record.replaceables.drain(..consumed);
                    touched_balances.insert(*record_id);
                }
            }
        }
    }

    Ok(make_event(request, item, primary.id, now))
}

fn make_event(
    request: &DeductionRequest,
    item: &DeductionItem,
    grant_id: Uuid,
    now: DateTime<Utc>,
) -> UsageEvent {
    UsageEvent {
        id: Uuid::new_v4(),
        org_id: request.org_id,
        env: request.env.clone(),
        customer_id: request.customer_id,
        feature_id: item.feature_id.clone(),
        grant_id,
        amount: item.amount,
        idempotency_key: request.idempotency_key.clone(),
        recorded_at: now,
    }
}

fn base_record_id(work: &CustomerAccount, grant_id: Uuid) -> Result<Uuid, DeductError> {
    work.balances
        .values()
        .find(|record| record.grant_id == grant_id)
        .map(|record| record.id)
        .ok_or(DeductError::NoCustomerProducts)
}

fn source_available(
    balance: i64,
    entities: Option<&BTreeMap<String, EntityBalance>>,
    entity: Option<&str>,
) -> Result<i64, DeductError> {
    match entities {
        Some(map) => {
            let key = entity.ok_or_else(|| DeductError::EntityNotFound("(none)".to_string()))?;
            let entry = map
                .get(key)
                .ok_or_else(|| DeductError::EntityNotFound(key.to_string()))?;
            Ok(entry.balance)
        }
        None => Ok(balance),
    }
}

fn source_values(record: &BalanceRecord, entity: Option<&str>) -> Result<(i64, i64), DeductError> {
    match &record.entities {
        Some(map) => {
            let key = entity.ok_or_else(|| DeductError::EntityNotFound("(none)".to_string()))?;
            let entry = map
                .get(key)
                .ok_or_else(|| DeductError::EntityNotFound(key.to_string()))?;
            Ok((entry.balance, entry.usage))
        }
        None => Ok((record.balance, record.usage)),
    }
}

fn source_slots<'a>(
    balance: &'a mut i64,
    usage: &'a mut i64,
    entities: Option<&'a mut BTreeMap<String, EntityBalance>>,
    entity: Option<&str>,
) -> Result<(&'a mut i64, &'a mut i64), DeductError> {
    match entities {
        Some(map) => {
            let key = entity.ok_or_else(|| DeductError::EntityNotFound("(none)".to_string()))?;
            let entry = map
                .get_mut(key)
                .ok_or_else(|| DeductError::EntityNotFound(key.to_string()))?;
            Ok((&mut entry.balance, &mut entry.usage))
        }
        None => Ok((balance, usage)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn grant(feature: &str, granted: i64) -> EntitlementGrant {
        EntitlementGrant {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            feature_id: feature.to_string(),
            feature_kind: FeatureKind::Metered,
            kind: GrantKind::Resettable,
            granted,
            unlimited: false,
            overage_allowed: false,
            max_purchase: None,
            reset_interval: "monthly".to_string(),
        }
    }

    fn account_with(grants: Vec<EntitlementGrant>) -> CustomerAccount {
        let mut account = CustomerAccount::default();
        for grant in grants {
            let record = BalanceRecord::fresh(&grant);
            account.balances.insert(record.id, record);
            account.grants.insert(grant.id, grant);
        }
        account
    }

    fn request(customer_id: Uuid, feature: &str, amount: i64) -> DeductionRequest {
        DeductionRequest {
            customer_id,
            org_id: Uuid::new_v4(),
            env: "live".to_string(),
            items: vec![DeductionItem {
                feature_id: feature.to_string(),
                amount,
            }],
            policy: OveragePolicy::Cap,
            entity_id: None,
            idempotency_key: None,
        }
    }

    #[test]
    fn repeated_small_deductions_conserve_exactly() {
        let g = grant("credits", 500);
        let customer = g.customer_id;
        let gid = g.id;
        let mut account = account_with(vec![g]);
        let now = Utc::now();

        for _ in 0..50 {
            run(&mut account, &request(customer, "credits", 10), now).expect("deduction applies");
        }

        let grant = account.grants.get(&gid).unwrap().clone();
        let record = account.balance_for_grant(gid).unwrap();
        assert_eq!(record.balance, 0);
        assert_eq!(record.usage, 500);
        assert!(record.conserves(&grant), "balance + usage must equal granted");
    }

    #[test]
    fn cap_rejection_leaves_state_untouched() {
        let g = grant("credits", 5);
        let customer = g.customer_id;
        let gid = g.id;
        let mut account = account_with(vec![g]);

        let err = run(&mut account, &request(customer, "credits", 10), Utc::now())
            .expect_err("cap policy must reject overage");
        assert_eq!(
            err,
            DeductError::InsufficientBalance(BalanceShortfall {
                feature_id: "credits".to_string(),
                requested: 10,
                remaining: 5,
            })
        );

        let record = account.balance_for_grant(gid).unwrap();
        assert_eq!(record.balance, 5);
        assert_eq!(record.usage, 0);
    }

    #[test]
    fn unlimited_grant_bypasses_without_mutation() {
        let mut g = grant("api_calls", 0);
        g.unlimited = true;
        let customer = g.customer_id;
        let gid = g.id;
        let mut account = account_with(vec![g]);

        let result = run(
            &mut account,
            &request(customer, "api_calls", i64::MAX / 2),
            Utc::now(),
        )
        .expect("unlimited always succeeds");

        assert_eq!(result.events.len(), 1);
        assert!(result.balances.is_empty(), "no balance record is touched");
        let record = account.balance_for_grant(gid).unwrap();
        assert_eq!(record.balance, 0);
        assert_eq!(record.usage, 0);
    }

    #[test]
    fn refunds_apply_regardless_of_policy() {
        let g = grant("credits", 100);
        let customer = g.customer_id;
        let gid = g.id;
        let mut account = account_with(vec![g]);
        let now = Utc::now();

        run(&mut account, &request(customer, "credits", 40), now).unwrap();
        run(&mut account, &request(customer, "credits", -15), now).unwrap();

        let record = account.balance_for_grant(gid).unwrap();
        assert_eq!(record.balance, 75);
        assert_eq!(record.usage, 25);
    }

    #[test]
    fn rollovers_drain_soonest_expiring_first_then_base() {
        let g = grant("credits", 100);
        let customer = g.customer_id;
        let gid = g.id;
        let mut account = account_with(vec![g]);
        let now = Utc::now();

        let soon = Rollover {
            id: Uuid::new_v4(),
            grant_id: gid,
            balance: 30,
            usage: 0,
            expires_at: Some(now + Duration::days(1)),
            entities: None,
        };
        let later = Rollover {
            id: Uuid::new_v4(),
            grant_id: gid,
            balance: 30,
            usage: 0,
            expires_at: Some(now + Duration::days(7)),
            entities: None,
        };
        let soon_id = soon.id;
        let later_id = later.id;
        account.rollovers.insert(soon.id, soon);
        account.rollovers.insert(later.id, later);

        // 30 from the soonest rollover, 10 from the later one, base untouched.
        run(&mut account, &request(customer, "credits", 40), now).unwrap();
        assert_eq!(account.rollovers[&soon_id].balance, 0);
        assert_eq!(account.rollovers[&later_id].balance, 20);
        assert_eq!(account.balance_for_grant(gid).unwrap().balance, 100);

        // Remaining rollover drains before the base grant.
        run(&mut account, &request(customer, "credits", 50), now).unwrap();
        assert_eq!(account.rollovers[&later_id].balance, 0);
        assert_eq!(account.balance_for_grant(gid).unwrap().balance, 70);
        assert_eq!(account.balance_for_grant(gid).unwrap().usage, 30);
    }

    #[test]
    fn expired_rollovers_do_not_fund() {
        let g = grant("credits", 10);
        let customer = g.customer_id;
        let gid = g.id;
        let mut account = account_with(vec![g]);
        let now = Utc::now();

        let expired = Rollover {
            id: Uuid::new_v4(),
            grant_id: gid,
            balance: 100,
            usage: 0,
            expires_at: Some(now - Duration::hours(1)),
            entities: None,
        };
        account.rollovers.insert(expired.id, expired);

        let err = run(&mut account, &request(customer, "credits", 50), now)
            .expect_err("expired rollover balance must not count");
        assert!(matches!(err, DeductError::InsufficientBalance(ref s) if s.remaining == 10));
    }

    #[test]
    fn allow_policy_overdraws_up_to_max_purchase() {
        let mut g = grant("seats", 10);
        g.overage_allowed = true;
        g.max_purchase = Some(5);
        let customer = g.customer_id;
        let gid = g.id;
        let mut account = account_with(vec![g]);
        let now = Utc::now();

        let mut req = request(customer, "seats", 13);
        req.policy = OveragePolicy::Allow;
        run(&mut account, &req, now).expect("overage within max purchase");

        let record = account.balance_for_grant(gid).unwrap();
        assert_eq!(record.balance, -3);
        assert_eq!(record.usage, 13);

        let mut over = request(customer, "seats", 5);
        over.policy = OveragePolicy::Allow;
        let err = run(&mut account, &over, now).expect_err("beyond max purchase");
        assert!(matches!(err, DeductError::InsufficientBalance(ref s) if s.remaining == 2));
    }

    #[test]
    fn paid_allocation_only_funding_is_rejected() {
        let mut g = grant("licenses", 5);
        g.kind = GrantKind::PaidAllocation;
        let customer = g.customer_id;
        let mut account = account_with(vec![g]);

        let err = run(&mut account, &request(customer, "licenses", 1), Utc::now())
            .expect_err("fast path does not serve paid allocations");
        assert_eq!(err, DeductError::PaidAllocated("licenses".to_string()));
    }

    #[test]
    fn per_entity_deduction_targets_one_entry() {
        let g = grant("messages", 20);
        let customer = g.customer_id;
        let gid = g.id;
        let mut account = account_with(vec![g]);
        let record_id = account.balance_for_grant(gid).unwrap().id;
        let mut entities = BTreeMap::new();
        entities.insert(
            "seat-a".to_string(),
            EntityBalance {
                balance: 20,
                usage: 0,
            },
        );
        entities.insert(
            "seat-b".to_string(),
            EntityBalance {
                balance: 20,
                usage: 0,
            },
        );
        account.balances.get_mut(&record_id).unwrap().entities = Some(entities);

        let mut req = request(customer, "messages", 7);
        req.entity_id = Some("seat-a".to_string());
        run(&mut account, &req, Utc::now()).unwrap();

        let record = account.balance_for_grant(gid).unwrap();
        let map = record.entities.as_ref().unwrap();
        assert_eq!(map["seat-a"].balance, 13);
        assert_eq!(map["seat-a"].usage, 7);
        assert_eq!(map["seat-b"].balance, 20);
        assert_eq!(map["seat-b"].usage, 0);

        let mut missing = request(customer, "messages", 1);
        missing.entity_id = Some("seat-z".to_string());
        let err = run(&mut account, &missing, Utc::now()).expect_err("unknown entity");
        assert_eq!(err, DeductError::EntityNotFound("seat-z".to_string()));
    }

    #[test]
    fn multi_item_requests_apply_all_or_nothing() {
        let a = grant("credits", 100);
        let customer = a.customer_id;
        let mut b = grant("seats", 2);
        b.customer_id = customer;
        let a_id = a.id;
        let mut account = account_with(vec![a, b]);
        let now = Utc::now();

        let mut req = request(customer, "credits", 50);
        req.items.push(DeductionItem {
            feature_id: "seats".to_string(),
            amount: 5,
        });

        let err = run(&mut account, &req, now).expect_err("second item is infeasible");
        assert!(matches!(err, DeductError::InsufficientBalance(ref s) if s.feature_id == "seats"));
        assert_eq!(
            account.balance_for_grant(a_id).unwrap().balance,
            100,
            "first item must not have applied"
        );
    }

    #[test]
    fn freed_units_become_replaceables_and_are_reused() {
        let mut g = grant("seats", 10);
        g.feature_kind = FeatureKind::ContinuousUse;
        let customer = g.customer_id;
        let gid = g.id;
        let mut account = account_with(vec![g]);
        let now = Utc::now();

        run(&mut account, &request(customer, "seats", 4), now).unwrap();
        run(&mut account, &request(customer, "seats", -2), now).unwrap();

        let record = account.balance_for_grant(gid).unwrap();
        assert_eq!(record.balance, 8);
        assert_eq!(record.replaceables.len(), 2);

        run(&mut account, &request(customer, "seats", 1), now).unwrap();
        let record = account.balance_for_grant(gid).unwrap();
        assert_eq!(record.balance, 7);
        assert_eq!(record.replaceables.len(), 1, "one freed unit was reused");
    }

    #[test]
    fn missing_customer_grants_is_no_products() {
        let mut account = CustomerAccount::default();
        let err = run(
            &mut account,
            &request(Uuid::new_v4(), "credits", 1),
            Utc::now(),
        )
        .expect_err("empty account");
        assert_eq!(err, DeductError::NoCustomerProducts);
    }

    #[test]
    fn script_handle_digest_is_stable() {
        assert_eq!(ScriptHandle::embedded(), ScriptHandle::embedded());
        assert_eq!(ScriptHandle::embedded().sha().len(), 64);
    }
}
