use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

/// key: engine-models -> grants,balances,rollovers,events

/// How a feature is consumed. Continuous-use features model allocation units
/// (seats, slots) and are the only kind that participates in replaceable
/// tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Metered,
    ContinuousUse,
}

/// Paid-allocation grants are non-resettable and are never served by the
/// fast path; the durable store handles them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    Resettable,
    PaidAllocation,
}

/// Request-level overage policy: `Cap` rejects any deduction the summed
/// source balances cannot fund, `Allow` lets the base balance go negative
/// within the grant's configured bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OveragePolicy {
    Cap,
    Allow,
}

/// The static allowance configured for one (customer, feature) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementGrant {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub feature_id: String,
    pub feature_kind: FeatureKind,
    pub kind: GrantKind,
    pub granted: i64,
    pub unlimited: bool,
    pub overage_allowed: bool,
    pub max_purchase: Option<i64>,
    pub reset_interval: String,
}

/// Per-sub-entity share of a split grant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityBalance {
    pub balance: i64,
    pub usage: i64,
}

/// Marker for an allocation unit freed by a refund and pending deletion at
/// the next reset cycle unless a later deduction reuses it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replaceable {
    pub id: Uuid,
    pub from_entity: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Mutable state for one grant instance. Outside of a running deduction,
/// `balance + usage == granted + adjustment` holds per record, or per entity
/// entry when the grant is split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub id: Uuid,
    pub grant_id: Uuid,
    pub balance: i64,
    pub usage: i64,
    pub adjustment: i64,
    pub entities: Option<BTreeMap<String, EntityBalance>>,
    pub replaceables: Vec<Replaceable>,
}

impl BalanceRecord {
    pub fn fresh(grant: &EntitlementGrant) -> Self {
        Self {
            id: Uuid::new_v4(),
            grant_id: grant.id,
            balance: grant.granted,
            usage: 0,
            adjustment: 0,
            entities: None,
            replaceables: Vec::new(),
        }
    }

    /// Conservation check against the owning grant.
    pub fn conserves(&self, grant: &EntitlementGrant) -> bool {
        match &self.entities {
            Some(entities) => entities
                .values()
                .all(|entry| entry.balance + entry.usage == grant.granted + self.adjustment),
            None => self.balance + self.usage == grant.granted + self.adjustment,
        }
    }
}

/// Unused balance carried over from a prior reset cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollover {
    pub id: Uuid,
    pub grant_id: Uuid,
    pub balance: i64,
    pub usage: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub entities: Option<BTreeMap<String, EntityBalance>>,
}

impl Rollover {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// One feature deduction within a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeductionItem {
    pub feature_id: String,
    pub amount: i64,
}

/// A validated, identifier-resolved deduction request. Validation and id
/// resolution happen upstream of this engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeductionRequest {
    pub customer_id: Uuid,
    pub org_id: Uuid,
    pub env: String,
    pub items: Vec<DeductionItem>,
    pub policy: OveragePolicy,
    pub entity_id: Option<String>,
    pub idempotency_key: Option<String>,
}

impl DeductionRequest {
    pub fn scope(&self) -> CustomerScope {
        CustomerScope {
            org_id: self.org_id,
            env: self.env.clone(),
            customer_id: self.customer_id,
        }
    }
}

/// Key addressing one customer's account in the fast-path store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomerScope {
    pub org_id: Uuid,
    pub env: String,
    pub customer_id: Uuid,
}

/// One customer's full account state, flat collections keyed by id with
/// foreign-key references between them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomerAccount {
    pub grants: HashMap<Uuid, EntitlementGrant>,
    pub balances: HashMap<Uuid, BalanceRecord>,
    pub rollovers: HashMap<Uuid, Rollover>,
}

impl CustomerAccount {
    pub fn balance_for_grant(&self, grant_id: Uuid) -> Option<&BalanceRecord> {
        self.balances.values().find(|record| record.grant_id == grant_id)
    }
}

/// Immutable record of one accepted deduction, persisted exactly once by the
/// event batcher.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: Uuid,
    pub org_id: Uuid,
    pub env: String,
    pub customer_id: Uuid,
    pub feature_id: String,
    pub grant_id: Uuid,
    pub amount: i64,
    pub idempotency_key: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Outcome of an applied deduction: the post-deduction state of every
/// touched balance record and rollover, plus the usage events to persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeductionResult {
    pub balances: Vec<BalanceRecord>,
    pub rollovers: Vec<Rollover>,
    pub events: Vec<UsageEvent>,
}

/// The shortfall payload carried by an authoritative balance rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceShortfall {
    pub feature_id: String,
    pub requested: i64,
    pub remaining: i64,
}

/// Typed failures of the deduction path. Business kinds come out of the
/// atomic script; infrastructure kinds out of the client wrapper.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeductError {
    #[error("customer not present in fast-path store")]
    CustomerNotFound,
    #[error("customer has no grants covering the request")]
    NoCustomerProducts,
    #[error("entity `{0}` not present on the targeted grant")]
    EntityNotFound(String),
    #[error("feature `{0}` is only funded by a paid allocation grant")]
    PaidAllocated(String),
    #[error(
        "insufficient balance for `{}`: requested {}, remaining {}",
        .0.feature_id,
        .0.requested,
        .0.remaining
    )]
    InsufficientBalance(BalanceShortfall),
    #[error("deduction script is not registered with the store")]
    ScriptNotRegistered,
    #[error("fast-path store unavailable: {0}")]
    Unavailable(String),
    #[error("fast-path invocation timed out")]
    Timeout,
}

/// Plain error kind used by the table-driven retry classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeductErrorKind {
    CustomerNotFound,
    NoCustomerProducts,
    EntityNotFound,
    PaidAllocated,
    InsufficientBalance,
    ScriptNotRegistered,
    Unavailable,
    Timeout,
}

impl DeductError {
    pub fn kind(&self) -> DeductErrorKind {
        match self {
            DeductError::CustomerNotFound => DeductErrorKind::CustomerNotFound,
            DeductError::NoCustomerProducts => DeductErrorKind::NoCustomerProducts,
            DeductError::EntityNotFound(_) => DeductErrorKind::EntityNotFound,
            DeductError::PaidAllocated(_) => DeductErrorKind::PaidAllocated,
            DeductError::InsufficientBalance(_) => DeductErrorKind::InsufficientBalance,
            DeductError::ScriptNotRegistered => DeductErrorKind::ScriptNotRegistered,
            DeductError::Unavailable(_) => DeductErrorKind::Unavailable,
            DeductError::Timeout => DeductErrorKind::Timeout,
        }
    }
}

/// A caller-held view of one customer's balances, patched in place by the
/// cache syncer after a successful deduction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerSnapshot {
    pub customer_id: Uuid,
    pub balances: HashMap<Uuid, BalanceRecord>,
    pub rollovers: HashMap<Uuid, Rollover>,
}

impl CustomerSnapshot {
    pub fn from_account(customer_id: Uuid, account: &CustomerAccount) -> Self {
        Self {
            customer_id,
            balances: account.balances.clone(),
            rollovers: account.rollovers.clone(),
        }
    }
}
