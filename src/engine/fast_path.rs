use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::config;
use crate::engine::models::{DeductError, DeductErrorKind, DeductionRequest, DeductionResult};
use crate::engine::script::ScriptHandle;
use crate::engine::store::FastStore;

/// key: engine-fast-path -> invocation wrapper and fallback classification

/// Whether a fast-path failure should be retried against the durable store.
/// `InsufficientBalance` is an authoritative answer; everything else means
/// the fast path could not decide.
pub fn fallback_eligible(kind: DeductErrorKind) -> bool {
    match kind {
        DeductErrorKind::InsufficientBalance => false,
        DeductErrorKind::CustomerNotFound
        | DeductErrorKind::NoCustomerProducts
        | DeductErrorKind::EntityNotFound
        | DeductErrorKind::PaidAllocated
        | DeductErrorKind::ScriptNotRegistered
        | DeductErrorKind::Unavailable
        | DeductErrorKind::Timeout => true,
    }
}

/// Client held by the tracking service. Owns the script handle and enforces
/// the per-invocation time budget so a stalled store degrades to the
/// fallback path instead of holding the request open.
pub struct FastPathClient {
    store: Arc<dyn FastStore>,
    handle: ScriptHandle,
    budget: Duration,
}

impl FastPathClient {
    /// Register the embedded script with the store and return a ready client.
    pub async fn connect(store: Arc<dyn FastStore>) -> Result<Self, DeductError> {
        let handle = store.register_script().await?;
        Ok(Self {
            store,
            handle,
            budget: Duration::from_millis(*config::FAST_PATH_TIMEOUT_MS),
        })
    }

    #[cfg(test)]
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    /// One scripted deduction attempt, bounded by the configured budget.
    pub async fn deduct(&self, request: &DeductionRequest) -> Result<DeductionResult, DeductError> {
        match timeout(self.budget, self.store.invoke(&self.handle, request)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    customer_id = %request.customer_id,
                    budget_ms = self.budget.as_millis() as u64,
                    "fast-path invocation exceeded its budget",
                );
                Err(DeductError::Timeout)
            }
        }
    }
}
