use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use once_cell::sync::OnceCell;

use crate::engine::models::{
    CustomerAccount, CustomerScope, DeductError, DeductionRequest, DeductionResult,
};
use crate::engine::script::{self, ScriptHandle};

/// key: engine-store -> scripted fast-path store seam

/// The scripted balance store the hot path talks to. Implementations must run
/// a registered script atomically per customer: two concurrent invocations
/// against the same scope never interleave.
#[async_trait]
pub trait FastStore: Send + Sync {
    /// Install the deduction script and return the handle callers must
    /// present on every invocation.
    async fn register_script(&self) -> Result<ScriptHandle, DeductError>;

    /// Run the registered script against one customer's account.
    async fn invoke(
        &self,
        handle: &ScriptHandle,
        request: &DeductionRequest,
    ) -> Result<DeductionResult, DeductError>;

    /// Load a full account image, if the customer is resident.
    async fn account(&self, scope: &CustomerScope) -> Result<Option<CustomerAccount>, DeductError>;

    /// Replace a customer's resident account image.
    async fn put_account(
        &self,
        scope: &CustomerScope,
        account: CustomerAccount,
    ) -> Result<(), DeductError>;

    /// Drop a customer from residency. Missing customers are not an error.
    async fn evict(&self, scope: &CustomerScope) -> Result<(), DeductError>;
}

/// In-process rendition of the scripted store. Accounts live in a sharded map
/// and the per-entry lock serializes invocations per customer, which is the
/// same atomicity unit a scripted remote store gives.
pub struct InProcessStore {
    accounts: DashMap<CustomerScope, CustomerAccount>,
    registered: OnceCell<String>,
}

impl InProcessStore {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            registered: OnceCell::new(),
        }
    }

    fn check_registered(&self, handle: &ScriptHandle) -> Result<(), DeductError> {
        match self.registered.get() {
            Some(sha) if sha == handle.sha() => Ok(()),
            _ => Err(DeductError::ScriptNotRegistered),
        }
    }
}

impl Default for InProcessStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FastStore for InProcessStore {
    async fn register_script(&self) -> Result<ScriptHandle, DeductError> {
        let handle = ScriptHandle::embedded();
        let _ = self.registered.set(handle.sha().to_string());
        tracing::debug!(sha = handle.sha(), "deduction script registered");
        Ok(handle)
    }

    async fn invoke(
        &self,
        handle: &ScriptHandle,
        request: &DeductionRequest,
    ) -> Result<DeductionResult, DeductError> {
        self.check_registered(handle)?;
        let scope = request.scope();
        let mut entry = self
            .accounts
            .get_mut(&scope)
            .ok_or(DeductError::CustomerNotFound)?;
        script::run(entry.value_mut(), request, Utc::now())
    }

    async fn account(&self, scope: &CustomerScope) -> Result<Option<CustomerAccount>, DeductError> {
        Ok(self.accounts.get(scope).map(|entry| entry.value().clone()))
    }

    async fn put_account(
        &self,
        scope: &CustomerScope,
        account: CustomerAccount,
    ) -> Result<(), DeductError> {
        self.accounts.insert(scope.clone(), account);
        Ok(())
    }

    async fn evict(&self, scope: &CustomerScope) -> Result<(), DeductError> {
        self.accounts.remove(scope);
        Ok(())
    }
}
