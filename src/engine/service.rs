use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use crate::engine::cache::CacheSyncer;
use crate::engine::events::EventBatcher;
use crate::engine::fallback::FallbackCoordinator;
use crate::engine::fast_path::{fallback_eligible, FastPathClient};
use crate::engine::idempotency::IdempotencyGuard;
use crate::engine::models::{
    BalanceShortfall, DeductError, DeductionRequest, DeductionResult,
};
use crate::engine::store::FastStore;

/// key: engine-service -> deduction request state machine

/// Terminal outcomes of one tracking request. Everything the caller can see
/// is one of these or a successful result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrackError {
    #[error("duplicate request for idempotency key `{0}`")]
    Duplicate(String),
    #[error(
        "insufficient balance for `{}`: requested {}, remaining {}",
        .0.feature_id,
        .0.requested,
        .0.remaining
    )]
    InsufficientBalance(BalanceShortfall),
    #[error("deduction could not be applied: {0}")]
    Infrastructure(String),
}

/// Drives a request through idempotency check, fast-path attempt, at most
/// one fallback attempt, and event batching. Built once at startup; every
/// collaborator is an injected handle.
pub struct TrackService {
    idempotency: Arc<IdempotencyGuard>,
    fast_path: FastPathClient,
    syncer: CacheSyncer,
    batcher: EventBatcher,
    fallback: Option<FallbackCoordinator>,
}

impl TrackService {
    pub async fn connect(
        store: Arc<dyn FastStore>,
        idempotency: Arc<IdempotencyGuard>,
        batcher: EventBatcher,
    ) -> Result<Self, DeductError> {
        let fast_path = FastPathClient::connect(store.clone()).await?;
        Ok(Self {
            idempotency,
            fast_path,
            syncer: CacheSyncer::new(store),
            batcher,
            fallback: None,
        })
    }

    pub fn with_fallback(mut self, coordinator: FallbackCoordinator) -> Self {
        self.fallback = Some(coordinator);
        self
    }

    pub fn syncer(&self) -> &CacheSyncer {
        &self.syncer
    }

    /// Apply one deduction request end to end.
    ///
    /// The idempotency marker is written before any attempt, so a retry of a
    /// request that is still in flight is refused instead of applied twice.
    /// Fallback runs exactly once and only for errors the fast path could
    /// not decide; a balance rejection from either path is final.
    pub async fn track(&self, request: &DeductionRequest) -> Result<DeductionResult, TrackError> {
        let scope = request.scope();
        if let Some(key) = &request.idempotency_key {
            if !self.idempotency.check_and_set(&scope, key, Utc::now()) {
                tracing::info!(customer_id = %request.customer_id, key, "duplicate track refused");
                return Err(TrackError::Duplicate(key.clone()));
            }
        }

        let result = match self.fast_path.deduct(request).await {
            Ok(result) => result,
            Err(err) if fallback_eligible(err.kind()) => self.run_fallback(request, err).await?,
            Err(DeductError::InsufficientBalance(shortfall)) => {
                return Err(TrackError::InsufficientBalance(shortfall));
            }
            Err(err) => return Err(TrackError::Infrastructure(err.to_string())),
        };

        for event in &result.events {
            if let Err(err) = self.batcher.record(event.clone()).await {
                // The deduction already applied; losing the event is a
                // persistence gap to surface, not a reason to fail the call.
                tracing::error!(?err, event_id = %event.id, "accepted usage event could not be queued");
            }
        }
        Ok(result)
    }

    async fn run_fallback(
        &self,
        request: &DeductionRequest,
        fast_err: DeductError,
    ) -> Result<DeductionResult, TrackError> {
        let Some(coordinator) = &self.fallback else {
            return Err(TrackError::Infrastructure(fast_err.to_string()));
        };
        tracing::debug!(
            customer_id = %request.customer_id,
            reason = %fast_err,
            "fast path undecided, taking durable path",
        );
        match coordinator.deduct(request).await {
            Ok(result) => Ok(result),
            Err(DeductError::InsufficientBalance(shortfall)) => {
                Err(TrackError::InsufficientBalance(shortfall))
            }
            Err(err) => Err(TrackError::Infrastructure(err.to_string())),
        }
    }
}
