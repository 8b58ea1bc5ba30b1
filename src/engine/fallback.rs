use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::{PgPool, Row};

use crate::engine::models::{
    BalanceShortfall, DeductError, DeductionRequest, DeductionResult,
};

/// key: engine-fallback -> durable-store deduction via stored procedure

/// Shape of the rejection a balance-exhausted procedure raises. The fields
/// ride inside the error message because the procedure aborts the
/// transaction; nothing else survives the rollback.
static SHORTFALL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"INSUFFICIENT_BALANCE\|featureId:([^|]+)\|value:(-?\d+)\|remaining:(-?\d+)")
        .unwrap_or_else(|err| panic!("shortfall pattern failed to compile: {err}"))
});

/// Parse a procedure error message into a shortfall, when it carries one.
pub fn parse_shortfall(message: &str) -> Option<BalanceShortfall> {
    let captures = SHORTFALL_PATTERN.captures(message)?;
    let feature_id = captures.get(1)?.as_str().to_string();
    let requested = captures.get(2)?.as_str().parse().ok()?;
    let remaining = captures.get(3)?.as_str().parse().ok()?;
    Some(BalanceShortfall {
        feature_id,
        requested,
        remaining,
    })
}

/// Runs a deduction inside a single Postgres transaction when the fast path
/// could not decide. The procedure reads, checks, and writes every touched
/// row itself, so concurrent fallbacks serialize on row locks.
#[derive(Clone)]
pub struct FallbackCoordinator {
    pool: PgPool,
}

impl FallbackCoordinator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn deduct(&self, request: &DeductionRequest) -> Result<DeductionResult, DeductError> {
        let payload = serde_json::to_value(request)
            .map_err(|err| DeductError::Unavailable(err.to_string()))?;
        let row = sqlx::query("SELECT metering.deduct_usage($1::jsonb) AS result")
            .bind(payload)
            .fetch_one(&self.pool)
            .await
            .map_err(classify_db_error)?;
        let value: serde_json::Value = row
            .try_get("result")
            .map_err(|err| DeductError::Unavailable(err.to_string()))?;
        serde_json::from_value(value).map_err(|err| {
            tracing::error!(?err, "fallback procedure returned an unreadable result");
            DeductError::Unavailable(err.to_string())
        })
    }
}

fn classify_db_error(err: sqlx::Error) -> DeductError {
    if let sqlx::Error::Database(db_err) = &err {
        let message = db_err.message();
        if let Some(shortfall) = parse_shortfall(message) {
            return DeductError::InsufficientBalance(shortfall);
        }
        if message.contains("NO_CUSTOMER_PRODUCTS") {
            return DeductError::NoCustomerProducts;
        }
        if let Some(rest) = message.split("ENTITY_NOT_FOUND|").nth(1) {
            return DeductError::EntityNotFound(rest.trim().to_string());
        }
    }
    DeductError::Unavailable(err.to_string())
}
