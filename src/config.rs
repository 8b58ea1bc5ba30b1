use once_cell::sync::Lazy;

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// key: metering-config -> usage event batch size trigger
pub static USAGE_FLUSH_THRESHOLD: Lazy<usize> = Lazy::new(|| {
    std::env::var("USAGE_FLUSH_THRESHOLD")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(100)
});

/// key: metering-config -> usage event time-based flush cadence
pub static USAGE_FLUSH_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("USAGE_FLUSH_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(5)
});

/// key: metering-config -> bound on the in-flight usage event queue
pub static USAGE_QUEUE_BOUND: Lazy<usize> = Lazy::new(|| {
    std::env::var("USAGE_QUEUE_BOUND")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(1024)
});

/// key: metering-config -> duplicate-detection window for idempotency keys
pub static IDEMPOTENCY_TTL_SECS: Lazy<i64> = Lazy::new(|| {
    std::env::var("IDEMPOTENCY_TTL_SECS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(86_400)
});

/// key: metering-config -> per-invocation budget for the fast-path store
pub static FAST_PATH_TIMEOUT_MS: Lazy<u64> = Lazy::new(|| {
    std::env::var("FAST_PATH_TIMEOUT_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(250)
});

/// key: metering-config -> default TTL for advisory locks
pub static ADVISORY_LOCK_TTL_SECS: Lazy<i64> = Lazy::new(|| {
    std::env::var("ADVISORY_LOCK_TTL_SECS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(30)
});
