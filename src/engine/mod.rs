pub mod api;
pub mod cache;
pub mod events;
pub mod fallback;
pub mod fast_path;
pub mod idempotency;
pub mod locks;
pub mod models;
pub mod script;
pub mod service;
pub mod store;

pub use cache::CacheSyncer;
pub use events::{start_event_batcher, EventBatcher, EventSink, PgEventSink};
pub use fallback::FallbackCoordinator;
pub use fast_path::FastPathClient;
pub use idempotency::IdempotencyGuard;
pub use locks::LockManager;
pub use service::{TrackError, TrackService};
pub use store::{FastStore, InProcessStore};
