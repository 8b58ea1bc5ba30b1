use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::oneshot;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::config;
use crate::engine::models::UsageEvent;

/// key: engine-events -> batched usage event persistence

/// Where flushed usage events land. The batcher retries a failed batch on
/// the next trigger, so sinks must tolerate re-seeing the same events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn persist(&self, events: &[UsageEvent]) -> anyhow::Result<()>;
}

/// Sink backed by the durable store. One multi-row insert per batch; replays
/// of an already persisted event are absorbed by the primary key.
pub struct PgEventSink {
    pool: PgPool,
}

impl PgEventSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventSink for PgEventSink {
    async fn persist(&self, events: &[UsageEvent]) -> anyhow::Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut ids = Vec::with_capacity(events.len());
        let mut org_ids = Vec::with_capacity(events.len());
        let mut envs = Vec::with_capacity(events.len());
        let mut customer_ids = Vec::with_capacity(events.len());
        let mut feature_ids = Vec::with_capacity(events.len());
        let mut grant_ids = Vec::with_capacity(events.len());
        let mut amounts = Vec::with_capacity(events.len());
        let mut idempotency_keys = Vec::with_capacity(events.len());
        let mut recorded_ats = Vec::with_capacity(events.len());
        for event in events {
            ids.push(event.id);
            org_ids.push(event.org_id);
            envs.push(event.env.clone());
            customer_ids.push(event.customer_id);
            feature_ids.push(event.feature_id.clone());
            grant_ids.push(event.grant_id);
            amounts.push(event.amount);
            idempotency_keys.push(event.idempotency_key.clone());
            recorded_ats.push(event.recorded_at);
        }
        sqlx::query(
            r#"
            INSERT INTO metering.usage_events
                (id, org_id, env, customer_id, feature_id, grant_id, amount, idempotency_key, recorded_at)
            SELECT * FROM UNNEST(
                $1::uuid[], $2::uuid[], $3::text[], $4::uuid[], $5::text[],
                $6::uuid[], $7::bigint[], $8::text[], $9::timestamptz[]
            )
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&ids)
        .bind(&org_ids)
        .bind(&envs)
        .bind(&customer_ids)
        .bind(&feature_ids)
        .bind(&grant_ids)
        .bind(&amounts)
        .bind(&idempotency_keys)
        .bind(&recorded_ats)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

enum BatcherCommand {
    Record(Box<UsageEvent>),
    Flush(oneshot::Sender<()>),
}

/// Caller side of the batcher worker. Cheap to clone, one per service.
#[derive(Clone)]
pub struct EventBatcher {
    tx: Sender<BatcherCommand>,
}

impl EventBatcher {
    /// Queue one event for persistence. Applies backpressure when the queue
    /// is full; errors only after the worker has gone away.
    pub async fn record(&self, event: UsageEvent) -> anyhow::Result<()> {
        self.tx
            .send(BatcherCommand::Record(Box::new(event)))
            .await
            .map_err(|_| anyhow::anyhow!("event batcher worker is gone"))
    }

    /// Force a flush and wait for it to complete. The flush is attempted
    /// even when the buffer is below the size threshold.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(BatcherCommand::Flush(done_tx))
            .await
            .map_err(|_| anyhow::anyhow!("event batcher worker is gone"))?;
        done_rx
            .await
            .map_err(|_| anyhow::anyhow!("event batcher worker dropped the flush"))
    }
}

/// Spawn the batching worker. Flushes when the buffer reaches the size
/// threshold or the flush interval elapses, whichever comes first. A batch
/// that fails to persist stays buffered for the next trigger.
pub fn start_event_batcher(sink: Arc<dyn EventSink>) -> EventBatcher {
    start_event_batcher_with(
        sink,
        *config::USAGE_FLUSH_THRESHOLD,
        Duration::from_secs(*config::USAGE_FLUSH_INTERVAL_SECS),
        *config::USAGE_QUEUE_BOUND,
    )
}

pub fn start_event_batcher_with(
    sink: Arc<dyn EventSink>,
    threshold: usize,
    flush_interval: Duration,
    queue_bound: usize,
) -> EventBatcher {
    let (tx, rx) = channel(queue_bound);
    tokio::spawn(run_worker(sink, rx, threshold, flush_interval));
    EventBatcher { tx }
}

async fn run_worker(
    sink: Arc<dyn EventSink>,
    mut rx: Receiver<BatcherCommand>,
    threshold: usize,
    flush_interval: Duration,
) {
    let mut buffer: Vec<UsageEvent> = Vec::new();
    let mut ticker = interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = rx.recv() => {
                match command {
                    Some(BatcherCommand::Record(event)) => {
                        buffer.push(*event);
                        if buffer.len() >= threshold {
                            flush_buffer(&*sink, &mut buffer).await;
                        }
                    }
                    Some(BatcherCommand::Flush(done)) => {
                        flush_buffer(&*sink, &mut buffer).await;
                        let _ = done.send(());
                    }
                    None => {
                        // Last handle dropped; push out whatever is left.
                        flush_buffer(&*sink, &mut buffer).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_buffer(&*sink, &mut buffer).await;
                }
            }
        }
    }
}

async fn flush_buffer(sink: &dyn EventSink, buffer: &mut Vec<UsageEvent>) {
    if buffer.is_empty() {
        return;
    }
    // Drain up front so events past the threshold that arrive mid-flush form
    // the next batch instead of growing this one.
    let batch: Vec<UsageEvent> = std::mem::take(buffer);
    match sink.persist(&batch).await {
        Ok(()) => {
            tracing::debug!(count = batch.len(), "usage event batch persisted");
        }
        Err(err) => {
            tracing::warn!(?err, count = batch.len(), "usage event batch failed, retaining");
            let mut retained = batch;
            retained.extend(buffer.drain(..));
            *buffer = retained;
        }
    }
}
