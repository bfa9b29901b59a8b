//! Progress ticks. Multipart progress is recomputed as the sum over all
//! parts' latest offsets on every tick, never maintained incrementally, so
//! out-of-order part completions re-sum idempotently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::types::{EventSender, ProgressPayload, TransferEvent};

pub(crate) const PROGRESS_TICK_MS: u64 = 500;

pub(crate) fn spawn_progress_ticker(
    tx: EventSender,
    counters: Arc<Vec<AtomicU64>>,
    total: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(PROGRESS_TICK_MS));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let loaded: u64 = counters.iter().map(|c| c.load(Ordering::SeqCst)).sum();
            if tx
                .send(TransferEvent::Progress(ProgressPayload { loaded, total }))
                .is_err()
            {
                break;
            }
        }
    })
}
