use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

pub(crate) type SpeedLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Builds the optional byte-rate limiter shared by all part tasks of one
/// transfer.
pub(crate) fn speed_limiter(limit: Option<NonZeroU32>) -> Option<Arc<SpeedLimiter>> {
    limit.map(|bytes_per_sec| Arc::new(RateLimiter::direct(Quota::per_second(bytes_per_sec))))
}

/// Waits until `len` bytes are admitted. Chunks larger than the quota burst
/// pass unthrottled rather than stalling forever.
pub(crate) async fn admit(limiter: &Option<Arc<SpeedLimiter>>, len: usize) {
    if let Some(limiter) = limiter {
        if let Some(n) = NonZeroU32::new(len.min(u32::MAX as usize) as u32) {
            let _ = limiter.until_n_ready(n).await;
        }
    }
}
