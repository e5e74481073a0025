//! Outbound request throttle shared by broker clients.

use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

/// Wraps a direct (un-keyed) governor limiter. Every REST call awaits a
/// permit before hitting the wire so that a reconciliation sweep cannot
/// starve order placement of rate budget.
pub struct RequestLimiter {
    inner: DefaultDirectRateLimiter,
}

impl RequestLimiter {
    /// Allow up to `per_second` requests per second, with a small burst.
    #[must_use]
    pub fn per_second(per_second: u32) -> Self {
        let rate = NonZeroU32::new(per_second.max(1)).unwrap();
        Self {
            inner: RateLimiter::direct(Quota::per_second(rate)),
        }
    }

    /// Wait until a request permit is available.
    pub async fn acquire(&self) {
        self.inner.until_ready().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_are_granted() {
        let limiter = RequestLimiter::per_second(1000);
        for _ in 0..10 {
            limiter.acquire().await;
        }
    }
}
