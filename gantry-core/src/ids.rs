//! Identifier generation: deterministic idempotency keys and sortable order ids.

use std::fmt::Write as _;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{Qty, Side};

/// Width of the bucket applied to decision timestamps when hashing intents.
///
/// Two decisions for the same signal inside one bucket are the same logical
/// intent; re-deriving the id after a crash therefore lands on the same
/// broker order.
const DECISION_TS_BUCKET_SECS: i64 = 60;

/// Derive the deterministic `client_order_id` for a trading intent.
///
/// The id is a stable SHA-256 prefix over the identifying tuple. No random
/// component: idempotency across process restarts requires that the same
/// intent always yields the same key.
#[must_use]
pub fn intent_client_order_id(
    strategy_id: &str,
    signal_id: &Uuid,
    symbol: &str,
    side: Side,
    qty: Qty,
    decision_ts: DateTime<Utc>,
) -> String {
    let bucket = decision_ts.timestamp() / DECISION_TS_BUCKET_SECS;
    let side = match side {
        Side::Buy => "buy",
        Side::Sell => "sell",
    };
    let mut hasher = Sha256::new();
    hasher.update(strategy_id.as_bytes());
    hasher.update(b"|");
    hasher.update(signal_id.as_bytes());
    hasher.update(b"|");
    hasher.update(symbol.as_bytes());
    hasher.update(b"|");
    hasher.update(side.as_bytes());
    hasher.update(b"|");
    hasher.update(qty.normalize().to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(bucket.to_le_bytes());
    let digest = hasher.finalize();

    let mut id = String::with_capacity(20);
    id.push_str("ord-");
    for byte in digest.iter().take(8) {
        write!(id, "{byte:02x}").ok();
    }
    id
}

/// Generates monotonic, lexicographically sortable order identifiers.
///
/// Format: 13-digit zero-padded unix milliseconds plus a 4-digit sequence,
/// bumped whenever two ids land in the same millisecond. The clock is never
/// allowed to run backwards within one process.
pub struct OrderIdGenerator {
    inner: Mutex<IdClock>,
}

struct IdClock {
    last_millis: i64,
    seq: u16,
}

impl OrderIdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(IdClock {
                last_millis: 0,
                seq: 0,
            }),
        }
    }

    /// Produce the next order id.
    pub fn next_id(&self) -> String {
        let mut clock = self.inner.lock().unwrap();
        let now = Utc::now().timestamp_millis();
        if now > clock.last_millis {
            clock.last_millis = now;
            clock.seq = 0;
        } else {
            clock.seq = clock.seq.wrapping_add(1);
            if clock.seq == 0 {
                clock.last_millis += 1;
            }
        }
        format!("{:013}-{:04}", clock.last_millis, clock.seq)
    }
}

impl Default for OrderIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_ids_are_strictly_increasing() {
        let gen = OrderIdGenerator::new();
        let mut previous = gen.next_id();
        for _ in 0..1_000 {
            let next = gen.next_id();
            assert!(next > previous, "{next} should sort after {previous}");
            previous = next;
        }
    }

    #[test]
    fn intent_ids_bucket_decision_timestamps() {
        let signal = Uuid::new_v4();
        let base = DateTime::parse_from_rfc3339("2025-06-02T14:30:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let a = intent_client_order_id("momo", &signal, "MSFT", Side::Buy, Qty::from(5), base);
        let b = intent_client_order_id(
            "momo",
            &signal,
            "MSFT",
            Side::Buy,
            Qty::from(5),
            base + chrono::Duration::seconds(30),
        );
        assert_eq!(a, b, "same minute bucket must hash identically");

        let c = intent_client_order_id(
            "momo",
            &signal,
            "MSFT",
            Side::Sell,
            Qty::from(5),
            base,
        );
        assert_ne!(a, c);
    }
}
