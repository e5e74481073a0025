//! Canonical journal record envelope and kinds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical kinds stored in the append-only journal.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordKind {
    Bar,
    Signal,
    Intent,
    OrderCreated,
    OrderTransition,
    Fill,
    PositionReconciled,
    Halt,
    Heartbeat,
    Metric,
}

impl RecordKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bar => "BAR",
            Self::Signal => "SIGNAL",
            Self::Intent => "INTENT",
            Self::OrderCreated => "ORDER_CREATED",
            Self::OrderTransition => "ORDER_TRANSITION",
            Self::Fill => "FILL",
            Self::PositionReconciled => "POSITION_RECONCILED",
            Self::Halt => "HALT",
            Self::Heartbeat => "HEARTBEAT",
            Self::Metric => "METRIC",
        }
    }
}

/// One line of the journal: `{"ts":"…Z","kind":"…","data":{…}}`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EventRecord {
    pub ts: DateTime<Utc>,
    pub kind: RecordKind,
    pub data: serde_json::Value,
}

impl EventRecord {
    /// Stamp a record with the current time.
    pub fn now(kind: RecordKind, data: serde_json::Value) -> Self {
        Self {
            ts: Utc::now(),
            kind,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_round_trips_as_single_json_line() {
        let record = EventRecord::now(RecordKind::OrderCreated, json!({"order_id": "x"}));
        let line = serde_json::to_string(&record).unwrap();
        assert!(!line.contains('\n'));
        let back: EventRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back.kind, RecordKind::OrderCreated);
        assert_eq!(back.data["order_id"], "x");
    }

    #[test]
    fn kinds_serialize_screaming_snake() {
        let value = serde_json::to_value(RecordKind::PositionReconciled).unwrap();
        assert_eq!(value, "POSITION_RECONCILED");
    }
}
