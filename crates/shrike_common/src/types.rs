use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a transaction, drawn from a per-store monotonic counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Wall-clock milliseconds since the Unix epoch.
///
/// TTL deadlines are absolute values on this clock; a deadline of 0 means
/// no expiration.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
