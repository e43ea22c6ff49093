use chrono::Utc;

/// Epoch seconds. Store and engine APIs take `now: i64` parameters so tests
/// can drive lease expiry and token TTLs without a mock clock; this is the
/// production source for those parameters.
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}
