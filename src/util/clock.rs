//! Wall-clock helpers.
//!
//! Engine operations take an explicit `now` so tests can move time forward
//! without sleeping; these helpers are the production source of that value.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Current UTC time.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Signed duration `now - since`, clamped at zero.
pub fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// `now - window`, saturating at the minimum representable time.
pub fn ago(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
