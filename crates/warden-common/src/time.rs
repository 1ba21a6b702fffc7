//! ---
//! warden_section: "01-core-functionality"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Shared primitives and utilities for the service runtime."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::Utc;

/// Wall-clock nanoseconds since the unix epoch, the unit of every write timestamp.
pub fn unix_nanos_now() -> i64 {
    let now = Utc::now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1_000))
}

/// Timestamp `age` before now, saturating at zero.
pub fn unix_nanos_before(age: Duration) -> i64 {
    let age = i64::try_from(age.as_nanos()).unwrap_or(i64::MAX);
    unix_nanos_now().saturating_sub(age).max(0)
}
