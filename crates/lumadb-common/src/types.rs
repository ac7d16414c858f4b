//! Common type definitions for LumaDB

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Session identifier, also used as the exclusive owner token of a handle
pub type SessionId = u64;

/// Current wall-clock time in milliseconds
#[must_use]
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}
