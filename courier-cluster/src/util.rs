use serde::Serializer;
use std::time::Duration;

/// Serialize a `Duration` as fractional milliseconds
pub(crate) fn serialize_duration_ms<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}
