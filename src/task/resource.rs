use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sentinel for "unbounded" (as a limit) or "not measured" (as usage).
pub const UNBOUNDED: i64 = -1;

fn unbounded() -> i64 {
    UNBOUNDED
}

/// Resource envelope of one execution.
///
/// The same shape describes both the limits handed to the executor and the
/// usage it measured. Any field set to `-1` is unbounded / not applicable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    #[serde(default = "unbounded")]
    pub time_msecs: i64,
    #[serde(default = "unbounded")]
    pub memory_bytes: i64,
    #[serde(default = "unbounded")]
    pub file_count: i64,
    #[serde(default = "unbounded")]
    pub file_size_bytes: i64,
}

impl Default for ResourceUsage {
    fn default() -> Self {
        Self::unbounded()
    }
}

fn bound(value: i64) -> Option<u64> {
    if value < 0 {
        None
    } else {
        Some(value as u64)
    }
}

impl ResourceUsage {
    pub const fn unbounded() -> Self {
        Self {
            time_msecs: UNBOUNDED,
            memory_bytes: UNBOUNDED,
            file_count: UNBOUNDED,
            file_size_bytes: UNBOUNDED,
        }
    }

    /// Time and memory bounded, disk unbounded.
    pub const fn new(time_msecs: i64, memory_bytes: i64) -> Self {
        Self {
            time_msecs,
            memory_bytes,
            file_count: UNBOUNDED,
            file_size_bytes: UNBOUNDED,
        }
    }

    pub fn time_limit(&self) -> Option<Duration> {
        bound(self.time_msecs).map(Duration::from_millis)
    }

    pub fn memory_limit(&self) -> Option<u64> {
        bound(self.memory_bytes)
    }

    pub fn file_count_limit(&self) -> Option<u64> {
        bound(self.file_count)
    }

    pub fn file_size_limit(&self) -> Option<u64> {
        bound(self.file_size_bytes)
    }

    /// Scale the time limit by `factor`, leaving unbounded time untouched.
    pub fn scale_time(&self, factor: f64) -> Self {
        let mut scaled = *self;
        if self.time_msecs >= 0 {
            scaled.time_msecs = (self.time_msecs as f64 * factor).ceil() as i64;
        }
        scaled
    }

    /// Field-wise maximum; used to aggregate peak usage across test cases.
    pub fn peak(&self, other: &Self) -> Self {
        Self {
            time_msecs: self.time_msecs.max(other.time_msecs),
            memory_bytes: self.memory_bytes.max(other.memory_bytes),
            file_count: self.file_count.max(other.file_count),
            file_size_bytes: self.file_size_bytes.max(other.file_size_bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_fields_are_unbounded() {
        let limits = ResourceUsage::unbounded();
        assert!(limits.time_limit().is_none());
        assert!(limits.memory_limit().is_none());
        assert!(limits.file_count_limit().is_none());
        assert!(limits.file_size_limit().is_none());
    }

    #[test]
    fn bounded_fields_convert() {
        let limits = ResourceUsage::new(1000, 268_435_456);
        assert_eq!(limits.time_limit(), Some(Duration::from_millis(1000)));
        assert_eq!(limits.memory_limit(), Some(268_435_456));
        assert!(limits.file_size_limit().is_none());
    }

    #[test]
    fn scale_time_keeps_unbounded() {
        assert_eq!(ResourceUsage::new(1000, -1).scale_time(1.5).time_msecs, 1500);
        assert_eq!(ResourceUsage::unbounded().scale_time(2.0).time_msecs, -1);
    }

    #[test]
    fn peak_takes_fieldwise_maximum() {
        let a = ResourceUsage::new(10, 500);
        let b = ResourceUsage {
            time_msecs: 30,
            memory_bytes: 100,
            file_count: 2,
            file_size_bytes: -1,
        };
        let p = a.peak(&b);
        assert_eq!(p.time_msecs, 30);
        assert_eq!(p.memory_bytes, 500);
        assert_eq!(p.file_count, 2);
        assert_eq!(p.file_size_bytes, -1);
    }

    #[test]
    fn missing_fields_deserialize_as_unbounded() {
        let limits: ResourceUsage =
            serde_json::from_str(r#"{"time_msecs": 1000, "memory_bytes": 268435456}"#).unwrap();
        assert_eq!(limits.time_msecs, 1000);
        assert_eq!(limits.file_count, UNBOUNDED);
        assert_eq!(limits.file_size_bytes, UNBOUNDED);
    }
}
