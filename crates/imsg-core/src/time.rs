//! Conversion between the store's native timestamps and wall-clock time.
//!
//! The message store counts nanoseconds since 2001-01-01T00:00:00Z. Display values are
//! milliseconds since the Unix epoch.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;

/// Seconds between the Unix epoch and the store's zero point (2001-01-01).
pub const NATIVE_EPOCH_OFFSET_SECS: i64 = 978_307_200;
pub const NANOS_PER_SEC: i64 = 1_000_000_000;
pub const SECS_PER_DAY: f64 = 86_400.0;

const NANOS_PER_MILLI: i64 = 1_000_000;
const NATIVE_EPOCH_OFFSET_MILLIS: i64 = NATIVE_EPOCH_OFFSET_SECS * 1_000;

/// Nanoseconds since the store's epoch, as found in `message.date`.
pub type NativeTimestamp = i64;

pub trait Clock: Send + Sync {
    fn now_unix_seconds(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_seconds(&self) -> i64 {
        Utc::now().timestamp()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedClock(pub i64);

impl FixedClock {
    pub fn at(instant: DateTime<Utc>) -> Self {
        Self(instant.timestamp())
    }
}

impl Clock for FixedClock {
    fn now_unix_seconds(&self) -> i64 {
        self.0
    }
}

#[derive(Clone)]
pub struct TimeCodec {
    clock: Arc<dyn Clock>,
}

impl Default for TimeCodec {
    fn default() -> Self {
        Self::new(SystemClock)
    }
}

impl std::fmt::Debug for TimeCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeCodec")
            .field("now_unix_seconds", &self.clock.now_unix_seconds())
            .finish()
    }
}

impl TimeCodec {
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self {
            clock: Arc::new(clock),
        }
    }

    /// Native threshold for "`days` ago". Fractional days are truncated to whole seconds.
    ///
    /// Windows reaching past the representable range saturate to `i64::MIN`, which
    /// admits every stored message.
    pub fn now_minus_days(&self, days: f64) -> NativeTimestamp {
        let duration_secs = (days * SECS_PER_DAY) as i64;
        self.clock
            .now_unix_seconds()
            .saturating_sub(NATIVE_EPOCH_OFFSET_SECS)
            .saturating_sub(duration_secs)
            .saturating_mul(NANOS_PER_SEC)
    }

    pub fn now_minus_hours(&self, hours: f64) -> NativeTimestamp {
        self.now_minus_days(hours / 24.0)
    }

    pub fn now_native(&self) -> NativeTimestamp {
        self.now_minus_days(0.0)
    }
}

/// Milliseconds since the Unix epoch for a native timestamp.
pub fn to_display_millis(native: NativeTimestamp) -> i64 {
    native.div_euclid(NANOS_PER_MILLI) + NATIVE_EPOCH_OFFSET_MILLIS
}

/// Inverse of [`to_display_millis`]; sub-millisecond precision is lost on the way out.
pub fn to_native(display_millis: i64) -> NativeTimestamp {
    (display_millis - NATIVE_EPOCH_OFFSET_MILLIS) * NANOS_PER_MILLI
}

pub fn to_datetime(native: NativeTimestamp) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(to_display_millis(native)).single()
}

pub fn from_datetime(instant: DateTime<Utc>) -> NativeTimestamp {
    to_native(instant.timestamp_millis())
}
