//! Identifier types
//!
//! Object ids and transaction ids are both 8-byte big-endian values on disk.
//! Transaction ids are derived from wall-clock time: the high 32 bits count
//! minutes since 1900-01-01 (with a 31-day month calendar), the low 32 bits
//! hold the fraction of the minute scaled to 2^32.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Object identifier: the key under which a blob's revisions are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Oid(pub u64);

impl Oid {
    pub const ZERO: Oid = Oid(0);

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Oid(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl From<u64> for Oid {
    fn from(v: u64) -> Self {
        Oid(v)
    }
}

/// Beyond this the 32-bit minute counter overflows (year ~9000)
const MAX_UNIX_SECS: f64 = 2.0e11;

/// Transaction identifier (also the serial of every record it wrote)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Tid(pub u64);

impl Tid {
    pub const ZERO: Tid = Tid(0);
    pub const MAX: Tid = Tid(u64::MAX);

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Tid(u64::from_be_bytes(bytes))
    }

    /// Tid for the current wall-clock time
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Tid::from_unix_time(secs)
    }

    /// Encode a unix timestamp (seconds, fractional) as a tid
    pub fn from_unix_time(secs: f64) -> Self {
        if secs >= MAX_UNIX_SECS {
            return Tid::MAX;
        }
        let secs = if secs.is_finite() && secs > 0.0 { secs } else { 0.0 };
        let days = (secs / 86_400.0).floor() as i64;
        let rem = secs - (days as f64) * 86_400.0;
        let (year, month, day) = civil_from_days(days);

        let hour = (rem / 3_600.0).floor() as i64;
        let minute = ((rem - hour as f64 * 3_600.0) / 60.0).floor() as i64;
        let second = rem - hour as f64 * 3_600.0 - minute as f64 * 60.0;

        let year = (year - 1900).max(0);
        let minutes = ((((year * 12 + month as i64 - 1) * 31 + day as i64 - 1) * 24 + hour) * 60)
            + minute;
        let high = (minutes as u64) & 0xffff_ffff;
        let low = ((second * 4_294_967_296.0 / 60.0) as u64).min(0xffff_ffff);

        Tid((high << 32) | low)
    }

    /// Decode the wall-clock time a tid was minted at (unix seconds)
    pub fn to_unix_time(self) -> f64 {
        let mut v = (self.0 >> 32) as i64;
        let minute = v % 60;
        v /= 60;
        let hour = v % 24;
        v /= 24;
        let day = (v % 31) as u32 + 1;
        v /= 31;
        let month = (v % 12) as u32 + 1;
        let year = v / 12 + 1900;

        let low = (self.0 & 0xffff_ffff) as f64;
        let days = days_from_civil(year, month, day);
        (days * 86_400 + hour * 3_600 + minute * 60) as f64 + low * 60.0 / 4_294_967_296.0
    }

    /// A tid strictly greater than `prev`: self if already later, else prev + 1
    pub fn later_than(self, prev: Tid) -> Tid {
        if self > prev {
            self
        } else {
            Tid(prev.0.saturating_add(1))
        }
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl From<u64> for Tid {
    fn from(v: u64) -> Self {
        Tid(v)
    }
}

// =============================================================================
// Calendar helpers (proleptic Gregorian, days relative to 1970-01-01)
// =============================================================================

fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = yoe as i64 + era * 400;
    (if month <= 2 { year + 1 } else { year }, month, day)
}

fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let year = if month <= 2 { year - 1 } else { year };
    let era = if year >= 0 { year } else { year - 399 } / 400;
    let yoe = (year - era * 400) as u64;
    let month = month as u64;
    let doy = (153 * if month > 2 { month - 3 } else { month + 9 } + 2) / 5 + day as u64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe as i64 - 719_468
}
