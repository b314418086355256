//! Timestamps written to the reference store and capture paths

use chrono::{Local, NaiveDateTime, SubsecRound, Utc};
use std::sync::Mutex;

use crate::{Error, Result};

/// `created_at` / `updated_at` format (UTC). Fixed width, so string order is time order.
pub const STAMP_FMT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// `captured_at` format (local time).
pub const CAPTURED_FMT: &str = "%Y-%m-%dT%H:%M:%S";

/// Image file name prefix format (local time).
pub const FILE_STAMP_FMT: &str = "%Y%m%d_%H%M%S";

/// Current UTC time, the base of row stamps and stale cutoffs.
///
/// UTC never repeats or skips an hour, so stamp order and item age stay
/// meaningful across daylight-saving changes.
pub fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Current local wall-clock time, for user-facing capture times and file names.
pub fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

pub fn captured_at(at: NaiveDateTime) -> String {
    at.format(CAPTURED_FMT).to_string()
}

pub fn file_stamp(at: NaiveDateTime) -> String {
    at.format(FILE_STAMP_FMT).to_string()
}

pub fn format_stamp(at: NaiveDateTime) -> String {
    at.format(STAMP_FMT).to_string()
}

/// Parse a stored stamp; accepts values with or without fractional seconds.
pub fn parse_stamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%dT%H:%M:%S%.f").ok()
}

/// Issues strictly increasing microsecond stamps.
///
/// If the wall clock stalls or steps backwards the clock advances by one
/// microsecond past the last stamp it handed out.
#[derive(Debug, Default)]
pub struct Clock {
    last: Mutex<Option<NaiveDateTime>>,
}

impl Clock {
    /// Start after `floor`, typically the newest stamp already persisted.
    pub fn starting_after(floor: Option<NaiveDateTime>) -> Self {
        Self {
            last: Mutex::new(floor.map(|f| f.trunc_subsecs(6))),
        }
    }

    /// Next stamp, formatted with [`STAMP_FMT`].
    pub fn tick(&self) -> Result<String> {
        let mut last = self.last.lock().map_err(|_| Error::LockPoisoned)?;
        let wall = now().trunc_subsecs(6);
        let next = match *last {
            Some(prev) if wall <= prev => prev + chrono::Duration::microseconds(1),
            _ => wall,
        };
        *last = Some(next);
        Ok(format_stamp(next))
    }
}
