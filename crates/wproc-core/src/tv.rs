//! Second/microsecond timestamps.
//!
//! The wire protocol ships timestamps as `sec.usec` strings and runtimes as
//! plain floats, so this type exists mostly to format and re-parse those.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// An absolute or relative time split into seconds and microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tv {
    pub sec: i64,
    pub usec: i64,
}

impl Tv {
    pub const fn new(sec: i64, usec: i64) -> Self {
        Self { sec, usec }
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                sec: d.as_secs() as i64,
                usec: d.subsec_micros() as i64,
            },
            // pre-epoch clock; treat as epoch
            Err(_) => Self { sec: 0, usec: 0 },
        }
    }

    /// Seconds elapsed from `self` to `stop`, as a float.
    pub fn delta(&self, stop: &Tv) -> f64 {
        let mut secs = (stop.sec - self.sec) as f64;
        let mut stop_usec = stop.usec;
        if stop_usec < self.usec {
            secs -= 1.0;
            stop_usec += 1_000_000;
        }
        secs + (stop_usec - self.usec) as f64 / 1_000_000.0
    }

    /// Parse `sec[.usec]` (a `,` is accepted in place of the `.`).
    ///
    /// Returns `None` when the string doesn't start with a number. A
    /// missing or unparsable fraction yields `usec == 0`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let end = s
            .find(|c: char| !c.is_ascii_digit() && c != '-')
            .unwrap_or(s.len());
        let sec: i64 = s[..end].parse().ok()?;
        let usec = match s[end..].strip_prefix(['.', ',']) {
            Some(frac) => {
                let fend = frac
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(frac.len());
                frac[..fend].parse().unwrap_or(0)
            }
            None => 0,
        };
        Some(Self { sec, usec })
    }
}

impl fmt::Display for Tv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

/// Current unix time in whole seconds.
pub fn now_secs() -> i64 {
    Tv::now().sec
}
