//! Failure and ban tickets.
//!
//! A ticket records one host's misbehavior: identifier (usually an IP),
//! first/last failure time, attempt counters, ban bookkeeping and the
//! matched log lines. The accumulation form carries a `retry` count used
//! for ban decisions and rate estimation; the ban manager stores the same
//! shape once accepted, so [`FailTicket`] and [`BanTicket`] are role
//! aliases rather than separate types.

use std::collections::BTreeMap;

use crate::ip::IpAddress;
use crate::mytime::MyTime;

/// End-of-ban time used for permanent bans (`ban_time == -1`).
pub const MAX_TIME: f64 = 0x7FFF_FFFF_FFFFu64 as f64;

/// A failure/ban record keyed by a host identifier.
#[derive(Debug, Clone)]
pub struct Ticket {
    id: IpAddress,
    /// Last failure (or ban) time.
    time: f64,
    /// First failure time inside the current window.
    first_time: f64,
    ban_count: u32,
    /// `None` means "use the jail default"; `-1` means permanent.
    ban_time: Option<i64>,
    restored: bool,
    banned: bool,
    /// Retry count: failures, possibly scaled by rate estimation or the
    /// increment policy.
    retry: u32,
    /// Observed failure count.
    attempts: u32,
    matches: Vec<String>,
    data: BTreeMap<String, String>,
}

/// A ticket being accumulated toward the ban threshold.
pub type FailTicket = Ticket;

/// A ticket accepted into the ban manager.
pub type BanTicket = Ticket;

impl Ticket {
    /// New ticket for `id` at `time` (or now).
    pub fn new(id: IpAddress, time: Option<f64>) -> Ticket {
        let time = time.unwrap_or_else(MyTime::time);
        Ticket {
            id,
            time,
            first_time: time,
            ban_count: 0,
            ban_time: None,
            restored: false,
            banned: false,
            retry: 1,
            attempts: 1,
            matches: Vec::new(),
            data: BTreeMap::new(),
        }
    }

    /// New ticket carrying matched lines.
    pub fn with_matches(id: IpAddress, time: Option<f64>, matches: Vec<String>) -> Ticket {
        let mut ticket = Ticket::new(id, time);
        ticket.matches = matches;
        ticket
    }

    /// The host identifier.
    pub fn id(&self) -> &IpAddress {
        &self.id
    }

    /// Last failure/ban time.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Set the ticket time (also resets the window start when earlier).
    pub fn set_time(&mut self, time: f64) {
        self.time = time;
        if time < self.first_time {
            self.first_time = time;
        }
    }

    /// First failure time of the current window.
    pub fn first_time(&self) -> f64 {
        self.first_time
    }

    /// Override the window start.
    pub fn set_first_time(&mut self, time: f64) {
        self.first_time = time;
    }

    /// Per-ticket ban time, if set.
    pub fn ban_time_raw(&self) -> Option<i64> {
        self.ban_time
    }

    /// Per-ticket ban time falling back to the jail default.
    pub fn ban_time(&self, default_ban_time: i64) -> i64 {
        self.ban_time.unwrap_or(default_ban_time)
    }

    /// Set the per-ticket ban time (`-1` = permanent).
    pub fn set_ban_time(&mut self, ban_time: Option<i64>) {
        self.ban_time = ban_time;
    }

    /// When the ban ends; permanent bans report [`MAX_TIME`].
    pub fn end_of_ban_time(&self, default_ban_time: i64) -> f64 {
        let ban_time = self.ban_time(default_ban_time);
        if ban_time == -1 {
            return MAX_TIME;
        }
        self.time + ban_time as f64
    }

    /// Strictly after the end of ban; permanent bans never time out.
    pub fn is_timed_out(&self, time: f64, default_ban_time: i64) -> bool {
        let ban_time = self.ban_time(default_ban_time);
        if ban_time == -1 {
            return false;
        }
        time > self.time + ban_time as f64
    }

    /// How often this id has been banned.
    pub fn ban_count(&self) -> u32 {
        self.ban_count
    }

    /// Raise the ban count; only ever increases unless `always`.
    pub fn set_ban_count(&mut self, value: u32, always: bool) {
        if always || value > self.ban_count {
            self.ban_count = value;
        }
    }

    /// Increment the ban count.
    pub fn incr_ban_count(&mut self) {
        self.ban_count += 1;
    }

    /// Whether this ticket was restored from the persistent store.
    pub fn restored(&self) -> bool {
        self.restored
    }

    /// Mark as restored.
    pub fn set_restored(&mut self, value: bool) {
        self.restored = value;
    }

    /// Whether this ticket has been banned.
    pub fn banned(&self) -> bool {
        self.banned
    }

    /// Mark as banned.
    pub fn set_banned(&mut self, value: bool) {
        self.banned = value;
    }

    /// Observed failure count.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Set the observed failure count.
    pub fn set_attempts(&mut self, value: u32) {
        self.attempts = value;
    }

    /// Retry count driving the ban decision.
    pub fn retry(&self) -> u32 {
        self.retry
    }

    /// Set an artificial retry count (increment policy for repeat IPs).
    pub fn set_retry(&mut self, value: u32) {
        self.retry = value;
        if self.attempts == 0 {
            self.attempts = 1;
        }
        if value == 0 {
            self.attempts = 0;
            self.matches.clear();
        }
    }

    /// The matched log lines.
    pub fn matches(&self) -> &[String] {
        &self.matches
    }

    /// Replace the matched lines.
    pub fn set_matches(&mut self, matches: Vec<String>) {
        self.matches = matches;
    }

    /// Extra key/value data extracted by the filter.
    pub fn data(&self) -> &BTreeMap<String, String> {
        &self.data
    }

    /// Look up one data entry.
    pub fn get_data(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// Insert one data entry.
    pub fn set_data(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), value.into());
    }

    /// Adjust time and retry considering `max_time` (the find window).
    ///
    /// When the previous known interval already exceeds the window, the
    /// retry count is re-estimated from its observed rate.
    pub fn adjust_time(&mut self, time: f64, max_time: i64) {
        if time <= self.time {
            return;
        }
        let max_time = max_time as f64;
        if self.first_time < time - max_time {
            let elapsed = time - self.first_time;
            let estimated = (self.retry as f64 / elapsed * max_time).round() as u32;
            self.retry = estimated.max(1);
            self.first_time = time - max_time;
        }
        self.time = time;
    }

    /// Fold another observation into this ticket.
    pub fn inc(&mut self, matches: &[String], attempt: u32, count: u32) {
        self.retry += count;
        self.attempts += attempt;
        if !matches.is_empty() {
            self.matches.extend_from_slice(matches);
        }
    }
}

impl PartialEq for Ticket {
    /// Equality on identifier, time (rounded to 1/100 s) and payload.
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && (self.time * 100.0).round() == (other.time * 100.0).round()
            && self.attempts == other.attempts
            && self.matches == other.matches
            && self.data == other.data
    }
}

impl std::fmt::Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Ticket: ip={} time={} bantime={:?} bancount={} #attempts={}",
            self.id, self.time, self.ban_time, self.ban_count, self.attempts
        )
    }
}
