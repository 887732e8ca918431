//! Per-jail failure accumulation inside the sliding find window.

use std::collections::HashMap;

use crate::ip::IpAddress;
use crate::ticket::FailTicket;

/// Folds fresh failure tickets into running counters per identifier.
///
/// Owned by one jail; the jail worker and the transmitter guard access
/// with an exclusive section.
#[derive(Debug)]
pub struct FailManager {
    fail_list: HashMap<IpAddress, FailTicket>,
    max_retry: u32,
    /// The find window in seconds.
    max_time: i64,
    max_matches: usize,
    fail_total: u64,
}

impl Default for FailManager {
    fn default() -> Self {
        FailManager {
            fail_list: HashMap::new(),
            max_retry: 3,
            max_time: 600,
            max_matches: 50,
            fail_total: 0,
        }
    }
}

impl FailManager {
    /// New manager with default window and threshold.
    pub fn new() -> Self {
        Self::default()
    }

    /// The ban threshold.
    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    /// Set the ban threshold.
    pub fn set_max_retry(&mut self, value: u32) {
        self.max_retry = value;
    }

    /// The find window in seconds.
    pub fn max_time(&self) -> i64 {
        self.max_time
    }

    /// Set the find window.
    pub fn set_max_time(&mut self, value: i64) {
        self.max_time = value;
    }

    /// Cap on matched lines kept per ticket.
    pub fn max_matches(&self) -> usize {
        self.max_matches
    }

    /// Set the per-ticket match cap.
    pub fn set_max_matches(&mut self, value: usize) {
        self.max_matches = value;
    }

    /// Total failures observed since start.
    pub fn fail_total(&self) -> u64 {
        self.fail_total
    }

    /// Merge a fresh failure into the list; returns the current retry count
    /// for that identifier.
    pub fn add_failure(&mut self, ticket: FailTicket) -> u32 {
        let retry = match self.fail_list.get_mut(ticket.id()) {
            Some(existing) => {
                existing.adjust_time(ticket.time(), self.max_time);
                existing.inc(ticket.matches(), ticket.attempts(), ticket.retry());
                for (key, value) in ticket.data() {
                    existing.set_data(key.clone(), value.clone());
                }
                Self::truncate_matches(existing, self.max_matches);
                existing.retry()
            }
            None => {
                let mut ticket = ticket;
                Self::truncate_matches(&mut ticket, self.max_matches);
                let retry = ticket.retry().max(1);
                self.fail_list.insert(ticket.id().clone(), ticket);
                retry
            }
        };
        self.fail_total += 1;
        retry
    }

    fn truncate_matches(ticket: &mut FailTicket, max_matches: usize) {
        let matches = ticket.matches();
        if matches.len() > max_matches {
            let kept: Vec<String> = matches[matches.len() - max_matches..].to_vec();
            ticket.set_matches(kept);
        }
    }

    /// Number of identifiers currently tracked.
    pub fn size(&self) -> usize {
        self.fail_list.len()
    }

    /// Evict entries that slipped out of the find window.
    pub fn cleanup(&mut self, now: f64) {
        let max_time = self.max_time as f64;
        self.fail_list.retain(|_, t| t.time() + max_time > now);
    }

    /// Pull one ban-eligible ticket out of the list.
    ///
    /// With an explicit `id`, only that entry is considered. Otherwise the
    /// eligible entry with the oldest window start wins. The returned
    /// ticket is removed.
    pub fn to_ban(&mut self, id: Option<&IpAddress>) -> Option<FailTicket> {
        let key = match id {
            Some(id) => {
                let ticket = self.fail_list.get(id)?;
                if ticket.retry() < self.max_retry {
                    return None;
                }
                id.clone()
            }
            None => self
                .fail_list
                .values()
                .filter(|t| t.retry() >= self.max_retry)
                .min_by(|a, b| a.first_time().total_cmp(&b.first_time()))?
                .id()
                .clone(),
        };
        self.fail_list.remove(&key)
    }

    /// Drop one entry without banning it.
    pub fn del_failure(&mut self, id: &IpAddress) -> bool {
        self.fail_list.remove(id).is_some()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.fail_list.clear();
    }
}
