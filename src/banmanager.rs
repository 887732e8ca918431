//! Active-ban bookkeeping for one jail.

use std::collections::HashMap;

use crate::ip::IpAddress;
use crate::mytime::MyTime;
use crate::ticket::{BanTicket, MAX_TIME};

/// The set of currently banned tickets, indexed by identifier.
#[derive(Debug)]
pub struct BanManager {
    ban_list: HashMap<IpAddress, BanTicket>,
    /// Default ban duration in seconds; `-1` = permanent.
    ban_time: i64,
    ban_total: u64,
    /// Earliest end of ban, for cheap no-op ticks.
    next_unban_time: f64,
}

impl Default for BanManager {
    fn default() -> Self {
        BanManager {
            ban_list: HashMap::new(),
            ban_time: 600,
            ban_total: 0,
            next_unban_time: MAX_TIME,
        }
    }
}

impl BanManager {
    /// New manager with the default 600 s ban time.
    pub fn new() -> Self {
        Self::default()
    }

    /// The default ban duration.
    pub fn ban_time(&self) -> i64 {
        self.ban_time
    }

    /// Set the default ban duration (`-1` = permanent).
    pub fn set_ban_time(&mut self, value: i64) {
        self.ban_time = value;
    }

    /// Total bans since the jail started.
    pub fn ban_total(&self) -> u64 {
        self.ban_total
    }

    /// Reset the total (used by stats maintenance).
    pub fn set_ban_total(&mut self, value: u64) {
        self.ban_total = value;
    }

    /// Currently banned count.
    pub fn size(&self) -> usize {
        self.ban_list.len()
    }

    /// Whether `id` is currently banned.
    pub fn is_banned(&self, id: &IpAddress) -> bool {
        self.ban_list.contains_key(id)
    }

    /// Fetch a banned ticket by id.
    pub fn get_ticket(&self, id: &IpAddress) -> Option<&BanTicket> {
        self.ban_list.get(id)
    }

    /// Accept a ticket into the ban list.
    ///
    /// Rejected when the id is already banned and that ban has not yet
    /// expired. Returns `true` if newly banned.
    pub fn add_ban_ticket(&mut self, mut ticket: BanTicket) -> bool {
        if let Some(existing) = self.ban_list.get(ticket.id()) {
            if !existing.is_timed_out(ticket.time(), self.ban_time) {
                return false;
            }
        }
        ticket.set_banned(true);
        let end = ticket.end_of_ban_time(self.ban_time);
        if end < self.next_unban_time {
            self.next_unban_time = end;
        }
        self.ban_list.insert(ticket.id().clone(), ticket);
        self.ban_total += 1;
        true
    }

    /// Extend (or shorten) the ban of an already banned id.
    pub fn prolong_ban(&mut self, id: &IpAddress, ban_time: i64) -> bool {
        match self.ban_list.get_mut(id) {
            Some(ticket) => {
                ticket.set_ban_time(Some(ban_time));
                let end = ticket.end_of_ban_time(ban_time);
                if end < self.next_unban_time {
                    self.next_unban_time = end;
                }
                true
            }
            None => false,
        }
    }

    /// Remove one ticket regardless of expiry.
    pub fn unban(&mut self, id: &IpAddress) -> Option<BanTicket> {
        self.ban_list.remove(id)
    }

    /// Remove and return every ticket whose ban ended at `now`.
    ///
    /// Permanent tickets never match.
    pub fn unban_list(&mut self, now: f64) -> Vec<BanTicket> {
        if now < self.next_unban_time {
            return Vec::new();
        }
        let ban_time = self.ban_time;
        let expired: Vec<IpAddress> = self
            .ban_list
            .values()
            .filter(|t| t.end_of_ban_time(ban_time) <= now)
            .map(|t| t.id().clone())
            .collect();
        let mut tickets = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(ticket) = self.ban_list.remove(&id) {
                tickets.push(ticket);
            }
        }
        self.next_unban_time = self
            .ban_list
            .values()
            .map(|t| t.end_of_ban_time(ban_time))
            .fold(MAX_TIME, f64::min);
        tickets
    }

    /// Remove and return every ticket (jail stop, `unban --all`).
    pub fn flush(&mut self) -> Vec<BanTicket> {
        self.next_unban_time = MAX_TIME;
        self.ban_list.drain().map(|(_, t)| t).collect()
    }

    /// Earliest end of ban among current tickets.
    pub fn next_unban_time(&self) -> f64 {
        self.next_unban_time
    }

    /// Banned tickets ordered by end of ban, ascending.
    pub fn get_ban_list(&self) -> Vec<&BanTicket> {
        let mut tickets: Vec<&BanTicket> = self.ban_list.values().collect();
        tickets.sort_by(|a, b| {
            a.end_of_ban_time(self.ban_time)
                .total_cmp(&b.end_of_ban_time(self.ban_time))
                .then_with(|| a.id().cmp(b.id()))
        });
        tickets
    }

    /// Banned identifiers ordered by end of ban.
    pub fn banned_ids(&self) -> Vec<String> {
        self.get_ban_list().iter().map(|t| t.id().ntoa()).collect()
    }

    /// Banned identifiers annotated with ban window arithmetic.
    pub fn banned_ids_with_time(&self) -> Vec<String> {
        self.get_ban_list()
            .iter()
            .map(|t| {
                let ban_time = t.ban_time(self.ban_time);
                if ban_time == -1 {
                    format!("{} \t{} + permanent", t.id().ntoa(), MyTime::time2str(t.time()))
                } else {
                    format!(
                        "{} \t{} + {} = {}",
                        t.id().ntoa(),
                        MyTime::time2str(t.time()),
                        ban_time,
                        MyTime::time2str(t.time() + ban_time as f64)
                    )
                }
            })
            .collect()
    }

    /// ASN / country / RIR enrichment for the `cymru` status flavor.
    ///
    /// The lookup service is optional; without it the lists stay empty and
    /// only the interface is preserved.
    pub fn cymru_info(&self) -> (Vec<String>, Vec<String>, Vec<String>) {
        (Vec::new(), Vec::new(), Vec::new())
    }
}

/// Ban-time growth policy for repeat offenders.
///
/// A new ban time is either `base * multipliers[count]` (positional, last
/// value clamps) or the exponential `base * factor * 2^count` with the
/// exponent capped. `rnd_time` adds uniform jitter so unban sweeps cannot
/// be predicted; `max_time` caps the result.
#[derive(Debug, Clone, Default)]
pub struct BantimeIncrement {
    /// Whether the policy applies at all.
    pub enabled: bool,
    /// Scale factor of the exponential formula.
    pub factor: f64,
    /// Positional multipliers overriding the formula.
    pub multipliers: Option<Vec<i64>>,
    /// Cap on the computed ban time.
    pub max_time: Option<i64>,
    /// Upper bound of the uniform jitter added to the result.
    pub rnd_time: Option<i64>,
    /// Consult ban history across all jails, not just the own one.
    pub overall_jails: bool,
}

impl BantimeIncrement {
    /// Compute the ban time for the `ban_count`-th repeat over `base`.
    pub fn compute(&self, ban_count: u32, base: i64) -> i64 {
        if !self.enabled || base < 0 {
            return base;
        }
        let mut ban_time = match &self.multipliers {
            Some(multipliers) if !multipliers.is_empty() => {
                let idx = (ban_count as usize).min(multipliers.len() - 1);
                base.saturating_mul(multipliers[idx])
            }
            _ => {
                let factor = if self.factor > 0.0 { self.factor } else { 1.0 };
                let exponent = ban_count.min(20);
                let scaled = base as f64 * factor * (1u64 << exponent) as f64;
                scaled.min(i64::MAX as f64) as i64
            }
        };
        if let Some(rnd) = self.rnd_time {
            if rnd > 0 {
                use rand::Rng;
                ban_time = ban_time.saturating_add(rand::thread_rng().gen_range(0..=rnd));
            }
        }
        if let Some(max) = self.max_time {
            ban_time = ban_time.min(max);
        }
        ban_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::Ticket;

    fn ban(id: &str, time: f64) -> BanTicket {
        Ticket::new(IpAddress::id(id), Some(time))
    }

    #[test]
    fn test_add_rejects_active_duplicate() {
        let mut manager = BanManager::new();
        assert!(manager.add_ban_ticket(ban("192.0.2.1", 1000.0)));
        assert!(!manager.add_ban_ticket(ban("192.0.2.1", 1100.0)));
        assert_eq!(manager.size(), 1);
        assert_eq!(manager.ban_total(), 1);
    }

    #[test]
    fn test_add_accepts_after_expiry() {
        let mut manager = BanManager::new();
        assert!(manager.add_ban_ticket(ban("192.0.2.1", 1000.0)));
        // 600s default ban; a ticket arriving after expiry replaces it.
        assert!(manager.add_ban_ticket(ban("192.0.2.1", 1601.0)));
        assert_eq!(manager.size(), 1);
        assert_eq!(manager.ban_total(), 2);
    }

    #[test]
    fn test_unban_list_returns_expired() {
        let mut manager = BanManager::new();
        manager.add_ban_ticket(ban("192.0.2.1", 1000.0));
        manager.add_ban_ticket(ban("192.0.2.2", 1400.0));

        assert!(manager.unban_list(1599.0).is_empty());
        let expired = manager.unban_list(1600.0);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id().ntoa(), "192.0.2.1");
        assert_eq!(manager.size(), 1);

        let expired = manager.unban_list(2001.0);
        assert_eq!(expired.len(), 1);
        assert_eq!(manager.size(), 0);
    }

    #[test]
    fn test_permanent_never_unbanned() {
        let mut manager = BanManager::new();
        let mut ticket = ban("192.0.2.1", 1000.0);
        ticket.set_ban_time(Some(-1));
        manager.add_ban_ticket(ticket);
        assert!(manager.unban_list(MAX_TIME).is_empty());
        assert_eq!(manager.size(), 1);
    }

    #[test]
    fn test_ban_list_ordered_by_end_of_ban() {
        let mut manager = BanManager::new();
        manager.add_ban_ticket(ban("192.0.2.9", 1400.0));
        manager.add_ban_ticket(ban("192.0.2.1", 1000.0));
        let ids = manager.banned_ids();
        assert_eq!(ids, vec!["192.0.2.1", "192.0.2.9"]);
    }

    #[test]
    fn test_with_time_formatting() {
        let mut manager = BanManager::new();
        // 2005-08-14 12:00:01 UTC
        manager.add_ban_ticket(ban("192.0.2.1", 1_124_020_801.0));
        let lines = manager.banned_ids_with_time();
        assert_eq!(
            lines[0],
            "192.0.2.1 \t2005-08-14 12:00:01 + 600 = 2005-08-14 12:10:01"
        );
    }

    #[test]
    fn test_prolong_ban() {
        let mut manager = BanManager::new();
        manager.add_ban_ticket(ban("192.0.2.1", 1000.0));
        assert!(manager.prolong_ban(&IpAddress::id("192.0.2.1"), 1200));
        assert!(manager.unban_list(1601.0).is_empty());
        assert_eq!(manager.unban_list(2201.0).len(), 1);
    }

    #[test]
    fn test_increment_formula() {
        let policy = BantimeIncrement {
            enabled: true,
            factor: 1.0,
            ..Default::default()
        };
        assert_eq!(policy.compute(0, 600), 600);
        assert_eq!(policy.compute(1, 600), 1_200);
        assert_eq!(policy.compute(3, 600), 4_800);
        // permanent bans pass through
        assert_eq!(policy.compute(5, -1), -1);
    }

    #[test]
    fn test_increment_multipliers_clamp() {
        let policy = BantimeIncrement {
            enabled: true,
            multipliers: Some(vec![1, 2, 4, 8]),
            ..Default::default()
        };
        assert_eq!(policy.compute(0, 600), 600);
        assert_eq!(policy.compute(2, 600), 2_400);
        // past the end the last value clamps
        assert_eq!(policy.compute(10, 600), 4_800);
    }

    #[test]
    fn test_increment_max_and_jitter_bounds() {
        let policy = BantimeIncrement {
            enabled: true,
            factor: 1.0,
            rnd_time: Some(30),
            max_time: Some(3_600),
            ..Default::default()
        };
        for count in 0..10 {
            let t = policy.compute(count, 600);
            assert!(t <= 3_600, "cap violated: {}", t);
            assert!(t >= 600, "below base: {}", t);
        }
    }

    #[test]
    fn test_increment_disabled_passthrough() {
        let policy = BantimeIncrement::default();
        assert_eq!(policy.compute(7, 600), 600);
    }

    #[test]
    fn test_flush_empties() {
        let mut manager = BanManager::new();
        manager.add_ban_ticket(ban("192.0.2.1", 1000.0));
        manager.add_ban_ticket(ban("192.0.2.2", 1000.0));
        assert_eq!(manager.flush().len(), 2);
        assert_eq!(manager.size(), 0);
        assert_eq!(manager.ban_total(), 2);
    }
}
