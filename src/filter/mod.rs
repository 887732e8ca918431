//! The filter: turns log lines into failure tickets.
//!
//! For each line: recover the event time, require the prefilter regex (when
//! set), drop ignored patterns, match the failure regexes in order, extract
//! the host identifier, run the ignore pipeline (IP lists, self addresses,
//! external command, memo cache) and emit a ticket.

mod datedetector;
mod failregex;
mod source;

pub use datedetector::{DateDetector, DateMatch};
pub use failregex::{FailMatch, FailRegex, PlainRegex};
pub use source::{LogContainer, SeekTo};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ip::{DnsResolver, FileIpSet, IpAddress, TtlCache, UseDns};
use crate::mytime::MyTime;
use crate::ticket::FailTicket;

/// Timeout for the external ignore command.
const IGNORE_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// One entry of the ignore list.
#[derive(Debug, Clone)]
pub enum IgnoreEntry {
    /// A literal address, subnet, or DNS name.
    Addr(IpAddress),
    /// A file-backed set (`file:/path`).
    File(Arc<FileIpSet>),
}

impl IgnoreEntry {
    /// Display form, matching what was configured.
    pub fn display(&self) -> String {
        match self {
            IgnoreEntry::Addr(ip) => ip.raw().to_string(),
            IgnoreEntry::File(set) => set.to_string(),
        }
    }
}

/// Memoization of ignore decisions, keyed by a rendered template.
#[derive(Debug)]
struct IgnoreCache {
    original: String,
    key_template: String,
    cache: TtlCache<String, bool>,
}

impl IgnoreCache {
    /// Parse `key=<ip>[,max-count=N][,max-time=S]`.
    fn parse(spec: &str) -> Result<IgnoreCache> {
        let mut key_template = None;
        let mut max_count = 512usize;
        let mut max_time = 300.0f64;
        for part in spec.split(',') {
            let Some((name, value)) = part.split_once('=') else {
                return Err(Error::InvalidArgument(format!(
                    "invalid ignorecache option {:?}",
                    part
                )));
            };
            match name.trim() {
                "key" => key_template = Some(value.to_string()),
                "max-count" => {
                    max_count = value.parse().map_err(|_| {
                        Error::InvalidArgument(format!("invalid ignorecache max-count {:?}", value))
                    })?
                }
                "max-time" => {
                    max_time = value.parse().map_err(|_| {
                        Error::InvalidArgument(format!("invalid ignorecache max-time {:?}", value))
                    })?
                }
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "invalid ignorecache option {:?}",
                        other
                    )))
                }
            }
        }
        let key_template = key_template.ok_or_else(|| {
            Error::InvalidArgument("ignorecache requires a key= template".to_string())
        })?;
        Ok(IgnoreCache {
            original: spec.to_string(),
            key_template,
            cache: TtlCache::new(max_count, max_time),
        })
    }

    fn render_key(&self, ip: &IpAddress, ticket_data: &[(String, String)]) -> String {
        let mut key = self.key_template.replace("<ip>", &ip.ntoa());
        key = key.replace("<fid>", ip.raw());
        for (name, value) in ticket_data {
            key = key.replace(&format!("<F-{}>", name.to_ascii_uppercase()), value);
        }
        key
    }
}

/// What the filter decided about one line.
#[derive(Debug)]
pub enum Outcome {
    /// No failure regex matched.
    NoMatch,
    /// Matched but discarded; the label names the ignore source.
    Ignored(&'static str),
    /// A failure was recorded.
    Fail(FailTicket),
}

/// Per-jail line matching configuration and state.
pub struct Filter {
    jail_name: String,
    resolver: Arc<DnsResolver>,
    date_detector: DateDetector,
    fail_regex: Vec<FailRegex>,
    ignore_regex: Vec<PlainRegex>,
    pref_regex: Option<PlainRegex>,
    ignore_ip: Vec<IgnoreEntry>,
    ignore_self: bool,
    ignore_command: Option<String>,
    ignore_cache: Option<IgnoreCache>,
    use_dns: UseDns,
    log_encoding: String,
    find_time: i64,
    max_lines: usize,
    line_buffer: VecDeque<String>,
    containers: Vec<Arc<LogContainer>>,
    journal_matches: Vec<String>,
    /// Live mode: lines older than the find window are skipped.
    in_operation: bool,
}

impl Filter {
    /// A fresh filter for `jail_name`.
    pub fn new(jail_name: impl Into<String>, resolver: Arc<DnsResolver>) -> Filter {
        Filter {
            jail_name: jail_name.into(),
            resolver,
            date_detector: DateDetector::new(),
            fail_regex: Vec::new(),
            ignore_regex: Vec::new(),
            pref_regex: None,
            ignore_ip: Vec::new(),
            ignore_self: true,
            ignore_command: None,
            ignore_cache: None,
            use_dns: UseDns::default(),
            log_encoding: "utf-8".to_string(),
            find_time: 600,
            max_lines: 1,
            line_buffer: VecDeque::new(),
            containers: Vec::new(),
            journal_matches: Vec::new(),
            in_operation: false,
        }
    }

    // -- configuration ------------------------------------------------------

    /// Append a failure regex.
    pub fn add_fail_regex(&mut self, template: &str) -> Result<()> {
        self.fail_regex.push(FailRegex::compile(template)?);
        Ok(())
    }

    /// Remove a failure regex by index.
    pub fn del_fail_regex(&mut self, index: usize) -> Result<()> {
        if index >= self.fail_regex.len() {
            return Err(Error::NotFound(format!(
                "Cannot remove regular expression. Index {} is not valid",
                index
            )));
        }
        self.fail_regex.remove(index);
        Ok(())
    }

    /// The configured failure regex templates.
    pub fn fail_regex_list(&self) -> Vec<String> {
        self.fail_regex.iter().map(|r| r.original().to_string()).collect()
    }

    /// Append an ignore regex.
    pub fn add_ignore_regex(&mut self, pattern: &str) -> Result<()> {
        self.ignore_regex.push(PlainRegex::compile(pattern)?);
        Ok(())
    }

    /// Remove an ignore regex by index.
    pub fn del_ignore_regex(&mut self, index: usize) -> Result<()> {
        if index >= self.ignore_regex.len() {
            return Err(Error::NotFound(format!(
                "Cannot remove regular expression. Index {} is not valid",
                index
            )));
        }
        self.ignore_regex.remove(index);
        Ok(())
    }

    /// The configured ignore regex patterns.
    pub fn ignore_regex_list(&self) -> Vec<String> {
        self.ignore_regex.iter().map(|r| r.original().to_string()).collect()
    }

    /// Set (or clear) the prefilter regex.
    pub fn set_pref_regex(&mut self, pattern: Option<&str>) -> Result<()> {
        self.pref_regex = match pattern {
            Some(p) if !p.is_empty() => Some(PlainRegex::compile(p)?),
            _ => None,
        };
        Ok(())
    }

    /// The prefilter regex, if set.
    pub fn pref_regex(&self) -> Option<String> {
        self.pref_regex.as_ref().map(|r| r.original().to_string())
    }

    /// Add an ignore entry (`file:`-prefixed specs become file sets).
    pub fn add_ignore_ip(&mut self, spec: &str) -> Result<()> {
        if self.ignore_ip.iter().any(|e| Self::entry_matches(e, spec)) {
            return Err(Error::AlreadyExists(format!(
                "{} already in ignore list of jail '{}'",
                spec, self.jail_name
            )));
        }
        let entry = if let Some(path) = spec.strip_prefix("file:") {
            let path = path.strip_prefix("//").unwrap_or(path);
            IgnoreEntry::File(self.resolver.get_file_set(path))
        } else {
            IgnoreEntry::Addr(IpAddress::id(spec))
        };
        self.ignore_ip.push(entry);
        Ok(())
    }

    /// Remove an ignore entry by its configured spelling.
    pub fn del_ignore_ip(&mut self, spec: &str) -> Result<()> {
        let before = self.ignore_ip.len();
        self.ignore_ip.retain(|e| !Self::entry_matches(e, spec));
        if self.ignore_ip.len() == before {
            return Err(Error::NotFound(format!(
                "{} is not in ignore list of jail '{}'",
                spec, self.jail_name
            )));
        }
        Ok(())
    }

    fn entry_matches(entry: &IgnoreEntry, spec: &str) -> bool {
        match entry {
            IgnoreEntry::Addr(ip) => *ip == IpAddress::id(spec),
            IgnoreEntry::File(set) => set.matches_name(spec),
        }
    }

    /// The ignore list as configured.
    pub fn ignore_ip_list(&self) -> Vec<String> {
        self.ignore_ip.iter().map(IgnoreEntry::display).collect()
    }

    /// Whether own addresses are ignored.
    pub fn ignore_self(&self) -> bool {
        self.ignore_self
    }

    /// Toggle ignoring own addresses.
    pub fn set_ignore_self(&mut self, value: bool) {
        self.ignore_self = value;
    }

    /// The external ignore command, if any.
    pub fn ignore_command(&self) -> Option<&str> {
        self.ignore_command.as_deref()
    }

    /// Set (or clear) the external ignore command.
    pub fn set_ignore_command(&mut self, command: Option<String>) {
        self.ignore_command = command.filter(|c| !c.is_empty());
    }

    /// The ignore cache spec, if configured.
    pub fn ignore_cache(&self) -> Option<String> {
        self.ignore_cache.as_ref().map(|c| c.original.clone())
    }

    /// Configure the ignore cache (`""` disables).
    pub fn set_ignore_cache(&mut self, spec: Option<&str>) -> Result<()> {
        self.ignore_cache = match spec {
            Some(s) if !s.is_empty() => Some(IgnoreCache::parse(s)?),
            _ => None,
        };
        Ok(())
    }

    /// DNS usage mode.
    pub fn use_dns(&self) -> UseDns {
        self.use_dns
    }

    /// Set the DNS usage mode.
    pub fn set_use_dns(&mut self, value: UseDns) {
        self.use_dns = value;
    }

    /// The configured log encoding name.
    pub fn log_encoding(&self) -> &str {
        &self.log_encoding
    }

    /// Set the log encoding; only UTF-8 (with lossy fallback) is decoded.
    pub fn set_log_encoding(&mut self, value: &str) -> Result<()> {
        let normalized = value.to_ascii_lowercase();
        match normalized.as_str() {
            "auto" | "utf-8" | "utf8" | "ascii" => {
                self.log_encoding = normalized;
                Ok(())
            }
            other => Err(Error::InvalidArgument(format!(
                "unsupported log encoding {:?}",
                other
            ))),
        }
    }

    /// The find window (mirrors the jail's fail manager).
    pub fn find_time(&self) -> i64 {
        self.find_time
    }

    /// Set the find window.
    pub fn set_find_time(&mut self, value: i64) {
        self.find_time = value;
    }

    /// Lines buffered for multi-line matching.
    pub fn max_lines(&self) -> usize {
        self.max_lines
    }

    /// Set the multi-line buffer depth.
    pub fn set_max_lines(&mut self, value: usize) {
        self.max_lines = value.max(1);
        while self.line_buffer.len() > self.max_lines {
            self.line_buffer.pop_front();
        }
    }

    /// The date pattern description.
    pub fn date_pattern(&self) -> String {
        self.date_detector.pattern_description()
    }

    /// Reconfigure date detection.
    pub fn set_date_pattern(&mut self, pattern: &str) -> Result<()> {
        self.date_detector.set_pattern(pattern)
    }

    /// Switch live-mode line age checking.
    pub fn set_in_operation(&mut self, value: bool) {
        self.in_operation = value;
    }

    // -- log sources --------------------------------------------------------

    /// Add a monitored log file.
    pub fn add_log_path(&mut self, path: &str, seek: SeekTo) -> Result<()> {
        if self.containers.iter().any(|c| c.path() == std::path::Path::new(path)) {
            return Err(Error::AlreadyExists(format!(
                "Log file {} already monitored by jail '{}'",
                path, self.jail_name
            )));
        }
        self.containers.push(Arc::new(LogContainer::open(path, seek)?));
        info!(jail = %self.jail_name, file = %path, "Added logfile");
        Ok(())
    }

    /// Remove a monitored log file.
    pub fn del_log_path(&mut self, path: &str) -> Result<()> {
        let before = self.containers.len();
        self.containers
            .retain(|c| c.path() != std::path::Path::new(path));
        if self.containers.len() == before {
            return Err(Error::NotFound(format!(
                "Log file {} is not monitored by jail '{}'",
                path, self.jail_name
            )));
        }
        info!(jail = %self.jail_name, file = %path, "Removed logfile");
        Ok(())
    }

    /// The monitored paths.
    pub fn log_paths(&self) -> Vec<String> {
        self.containers
            .iter()
            .map(|c| c.path().display().to_string())
            .collect()
    }

    /// Snapshot of the containers for the poller task.
    pub fn containers(&self) -> Vec<Arc<LogContainer>> {
        self.containers.clone()
    }

    /// Add a journal match expression (stored for the journal backend).
    pub fn add_journal_match(&mut self, expr: &str) {
        self.journal_matches.push(expr.to_string());
    }

    /// Remove a journal match expression.
    pub fn del_journal_match(&mut self, expr: &str) -> Result<()> {
        let before = self.journal_matches.len();
        self.journal_matches.retain(|m| m != expr);
        if self.journal_matches.len() == before {
            return Err(Error::NotFound(format!(
                "Journal match {:?} not found in jail '{}'",
                expr, self.jail_name
            )));
        }
        Ok(())
    }

    /// The stored journal matches.
    pub fn journal_matches(&self) -> Vec<String> {
        self.journal_matches.clone()
    }

    // -- line processing ----------------------------------------------------

    /// Process one log line, possibly producing a failure ticket.
    pub async fn process_line(&mut self, raw_line: &str, source_time: Option<f64>) -> Outcome {
        // 1. event time, stripping a leading timestamp for the regexes
        let mut line = raw_line;
        let time = match self.date_detector.get_time(raw_line) {
            Some(found) => {
                if found.span.start == 0 {
                    line = raw_line[found.span.end..].trim_start();
                }
                found.time
            }
            None => source_time.unwrap_or_else(MyTime::time),
        };

        if self.in_operation && time + (self.find_time as f64) < MyTime::time() {
            debug!(jail = %self.jail_name, "Ignoring line, too old");
            return Outcome::Ignored("too-old");
        }

        // 2. the prefilter regex gates everything and passes its tail on
        let line = match &self.pref_regex {
            Some(pre) => match pre.tail(line) {
                Some(tail) => tail.to_string(),
                None => return Outcome::NoMatch,
            },
            None => line.to_string(),
        };

        // 3. ignored patterns
        if self.ignore_regex.iter().any(|re| re.is_match(&line)) {
            debug!(jail = %self.jail_name, "Ignoring line, ignoreregex matched");
            return Outcome::Ignored("ignoreregex");
        }

        // 4. failure regexes in declaration order
        let matched = self.search_fail_regex(&line);
        let matched = match matched {
            Some(m) => m,
            None => {
                if self.max_lines > 1 {
                    self.line_buffer.push_back(line.clone());
                    while self.line_buffer.len() > self.max_lines {
                        self.line_buffer.pop_front();
                    }
                    let joined: Vec<String> = self.line_buffer.iter().cloned().collect();
                    let joined = joined.join("\n");
                    match self.search_fail_regex(&joined) {
                        Some(m) => {
                            self.line_buffer.clear();
                            m
                        }
                        None => return Outcome::NoMatch,
                    }
                } else {
                    return Outcome::NoMatch;
                }
            }
        };

        if !matched.has_id() {
            warn!(jail = %self.jail_name, "Found a match but no host identifier");
            return Outcome::NoMatch;
        }

        // 5. host identifier extraction
        let Some(id) = self.extract_id(&matched).await else {
            debug!(jail = %self.jail_name, "Unable to determine a host identifier");
            return Outcome::Ignored("no-host");
        };

        // 6. ignore pipeline
        if self.is_ignored(&id, &matched.data).await {
            info!(jail = %self.jail_name, id = %id, "Ignore {}", id);
            return Outcome::Ignored("ignored");
        }

        // 7. emit
        let mut ticket = FailTicket::with_matches(id, Some(time), vec![raw_line.to_string()]);
        for (key, value) in &matched.data {
            ticket.set_data(key.clone(), value.clone());
        }
        Outcome::Fail(ticket)
    }

    fn search_fail_regex(&self, line: &str) -> Option<FailMatch> {
        self.fail_regex.iter().find_map(|re| re.search(line))
    }

    async fn extract_id(&self, matched: &FailMatch) -> Option<IpAddress> {
        if let Some(fid) = &matched.fid {
            return Some(IpAddress::raw_id(fid));
        }
        for candidate in [&matched.ip4, &matched.ip6].into_iter().flatten() {
            let ip = IpAddress::id(candidate);
            if ip.is_valid() {
                return Some(ip);
            }
        }
        let name = matched.host.as_ref().or(matched.dns.as_ref())?;
        let ip = IpAddress::id(name);
        if ip.is_valid() {
            return Some(ip);
        }
        match self.use_dns {
            UseDns::Raw => Some(IpAddress::raw_id(name)),
            _ => {
                let mut ips = self.resolver.text_to_ip(name, self.use_dns).await;
                if ips.is_empty() {
                    None
                } else {
                    Some(ips.swap_remove(0))
                }
            }
        }
    }

    async fn is_ignored(&mut self, id: &IpAddress, data: &[(String, String)]) -> bool {
        let cache_key = self
            .ignore_cache
            .as_ref()
            .map(|c| c.render_key(id, data));
        if let (Some(cache), Some(key)) = (&self.ignore_cache, &cache_key) {
            if let Some(hit) = cache.cache.get(key) {
                return hit;
            }
        }

        let ignored = self.compute_ignored(id).await;

        if let (Some(cache), Some(key)) = (&self.ignore_cache, cache_key) {
            cache.cache.set(key, ignored);
        }
        ignored
    }

    async fn compute_ignored(&self, id: &IpAddress) -> bool {
        // ignore list: direct hits, subnets, DNS entries, file sets
        for entry in &self.ignore_ip {
            match entry {
                IgnoreEntry::Addr(entry_ip) => {
                    if entry_ip == id || (!entry_ip.is_single() && entry_ip.contains(id)) {
                        return true;
                    }
                    if !entry_ip.is_valid() && !entry_ip.raw().is_empty() {
                        // a DNS name in the ignore list
                        let resolved = self.resolver.dns_to_ip(entry_ip.raw()).await;
                        if resolved.iter().any(|ip| ip == id) {
                            return true;
                        }
                    }
                }
                IgnoreEntry::File(set) => {
                    if set.contains(id) {
                        return true;
                    }
                }
            }
        }

        // own addresses and names
        if self.ignore_self {
            if id.is_valid() {
                if self.resolver.get_self_ips().await.contains(id) {
                    return true;
                }
            } else if self.resolver.get_self_names().await.contains(id.raw()) {
                return true;
            }
        }

        // external callout: exit code 0 means "ignore"
        if let Some(command) = &self.ignore_command {
            let rendered = command.replace("<ip>", &id.ntoa()).replace("<fid>", id.raw());
            match tokio::time::timeout(
                IGNORE_COMMAND_TIMEOUT,
                tokio::process::Command::new("sh").arg("-c").arg(&rendered).status(),
            )
            .await
            {
                Ok(Ok(status)) if status.success() => return true,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!(jail = %self.jail_name, error = %e, "Error running ignorecommand");
                }
                Err(_) => {
                    warn!(jail = %self.jail_name, command = %rendered, "ignorecommand timed out");
                }
            }
        }

        false
    }
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("jail", &self.jail_name)
            .field("fail_regex", &self.fail_regex.len())
            .field("ignore_regex", &self.ignore_regex.len())
            .field("containers", &self.containers.len())
            .finish_non_exhaustive()
    }
}
