//! IP address sets and file-backed sets.

use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::warn;

use crate::ip::addr::IpAddress;
use crate::mytime::MyTime;

/// An unordered set of addresses and subnets.
///
/// Membership checks single addresses directly; subnet members are asked
/// for containment only when at least one is present.
#[derive(Debug, Default, Clone)]
pub struct IpAddrSet {
    items: HashSet<IpAddress>,
    subnet_count: usize,
}

impl IpAddrSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one entry.
    pub fn add(&mut self, ip: IpAddress) {
        if !ip.is_single() {
            self.subnet_count += 1;
        }
        if !self.items.insert(ip) {
            // Duplicate insert of a subnet must not inflate the counter.
            self.subnet_count = self.items.iter().filter(|i| !i.is_single()).count();
        }
    }

    /// Remove one entry; `true` if it was present.
    pub fn remove(&mut self, ip: &IpAddress) -> bool {
        let removed = self.items.remove(ip);
        if removed && !ip.is_single() {
            self.subnet_count -= 1;
        }
        removed
    }

    /// Replace the whole content.
    pub fn set(&mut self, ips: impl IntoIterator<Item = IpAddress>) {
        self.items.clear();
        self.subnet_count = 0;
        for ip in ips {
            self.add(ip);
        }
    }

    /// Membership, including subnet containment.
    pub fn contains(&self, ip: &IpAddress) -> bool {
        if self.items.contains(ip) {
            return true;
        }
        self.subnet_count > 0 && self.items.iter().any(|net| !net.is_single() && net.contains(ip))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate over the entries.
    pub fn iter(&self) -> impl Iterator<Item = &IpAddress> {
        self.items.iter()
    }
}

impl FromIterator<IpAddress> for IpAddrSet {
    fn from_iter<T: IntoIterator<Item = IpAddress>>(iter: T) -> Self {
        let mut set = IpAddrSet::new();
        for ip in iter {
            set.add(ip);
        }
        set
    }
}

#[derive(Debug, Default)]
struct FileState {
    set: IpAddrSet,
    next_check: f64,
    stats: Option<(i64, u64, u64)>,
}

/// An IP set lazily reloaded from a file.
///
/// The file holds whitespace/comma separated addresses or subnets;
/// `#` starts a comment. File stats (mtime, inode, size) are polled with a
/// bounded minimum interval so hot membership checks stay cheap.
#[derive(Debug)]
pub struct FileIpSet {
    path: PathBuf,
    state: Mutex<FileState>,
    /// Minimum seconds between stat polls.
    max_update_latency: f64,
}

impl FileIpSet {
    /// Create a set backed by `path`; loading happens on first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileIpSet {
            path: path.into(),
            state: Mutex::new(FileState::default()),
            max_update_latency: 1.0,
        }
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `name` refers to this set (`file:PATH` or the plain path).
    pub fn matches_name(&self, name: &str) -> bool {
        let stripped = name
            .strip_prefix("file://")
            .or_else(|| name.strip_prefix("file:"))
            .unwrap_or(name);
        Path::new(stripped) == self.path
    }

    /// Reload from the file if it changed (or `force`).
    pub fn load(&self, force: bool) {
        let mut state = self.state.lock();
        let now = MyTime::time();
        if !force && now <= state.next_check {
            return;
        }
        state.next_check = now + self.max_update_latency;

        let stats = match std::fs::metadata(&self.path) {
            Ok(md) => (md.mtime(), md.ino(), md.size()),
            Err(e) => {
                // back off to a minute so a missing file does not flood the log
                state.next_check = now + 60.0;
                warn!(file = %self.path.display(), error = %e, "Retrieving IPs set failed");
                return;
            }
        };
        if !force && state.stats == Some(stats) {
            return;
        }
        state.stats = Some(stats);

        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                let ips = content
                    .lines()
                    .map(|line| line.split('#').next().unwrap_or(""))
                    .flat_map(|line| line.split([' ', '\t', ',']))
                    .filter(|word| !word.is_empty())
                    .map(IpAddress::id);
                state.set.set(ips);
            }
            Err(e) => {
                state.next_check = now + 60.0;
                warn!(file = %self.path.display(), error = %e, "Retrieving IPs set failed");
            }
        }
    }

    /// Membership, reloading the file first when due.
    pub fn contains(&self, ip: &IpAddress) -> bool {
        self.load(false);
        self.state.lock().set.contains(ip)
    }

    /// Current number of loaded entries.
    pub fn len(&self) -> usize {
        self.state.lock().set.len()
    }

    /// Whether no entries are loaded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Display for FileIpSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "file:{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mytime::AlternateNowGuard;
    use std::io::Write;

    #[test]
    fn test_set_contains_subnets() {
        let mut set = IpAddrSet::new();
        set.add(IpAddress::id("192.0.2.1"));
        set.add(IpAddress::id("10.0.0.0/8"));

        assert!(set.contains(&IpAddress::id("192.0.2.1")));
        assert!(set.contains(&IpAddress::id("10.20.30.40")));
        assert!(!set.contains(&IpAddress::id("192.0.2.2")));
    }

    #[test]
    fn test_set_remove_updates_subnet_flag() {
        let mut set = IpAddrSet::new();
        let net = IpAddress::id("10.0.0.0/8");
        set.add(net.clone());
        assert!(set.contains(&IpAddress::id("10.1.1.1")));
        assert!(set.remove(&net));
        assert!(!set.contains(&IpAddress::id("10.1.1.1")));
    }

    #[test]
    fn test_file_set_reloads_after_latency() {
        let _guard = AlternateNowGuard::set(2_000.0);
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "192.0.2.1 # doc host").unwrap();
        tmp.flush().unwrap();

        let set = FileIpSet::new(tmp.path());
        assert!(set.contains(&IpAddress::id("192.0.2.1")));
        assert!(!set.contains(&IpAddress::id("192.0.2.2")));

        // Edit the file; within the poll interval the old content sticks.
        writeln!(tmp, "192.0.2.2").unwrap();
        tmp.flush().unwrap();
        assert!(!set.contains(&IpAddress::id("192.0.2.2")));

        // After the interval the new entry is visible.
        crate::mytime::MyTime::set_alternate_now(2_002.0);
        assert!(set.contains(&IpAddress::id("192.0.2.2")));
    }

    #[test]
    fn test_file_set_name_matching() {
        let set = FileIpSet::new("/etc/jaild/ignore.lst");
        assert!(set.matches_name("file:/etc/jaild/ignore.lst"));
        assert!(set.matches_name("file:///etc/jaild/ignore.lst"));
        assert!(set.matches_name("/etc/jaild/ignore.lst"));
        assert!(!set.matches_name("file:/etc/other.lst"));
    }
}
