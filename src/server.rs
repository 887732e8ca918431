//! The server: jail map, global settings, lifecycle.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{info, warn};

use jail_proto::Value;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::ip::DnsResolver;
use crate::jail::Jail;
use crate::observer::{Observer, ObserverOp};
use crate::telemetry::Telemetry;

/// Reserved jail name used by `--all` options.
const RESERVED_ALL: &str = "--all";

/// Hourly database purge cadence.
const PURGE_INTERVAL: Duration = Duration::from_secs(3_600);

/// The daemon core: owns the jails and the shared services.
pub struct Server {
    jails: RwLock<Vec<(String, Arc<Jail>)>>,
    db: Arc<RwLock<Option<Database>>>,
    db_purge_age: AtomicI64,
    db_max_matches: Arc<AtomicUsize>,
    observer: Arc<Observer>,
    resolver: Arc<DnsResolver>,
    telemetry: Arc<Telemetry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create the server and spawn its background services.
    pub fn new(telemetry: Arc<Telemetry>) -> Arc<Server> {
        let db: Arc<RwLock<Option<Database>>> = Arc::new(RwLock::new(None));
        let observer = Arc::new(Observer::spawn(db.clone()));
        let (shutdown_tx, _) = broadcast::channel(4);

        let server = Arc::new(Server {
            jails: RwLock::new(Vec::new()),
            db,
            db_purge_age: AtomicI64::new(86_400),
            db_max_matches: Arc::new(AtomicUsize::new(10)),
            observer,
            resolver: Arc::new(DnsResolver::new()),
            telemetry,
            shutdown_tx,
        });

        // periodic database purge through the observer queue
        {
            let server = Arc::clone(&server);
            let mut shutdown_rx = server.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(PURGE_INTERVAL);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            server.observer.add(ObserverOp::Purge {
                                purge_age: server.db_purge_age.load(Ordering::Relaxed),
                            });
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }

        server
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// The shared resolver.
    pub fn resolver(&self) -> &Arc<DnsResolver> {
        &self.resolver
    }

    /// The telemetry handle.
    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// The daemon version string.
    pub fn version(&self) -> String {
        format!("jaild {}", env!("CARGO_PKG_VERSION"))
    }

    // -- jail control --------------------------------------------------------

    /// Create a jail; `--all` is reserved, duplicates are rejected.
    pub async fn add_jail(&self, name: &str, backend: &str) -> Result<()> {
        if name == RESERVED_ALL {
            return Err(Error::InvalidArgument(format!(
                "Jail name {:?} is reserved",
                RESERVED_ALL
            )));
        }
        {
            let jails = self.jails.read();
            if jails.iter().any(|(n, _)| n == name) {
                return Err(Error::jail_exists(name));
            }
        }
        let jail = Arc::new(Jail::new(
            name,
            backend,
            self.resolver.clone(),
            self.observer.clone(),
            self.db.clone(),
            self.db_max_matches.clone(),
        )?);
        self.jails.write().push((name.to_string(), jail));
        let db = self.db.read().clone();
        if let Some(db) = db {
            if let Err(e) = db.add_jail(name).await {
                warn!(jail = %name, error = %e, "Failed to register jail in store");
            }
        }
        info!(jail = %name, backend = %backend, "Jail added");
        Ok(())
    }

    /// Look one jail up.
    pub fn get_jail(&self, name: &str) -> Result<Arc<Jail>> {
        self.jails
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, j)| j.clone())
            .ok_or_else(|| Error::no_jail(name))
    }

    /// Jail names in insertion order.
    pub fn jail_names(&self) -> Vec<String> {
        self.jails.read().iter().map(|(n, _)| n.clone()).collect()
    }

    /// All jails in insertion order.
    pub fn jails(&self) -> Vec<Arc<Jail>> {
        self.jails.read().iter().map(|(_, j)| j.clone()).collect()
    }

    /// Start one jail.
    pub async fn start_jail(&self, name: &str) -> Result<()> {
        self.get_jail(name)?.start().await
    }

    /// Stop one jail and remove it from the map.
    pub async fn stop_jail(&self, name: &str) -> Result<()> {
        let jail = self.get_jail(name)?;
        jail.stop().await?;
        self.jails.write().retain(|(n, _)| n != name);
        let db = self.db.read().clone();
        if let Some(db) = db {
            if let Err(e) = db.disable_jail(name).await {
                warn!(jail = %name, error = %e, "Failed to disable jail in store");
            }
        }
        Ok(())
    }

    /// Reload: re-arm jails from their in-memory settings.
    ///
    /// `--unban` flushes affected jails first; `--restart` stops and
    /// starts them. Without a jail name every jail is affected.
    pub async fn reload(
        &self,
        jail: Option<&str>,
        restart: bool,
        unban: bool,
        if_exists: bool,
    ) -> Result<()> {
        let affected = match jail {
            Some(name) => match self.get_jail(name) {
                Ok(jail) => vec![jail],
                Err(_) if if_exists => Vec::new(),
                Err(e) => return Err(e),
            },
            None => self.jails(),
        };
        for jail in affected {
            if unban && jail.is_running() {
                jail.flush_bans().await?;
            }
            if restart {
                jail.stop().await?;
                jail.start().await?;
            }
        }
        Ok(())
    }

    /// Stop everything: jails in order, then the observer.
    pub async fn quit(&self) {
        info!("Stopping all jails");
        for jail in self.jails() {
            if let Err(e) = jail.stop().await {
                warn!(jail = %jail.name(), error = %e, "Failed to stop jail");
            }
        }
        self.jails.write().clear();
        self.observer.stop().await;
        let _ = self.shutdown_tx.send(());
        info!("Shutdown requested");
    }

    // -- aggregate queries ---------------------------------------------------

    /// Server status; with `all`, per-jail statuses are appended.
    pub async fn status(&self, all: Option<&str>) -> Result<Value> {
        let names = self.jail_names();
        let mut rows = vec![
            Value::pair("Number of jail", names.len()),
            Value::pair("Jail list", names.join(", ")),
        ];
        if let Some(flavor) = all {
            for jail in self.jails() {
                rows.push(Value::pair(jail.name(), jail.status(flavor).await?));
            }
        }
        Ok(Value::List(rows))
    }

    /// Statistics table: jail -> (backend, filter counters, ban counters).
    pub fn stats(&self) -> Value {
        let rows: Vec<Value> = self
            .jails()
            .iter()
            .map(|jail| {
                let (failed, fail_total, banned, ban_total) = jail.counters();
                Value::pair(
                    jail.name(),
                    Value::List(vec![
                        Value::from(jail.backend()),
                        Value::List(vec![Value::from(failed), Value::Int(fail_total as i64)]),
                        Value::List(vec![Value::from(banned), Value::Int(ban_total as i64)]),
                    ]),
                )
            })
            .collect();
        Value::List(rows)
    }

    /// `banned`: jail -> banned ids; `banned <IP>..`: per-ip jail lists.
    pub fn banned(&self, ids: &[String]) -> Value {
        if ids.is_empty() {
            let rows: Vec<Value> = self
                .jails()
                .iter()
                .map(|jail| Value::pair(jail.name(), Value::list(jail.banned_ids())))
                .collect();
            return Value::List(rows);
        }
        let rows: Vec<Value> = ids
            .iter()
            .map(|id| {
                let jails: Vec<String> = self
                    .jails()
                    .iter()
                    .filter(|jail| jail.is_banned(id))
                    .map(|jail| jail.name().to_string())
                    .collect();
                Value::list(jails)
            })
            .collect();
        Value::List(rows)
    }

    /// Unban ids (or everything) across all jails and the store.
    pub async fn unban(&self, ids: Option<&[String]>) -> Result<usize> {
        let mut count = 0;
        for jail in self.jails() {
            if !jail.is_running() {
                continue;
            }
            match ids {
                Some(ids) => count += jail.unban_ips(ids, false).await?,
                None => count += jail.flush_bans().await?,
            }
        }
        let db = self.db.read().clone();
        if let Some(db) = db {
            match ids {
                Some(ids) => {
                    for id in ids {
                        db.del_ban(None, Some(&crate::ip::IpAddress::id(id))).await?;
                    }
                }
                None => {
                    db.del_ban(None, None).await?;
                }
            }
        }
        Ok(count)
    }

    // -- global settings -----------------------------------------------------

    /// Attach (or detach with `None`) the persistent store.
    ///
    /// Rejected while jails exist; their history handles would go stale.
    pub async fn set_db_file(&self, path: Option<&str>) -> Result<()> {
        if !self.jails.read().is_empty() {
            return Err(Error::Busy(
                "Cannot change database when there are jails present".to_string(),
            ));
        }
        match path {
            Some(path) => {
                let db = Database::new(path).await?;
                *self.db.write() = Some(db);
            }
            None => {
                *self.db.write() = None;
            }
        }
        Ok(())
    }

    /// The store path, if attached.
    pub fn db_file(&self) -> Option<String> {
        self.db.read().as_ref().map(|db| db.path().to_string())
    }

    /// Max matches persisted per ticket.
    pub fn db_max_matches(&self) -> usize {
        self.db_max_matches.load(Ordering::Relaxed)
    }

    /// Set the persisted match cap.
    pub fn set_db_max_matches(&self, value: usize) {
        self.db_max_matches.store(value, Ordering::Relaxed);
    }

    /// History retention in seconds.
    pub fn db_purge_age(&self) -> i64 {
        self.db_purge_age.load(Ordering::Relaxed)
    }

    /// Set history retention.
    pub fn set_db_purge_age(&self, value: i64) {
        self.db_purge_age.store(value, Ordering::Relaxed);
    }

    /// Set the IPv6 tri-state (`on`/`off`/`auto`).
    pub fn set_allow_ipv6(&self, value: Option<bool>) {
        self.resolver.set_ipv6_allowed(value);
    }

    /// The IPv6 tri-state as a protocol token.
    pub fn allow_ipv6(&self) -> &'static str {
        match self.resolver.ipv6_setting() {
            Some(true) => "yes",
            Some(false) => "no",
            None => "auto",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_server() -> Arc<Server> {
        Server::new(Telemetry::disabled())
    }

    #[tokio::test]
    async fn test_add_jail_rejects_reserved_and_duplicates() {
        let server = test_server();
        server.add_jail("ssh", "polling").await.unwrap();
        assert!(server.add_jail("ssh", "polling").await.is_err());
        let err = server.add_jail("--all", "polling").await.unwrap_err();
        assert_eq!(err.error_code(), "invalid_argument");
        assert_eq!(server.jail_names(), vec!["ssh"]);
    }

    #[tokio::test]
    async fn test_jail_map_keeps_insertion_order() {
        let server = test_server();
        for name in ["zzz", "aaa", "mmm"] {
            server.add_jail(name, "polling").await.unwrap();
        }
        assert_eq!(server.jail_names(), vec!["zzz", "aaa", "mmm"]);
    }

    #[tokio::test]
    async fn test_stop_jail_removes_it() {
        let server = test_server();
        server.add_jail("ssh", "polling").await.unwrap();
        server.start_jail("ssh").await.unwrap();
        server.stop_jail("ssh").await.unwrap();
        assert!(server.get_jail("ssh").is_err());
        assert!(server.stop_jail("ssh").await.is_err());
    }

    #[tokio::test]
    async fn test_db_file_busy_with_jails() {
        let server = test_server();
        server.add_jail("ssh", "polling").await.unwrap();
        let err = server.set_db_file(Some(":memory:")).await.unwrap_err();
        assert_eq!(err.error_code(), "busy");

        server.stop_jail("ssh").await.unwrap();
        server.set_db_file(Some(":memory:")).await.unwrap();
        assert_eq!(server.db_file().as_deref(), Some(":memory:"));
        server.set_db_file(None).await.unwrap();
        assert!(server.db_file().is_none());
    }

    #[tokio::test]
    async fn test_status_and_banned_aggregation() {
        let server = test_server();
        server.add_jail("ssh", "polling").await.unwrap();
        server.add_jail("web", "polling").await.unwrap();
        server.start_jail("ssh").await.unwrap();
        server
            .get_jail("ssh")
            .unwrap()
            .ban_ips(&["192.0.2.1".to_string()], false)
            .await
            .unwrap();

        let status = server.status(None).await.unwrap();
        let rendered = status.to_string();
        assert!(rendered.contains("Number of jail"));
        assert!(rendered.contains("ssh, web"));

        let banned = server.banned(&[]).to_string();
        assert!(banned.contains("192.0.2.1"));

        let per_ip = server.banned(&["192.0.2.1".to_string(), "192.0.2.9".to_string()]);
        let rows = per_ip.as_list().unwrap();
        assert_eq!(rows[0].to_string(), "[ssh]");
        assert_eq!(rows[1].to_string(), "[]");

        server.quit().await;
    }
}
