//! Optional persistent store for ban history.
//!
//! Async SQLite access through SQLx: the `bans` table carries one row per
//! (jail, ip) with the last ban window, the running ban count and the
//! ticket payload as JSON. Jails restore their current bans from here on
//! start; the observer consults the history for the ban-time increment
//! policy.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::ip::IpAddress;
use crate::mytime::MyTime;
use crate::ticket::{BanTicket, Ticket};

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("corrupt ticket payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// JSON payload stored in the `data` column.
#[derive(Debug, Default, Serialize, Deserialize)]
struct TicketPayload {
    matches: Vec<String>,
    failures: u32,
    #[serde(default)]
    data: std::collections::BTreeMap<String, String>,
}

/// A row of ban history, as used by the increment policy.
#[derive(Debug, Clone)]
pub struct BanRecord {
    /// Ban window start.
    pub timeofban: f64,
    /// Ban duration in seconds (`-1` permanent).
    pub bantime: i64,
    /// Running ban count for this ip.
    pub bancount: u32,
}

/// Database handle with connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    path: String,
}

impl Database {
    /// Connection acquire timeout - prevents connection storms from blocking indefinitely.
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Maximum time a connection can remain idle before being closed.
    const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create a new database connection, running migrations if needed.
    pub async fn new(path: &str) -> Result<Self, DbError> {
        let pool = if path == ":memory:" {
            let options = SqliteConnectOptions::new()
                .filename("file::memory:")
                .shared_cache(true)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .idle_timeout(Some(Self::IDLE_TIMEOUT))
                .test_before_acquire(true)
                .connect_with(options)
                .await?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        warn!(path = %parent.display(), error = %e, "Failed to create database directory");
                    }
                }
            }
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .idle_timeout(Some(Self::IDLE_TIMEOUT))
                .test_before_acquire(true)
                .connect_with(options)
                .await?
        };

        info!(path = %path, "Database connected");
        Self::run_migrations(&pool).await;

        Ok(Self {
            pool,
            path: path.to_string(),
        })
    }

    /// The configured database file path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Run the embedded migration, statement by statement.
    async fn run_migrations(pool: &SqlitePool) {
        for statement in include_str!("../../migrations/001_init.sql").split(';') {
            let sql: Vec<&str> = statement
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with("--"))
                .collect();
            if sql.is_empty() {
                continue;
            }
            let sql = sql.join("\n");
            if let Err(e) = sqlx::query(&sql).execute(pool).await {
                let text = e.to_string();
                if !text.contains("already exists") {
                    warn!(sql = %sql, error = %text, "Migration statement failed");
                }
            }
        }
    }

    /// Register a jail (idempotent, re-enables a disabled one).
    pub async fn add_jail(&self, name: &str) -> Result<(), DbError> {
        sqlx::query("INSERT OR REPLACE INTO jails (name, enabled) VALUES (?, 1)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark a jail disabled (its history is kept for later restore).
    pub async fn disable_jail(&self, name: &str) -> Result<(), DbError> {
        sqlx::query("UPDATE jails SET enabled = 0 WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist (or refresh) one ban.
    pub async fn add_ban(
        &self,
        jail: &str,
        ticket: &BanTicket,
        default_ban_time: i64,
        max_matches: usize,
    ) -> Result<(), DbError> {
        let matches = ticket.matches();
        let kept = if matches.len() > max_matches {
            matches[matches.len() - max_matches..].to_vec()
        } else {
            matches.to_vec()
        };
        let payload = TicketPayload {
            matches: kept,
            failures: ticket.attempts(),
            data: ticket.data().clone(),
        };
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO bans (jail, ip, timeofban, bantime, bancount, data)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(jail)
        .bind(ticket.id().ntoa())
        .bind(ticket.time())
        .bind(ticket.ban_time(default_ban_time))
        .bind(ticket.ban_count().max(1) as i64)
        .bind(serde_json::to_string(&payload)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The last ban of `ip`, optionally confined to one jail.
    pub async fn get_ban(
        &self,
        ip: &IpAddress,
        jail: Option<&str>,
    ) -> Result<Option<BanRecord>, DbError> {
        let row: Option<(f64, i64, i64)> = match jail {
            Some(jail) => {
                sqlx::query_as(
                    "SELECT timeofban, bantime, bancount FROM bans WHERE ip = ? AND jail = ? \
                     ORDER BY timeofban DESC LIMIT 1",
                )
                .bind(ip.ntoa())
                .bind(jail)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT timeofban, bantime, MAX(bancount) FROM bans WHERE ip = ? \
                     GROUP BY ip ORDER BY timeofban DESC LIMIT 1",
                )
                .bind(ip.ntoa())
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(row.map(|(timeofban, bantime, bancount)| BanRecord {
            timeofban,
            bantime,
            bancount: bancount.max(0) as u32,
        }))
    }

    /// Bans of `jail` whose window still covers the present, as restorable
    /// tickets (marked restored, keeping their original window start).
    pub async fn get_current_bans(&self, jail: &str) -> Result<Vec<BanTicket>, DbError> {
        let now = MyTime::time();
        let rows: Vec<(String, f64, i64, i64, Option<String>)> = sqlx::query_as(
            r#"
            SELECT ip, timeofban, bantime, bancount, data FROM bans
            WHERE jail = ? AND (bantime < 0 OR timeofban + bantime > ?)
            "#,
        )
        .bind(jail)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut tickets = Vec::with_capacity(rows.len());
        for (ip, timeofban, bantime, bancount, data) in rows {
            let mut ticket = Ticket::new(IpAddress::id(&ip), Some(timeofban));
            ticket.set_ban_time(Some(bantime));
            ticket.set_ban_count(bancount.max(0) as u32, true);
            ticket.set_restored(true);
            if let Some(text) = data {
                match serde_json::from_str::<TicketPayload>(&text) {
                    Ok(payload) => {
                        ticket.set_matches(payload.matches);
                        if payload.failures > 0 {
                            ticket.set_attempts(payload.failures);
                        }
                        for (key, value) in payload.data {
                            ticket.set_data(key, value);
                        }
                    }
                    Err(e) => {
                        warn!(jail = %jail, ip = %ip, error = %e, "Discarding corrupt ticket payload");
                    }
                }
            }
            tickets.push(ticket);
        }
        Ok(tickets)
    }

    /// Jails with at least one currently active ban, with their banned ips.
    pub async fn get_banned_map(&self) -> Result<Vec<(String, Vec<String>)>, DbError> {
        let now = MyTime::time();
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT jail, ip FROM bans
            WHERE bantime < 0 OR timeofban + bantime > ?
            ORDER BY jail, timeofban
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        let mut map: Vec<(String, Vec<String>)> = Vec::new();
        for (jail, ip) in rows {
            match map.last_mut() {
                Some((last, ips)) if *last == jail => ips.push(ip),
                _ => map.push((jail, vec![ip])),
            }
        }
        Ok(map)
    }

    /// Delete ban rows; both filters optional (`unban --all`).
    pub async fn del_ban(&self, jail: Option<&str>, ip: Option<&IpAddress>) -> Result<u64, DbError> {
        let result = match (jail, ip) {
            (Some(jail), Some(ip)) => {
                sqlx::query("DELETE FROM bans WHERE jail = ? AND ip = ?")
                    .bind(jail)
                    .bind(ip.ntoa())
                    .execute(&self.pool)
                    .await?
            }
            (Some(jail), None) => {
                sqlx::query("DELETE FROM bans WHERE jail = ?")
                    .bind(jail)
                    .execute(&self.pool)
                    .await?
            }
            (None, Some(ip)) => {
                sqlx::query("DELETE FROM bans WHERE ip = ?")
                    .bind(ip.ntoa())
                    .execute(&self.pool)
                    .await?
            }
            (None, None) => sqlx::query("DELETE FROM bans").execute(&self.pool).await?,
        };
        Ok(result.rows_affected())
    }

    /// Drop expired history older than `purge_age` seconds (permanent bans
    /// are kept).
    pub async fn purge(&self, purge_age: i64) -> Result<u64, DbError> {
        let cutoff = MyTime::time() - purge_age as f64;
        let result = sqlx::query("DELETE FROM bans WHERE bantime >= 0 AND timeofban + bantime < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> Database {
        Database::new(":memory:").await.unwrap()
    }

    fn ban(ip: &str, time: f64, bantime: i64, count: u32) -> BanTicket {
        let mut t = Ticket::with_matches(IpAddress::id(ip), Some(time), vec!["line".into()]);
        t.set_ban_time(Some(bantime));
        t.set_ban_count(count, true);
        t
    }

    #[tokio::test]
    async fn test_ban_round_trip() {
        let db = memory_db().await;
        db.add_jail("ssh").await.unwrap();
        let now = MyTime::time();
        db.add_ban("ssh", &ban("192.0.2.1", now, 600, 1), 600, 10)
            .await
            .unwrap();

        let restored = db.get_current_bans("ssh").await.unwrap();
        assert_eq!(restored.len(), 1);
        assert!(restored[0].restored());
        assert_eq!(restored[0].id().ntoa(), "192.0.2.1");
        assert_eq!(restored[0].ban_time(0), 600);
        assert_eq!(restored[0].matches(), ["line"]);
    }

    #[tokio::test]
    async fn test_expired_bans_not_restored() {
        let db = memory_db().await;
        let now = MyTime::time();
        db.add_ban("ssh", &ban("192.0.2.1", now - 700.0, 600, 1), 600, 10)
            .await
            .unwrap();
        db.add_ban("ssh", &ban("192.0.2.2", now - 700.0, -1, 1), 600, 10)
            .await
            .unwrap();

        let restored = db.get_current_bans("ssh").await.unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].id().ntoa(), "192.0.2.2");
    }

    #[tokio::test]
    async fn test_get_ban_for_increment() {
        let db = memory_db().await;
        let now = MyTime::time();
        db.add_ban("ssh", &ban("192.0.2.1", now, 600, 3), 600, 10)
            .await
            .unwrap();
        db.add_ban("web", &ban("192.0.2.1", now, 600, 5), 600, 10)
            .await
            .unwrap();

        let per_jail = db.get_ban(&IpAddress::id("192.0.2.1"), Some("ssh")).await.unwrap();
        assert_eq!(per_jail.unwrap().bancount, 3);

        // across all jails the highest count wins
        let overall = db.get_ban(&IpAddress::id("192.0.2.1"), None).await.unwrap();
        assert_eq!(overall.unwrap().bancount, 5);

        assert!(db
            .get_ban(&IpAddress::id("192.0.2.9"), None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_del_ban_and_purge() {
        let db = memory_db().await;
        let now = MyTime::time();
        db.add_ban("ssh", &ban("192.0.2.1", now, 600, 1), 600, 10)
            .await
            .unwrap();
        db.add_ban("ssh", &ban("192.0.2.2", now - 5_000.0, 600, 1), 600, 10)
            .await
            .unwrap();

        assert_eq!(db.purge(3_600).await.unwrap(), 1);
        assert_eq!(db.del_ban(None, Some(&IpAddress::id("192.0.2.1"))).await.unwrap(), 1);
        assert!(db.get_current_bans("ssh").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_matches_capped_on_store() {
        let db = memory_db().await;
        let now = MyTime::time();
        let mut ticket = ban("192.0.2.1", now, 600, 1);
        ticket.set_matches((0..20).map(|i| format!("line {}", i)).collect());
        db.add_ban("ssh", &ticket, 600, 3).await.unwrap();

        let restored = db.get_current_bans("ssh").await.unwrap();
        assert_eq!(restored[0].matches().len(), 3);
        assert_eq!(restored[0].matches()[2], "line 19");
    }
}
