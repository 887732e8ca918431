//! Daemon configuration.
//!
//! The control socket, pidfile, logging and store settings come from a
//! TOML file; everything else (jails, filters, actions) is configured at
//! runtime over the control socket by the client tooling.

use serde::Deserialize;
use std::path::Path;

use jail_proto::LogLevel;

/// Log output style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Structured JSON lines.
    Json,
    /// Human-readable output.
    Pretty,
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Daemon settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Optional persistent store.
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
}

/// `[server]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Control socket path.
    #[serde(default = "default_socket")]
    pub socket: String,
    /// Pidfile path.
    #[serde(default = "default_pidfile")]
    pub pidfile: String,
    /// Initial log level (protocol names or 50..5).
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
    /// Initial log target (`STDOUT`, `STDERR`, or a file path).
    #[serde(default = "default_logtarget")]
    pub logtarget: String,
    /// Log output style.
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
    /// IPv6 handling: `auto`, `on`/`yes`, `off`/`no`.
    #[serde(default = "default_allow_ipv6")]
    pub allow_ipv6: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            socket: default_socket(),
            pidfile: default_pidfile(),
            loglevel: default_loglevel(),
            logtarget: default_logtarget(),
            log_format: default_log_format(),
            allow_ipv6: default_allow_ipv6(),
        }
    }
}

/// `[database]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path (`:memory:` for ephemeral).
    #[serde(default = "default_db_path")]
    pub path: String,
    /// History retention in seconds.
    #[serde(default = "default_purge_age")]
    pub purge_age: i64,
    /// Matches stored per ticket.
    #[serde(default = "default_db_max_matches")]
    pub max_matches: usize,
}

fn default_socket() -> String {
    "/var/run/jaild/jaild.sock".to_string()
}

fn default_pidfile() -> String {
    "/var/run/jaild/jaild.pid".to_string()
}

fn default_loglevel() -> String {
    "INFO".to_string()
}

fn default_logtarget() -> String {
    "STDERR".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_allow_ipv6() -> String {
    "auto".to_string()
}

fn default_db_path() -> String {
    "/var/lib/jaild/jaild.sqlite3".to_string()
}

fn default_purge_age() -> i64 {
    86_400
}

fn default_db_max_matches() -> usize {
    10
}

impl Config {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &str) -> anyhow::Result<Config> {
        if !Path::new(path).exists() {
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Parsed allow_ipv6 tri-state; `None` = auto.
    pub fn allow_ipv6(&self) -> Result<Option<bool>, String> {
        match self.server.allow_ipv6.to_ascii_lowercase().as_str() {
            "auto" => Ok(None),
            other => jail_proto::parse_bool(other)
                .map(Some)
                .map_err(|_| format!("invalid allow_ipv6 value {:?}", other)),
        }
    }
}

/// Validate the configuration, collecting every problem.
pub fn validate(config: &Config) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    if let Err(e) = LogLevel::parse(&config.server.loglevel) {
        errors.push(e.to_string());
    }
    if config.server.socket.is_empty() {
        errors.push("server.socket must not be empty".to_string());
    }
    if let Err(e) = config.allow_ipv6() {
        errors.push(e);
    }
    if let Some(db) = &config.database {
        if db.path.is_empty() {
            errors.push("database.path must not be empty".to_string());
        }
        if db.purge_age < 0 {
            errors.push("database.purge_age must not be negative".to_string());
        }
    }
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.loglevel, "INFO");
        assert_eq!(config.server.logtarget, "STDERR");
        assert!(config.database.is_none());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            [server]
            socket = "/tmp/jaild.sock"
            loglevel = "DEBUG"
            logtarget = "/var/log/jaild.log"
            log_format = "json"
            allow_ipv6 = "off"

            [database]
            path = ":memory:"
            purge_age = 3600
            "#,
        )
        .unwrap();
        assert_eq!(config.server.socket, "/tmp/jaild.sock");
        assert_eq!(config.server.log_format, LogFormat::Json);
        assert_eq!(config.allow_ipv6().unwrap(), Some(false));
        let db = config.database.unwrap();
        assert_eq!(db.path, ":memory:");
        assert_eq!(db.purge_age, 3_600);
        assert_eq!(db.max_matches, 10);
    }

    #[test]
    fn test_validation_collects_errors() {
        let config: Config = toml::from_str(
            r#"
            [server]
            socket = ""
            loglevel = "NOISY"
            allow_ipv6 = "perhaps"
            "#,
        )
        .unwrap();
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
    }
}
