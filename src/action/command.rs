//! Shell-template actions.
//!
//! The canonical command properties are `actionstart`, `actionstop`,
//! `actioncheck`, `actionban`, `actionunban`, `actionflush` and
//! `actionreload`; everything else in the property map is substitution
//! material. An empty or missing command is a successful no-op.

use std::collections::{BTreeMap, HashSet};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::action::{compose_env, substitute_tags, Action, ActionInfo};
use crate::error::{Error, Result};
use crate::ip::Family;

/// Default command timeout in seconds.
const DEFAULT_TIMEOUT: u64 = 60;

/// Run a rendered command line through the shell with a timeout.
///
/// On expiry the child is killed and the action reports [`Error::Timeout`].
pub(crate) async fn run_shell(command: &str, timeout_secs: u64) -> Result<()> {
    if command.trim().is_empty() {
        return Ok(());
    }
    debug!(command = %command, "Executing");
    let mut child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    match tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(Error::Io(std::io::Error::other(format!(
            "command {:?} returned {}",
            command, status
        )))),
        Ok(Err(e)) => Err(Error::Io(e)),
        Err(_) => {
            warn!(command = %command, timeout = timeout_secs, "Command timed out, killing");
            let _ = child.kill().await;
            Err(Error::Timeout {
                command: command.to_string(),
                seconds: timeout_secs,
            })
        }
    }
}

/// An action whose operations are shell command templates.
pub struct CommandAction {
    name: String,
    properties: RwLock<BTreeMap<String, String>>,
    /// Families for which `actionstart` already ran.
    started: Mutex<HashSet<Family>>,
}

impl CommandAction {
    /// A fresh command action named `name`.
    pub fn new(name: impl Into<String>) -> CommandAction {
        CommandAction {
            name: name.into(),
            properties: RwLock::new(BTreeMap::new()),
            started: Mutex::new(HashSet::new()),
        }
    }

    fn timeout_secs(&self) -> u64 {
        self.properties
            .read()
            .get("timeout")
            .and_then(|t| jail_proto::parse_interval(t).ok())
            .and_then(|t| u64::try_from(t).ok())
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    fn start_on_demand(&self) -> bool {
        self.properties
            .read()
            .get("actionstart_on_demand")
            .map(|v| jail_proto::parse_bool(v).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Render one command property for `info`; `Ok(None)` when unset.
    fn render(&self, key: &str, info: &ActionInfo) -> Result<Option<String>> {
        let properties = self.properties.read();
        let Some(template) = properties.get(key) else {
            return Ok(None);
        };
        if template.is_empty() {
            return Ok(None);
        }
        let env = compose_env(info, &properties);
        Ok(Some(substitute_tags(template, &env)?))
    }

    async fn run(&self, key: &str, info: &ActionInfo) -> Result<()> {
        match self.render(key, info)? {
            Some(command) => run_shell(&command, self.timeout_secs()).await,
            None => Ok(()),
        }
    }

    fn family_of(info: &ActionInfo) -> Family {
        info.ip().map(|ip| ip.family()).unwrap_or(Family::Unspec)
    }

    async fn ensure_started(&self, info: &ActionInfo) -> Result<()> {
        let family = Self::family_of(info);
        if self.started.lock().contains(&family) {
            return Ok(());
        }
        self.run("actionstart", info).await?;
        self.started.lock().insert(family);
        Ok(())
    }

    /// `actioncheck` before each ban; a failure triggers one
    /// stop/start repair cycle.
    async fn invariant_check(&self, info: &ActionInfo) -> Result<()> {
        if self.render("actioncheck", info)?.is_none() {
            return Ok(());
        }
        if self.run("actioncheck", info).await.is_ok() {
            return Ok(());
        }
        warn!(action = %self.name, "Invariant check failed, restarting action");
        self.run("actionstop", info).await.ok();
        self.run("actionstart", info).await?;
        self.run("actioncheck", info).await
    }
}

#[async_trait]
impl Action for CommandAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "command"
    }

    fn set_property(&self, key: &str, value: &str) {
        self.properties
            .write()
            .insert(key.to_string(), value.to_string());
    }

    fn get_property(&self, key: &str) -> Option<String> {
        if key == "timeout" {
            return Some(self.timeout_secs().to_string());
        }
        self.properties.read().get(key).cloned()
    }

    fn properties(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.properties.read().keys().cloned().collect();
        if !keys.iter().any(|k| k == "timeout") {
            keys.push("timeout".to_string());
        }
        keys
    }

    fn methods(&self) -> Vec<String> {
        ["start", "stop", "check", "ban", "unban", "flush", "reload"]
            .iter()
            .map(|m| m.to_string())
            .collect()
    }

    async fn start(&self, info: &ActionInfo) -> Result<()> {
        if self.start_on_demand() {
            debug!(action = %self.name, "Start deferred until first ban");
            return Ok(());
        }
        self.ensure_started(info).await
    }

    async fn stop(&self, info: &ActionInfo) -> Result<()> {
        let families: Vec<Family> = self.started.lock().drain().collect();
        if families.is_empty() {
            return Ok(());
        }
        self.run("actionstop", info).await
    }

    async fn check(&self, info: &ActionInfo) -> Result<()> {
        self.run("actioncheck", info).await
    }

    async fn ban(&self, info: &ActionInfo) -> Result<()> {
        self.ensure_started(info).await?;
        self.invariant_check(info).await?;
        self.run("actionban", info).await
    }

    async fn unban(&self, info: &ActionInfo) -> Result<()> {
        self.run("actionunban", info).await
    }

    async fn flush(&self, info: &ActionInfo) -> Result<()> {
        self.run("actionflush", info).await
    }

    async fn reload(&self, info: &ActionInfo) -> Result<()> {
        self.run("actionreload", info).await
    }

    async fn invoke(
        &self,
        method: &str,
        _kwargs: serde_json::Value,
        info: &ActionInfo,
    ) -> Result<String> {
        match method {
            "start" => self.start(info).await?,
            "stop" => self.stop(info).await?,
            "check" => self.check(info).await?,
            "ban" => self.ban(info).await?,
            "unban" => self.unban(info).await?,
            "flush" => self.flush(info).await?,
            "reload" => self.reload(info).await?,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "Command action '{}' has no method {:?}",
                    self.name, other
                )))
            }
        }
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::IpAddress;
    use crate::ticket::Ticket;

    fn info(ip: &str) -> ActionInfo {
        ActionInfo::for_ticket("ssh", Ticket::new(IpAddress::id(ip), Some(1000.0)), 600)
    }

    #[tokio::test]
    async fn test_empty_commands_are_noops() {
        let action = CommandAction::new("dummy");
        action.ban(&info("192.0.2.1")).await.unwrap();
        action.unban(&info("192.0.2.1")).await.unwrap();
        action.stop(&ActionInfo::jail_only("ssh", 600)).await.unwrap();
    }

    #[tokio::test]
    async fn test_ban_writes_rendered_command() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("banlog");
        let action = CommandAction::new("dummy");
        action.set_property("actionban", &format!("echo 'ban <ip>' >> {}", out.display()));
        action.ban(&info("192.0.2.1")).await.unwrap();
        action.ban(&info("192.0.2.2")).await.unwrap();

        let content = std::fs::read_to_string(&out).unwrap();
        assert_eq!(content, "ban 192.0.2.1\nban 192.0.2.2\n");
    }

    #[tokio::test]
    async fn test_start_runs_once_per_family() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("startlog");
        let action = CommandAction::new("dummy");
        action.set_property("actionstart", &format!("echo start >> {}", out.display()));
        action.ban(&info("192.0.2.1")).await.unwrap();
        action.ban(&info("192.0.2.2")).await.unwrap();
        // a v6 ticket brings the family up separately
        action.ban(&info("2001:db8::1")).await.unwrap();

        let content = std::fs::read_to_string(&out).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_failed_check_triggers_repair() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("started");
        let action = CommandAction::new("dummy");
        // check passes only once actionstart created the marker file
        action.set_property("actioncheck", &format!("test -f {}", marker.display()));
        action.set_property("actionstart", &format!("touch {}", marker.display()));
        action.set_property("actionban", "true");
        action.set_property("actionstart_on_demand", "true");

        // Remove the marker after the deferred start to force the repair path.
        action.ensure_started(&info("192.0.2.1")).await.unwrap();
        std::fs::remove_file(&marker).unwrap();
        action.ban(&info("192.0.2.1")).await.unwrap();
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_failing_ban_command_is_error() {
        let action = CommandAction::new("dummy");
        action.set_property("actionban", "false");
        assert!(action.ban(&info("192.0.2.1")).await.is_err());
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let action = CommandAction::new("dummy");
        action.set_property("actionban", "sleep 30");
        action.set_property("timeout", "1");
        let err = action.ban(&info("192.0.2.1")).await.unwrap_err();
        assert_eq!(err.error_code(), "timeout");
    }

    #[test]
    fn test_properties_include_timeout() {
        let action = CommandAction::new("dummy");
        action.set_property("port", "ssh");
        assert!(action.properties().contains(&"timeout".to_string()));
        assert!(action.properties().contains(&"port".to_string()));
        assert_eq!(action.get_property("timeout").as_deref(), Some("60"));
    }
}
