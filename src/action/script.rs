//! Scripted actions: an external executable dispatched by method name.
//!
//! The script is called as `<path> <method> <json>` where the JSON object
//! carries the action's keyword properties merged with the ticket fields.
//! Exit code 0 is success; stdout is returned to the caller for custom
//! method invocations. The required methods are `start`, `stop`, `ban`
//! and `unban`; `check` and `reban` are optional, any other name may be
//! invoked explicitly.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, warn};

use crate::action::{Action, ActionInfo};
use crate::error::{Error, Result};

/// Default script timeout in seconds.
const DEFAULT_TIMEOUT: u64 = 60;

/// An action backed by an external executable.
pub struct ScriptedAction {
    name: String,
    path: String,
    kwargs: RwLock<BTreeMap<String, serde_json::Value>>,
}

impl ScriptedAction {
    /// Create a scripted action from its executable path and JSON kwargs.
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        kwargs: serde_json::Value,
    ) -> Result<ScriptedAction> {
        let map = match kwargs {
            serde_json::Value::Null => BTreeMap::new(),
            serde_json::Value::Object(obj) => obj.into_iter().collect(),
            other => {
                return Err(Error::InvalidArgument(format!(
                    "script action kwargs must be a JSON object, got {}",
                    other
                )))
            }
        };
        Ok(ScriptedAction {
            name: name.into(),
            path: path.into(),
            kwargs: RwLock::new(map),
        })
    }

    /// The executable path.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn timeout_secs(&self) -> u64 {
        self.kwargs
            .read()
            .get("timeout")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    fn payload(&self, info: &ActionInfo, extra: serde_json::Value) -> serde_json::Value {
        let mut body = serde_json::Map::new();
        for (key, value) in self.kwargs.read().iter() {
            body.insert(key.clone(), value.clone());
        }
        body.insert("jail".to_string(), json!(info.jail));
        if let Some(ticket) = &info.ticket {
            body.insert("ip".to_string(), json!(ticket.id().ntoa()));
            body.insert("fid".to_string(), json!(ticket.id().raw()));
            body.insert("family".to_string(), json!(ticket.id().family().name()));
            body.insert("failures".to_string(), json!(ticket.attempts()));
            body.insert(
                "bantime".to_string(),
                json!(ticket.ban_time(info.default_ban_time)),
            );
            body.insert("bancount".to_string(), json!(ticket.ban_count()));
            body.insert("time".to_string(), json!(ticket.time() as i64));
        }
        if let serde_json::Value::Object(extra) = extra {
            for (key, value) in extra {
                body.insert(key, value);
            }
        }
        serde_json::Value::Object(body)
    }

    async fn dispatch(
        &self,
        method: &str,
        info: &ActionInfo,
        extra: serde_json::Value,
    ) -> Result<String> {
        let payload = self.payload(info, extra);
        debug!(action = %self.name, method = %method, "Dispatching to script");
        let mut child = tokio::process::Command::new(&self.path)
            .arg(method)
            .arg(payload.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let timeout = Duration::from_secs(self.timeout_secs());
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(action = %self.name, method = %method, "Script timed out");
                return Err(Error::Timeout {
                    command: format!("{} {}", self.path, method),
                    seconds: self.timeout_secs(),
                });
            }
        };
        if !output.status.success() {
            return Err(Error::Io(std::io::Error::other(format!(
                "script {:?} method {:?} returned {}",
                self.path, method, output.status
            ))));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}

#[async_trait]
impl Action for ScriptedAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "script"
    }

    fn set_property(&self, key: &str, value: &str) {
        // values arriving over the wire are strings; keep JSON values intact
        // when they parse, fall back to a plain string otherwise
        let parsed = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        self.kwargs.write().insert(key.to_string(), parsed);
    }

    fn get_property(&self, key: &str) -> Option<String> {
        self.kwargs.read().get(key).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    fn properties(&self) -> Vec<String> {
        self.kwargs.read().keys().cloned().collect()
    }

    fn methods(&self) -> Vec<String> {
        ["start", "stop", "check", "ban", "reban", "unban", "flush"]
            .iter()
            .map(|m| m.to_string())
            .collect()
    }

    async fn start(&self, info: &ActionInfo) -> Result<()> {
        self.dispatch("start", info, serde_json::Value::Null).await.map(|_| ())
    }

    async fn stop(&self, info: &ActionInfo) -> Result<()> {
        self.dispatch("stop", info, serde_json::Value::Null).await.map(|_| ())
    }

    async fn check(&self, info: &ActionInfo) -> Result<()> {
        self.dispatch("check", info, serde_json::Value::Null).await.map(|_| ())
    }

    async fn ban(&self, info: &ActionInfo) -> Result<()> {
        self.dispatch("ban", info, serde_json::Value::Null).await.map(|_| ())
    }

    async fn unban(&self, info: &ActionInfo) -> Result<()> {
        self.dispatch("unban", info, serde_json::Value::Null).await.map(|_| ())
    }

    async fn flush(&self, info: &ActionInfo) -> Result<()> {
        self.dispatch("flush", info, serde_json::Value::Null).await.map(|_| ())
    }

    async fn reload(&self, info: &ActionInfo) -> Result<()> {
        self.dispatch("reload", info, serde_json::Value::Null).await.map(|_| ())
    }

    async fn invoke(
        &self,
        method: &str,
        kwargs: serde_json::Value,
        info: &ActionInfo,
    ) -> Result<String> {
        self.dispatch(method, info, kwargs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::IpAddress;
    use crate::ticket::Ticket;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("action.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "{}", body).unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn info(ip: &str) -> ActionInfo {
        ActionInfo::for_ticket("ssh", Ticket::new(IpAddress::id(ip), Some(1000.0)), 600)
    }

    #[tokio::test]
    async fn test_dispatch_passes_method_and_payload() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls");
        let script = write_script(
            dir.path(),
            &format!("echo \"$1 $2\" >> {}", log.display()),
        );
        let action = ScriptedAction::new(
            "myscript",
            script.to_string_lossy(),
            serde_json::json!({"table": "jail-deny"}),
        )
        .unwrap();

        action.ban(&info("192.0.2.1")).await.unwrap();
        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.starts_with("ban {"));
        assert!(content.contains("\"ip\":\"192.0.2.1\""));
        assert!(content.contains("\"table\":\"jail-deny\""));
        assert!(content.contains("\"jail\":\"ssh\""));
    }

    #[tokio::test]
    async fn test_custom_method_returns_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "if [ \"$1\" = \"hello\" ]; then echo world; fi");
        let action =
            ScriptedAction::new("myscript", script.to_string_lossy(), serde_json::Value::Null)
                .unwrap();
        let out = action
            .invoke(
                "hello",
                serde_json::Value::Null,
                &ActionInfo::jail_only("ssh", 600),
            )
            .await
            .unwrap();
        assert_eq!(out, "world");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "exit 3");
        let action =
            ScriptedAction::new("myscript", script.to_string_lossy(), serde_json::Value::Null)
                .unwrap();
        assert!(action.ban(&info("192.0.2.1")).await.is_err());
    }

    #[test]
    fn test_kwargs_must_be_object() {
        assert!(ScriptedAction::new("x", "/bin/true", serde_json::json!([1, 2])).is_err());
        assert!(ScriptedAction::new("x", "/bin/true", serde_json::Value::Null).is_ok());
    }
}
