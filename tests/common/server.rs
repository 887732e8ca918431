//! Test daemon management.
//!
//! Spawns and manages jaild instances for integration testing.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;
use tokio::time::sleep;

/// A spawned jaild instance with its scratch directory.
pub struct TestDaemon {
    child: Child,
    data_dir: tempfile::TempDir,
}

impl TestDaemon {
    /// Spawn a daemon with an ephemeral socket, stderr logging and an
    /// in-memory database.
    pub async fn spawn() -> anyhow::Result<Self> {
        Self::spawn_with(true).await
    }

    /// Spawn a daemon without a database.
    pub async fn spawn_without_db() -> anyhow::Result<Self> {
        Self::spawn_with(false).await
    }

    async fn spawn_with(database: bool) -> anyhow::Result<Self> {
        let data_dir = tempfile::tempdir()?;
        let config_path = data_dir.path().join("config.toml");
        let socket = data_dir.path().join("jaild.sock");
        let pidfile = data_dir.path().join("jaild.pid");

        let mut config = format!(
            r#"
[server]
socket = "{}"
pidfile = "{}"
loglevel = "DEBUG"
logtarget = "STDERR"
allow_ipv6 = "off"
"#,
            socket.display(),
            pidfile.display(),
        );
        if database {
            config.push_str(&format!(
                r#"
[database]
path = "{}/test.sqlite3"
"#,
                data_dir.path().display()
            ));
        }
        std::fs::write(&config_path, config)?;

        let child = Command::new(env!("CARGO_BIN_EXE_jaild"))
            .arg("-c")
            .arg(&config_path)
            .spawn()?;

        let daemon = TestDaemon { child, data_dir };

        // wait for the control socket to come up
        for _ in 0..300 {
            if daemon.socket_path().exists() {
                return Ok(daemon);
            }
            sleep(Duration::from_millis(10)).await;
        }
        anyhow::bail!("daemon did not create its control socket in time");
    }

    /// The control socket path.
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.path().join("jaild.sock")
    }

    /// The scratch directory (log fixtures, action output files).
    pub fn data_dir(&self) -> &Path {
        self.data_dir.path()
    }

    /// Whether the daemon process has exited.
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Wait (bounded) for the daemon process to exit.
    pub async fn wait_for_exit(&mut self) -> bool {
        for _ in 0..500 {
            if self.has_exited() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
