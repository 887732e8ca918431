//! End-to-end log-driven flows: polling source, filter match, restore.

mod common;

use std::io::Write;
use std::time::Duration;

use common::{ControlClient, TestDaemon};
use jail_proto::Value;

async fn poll_banned(socket: &std::path::Path, jail: &str, id: &str, secs: u64) -> bool {
    for _ in 0..(secs * 10) {
        let mut client = ControlClient::connect(socket).await.unwrap();
        if client.ok(&["get", jail, "banned", id]).await == Value::Int(1) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
async fn test_log_line_to_ban() {
    let daemon = TestDaemon::spawn_without_db().await.unwrap();
    let mut client = ControlClient::connect(&daemon.socket_path()).await.unwrap();

    let logfile = daemon.data_dir().join("auth.log");
    std::fs::File::create(&logfile).unwrap();
    let logpath = logfile.display().to_string();

    client.ok(&["add", "ssh", "polling"]).await;
    client.ok(&["set", "ssh", "ignoreself", "false"]).await;
    client.ok(&["set", "ssh", "maxretry", "1"]).await;
    client
        .ok(&["set", "ssh", "addfailregex", "^test <HOST> group$"])
        .await;
    client.ok(&["set", "ssh", "addlogpath", &logpath]).await;
    client.ok(&["start", "ssh"]).await;

    let mut file = std::fs::OpenOptions::new().append(true).open(&logfile).unwrap();
    writeln!(file, "test 192.0.2.1 group").unwrap();
    writeln!(file, "unrelated noise").unwrap();
    file.flush().unwrap();

    assert!(
        poll_banned(&daemon.socket_path(), "ssh", "192.0.2.1", 15).await,
        "the matched host should get banned"
    );

    // the matched line reaches the filter counters
    let status = client.ok(&["status", "ssh"]).await.to_string();
    assert!(status.contains("Total failed, 1"));
}

#[tokio::test]
async fn test_ignored_ip_is_not_banned() {
    let daemon = TestDaemon::spawn_without_db().await.unwrap();
    let mut client = ControlClient::connect(&daemon.socket_path()).await.unwrap();

    let logfile = daemon.data_dir().join("auth.log");
    std::fs::File::create(&logfile).unwrap();
    let logpath = logfile.display().to_string();

    client.ok(&["add", "ssh", "polling"]).await;
    client.ok(&["set", "ssh", "ignoreself", "false"]).await;
    client.ok(&["set", "ssh", "maxretry", "1"]).await;
    client
        .ok(&["set", "ssh", "addfailregex", "failure from <HOST>"])
        .await;
    client.ok(&["set", "ssh", "addignoreip", "192.0.2.0/24"]).await;
    client.ok(&["set", "ssh", "addlogpath", &logpath]).await;
    client.ok(&["start", "ssh"]).await;

    let mut file = std::fs::OpenOptions::new().append(true).open(&logfile).unwrap();
    writeln!(file, "failure from 192.0.2.100").unwrap();
    writeln!(file, "failure from 198.51.100.7").unwrap();
    file.flush().unwrap();

    assert!(
        poll_banned(&daemon.socket_path(), "ssh", "198.51.100.7", 15).await,
        "the non-ignored host should get banned"
    );
    let mut client = ControlClient::connect(&daemon.socket_path()).await.unwrap();
    assert_eq!(
        client.ok(&["get", "ssh", "banned", "192.0.2.100"]).await,
        Value::Int(0)
    );
}

#[tokio::test]
async fn test_bans_restored_from_store() {
    let mut daemon = TestDaemon::spawn().await.unwrap();
    let mut client = ControlClient::connect(&daemon.socket_path()).await.unwrap();

    client.ok(&["add", "ssh", "polling"]).await;
    client.ok(&["set", "ssh", "bantime", "600"]).await;
    client.ok(&["start", "ssh"]).await;
    client.ok(&["set", "ssh", "banip", "192.0.2.1"]).await;

    // let the observer persist before tearing the jail down
    tokio::time::sleep(Duration::from_millis(300)).await;
    client.ok(&["stop", "ssh"]).await;

    client.ok(&["add", "ssh", "polling"]).await;
    client.ok(&["set", "ssh", "bantime", "600"]).await;
    client.ok(&["start", "ssh"]).await;

    assert!(
        poll_banned(&daemon.socket_path(), "ssh", "192.0.2.1", 10).await,
        "the persisted ban should be restored"
    );
    assert!(!daemon.has_exited());
}
