//! Manual ban/unban flows through the transmitter and action chain.

mod common;

use std::time::Duration;

use common::{ControlClient, TestDaemon};
use jail_proto::Value;

async fn poll_until(mut condition: impl AsyncFnMut() -> bool, secs: u64) -> bool {
    for _ in 0..(secs * 10) {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
async fn test_banip_counts_and_action_emission() {
    let daemon = TestDaemon::spawn_without_db().await.unwrap();
    let mut client = ControlClient::connect(&daemon.socket_path()).await.unwrap();
    let banlog = daemon.data_dir().join("banlog");

    client.ok(&["add", "ssh", "polling"]).await;
    client.ok(&["set", "ssh", "addaction", "dummy"]).await;
    client
        .ok(&[
            "set",
            "ssh",
            "action",
            "dummy",
            "actionban",
            &format!("echo 'Ban <ip>' >> {}", banlog.display()),
        ])
        .await;
    client
        .ok(&[
            "set",
            "ssh",
            "action",
            "dummy",
            "actionunban",
            &format!("echo 'Unban <ip>' >> {}", banlog.display()),
        ])
        .await;
    client.ok(&["start", "ssh"]).await;

    // duplicate in the same call counts once; second call returns 0
    assert_eq!(
        client
            .ok(&["set", "ssh", "banip", "192.0.2.1", "192.0.2.1", "192.0.2.2"])
            .await,
        Value::Int(2)
    );
    assert_eq!(
        client.ok(&["set", "ssh", "banip", "192.0.2.1"]).await,
        Value::Int(0)
    );

    let content = std::fs::read_to_string(&banlog).unwrap();
    assert!(content.contains("Ban 192.0.2.1"));
    assert!(content.contains("Ban 192.0.2.2"));

    // unban runs the chain too
    assert_eq!(
        client.ok(&["set", "ssh", "unbanip", "192.0.2.1"]).await,
        Value::Int(1)
    );
    let content = std::fs::read_to_string(&banlog).unwrap();
    assert!(content.contains("Unban 192.0.2.1"));

    // absent ids are tolerated unless reported
    assert_eq!(
        client.ok(&["set", "ssh", "unbanip", "192.0.2.77"]).await,
        Value::Int(0)
    );
    let text = client
        .err(&["set", "ssh", "unbanip", "--report-absent", "192.0.2.77"])
        .await;
    assert!(text.contains("not banned"));
}

#[tokio::test]
async fn test_threshold_two_hosts() {
    let daemon = TestDaemon::spawn_without_db().await.unwrap();
    let mut client = ControlClient::connect(&daemon.socket_path()).await.unwrap();

    client.ok(&["add", "ssh", "polling"]).await;
    client.ok(&["set", "ssh", "maxretry", "5"]).await;
    client.ok(&["start", "ssh"]).await;

    for _ in 0..2 {
        client.ok(&["set", "ssh", "attempt", "192.0.2.1"]).await;
    }
    for _ in 0..5 {
        client.ok(&["set", "ssh", "attempt", "192.0.2.2"]).await;
    }

    let socket = daemon.socket_path();
    let banned = poll_until(
        async || {
            let mut c = ControlClient::connect(&socket).await.unwrap();
            c.ok(&["get", "ssh", "banned", "192.0.2.2"]).await == Value::Int(1)
        },
        10,
    )
    .await;
    assert!(banned, "192.0.2.2 should cross the threshold");
    assert_eq!(
        client.ok(&["get", "ssh", "banned", "192.0.2.1"]).await,
        Value::Int(0)
    );
}

#[tokio::test]
async fn test_banip_with_time_listing() {
    let daemon = TestDaemon::spawn_without_db().await.unwrap();
    let mut client = ControlClient::connect(&daemon.socket_path()).await.unwrap();

    client.ok(&["add", "ssh", "polling"]).await;
    client.ok(&["set", "ssh", "bantime", "600"]).await;
    client.ok(&["start", "ssh"]).await;
    client.ok(&["set", "ssh", "banip", "192.0.2.1"]).await;

    let listing = client.ok(&["get", "ssh", "banip", "--with-time"]).await;
    let line = listing.as_list().unwrap()[0].to_string();
    assert!(line.starts_with("192.0.2.1 \t"));
    assert!(line.contains(" + 600 = "));

    // custom separator renders a joined string
    client.ok(&["set", "ssh", "banip", "192.0.2.2"]).await;
    let joined = client.ok(&["get", "ssh", "banip", ","]).await;
    assert_eq!(joined, Value::from("192.0.2.1,192.0.2.2"));
}

#[tokio::test]
async fn test_ban_expires_after_bantime() {
    let daemon = TestDaemon::spawn_without_db().await.unwrap();
    let mut client = ControlClient::connect(&daemon.socket_path()).await.unwrap();

    client.ok(&["add", "ssh", "polling"]).await;
    client.ok(&["set", "ssh", "bantime", "1"]).await;
    client.ok(&["start", "ssh"]).await;
    client.ok(&["set", "ssh", "banip", "192.0.2.1"]).await;

    let socket = daemon.socket_path();
    let expired = poll_until(
        async || {
            let mut c = ControlClient::connect(&socket).await.unwrap();
            c.ok(&["get", "ssh", "banned", "192.0.2.1"]).await == Value::Int(0)
        },
        10,
    )
    .await;
    assert!(expired, "the ban should expire");
}

#[tokio::test]
async fn test_non_ip_identifier_is_tolerated() {
    let daemon = TestDaemon::spawn_without_db().await.unwrap();
    let mut client = ControlClient::connect(&daemon.socket_path()).await.unwrap();

    client.ok(&["add", "ssh", "polling"]).await;
    client.ok(&["start", "ssh"]).await;

    assert_eq!(
        client.ok(&["set", "ssh", "banip", "Badger"]).await,
        Value::Int(1)
    );
    assert_eq!(
        client.ok(&["get", "ssh", "banned", "Badger"]).await,
        Value::Int(1)
    );
}

#[tokio::test]
async fn test_server_level_banned_and_unban() {
    let daemon = TestDaemon::spawn_without_db().await.unwrap();
    let mut client = ControlClient::connect(&daemon.socket_path()).await.unwrap();

    for jail in ["ssh", "web"] {
        client.ok(&["add", jail, "polling"]).await;
        client.ok(&["start", jail]).await;
    }
    client.ok(&["set", "ssh", "banip", "192.0.2.1"]).await;
    client.ok(&["set", "web", "banip", "192.0.2.1", "192.0.2.2"]).await;

    // banned map: jail -> ids
    let map = client.ok(&["banned"]).await.to_string();
    assert!(map.contains("ssh"));
    assert!(map.contains("192.0.2.2"));

    // per-ip listing of jails
    let per_ip = client.ok(&["banned", "192.0.2.1", "192.0.2.9"]).await;
    let rows = per_ip.as_list().unwrap();
    assert_eq!(rows[0].to_string(), "[ssh, web]");
    assert_eq!(rows[1].to_string(), "[]");

    // unban across all jails
    assert_eq!(client.ok(&["unban", "192.0.2.1"]).await, Value::Int(2));
    assert_eq!(
        client.ok(&["get", "web", "banned", "192.0.2.1"]).await,
        Value::Int(0)
    );
    assert_eq!(client.ok(&["unban", "--all"]).await, Value::Int(1));
}
