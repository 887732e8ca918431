//! Control protocol surface: basic verbs, grammars, error replies.

mod common;

use common::{ControlClient, TestDaemon};
use jail_proto::Value;

#[tokio::test]
async fn test_ping_version_echo() {
    let daemon = TestDaemon::spawn_without_db().await.unwrap();
    let mut client = ControlClient::connect(&daemon.socket_path()).await.unwrap();

    assert_eq!(client.ok(&["ping"]).await, Value::from("pong"));

    let version = client.ok(&["version"]).await;
    assert!(version.to_string().starts_with("jaild "));

    assert_eq!(
        client.ok(&["echo", "foo", "bar"]).await,
        Value::list(["foo", "bar"])
    );
}

#[tokio::test]
async fn test_unknown_command_is_error() {
    let daemon = TestDaemon::spawn_without_db().await.unwrap();
    let mut client = ControlClient::connect(&daemon.socket_path()).await.unwrap();

    let text = client.err(&["frobnicate", "now"]).await;
    assert!(text.contains("Invalid command"));
}

#[tokio::test]
async fn test_time_interval_grammar() {
    let daemon = TestDaemon::spawn_without_db().await.unwrap();
    let mut client = ControlClient::connect(&daemon.socket_path()).await.unwrap();

    client.ok(&["add", "ssh", "polling"]).await;
    assert_eq!(
        client.ok(&["set", "ssh", "bantime", "15d 5h 30m"]).await,
        Value::Int(1_315_800)
    );
    assert_eq!(
        client.ok(&["get", "ssh", "bantime"]).await,
        Value::Int(1_315_800)
    );

    assert_eq!(
        client.ok(&["set", "ssh", "findtime", "10m"]).await,
        Value::Int(600)
    );
    let text = client.err(&["set", "ssh", "findtime", "10 parsecs"]).await;
    assert!(text.contains("invalid time interval"));
}

#[tokio::test]
async fn test_loglevel_and_logtarget() {
    let daemon = TestDaemon::spawn_without_db().await.unwrap();
    let mut client = ControlClient::connect(&daemon.socket_path()).await.unwrap();

    assert_eq!(
        client.ok(&["set", "loglevel", "HEAVYDEBUG"]).await,
        Value::from("HEAVYDEBUG")
    );
    assert_eq!(client.ok(&["get", "loglevel"]).await, Value::from("HEAVYDEBUG"));
    // numeric values are accepted too
    assert_eq!(client.ok(&["set", "loglevel", "30"]).await, Value::from("WARNING"));
    client.err(&["set", "loglevel", "CHATTY"]).await;

    let logfile = daemon.data_dir().join("daemon.log");
    let path = logfile.display().to_string();
    assert_eq!(
        client.ok(&["set", "logtarget", &path]).await,
        Value::from(path.clone())
    );
    assert_eq!(client.ok(&["get", "logtarget"]).await, Value::from(path));
    assert_eq!(client.ok(&["flushlogs"]).await, Value::from("rolled over"));
    client.ok(&["set", "logtarget", "STDERR"]).await;
}

#[tokio::test]
async fn test_status_aggregation() {
    let daemon = TestDaemon::spawn_without_db().await.unwrap();
    let mut client = ControlClient::connect(&daemon.socket_path()).await.unwrap();

    client.ok(&["add", "ssh", "polling"]).await;
    client.ok(&["add", "web", "polling"]).await;

    let status = client.ok(&["status"]).await.to_string();
    assert!(status.contains("Number of jail"));
    assert!(status.contains("ssh, web"));

    let all = client.ok(&["status", "--all"]).await.to_string();
    assert!(all.contains("Currently banned"));

    let jail = client.ok(&["status", "ssh"]).await.to_string();
    assert!(jail.contains("Currently failed"));

    let stats = client.ok(&["stats"]).await.to_string();
    assert!(stats.contains("polling"));

    client.err(&["status", "missing"]).await;
}

#[tokio::test]
async fn test_db_settings() {
    let daemon = TestDaemon::spawn_without_db().await.unwrap();
    let mut client = ControlClient::connect(&daemon.socket_path()).await.unwrap();

    assert_eq!(client.ok(&["get", "dbfile"]).await, Value::Nil);
    client.ok(&["set", "dbfile", ":memory:"]).await;
    assert_eq!(client.ok(&["get", "dbfile"]).await, Value::from(":memory:"));

    client.ok(&["set", "dbmaxmatches", "20"]).await;
    assert_eq!(client.ok(&["get", "dbmaxmatches"]).await, Value::Int(20));

    client.ok(&["set", "dbpurgeage", "1d"]).await;
    assert_eq!(client.ok(&["get", "dbpurgeage"]).await, Value::Int(86_400));

    // with a jail present the database can no longer be switched
    client.ok(&["add", "ssh", "polling"]).await;
    let text = client.err(&["set", "dbfile", "/tmp/other.sqlite3"]).await;
    assert!(text.contains("database"));
}
