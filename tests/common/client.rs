//! Test control client.
//!
//! Drives a daemon over its Unix control socket and asserts on replies.

#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use jail_proto::{ClientCodec, CommandFrame, Reply, Value};

/// Per-command reply timeout.
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// A control socket client.
pub struct ControlClient {
    framed: Framed<UnixStream, ClientCodec>,
}

impl ControlClient {
    /// Connect to a daemon's control socket.
    pub async fn connect(socket: &Path) -> anyhow::Result<Self> {
        let stream = UnixStream::connect(socket).await?;
        Ok(ControlClient {
            framed: Framed::new(stream, ClientCodec),
        })
    }

    /// Send one command and wait for its reply.
    pub async fn send(&mut self, tokens: &[&str]) -> anyhow::Result<Reply> {
        self.framed.send(CommandFrame::from(tokens)).await?;
        match timeout(REPLY_TIMEOUT, self.framed.next()).await {
            Ok(Some(reply)) => Ok(reply?),
            Ok(None) => anyhow::bail!("connection closed before reply"),
            Err(_) => anyhow::bail!("timed out waiting for reply to {:?}", tokens),
        }
    }

    /// Send a command that must succeed; returns its value.
    pub async fn ok(&mut self, tokens: &[&str]) -> Value {
        let reply = self.send(tokens).await.expect("send failed");
        assert!(
            reply.is_ok(),
            "command {:?} failed: {}",
            tokens,
            reply.value
        );
        reply.value
    }

    /// Send a command that must fail; returns the error text.
    pub async fn err(&mut self, tokens: &[&str]) -> String {
        let reply = self.send(tokens).await.expect("send failed");
        assert!(!reply.is_ok(), "command {:?} unexpectedly succeeded", tokens);
        reply.value.to_string()
    }
}
