//! The local control socket.
//!
//! An accept loop on a Unix socket; each connection gets a short-lived
//! handler that decodes command frames, runs them through the
//! transmitter and writes the reply frame back. Connections may pipeline
//! several commands; the close sentinel (or EOF) ends them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use jail_proto::{ClientFrame, FrameCodec};

use crate::error::Result;
use crate::server::Server;
use crate::transmitter::Transmitter;

/// Run the control socket until the server signals shutdown.
pub async fn serve(path: &Path, server: Arc<Server>) -> Result<()> {
    // a stale socket file from an unclean shutdown blocks the bind
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let listener = UnixListener::bind(path)?;
    info!(socket = %path.display(), "Control socket listening");

    let transmitter = Arc::new(Transmitter::new(server.clone()));
    let mut shutdown_rx = server.subscribe_shutdown();
    let socket_path = PathBuf::from(path);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let transmitter = transmitter.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, transmitter).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    drop(listener);
    let _ = std::fs::remove_file(&socket_path);
    info!("Control socket closed");
    Ok(())
}

async fn handle_connection(stream: UnixStream, transmitter: Arc<Transmitter>) {
    let mut framed = Framed::new(stream, FrameCodec);
    while let Some(frame) = framed.next().await {
        match frame {
            Ok(ClientFrame::Command(command)) => {
                let reply = transmitter.handle(&command).await;
                if let Err(e) = framed.send(reply).await {
                    debug!(error = %e, "Failed to send reply");
                    break;
                }
            }
            Ok(ClientFrame::Close) => break,
            Ok(ClientFrame::Empty) => continue,
            Err(e) => {
                warn!(error = %e, "Malformed frame, closing connection");
                break;
            }
        }
    }
}
