//! Subscriber stream listener.
//!
//! Long-lived clients connect to a Unix socket and receive every bus
//! event published while they are attached, one JSON object per line, in
//! arrival order. A connection registers its subscription on accept and
//! releases it the moment the client goes away, so no delivery queue
//! outlives its client.

use crate::events::EventBus;
use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Handle for the running listener.
///
/// Dropping it (or calling [`shutdown`](Self::shutdown)) stops the accept
/// loop; connections already forwarding events finish on their own when
/// their client disconnects.
pub struct StreamHandle {
    stop_tx: Option<mpsc::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl StreamHandle {
    /// Stops accepting new connections and waits for the accept loop.
    pub async fn shutdown(mut self) {
        self.stop_tx.take();
        let _ = self.task.await;
    }
}

/// Binds the event socket and spawns the accept loop.
pub fn run_listener(bus: EventBus, socket_path: PathBuf) -> Result<StreamHandle> {
    use tokio::net::UnixListener;

    if socket_path.exists() {
        // A connectable socket means another daemon owns it; a dead one
        // is left over from an unclean exit and can be removed.
        if std::os::unix::net::UnixStream::connect(&socket_path).is_ok() {
            anyhow::bail!(
                "Another daemon is already listening on {}",
                socket_path.display()
            );
        }
        std::fs::remove_file(&socket_path).context("Failed to remove stale socket")?;
    }

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create socket directory: {}", parent.display()))?;
    }

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("Failed to bind event socket: {}", socket_path.display()))?;
    info!("Event stream listening on {}", socket_path.display());

    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let bus = bus.clone();
                            tokio::spawn(async move {
                                let (reader, writer) = stream.into_split();
                                serve_connection(bus, reader, writer).await;
                            });
                        }
                        Err(e) => {
                            warn!("Failed to accept event stream client: {}", e);
                        }
                    }
                }
                _ = stop_rx.recv() => break,
            }
        }
        let _ = std::fs::remove_file(&socket_path);
    });

    Ok(StreamHandle {
        stop_tx: Some(stop_tx),
        task,
    })
}

/// Forwards bus events to one client until it disconnects.
///
/// The read half is only watched for EOF; anything the client writes is
/// discarded. The subscription is released on every exit path.
async fn serve_connection<R, W>(bus: EventBus, mut reader: R, mut writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut subscription = bus.subscribe().await;
    debug!(
        "Event stream client attached ({} active)",
        bus.subscriber_count().await
    );

    let mut discard = [0u8; 256];
    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let line = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to serialize event: {}", e);
                        continue;
                    }
                };
                if writer.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
                    break;
                }
            }
            read = reader.read(&mut discard) => {
                match read {
                    // EOF or error: client went away.
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        }
    }

    bus.unsubscribe(&subscription).await;
    debug!(
        "Event stream client detached ({} active)",
        bus.subscriber_count().await
    );
}
