//! Line-oriented control socket.
//!
//! Each client sends one command per line and receives `<code> <text>`
//! reply lines; unsolicited broadcasts are interleaved onto every
//! connection. Requests funnel through the engine channel, so a client
//! always observes the state its previous command left behind.

use std::io;
use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};

use stowage::Broadcaster;

use crate::engine::EngineRequest;

/// Bind the control socket and serve clients forever.
pub async fn serve(
    path: &Path,
    engine: mpsc::UnboundedSender<EngineRequest>,
    broadcaster: Broadcaster,
) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // A previous instance may have left its socket behind.
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    let listener = UnixListener::bind(path)?;
    tracing::info!(socket = %path.display(), "control socket listening");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let engine = engine.clone();
        let events = broadcaster.subscribe();
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, engine, events).await {
                tracing::debug!(%err, "control connection closed");
            }
        });
    }
}

async fn handle_client(
    stream: UnixStream,
    engine: mpsc::UnboundedSender<EngineRequest>,
    mut events: tokio::sync::broadcast::Receiver<stowage::Broadcast>,
) -> io::Result<()> {
    let uid = stream.peer_cred().map(|cred| cred.uid()).unwrap_or(u32::MAX);
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }

                let (tx, rx) = oneshot::channel();
                if engine
                    .send(EngineRequest::Command { uid, line, reply: tx })
                    .is_err()
                {
                    break;
                }
                let Ok(replies) = rx.await else { break };
                for reply in replies {
                    write_half
                        .write_all(format!("{} {}\n", reply.code, reply.message).as_bytes())
                        .await?;
                }
            }
            event = events.recv() => {
                match event {
                    Ok(broadcast) => {
                        write_half
                            .write_all(
                                format!("{} {}\n", broadcast.code.as_i32(), broadcast.message)
                                    .as_bytes(),
                            )
                            .await?;
                    }
                    // Slow consumers lose the oldest events, nothing more.
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "control client lagged behind broadcasts");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
    Ok(())
}
