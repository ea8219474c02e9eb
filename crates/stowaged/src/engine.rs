//! The single-threaded volume engine.
//!
//! All event dispatch, command handling, and state mutation happen on
//! this one thread, draining its channel in FIFO order. Long-running
//! operations (probes, mounts, retry sleeps) intentionally block it, so
//! the control channel always observes a consistent state before the
//! next request is dequeued.

use tokio::sync::{mpsc, oneshot};

use stowage::{BlockEvent, VolumeManager};

use crate::dispatch::{self, Reply};

/// Work items the engine drains.
#[derive(Debug)]
pub enum EngineRequest {
    /// Control-surface command line from a connected client.
    Command {
        /// Peer uid, for privileged commands.
        uid: u32,
        /// The raw request line.
        line: String,
        /// Where the replies go.
        reply: oneshot::Sender<Vec<Reply>>,
    },
    /// Parsed kernel block event.
    Kernel(BlockEvent),
}

/// Run the engine until every sender is gone.
pub fn run(mut manager: VolumeManager, mut rx: mpsc::UnboundedReceiver<EngineRequest>) {
    while let Some(request) = rx.blocking_recv() {
        match request {
            EngineRequest::Kernel(event) => {
                if let Err(err) = manager.dispatch_block_event(&event) {
                    // Unmatched and malformed events are dropped, never
                    // allowed to touch state.
                    tracing::debug!(%err, devpath = %event.devpath, "kernel event dropped");
                }
            }
            EngineRequest::Command { uid, line, reply } => {
                let replies = dispatch::dispatch(&mut manager, uid, &line);
                // Client may have disconnected while we worked.
                let _ = reply.send(replies);
            }
        }
    }
    tracing::info!("engine channel closed, exiting");
}
