//! Message plumbing between the coordinator and its children.
//!
//! Two primitives: a point-to-point pipe from the coordinator to one child,
//! and a fan-in group over which the coordinator receives from any child.
//! Channels are unbounded; flow control belongs to the ingest-rate budget
//! and the per-worker request cap, not to channel backpressure.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

/// The receiving side has gone away.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("channel closed")]
pub struct ChannelClosed;

/// Sending half of a point-to-point pipe. Cloneable so the coordinator
/// can keep a handle for the poison pill while a child feeds the pipe.
#[derive(Debug)]
pub struct PipeSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for PipeSender<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

/// Receiving half of a point-to-point pipe.
#[derive(Debug)]
pub struct PipeReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

/// Create a one-way pipe between the coordinator and one child.
#[must_use]
pub fn pipe<T>() -> (PipeSender<T>, PipeReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PipeSender { tx }, PipeReceiver { rx })
}

impl<T> PipeSender<T> {
    /// Hand a message to the peer.
    ///
    /// # Errors
    ///
    /// [`ChannelClosed`] if the peer has dropped its receiver.
    pub fn send(&self, msg: T) -> Result<(), ChannelClosed> {
        self.tx.send(msg).map_err(|_| ChannelClosed)
    }
}

impl<T> PipeReceiver<T> {
    /// Await the next message; `None` once the sender is gone and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take a message only if one is already queued.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// Cloneable sending half of a fan-in group; one per child.
#[derive(Debug)]
pub struct GroupSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for GroupSender<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T> GroupSender<T> {
    /// Hand a message to the coordinator.
    ///
    /// # Errors
    ///
    /// [`ChannelClosed`] if the coordinator has dropped the group.
    pub fn send(&self, msg: T) -> Result<(), ChannelClosed> {
        self.tx.send(msg).map_err(|_| ChannelClosed)
    }
}

/// Coordinator-side receiver multiplexing all children.
///
/// Arrival order is delivery order, which keeps receives fair enough: no
/// child waits longer than one `recv_timeout` window once its message is
/// queued.
#[derive(Debug)]
pub struct FanIn<T> {
    rx: mpsc::UnboundedReceiver<T>,
    tx: mpsc::UnboundedSender<T>,
}

/// Create a fan-in group.
#[must_use]
pub fn fan_in<T>() -> FanIn<T> {
    let (tx, rx) = mpsc::unbounded_channel();
    FanIn { rx, tx }
}

impl<T> FanIn<T> {
    /// A new sending handle for one child.
    #[must_use]
    pub fn sender(&self) -> GroupSender<T> {
        GroupSender { tx: self.tx.clone() }
    }

    /// Receive every message that becomes ready within `timeout`.
    ///
    /// Waits up to `timeout` for the first message, then drains whatever
    /// else is already queued. Returns an empty vector on a quiet window.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Vec<T> {
        let mut out = Vec::new();
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(first)) => {
                out.push(first);
                while let Ok(more) = self.rx.try_recv() {
                    out.push(more);
                }
            }
            Ok(None) | Err(_) => {}
        }
        out
    }
}
