//! FIFO signal delivery between workflow executions.
//!
//! Signals sent from one execution to another are delivered in send order;
//! sending never blocks. Receiving is a workflow suspension point.

use thiserror::Error;
use tokio::sync::mpsc;

/// The receiving workflow has completed and dropped its receiver.
#[derive(Debug, Error)]
#[error("signal target is gone")]
pub struct SignalClosed;

/// Sending half of a signal channel.
#[derive(Debug)]
pub struct SignalSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

// Manual impl: `#[derive(Clone)]` would bound `T: Clone` needlessly.
impl<T> Clone for SignalSender<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T> SignalSender<T> {
    /// Delivers a signal. Never blocks.
    pub fn send(&self, signal: T) -> Result<(), SignalClosed> {
        self.tx.send(signal).map_err(|_| SignalClosed)
    }
}

/// Receiving half of a signal channel, held by the target workflow.
#[derive(Debug)]
pub struct SignalReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> SignalReceiver<T> {
    /// Awaits the next signal in FIFO order. Returns `None` once every
    /// sender is gone and the buffer is drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// Creates a signal channel.
pub fn signal_channel<T>() -> (SignalSender<T>, SignalReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SignalSender { tx }, SignalReceiver { rx })
}
