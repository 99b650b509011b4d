//! Outbound frame queue.
//!
//! Each connection writes through exactly one outbox, drained by one writer
//! task, so frames from concurrent producers never interleave.

use cable_protocol::ServerFrame;
use tokio::sync::mpsc;

/// An item for the transport writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    /// Send a frame to the client.
    Frame(ServerFrame),
    /// Close the transport.
    Close,
}

/// Sending half of a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Outbox {
    /// Create an outbox and the receiver the transport writer drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a frame. Returns `false` if the writer is gone.
    pub fn send(&self, frame: ServerFrame) -> bool {
        self.tx.send(Outgoing::Frame(frame)).is_ok()
    }

    /// Ask the writer to close the transport.
    pub fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }

    /// Check if the writer has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
