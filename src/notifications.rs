//! Chain events delivered to whoever consumes the client's notification stream.
//!
//! Rescan workers publish through a [`NotificationSink`]; the client adds its own
//! lifecycle events and forwards worker errors. One channel exists per lifecycle
//! generation and it closes once that generation's dispatcher and workers are gone.

use bitcoin::Transaction;
use tokio::sync::mpsc;

use crate::chain::BlockStamp;

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// The client finished `start` and is accepting requests.
    ClientConnected,
    BlockConnected(BlockStamp),
    BlockDisconnected(BlockStamp),
    /// A connected block together with the transactions that matched the watch-list.
    FilteredBlockConnected {
        stamp: BlockStamp,
        relevant_txs: Vec<Transaction>,
    },
    RescanProgress(BlockStamp),
    /// The rescan reached (or already was at) this block.
    RescanFinished(BlockStamp),
    /// A worker reported a failure on its event stream. The client keeps running.
    RescanError(String),
}

/// Cloneable publishing end of a notification stream.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl NotificationSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A sink nobody listens to. Everything sent to it is discarded.
    pub fn detached() -> Self {
        Self::channel().0
    }

    /// Queues a notification. Returns `false` once nobody can receive it anymore.
    pub fn notify(&self, notification: Notification) -> bool {
        log::trace!("[NOTIFY] {:?}", notification);
        self.tx.send(notification).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
