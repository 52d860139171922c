use bitcoin::{Address, OutPoint, ScriptBuf};
use tokio::sync::watch;

use crate::chain::BlockStamp;
use crate::notifications::NotificationSink;

/// An outpoint whose spend should be reported, with the script it locks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchedInput {
    pub outpoint: OutPoint,
    pub script_pubkey: ScriptBuf,
}

impl WatchedInput {
    pub fn new(outpoint: OutPoint, address: &Address) -> Self {
        Self {
            outpoint,
            script_pubkey: address.script_pubkey(),
        }
    }
}

/// Everything a freshly constructed rescan worker needs.
#[derive(Debug, Clone)]
pub struct RescanOptions {
    pub start: BlockStamp,
    /// Stop after this block. `None` follows the tip indefinitely.
    pub end: Option<BlockStamp>,
    pub watch_addrs: Vec<Address>,
    pub watch_inputs: Vec<WatchedInput>,
    /// Fires when the owning client tears this worker down.
    pub quit: QuitSignal,
    /// Where the worker reports connected blocks, matches and progress.
    pub notifications: NotificationSink,
}

/// Incremental watch-list growth applied to a running worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RescanUpdate {
    pub addrs: Vec<Address>,
    pub inputs: Vec<WatchedInput>,
}

/// Owning side of a worker's quit signal. Dropping it also quits.
#[derive(Debug)]
pub struct QuitHandle {
    tx: watch::Sender<bool>,
}

impl QuitHandle {
    pub fn quit(&self) {
        self.tx.send_replace(true);
    }
}

/// Observing side of a worker's quit signal. Cheap to clone into worker tasks.
#[derive(Debug, Clone)]
pub struct QuitSignal {
    rx: watch::Receiver<bool>,
}

impl QuitSignal {
    pub fn pair() -> (QuitHandle, QuitSignal) {
        let (tx, rx) = watch::channel(false);
        (QuitHandle { tx }, QuitSignal { rx })
    }

    pub fn is_quit(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once quit was requested or the handle is gone.
    pub async fn quitted(&mut self) {
        let _ = self.rx.wait_for(|quit| *quit).await;
    }
}
