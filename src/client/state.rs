//! Client state machine.
//!
//! Owns the live rescan worker (if any) and the cumulative watch-list. Built once
//! per client and lent to each generation's dispatcher, which drives it one
//! [`Command`] at a time and hands it back on teardown. None of its methods need
//! to be safe against concurrent callers.
//!
//! # States
//! * `Idle`: no worker.
//! * `Scanning`: exactly one live worker accepting updates.
//!
//! A restart tears the old worker down and installs the new one inside a single
//! `apply`, so the "restarting" step is never visible outside this module: the
//! published scanning flag is only refreshed once `apply` is done.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bitcoin::{Address, OutPoint};
use tokio::sync::mpsc;

use crate::chain::BlockStamp;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::notifications::NotificationSink;
use crate::rescan::{
    QuitHandle, QuitSignal, RescanError, RescanFactory, RescanOptions, RescanUpdate, Rescanner,
    WatchedInput,
};

/// A state transition, already resolved against the chain.
#[derive(Debug)]
pub(crate) enum Command {
    /// Replace whatever runs now with a worker seeded from the cumulative watch-list.
    StartRescan {
        start: BlockStamp,
        end: Option<BlockStamp>,
    },
    /// Extend the live worker's watch-list.
    UpdateRescan(RescanUpdate),
    StopRescan,
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Command::StartRescan { .. } => "StartRescan",
            Command::UpdateRescan(_) => "UpdateRescan",
            Command::StopRescan => "StopRescan",
        }
    }
}

/// Every address and outpoint registered since the client was built.
#[derive(Debug, Default)]
pub(crate) struct WatchList {
    addrs: Vec<Address>,
    inputs: Vec<WatchedInput>,
    seen_addrs: HashSet<Address>,
    seen_outpoints: HashSet<OutPoint>,
}

impl WatchList {
    /// Folds new items in, keeping first-registration order. Returns how many were new.
    pub(crate) fn extend(&mut self, addrs: &[Address], inputs: &[WatchedInput]) -> usize {
        let mut added = 0;
        for addr in addrs {
            if self.seen_addrs.insert(addr.clone()) {
                self.addrs.push(addr.clone());
                added += 1;
            }
        }
        for input in inputs {
            if self.seen_outpoints.insert(input.outpoint) {
                self.inputs.push(input.clone());
                added += 1;
            }
        }
        added
    }

    pub(crate) fn addrs(&self) -> &[Address] {
        &self.addrs
    }

    pub(crate) fn inputs(&self) -> &[WatchedInput] {
        &self.inputs
    }

    pub(crate) fn len(&self) -> usize {
        self.addrs.len() + self.inputs.len()
    }
}

struct ActiveRescan {
    worker: Box<dyn Rescanner>,
    quit: QuitHandle,
    /// `None` once the worker closed its stream.
    events: Option<mpsc::Receiver<RescanError>>,
    start: BlockStamp,
}

impl ActiveRescan {
    async fn shut_down(mut self, grace: Duration) {
        // Drop the stream first so a worker blocked on reporting sees the quit.
        self.events = None;
        self.quit.quit();

        if tokio::time::timeout(grace, self.worker.wait_for_shutdown())
            .await
            .is_err()
        {
            log::warn!(
                "[RESCAN] worker started at {} still running after {:?}, abandoning it",
                self.start,
                grace
            );
        }
    }
}

enum ScanState {
    Idle,
    Scanning(ActiveRescan),
}

pub(crate) struct ClientStateMachine {
    scan: ScanState,
    watch_list: WatchList,
    factory: Arc<dyn RescanFactory>,
    notifications: NotificationSink,
    /// Published copy of `scan`, readable from any thread.
    is_scanning: Arc<AtomicBool>,
    update_timeout: Duration,
    shutdown_timeout: Duration,
}

impl ClientStateMachine {
    pub(crate) fn new(
        factory: Arc<dyn RescanFactory>,
        is_scanning: Arc<AtomicBool>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            scan: ScanState::Idle,
            watch_list: WatchList::default(),
            factory,
            notifications: NotificationSink::detached(),
            is_scanning,
            update_timeout: config.update_timeout,
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Routes notifications of workers started from now on to `sink`.
    pub(crate) fn attach(&mut self, sink: NotificationSink) {
        self.notifications = sink;
    }

    /// Drops the generation's sink so its notification stream can close.
    pub(crate) fn detach(&mut self) {
        self.notifications = NotificationSink::detached();
    }

    pub(crate) fn is_scanning(&self) -> bool {
        matches!(self.scan, ScanState::Scanning(_))
    }

    pub(crate) fn watch_list(&self) -> &WatchList {
        &self.watch_list
    }

    pub(crate) fn watch_list_mut(&mut self) -> &mut WatchList {
        &mut self.watch_list
    }

    /// Applies one transition and publishes the resulting scanning flag.
    pub(crate) async fn apply(&mut self, command: Command) -> Result<()> {
        let result = match command {
            Command::StartRescan { start, end } => self.start_rescan(start, end).await,
            Command::UpdateRescan(update) => self.update_rescan(update).await,
            Command::StopRescan => {
                self.stop_rescan().await;
                Ok(())
            }
        };
        self.publish();
        result
    }

    /// Next error reported by the live worker. Pends forever while there is none.
    pub(crate) async fn next_event(&mut self) -> RescanError {
        if let ScanState::Scanning(active) = &mut self.scan {
            if let Some(events) = active.events.as_mut() {
                match events.recv().await {
                    Some(err) => return err,
                    None => {
                        log::debug!("[RESCAN] worker started at {} closed its stream", active.start);
                        active.events = None;
                    }
                }
            }
        }
        std::future::pending().await
    }

    async fn start_rescan(&mut self, start: BlockStamp, end: Option<BlockStamp>) -> Result<()> {
        self.stop_rescan().await;

        let (quit, signal) = QuitSignal::pair();
        let options = RescanOptions {
            start,
            end,
            watch_addrs: self.watch_list.addrs().to_vec(),
            watch_inputs: self.watch_list.inputs().to_vec(),
            quit: signal,
            notifications: self.notifications.clone(),
        };

        let mut worker = self
            .factory
            .new_rescanner(options)
            .map_err(ClientError::RescanSetup)?;
        let events = worker.start();

        log::debug!(
            "[RESCAN] worker started at {} watching {} items",
            start,
            self.watch_list.len()
        );
        self.scan = ScanState::Scanning(ActiveRescan {
            worker,
            quit,
            events: Some(events),
            start,
        });
        Ok(())
    }

    async fn update_rescan(&mut self, update: RescanUpdate) -> Result<()> {
        let ScanState::Scanning(active) = &self.scan else {
            return Err(ClientError::RescanUpdate(anyhow!("no rescan is running")));
        };

        match tokio::time::timeout(self.update_timeout, active.worker.update(update)).await {
            Ok(applied) => applied.map_err(ClientError::RescanUpdate),
            Err(_) => Err(ClientError::Timeout("rescan update")),
        }
    }

    async fn stop_rescan(&mut self) {
        if let ScanState::Scanning(active) = std::mem::replace(&mut self.scan, ScanState::Idle) {
            log::debug!("[RESCAN] stopping worker started at {}", active.start);
            active.shut_down(self.shutdown_timeout).await;
        }
    }

    fn publish(&self) {
        self.is_scanning
            .store(self.is_scanning(), Ordering::Release);
    }
}
