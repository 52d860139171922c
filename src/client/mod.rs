//! Chain client: lifecycle controller and public surface.
//!
//! # Architecture
//! * **[`ChainClient`]**: what applications hold. Lifecycle calls (`start`,
//!   `stop`, `wait_for_shutdown`) plus request and chain pass-through methods.
//! * **Dispatcher** (`coordinator`): a task per generation that serializes
//!   every request against the state machine.
//! * **State machine** (`state`): owns the live rescan worker and watch-list.
//!   Built with the client and lent to whichever dispatcher is running, so the
//!   watch-list survives restarts.
//!
//! A *generation* is one `start`→`stop` span. Each gets its own request channel,
//! notification stream and dispatcher; the client itself can be started again
//! once the previous generation has wound down.

mod coordinator;
mod state;
mod types;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bitcoin::bip158::BlockFilter;
use bitcoin::{block, Address, Block, BlockHash, OutPoint, Transaction, Txid};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::chain::{BlockStamp, ChainService, FilterType, QueryOptions};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::notifications::{Notification, NotificationSink};
use crate::rescan::RescanFactory;

use coordinator::{Dispatcher, Envelope, MachineSlot, Request};
use state::ClientStateMachine;

pub use types::WatchRequest;

const BACKEND_NAME: &str = "cfilter";

struct Generation {
    id: u64,
    requests: mpsc::Sender<Envelope>,
    shutdown: oneshot::Sender<()>,
    done: watch::Receiver<bool>,
    notifications: Option<mpsc::UnboundedReceiver<Notification>>,
}

enum Lifecycle {
    /// Not running. `last` is the completion signal of the most recent generation,
    /// `None` if the client was never started.
    Idle { last: Option<watch::Receiver<bool>> },
    Running(Generation),
}

/// Chain notification client over a compact-filter chain service.
pub struct ChainClient<C> {
    chain: Arc<C>,
    factory: Arc<dyn RescanFactory>,
    config: ClientConfig,
    is_scanning: Arc<AtomicBool>,
    lifecycle: Mutex<Lifecycle>,
    /// Holds the state machine while no dispatcher is running.
    parked: MachineSlot,
    generations: AtomicU64,
    /// Bumped by every `stop`; a `start` that sees it move gives up.
    stops: AtomicU64,
}

impl<C: ChainService> ChainClient<C> {
    pub fn new(chain: Arc<C>, factory: Arc<dyn RescanFactory>, config: ClientConfig) -> Self {
        let is_scanning = Arc::new(AtomicBool::new(false));
        let machine = ClientStateMachine::new(factory.clone(), is_scanning.clone(), &config);
        Self {
            chain,
            factory,
            config,
            is_scanning,
            lifecycle: Mutex::new(Lifecycle::Idle { last: None }),
            parked: Arc::new(Mutex::new(Some(machine))),
            generations: AtomicU64::new(0),
            stops: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts the chain service and a fresh dispatcher. A no-op while running.
    ///
    /// If the previous generation is still winding down, waits for it first
    /// (bounded by `start_timeout`). A `stop` issued before this returns wins:
    /// nothing is left running and the call fails with `Stopped`.
    pub async fn start(&self) -> Result<()> {
        let stops = self.stops.load(Ordering::Acquire);

        if let Some(previous) = self.winding_down() {
            log::debug!("[CLIENT] start: waiting for previous generation to finish");
            tokio::time::timeout(self.config.start_timeout, wait_done(previous))
                .await
                .map_err(|_| ClientError::Timeout("previous generation to shut down"))?;
        }

        self.chain.start().await.map_err(ClientError::ChainService)?;

        let mut lifecycle = self.lifecycle();
        if let Lifecycle::Running(generation) = &*lifecycle {
            log::debug!("[CLIENT] start: generation {} already running", generation.id);
            return Ok(());
        }
        if self.stops.load(Ordering::Acquire) != stops {
            log::info!("[CLIENT] start: stopped before it completed");
            return Err(ClientError::Stopped);
        }

        let id = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let (requests_tx, requests_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(false);
        let (sink, notifications) = NotificationSink::channel();

        let mut machine = self.unpark();
        machine.attach(sink.clone());
        sink.notify(Notification::ClientConnected);
        let dispatcher = Dispatcher::new(
            id,
            self.chain.clone(),
            machine,
            self.parked.clone(),
            requests_rx,
            sink,
            &self.config,
        );
        tokio::spawn(dispatcher.run(shutdown_rx, done_tx));

        *lifecycle = Lifecycle::Running(Generation {
            id,
            requests: requests_tx,
            shutdown: shutdown_tx,
            done: done_rx,
            notifications: Some(notifications),
        });
        log::info!("[CLIENT] started generation {} ({} backend)", id, BACKEND_NAME);
        Ok(())
    }

    /// Signals the running generation to shut down and returns immediately.
    /// Idempotent; use [`Self::wait_for_shutdown`] to block until it is done.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle();
        self.stops.fetch_add(1, Ordering::AcqRel);
        match std::mem::replace(&mut *lifecycle, Lifecycle::Idle { last: None }) {
            Lifecycle::Running(Generation { id, shutdown, done, .. }) => {
                log::info!("[CLIENT] stopping generation {}", id);
                // The dispatcher may already be gone; `done` covers that case.
                let _ = shutdown.send(());
                *lifecycle = Lifecycle::Idle { last: Some(done) };
            }
            idle => {
                log::trace!("[CLIENT] stop: not running");
                *lifecycle = idle;
            }
        }
    }

    /// Resolves once the most recent generation has fully shut down, its worker
    /// included. Resolves immediately if the client was never started.
    pub async fn wait_for_shutdown(&self) {
        let done = match &*self.lifecycle() {
            Lifecycle::Running(generation) => Some(generation.done.clone()),
            Lifecycle::Idle { last } => last.clone(),
        };
        if let Some(done) = done {
            wait_done(done).await;
        }
    }

    pub async fn wait_for_shutdown_timeout(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.wait_for_shutdown())
            .await
            .map_err(|_| ClientError::Timeout("client shutdown"))
    }

    pub fn is_started(&self) -> bool {
        matches!(&*self.lifecycle(), Lifecycle::Running(_))
    }

    /// Hands out the current generation's notification stream. Returns `None`
    /// when not running or when it was already taken.
    pub fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        match &mut *self.lifecycle() {
            Lifecycle::Running(generation) => generation.notifications.take(),
            Lifecycle::Idle { .. } => None,
        }
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Adds addresses to the watch-list, extending the live rescan or starting one
    /// at the current tip. Returns once the change is in effect.
    pub async fn notify_received(&self, addrs: &[Address]) -> Result<()> {
        let request = WatchRequest::new().with_addrs(addrs.iter().cloned());
        self.submit(Request::NotifyReceived(request)).await
    }

    /// Replaces the live rescan with one starting at `start` (genesis if `None`)
    /// that watches the cumulative watch-list plus the given items.
    pub async fn rescan(
        &self,
        start: Option<BlockHash>,
        addrs: &[Address],
        outpoints: &HashMap<OutPoint, Address>,
    ) -> Result<()> {
        let mut request = WatchRequest::new()
            .with_addrs(addrs.iter().cloned())
            .with_outpoints(outpoints);
        request.start = start;
        self.rescan_with(request).await
    }

    /// Like [`Self::rescan`], with an optional end block.
    pub async fn rescan_with(&self, request: WatchRequest) -> Result<()> {
        self.submit(Request::Rescan(request)).await
    }

    /// Whether a rescan worker is live. Never blocks on the dispatcher.
    pub fn is_scanning(&self) -> bool {
        self.is_scanning.load(Ordering::Acquire)
    }

    async fn submit(&self, request: Request) -> Result<()> {
        let requests = self.request_sender()?;
        let deadline = Instant::now() + self.config.request_timeout;
        let (reply, ack) = oneshot::channel();

        match tokio::time::timeout_at(deadline, requests.send(Envelope { request, reply })).await {
            Err(_) => return Err(ClientError::Timeout("request queue")),
            Ok(Err(_)) => return Err(ClientError::Stopped),
            Ok(Ok(())) => {}
        }
        drop(requests);

        match tokio::time::timeout_at(deadline, ack).await {
            Err(_) => Err(ClientError::Timeout("request to be applied")),
            Ok(Err(_)) => Err(ClientError::Stopped),
            Ok(Ok(result)) => result,
        }
    }

    fn request_sender(&self) -> Result<mpsc::Sender<Envelope>> {
        match &*self.lifecycle() {
            Lifecycle::Running(generation) => Ok(generation.requests.clone()),
            Lifecycle::Idle { last: None } => Err(ClientError::NotStarted),
            Lifecycle::Idle { last: Some(_) } => Err(ClientError::Stopped),
        }
    }

    // =========================================================================
    // Chain pass-through
    // =========================================================================

    pub fn backend(&self) -> &'static str {
        BACKEND_NAME
    }

    pub async fn get_block(&self, hash: BlockHash) -> Result<Block> {
        self.chain
            .get_block(hash, &QueryOptions::default())
            .await
            .map_err(ClientError::ChainService)
    }

    pub async fn get_block_height(&self, hash: BlockHash) -> Result<u32> {
        self.chain
            .get_block_height(hash)
            .await
            .map_err(ClientError::ChainService)
    }

    pub async fn get_block_hash(&self, height: u32) -> Result<BlockHash> {
        self.chain
            .get_block_hash(height)
            .await
            .map_err(ClientError::ChainService)
    }

    pub async fn get_block_header(&self, hash: BlockHash) -> Result<block::Header> {
        self.chain
            .get_block_header(hash)
            .await
            .map_err(ClientError::ChainService)
    }

    /// Hash and height of the best block.
    pub async fn get_best_block(&self) -> Result<(BlockHash, u32)> {
        let stamp = self.block_stamp().await?;
        Ok((stamp.hash, stamp.height))
    }

    pub async fn block_stamp(&self) -> Result<BlockStamp> {
        self.chain
            .best_block()
            .await
            .map_err(ClientError::ChainService)
    }

    pub fn is_current(&self) -> bool {
        self.chain.is_current()
    }

    pub async fn send_raw_transaction(&self, tx: &Transaction) -> Result<Txid> {
        self.chain
            .send_transaction(tx)
            .await
            .map_err(ClientError::ChainService)?;
        Ok(tx.compute_txid())
    }

    pub async fn get_cfilter(&self, hash: BlockHash, filter_type: FilterType) -> Result<BlockFilter> {
        self.chain
            .get_cfilter(hash, filter_type, &QueryOptions::default())
            .await
            .map_err(ClientError::ChainService)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the state machine back from the last generation. Only a dispatcher
    /// that died without tearing down leaves the slot empty.
    fn unpark(&self) -> ClientStateMachine {
        let parked = self
            .parked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        parked.unwrap_or_else(|| {
            log::warn!("[CLIENT] previous generation never parked its state, watch-list reset");
            ClientStateMachine::new(self.factory.clone(), self.is_scanning.clone(), &self.config)
        })
    }

    /// Completion signal of a stopped generation that has not finished yet.
    fn winding_down(&self) -> Option<watch::Receiver<bool>> {
        match &*self.lifecycle() {
            Lifecycle::Idle { last: Some(done) } if !*done.borrow() => Some(done.clone()),
            _ => None,
        }
    }
}

async fn wait_done(mut done: watch::Receiver<bool>) {
    // The sender only goes away after publishing `true`, so an error means done too.
    let _ = done.wait_for(|finished| *finished).await;
}
