//! Request coordinator.
//!
//! One dispatcher task exists per lifecycle generation. It is the only code that
//! touches the [`ClientStateMachine`], which makes every state check and the
//! transition that follows it a single step.
//!
//! # Loop
//! 1. **Shutdown** wins over everything else (`biased`), including a request
//!    that is halfway through; its caller is told `Stopped`.
//! 2. **Requests** arrive over a single-slot channel; each is folded into a
//!    [`Command`], applied, and acknowledged to the waiting caller.
//! 3. **Worker errors** from the live rescan are forwarded as notifications.
//!
//! On exit the live worker is stopped, queued callers are released with
//! `Stopped`, the state machine is parked for the next generation, and only
//! then is the generation reported as done.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bitcoin::BlockHash;
use tokio::sync::{mpsc, oneshot, watch};

use super::state::{ClientStateMachine, Command};
use super::types::WatchRequest;
use crate::chain::{BlockStamp, ChainService};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::notifications::{Notification, NotificationSink};
use crate::rescan::RescanUpdate;

/// Where the state machine waits between generations.
pub(crate) type MachineSlot = Arc<Mutex<Option<ClientStateMachine>>>;

#[derive(Debug)]
pub(crate) enum Request {
    /// Watch more items, continuing the current rescan or starting one at the tip.
    NotifyReceived(WatchRequest),
    /// Watch more items and restart scanning over the requested range.
    Rescan(WatchRequest),
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Request::NotifyReceived(_) => "NotifyReceived",
            Request::Rescan(_) => "Rescan",
        }
    }
}

/// A request together with the slot its outcome is reported on.
pub(crate) struct Envelope {
    pub request: Request,
    pub reply: oneshot::Sender<Result<()>>,
}

pub(crate) struct Dispatcher<C> {
    generation: u64,
    chain: Arc<C>,
    machine: ClientStateMachine,
    parking: MachineSlot,
    requests: mpsc::Receiver<Envelope>,
    notifications: NotificationSink,
    chain_timeout: Duration,
    handled: u64,
    t0: Instant,
}

impl<C: ChainService> Dispatcher<C> {
    pub(crate) fn new(
        generation: u64,
        chain: Arc<C>,
        machine: ClientStateMachine,
        parking: MachineSlot,
        requests: mpsc::Receiver<Envelope>,
        notifications: NotificationSink,
        config: &ClientConfig,
    ) -> Self {
        Self {
            generation,
            chain,
            machine,
            parking,
            requests,
            notifications,
            chain_timeout: config.request_timeout,
            handled: 0,
            t0: Instant::now(),
        }
    }

    /// Serves requests until shutdown, then flips `done` once everything this
    /// generation owned has been released.
    pub(crate) async fn run(
        mut self,
        mut shutdown: oneshot::Receiver<()>,
        done: watch::Sender<bool>,
    ) {
        self.info("dispatcher running");

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    self.debug("shutdown requested");
                    break;
                }

                envelope = self.requests.recv() => match envelope {
                    Some(envelope) => {
                        if self.dispatch(envelope, &mut shutdown).await.is_break() {
                            break;
                        }
                    }
                    None => {
                        self.debug("request channel closed");
                        break;
                    }
                },

                err = self.machine.next_event() => {
                    log::error!("[DISPATCH] gen {}: rescan error: {:#}", self.generation, err);
                    self.notifications
                        .notify(Notification::RescanError(format!("{:#}", err)));
                }
            }
        }

        // Whatever is still queued is dropped with the receiver below; those
        // callers see their reply slot close and report `Stopped`.
        self.requests.close();
        if let Err(err) = self.machine.apply(Command::StopRescan).await {
            log::warn!("[DISPATCH] gen {}: teardown: {}", self.generation, err);
        }

        let Dispatcher {
            generation,
            chain,
            mut machine,
            parking,
            requests,
            notifications,
            handled,
            ..
        } = self;
        drop((chain, requests, notifications));

        machine.detach();
        *parking.lock().unwrap_or_else(PoisonError::into_inner) = Some(machine);

        log::info!(
            "[DISPATCH] gen {}: shut down after {} requests",
            generation,
            handled
        );
        done.send_replace(true);
    }

    /// Applies one request unless shutdown arrives first. Breaks when it did.
    async fn dispatch(
        &mut self,
        envelope: Envelope,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> ControlFlow<()> {
        let Envelope { request, reply } = envelope;
        let name = request.name();
        self.handled += 1;

        let outcome = tokio::select! {
            biased;
            _ = &mut *shutdown => None,
            result = self.handle(request) => Some(result),
        };

        let Some(result) = outcome else {
            self.debug(&format!("shutdown requested while applying {}", name));
            let _ = reply.send(Err(ClientError::Stopped));
            return ControlFlow::Break(());
        };

        match &result {
            Ok(()) => self.trace(&format!("{} applied", name)),
            Err(err) => self.debug(&format!("{} failed: {}", name, err)),
        }

        if reply.send(result).is_err() {
            self.trace(&format!("{} caller went away before the reply", name));
        }
        ControlFlow::Continue(())
    }

    async fn handle(&mut self, request: Request) -> Result<()> {
        let (command, followup) = self.plan(request).await?;
        self.trace(&format!("cmd: {:?}", command));
        self.debug(&format!("applying {}", command.name()));

        self.machine.apply(command).await?;

        if let Some(notification) = followup {
            self.notifications.notify(notification);
        }
        Ok(())
    }

    /// Folds a request into the watch-list and picks the transition it implies.
    /// The watch-list grows even when the transition later fails, so nothing a
    /// caller registered is lost.
    async fn plan(&mut self, request: Request) -> Result<(Command, Option<Notification>)> {
        match request {
            Request::NotifyReceived(watch) => {
                let added = self
                    .machine
                    .watch_list_mut()
                    .extend(&watch.addrs, &watch.inputs);
                self.trace(&format!(
                    "NotifyReceived: {} new of {} (watching {})",
                    added,
                    watch.addrs.len() + watch.inputs.len(),
                    self.machine.watch_list().len()
                ));

                if self.machine.is_scanning() {
                    let update = RescanUpdate {
                        addrs: watch.addrs,
                        inputs: watch.inputs,
                    };
                    Ok((Command::UpdateRescan(update), None))
                } else {
                    let best = self.best_block().await?;
                    Ok((Command::StartRescan { start: best, end: None }, None))
                }
            }

            Request::Rescan(watch) => {
                self.machine
                    .watch_list_mut()
                    .extend(&watch.addrs, &watch.inputs);

                let best = self.best_block().await?;
                let start = match watch.start {
                    Some(hash) => self.stamp_for(hash).await?,
                    None => self.genesis().await?,
                };
                let end = match watch.end {
                    Some(hash) => Some(self.stamp_for(hash).await?),
                    None => None,
                };

                let followup = (start.hash == best.hash).then_some(Notification::RescanFinished(best));
                Ok((Command::StartRescan { start, end }, followup))
            }
        }
    }

    async fn best_block(&self) -> Result<BlockStamp> {
        self.query("best block", self.chain.best_block()).await
    }

    async fn stamp_for(&self, hash: BlockHash) -> Result<BlockStamp> {
        let height = self
            .query("block height", self.chain.get_block_height(hash))
            .await?;
        Ok(BlockStamp::new(height, hash))
    }

    async fn genesis(&self) -> Result<BlockStamp> {
        let hash = self
            .query("genesis hash", self.chain.get_block_hash(0))
            .await?;
        Ok(BlockStamp::new(0, hash))
    }

    async fn query<T>(
        &self,
        what: &'static str,
        query: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.chain_timeout, query).await {
            Ok(result) => result.map_err(ClientError::ChainService),
            Err(_) => Err(ClientError::Timeout(what)),
        }
    }

    fn t(&self) -> u128 {
        self.t0.elapsed().as_micros()
    }

    fn info(&self, msg: &str) {
        log::info!("[DISPATCH] gen {} {:>8}us: {}", self.generation, self.t(), msg);
    }

    fn debug(&self, msg: &str) {
        log::debug!("[DISPATCH] gen {} {:>8}us: {}", self.generation, self.t(), msg);
    }

    fn trace(&self, msg: &str) {
        log::trace!("[DISPATCH] gen {} {:>8}us: {}", self.generation, self.t(), msg);
    }
}
