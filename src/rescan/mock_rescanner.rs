use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bitcoin::Address;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::chain::BlockStamp;
use crate::notifications::{Notification, NotificationSink};
use crate::rescan::api::{RescanError, RescanFactory, Rescanner};
use crate::rescan::types::{QuitSignal, RescanOptions, RescanUpdate, WatchedInput};

/// What the mock observed of a single worker over its lifetime.
#[derive(Debug)]
pub struct RescanRecord {
    pub start: BlockStamp,
    pub end: Option<BlockStamp>,
    pub watch_addrs: Vec<Address>,
    pub watch_inputs: Vec<WatchedInput>,
    updates: Mutex<Vec<RescanUpdate>>,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl RescanRecord {
    pub fn updates(&self) -> Vec<RescanUpdate> {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_count(&self) -> usize {
        self.updates.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

/// Rescan factory double.
///
/// Every worker it builds replays a fixed list of notifications and errors,
/// then closes its stream. Construction failures and slow updates can be injected.
#[derive(Debug, Default)]
pub struct MockRescanFactory {
    errors: Vec<String>,
    notifications: Vec<Notification>,
    update_delay: Option<Duration>,
    fail_next: AtomicUsize,
    spawned: Mutex<Vec<Arc<RescanRecord>>>,
    live: Arc<AtomicUsize>,
}

impl MockRescanFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each worker emits these errors, one by one, on its event stream.
    pub fn with_errors<I, S>(mut self, errors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.errors = errors.into_iter().map(Into::into).collect();
        self
    }

    /// Each worker publishes these through its sink as soon as it starts.
    pub fn with_notifications(mut self, notifications: Vec<Notification>) -> Self {
        self.notifications = notifications;
        self
    }

    /// Each `update` sleeps this long before being recorded.
    pub fn with_update_delay(mut self, delay: Duration) -> Self {
        self.update_delay = Some(delay);
        self
    }

    /// The next `n` constructions fail.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn rescanners(&self) -> Vec<Arc<RescanRecord>> {
        self.spawned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last(&self) -> Option<Arc<RescanRecord>> {
        self.spawned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn spawned_count(&self) -> usize {
        self.spawned.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Workers built by this factory that have not been dropped yet.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn total_updates(&self) -> usize {
        self.rescanners().iter().map(|r| r.update_count()).sum()
    }
}

impl RescanFactory for MockRescanFactory {
    fn new_rescanner(&self, options: RescanOptions) -> Result<Box<dyn Rescanner>> {
        let refused = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            bail!("mock factory refused to build a rescanner");
        }

        let record = Arc::new(RescanRecord {
            start: options.start,
            end: options.end,
            watch_addrs: options.watch_addrs,
            watch_inputs: options.watch_inputs,
            updates: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        });
        self.spawned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        self.live.fetch_add(1, Ordering::SeqCst);
        log::trace!("[MOCK] built rescanner starting at {}", record.start);

        Ok(Box::new(MockRescanner {
            record,
            quit: options.quit,
            sink: options.notifications,
            errors: self.errors.clone(),
            notifications: self.notifications.clone(),
            update_delay: self.update_delay,
            task: None,
            live: self.live.clone(),
        }))
    }
}

pub struct MockRescanner {
    record: Arc<RescanRecord>,
    quit: QuitSignal,
    sink: NotificationSink,
    errors: Vec<String>,
    notifications: Vec<Notification>,
    update_delay: Option<Duration>,
    task: Option<JoinHandle<()>>,
    live: Arc<AtomicUsize>,
}

#[async_trait]
impl Rescanner for MockRescanner {
    fn start(&mut self) -> mpsc::Receiver<RescanError> {
        let (tx, rx) = mpsc::channel(1);
        let errors = std::mem::take(&mut self.errors);
        let notifications = std::mem::take(&mut self.notifications);
        let sink = self.sink.clone();
        let mut quit = self.quit.clone();

        self.record.started.store(true, Ordering::SeqCst);
        self.task = Some(tokio::spawn(async move {
            for notification in notifications {
                sink.notify(notification);
            }
            for err in errors {
                tokio::select! {
                    _ = quit.quitted() => return,
                    sent = tx.send(anyhow!(err)) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        }));

        rx
    }

    async fn update(&self, update: RescanUpdate) -> Result<()> {
        if let Some(delay) = self.update_delay {
            tokio::time::sleep(delay).await;
        }
        if self.quit.is_quit() {
            bail!("rescan is shutting down");
        }
        self.record
            .updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(update);
        Ok(())
    }

    async fn wait_for_shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.record.shut_down.store(true, Ordering::SeqCst);
    }
}

impl Drop for MockRescanner {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}
