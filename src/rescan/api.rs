use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::rescan::types::{RescanOptions, RescanUpdate};

/// Item type of a worker's event stream.
pub type RescanError = anyhow::Error;

/// A long-lived rescan process bound to one chain source and one option set.
///
/// The client owns at most one live worker at a time and talks to it only from
/// its dispatcher task.
#[async_trait]
pub trait Rescanner: Send + Sync {
    /// Launches the worker's background activity.
    ///
    /// The returned stream carries the errors the worker hits while running and
    /// is closed when the worker terminates. Called exactly once per worker.
    fn start(&mut self) -> mpsc::Receiver<RescanError>;

    /// Applies watch-list growth to the running worker.
    async fn update(&self, update: RescanUpdate) -> Result<()>;

    /// Resolves once every task the worker spawned has exited.
    /// Must be a no-op for a worker that was never started.
    async fn wait_for_shutdown(&mut self);
}

/// Builds rescan workers. Swapped for a double in tests.
pub trait RescanFactory: Send + Sync {
    fn new_rescanner(&self, options: RescanOptions) -> Result<Box<dyn Rescanner>>;
}

impl<F> RescanFactory for F
where
    F: Fn(RescanOptions) -> Result<Box<dyn Rescanner>> + Send + Sync,
{
    fn new_rescanner(&self, options: RescanOptions) -> Result<Box<dyn Rescanner>> {
        self(options)
    }
}
