/// Errors reported to callers of [`crate::client::ChainClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// A request arrived before the first `start`.
    #[error("chain client has not been started")]
    NotStarted,

    /// A request arrived after `stop`, or its generation shut down before applying it.
    #[error("chain client stopped")]
    Stopped,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("chain service error: {0:#}")]
    ChainService(anyhow::Error),

    /// The rescan factory could not build a worker. The client is left idle.
    #[error("failed to start rescan: {0:#}")]
    RescanSetup(anyhow::Error),

    /// The live worker refused an update. It stays in place.
    #[error("rescan update rejected: {0:#}")]
    RescanUpdate(anyhow::Error),
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
