use std::fmt;
use std::time::Duration;

use bitcoin::BlockHash;
use serde::{Deserialize, Serialize};

/// A block identified by both its height and its hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockStamp {
    pub height: u32,
    pub hash: BlockHash,
}

impl BlockStamp {
    pub fn new(height: u32, hash: BlockHash) -> Self {
        Self { height, hash }
    }
}

impl fmt::Display for BlockStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.height, self.hash)
    }
}

/// Compact filter flavours a chain service can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterType {
    /// BIP-158 basic filter (scriptPubKeys of outputs and spent prevouts).
    #[default]
    Basic,
}

impl FilterType {
    /// Wire identifier used by `getcfilters`.
    pub fn as_u8(self) -> u8 {
        match self {
            FilterType::Basic => 0x00,
        }
    }
}

/// Per-query knobs forwarded to the chain service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryOptions {
    /// Give up on a single peer query after this long.
    pub timeout: Option<Duration>,
    /// How many times a failed query may be retried.
    pub num_retries: Option<u8>,
}

impl QueryOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, num_retries: u8) -> Self {
        self.num_retries = Some(num_retries);
        self
    }
}
