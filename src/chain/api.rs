use anyhow::Result;
use async_trait::async_trait;
use bitcoin::bip158::BlockFilter;
use bitcoin::{block, Block, BlockHash, Transaction};

use crate::chain::types::{BlockStamp, FilterType, QueryOptions};

/// Compact-filter chain backend consumed by the client.
///
/// The client never looks behind this trait: fetching blocks, talking to peers
/// and validating filter headers are all the implementor's business.
#[async_trait]
pub trait ChainService: Send + Sync + 'static {
    /// Brings the service up. Called on every `ChainClient::start`, so it must
    /// tolerate being called while already running.
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Retrieves a full block, usually after a filter hit.
    async fn get_block(&self, hash: BlockHash, opts: &QueryOptions) -> Result<Block>;

    async fn get_block_height(&self, hash: BlockHash) -> Result<u32>;

    async fn get_block_hash(&self, height: u32) -> Result<BlockHash>;

    async fn get_block_header(&self, hash: BlockHash) -> Result<block::Header>;

    /// Tip of the best chain known to the service.
    async fn best_block(&self) -> Result<BlockStamp>;

    /// Whether the service believes it is synced to the network tip.
    fn is_current(&self) -> bool;

    async fn send_transaction(&self, tx: &Transaction) -> Result<()>;

    async fn get_cfilter(
        &self,
        hash: BlockHash,
        filter_type: FilterType,
        opts: &QueryOptions,
    ) -> Result<BlockFilter>;
}
