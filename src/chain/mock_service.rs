use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bitcoin::bip158::{self, BlockFilter};
use bitcoin::block::{self, Header, Version};
use bitcoin::hashes::Hash;
use bitcoin::{Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Transaction, TxMerkleNode};

use crate::chain::api::ChainService;
use crate::chain::types::{BlockStamp, FilterType, QueryOptions};

/// Pure in-memory chain service for tests and the demo binary.
///
/// Holds a linear chain of empty regtest-difficulty blocks.
pub struct MockChainService {
    blocks: Mutex<Vec<Block>>,
    fail_start: AtomicBool,
    current: AtomicBool,
    start_calls: AtomicUsize,
    start_delay_ms: AtomicU64,
    query_delay_ms: AtomicU64,
    sent: Mutex<Vec<Transaction>>,
}

impl MockChainService {
    /// Builds a chain of `len` blocks (at least the genesis block).
    pub fn new(len: u32) -> Self {
        let mut blocks = Vec::new();
        extend_chain(&mut blocks, len.max(1));
        Self {
            blocks: Mutex::new(blocks),
            fail_start: AtomicBool::new(false),
            current: AtomicBool::new(false),
            start_calls: AtomicUsize::new(0),
            start_delay_ms: AtomicU64::new(0),
            query_delay_ms: AtomicU64::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Makes every subsequent `start` fail.
    pub fn failing_start(self) -> Self {
        self.fail_start.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Every subsequent `start` takes this long.
    pub fn set_start_delay(&self, delay: Duration) {
        self.start_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Height, hash and best-block lookups take this long.
    pub fn set_query_delay(&self, delay: Duration) {
        self.query_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_current(&self, current: bool) {
        self.current.store(current, Ordering::SeqCst);
    }

    /// Appends `n` blocks and returns the new tip.
    pub fn mine(&self, n: u32) -> BlockStamp {
        let mut blocks = self.blocks();
        extend_chain(&mut blocks, n);
        tip_of(&blocks)
    }

    pub fn tip(&self) -> BlockStamp {
        tip_of(&self.blocks())
    }

    pub fn stamp_at(&self, height: u32) -> Option<BlockStamp> {
        self.blocks()
            .get(height as usize)
            .map(|b| BlockStamp::new(height, b.block_hash()))
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn sent_transactions(&self) -> Vec<Transaction> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn pause(delay_ms: &AtomicU64) {
        let ms = delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn blocks(&self) -> MutexGuard<'_, Vec<Block>> {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find(&self, hash: BlockHash) -> Result<(u32, Block)> {
        self.blocks()
            .iter()
            .enumerate()
            .find(|(_, b)| b.block_hash() == hash)
            .map(|(height, b)| (height as u32, b.clone()))
            .ok_or_else(|| anyhow!("unknown block {}", hash))
    }
}

fn extend_chain(blocks: &mut Vec<Block>, n: u32) {
    for _ in 0..n {
        let height = blocks.len() as u32;
        let prev_blockhash = blocks
            .last()
            .map(|b| b.block_hash())
            .unwrap_or_else(BlockHash::all_zeros);

        let header = Header {
            version: Version::ONE,
            prev_blockhash,
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_296_688_602 + height * 600,
            bits: CompactTarget::from_consensus(0x207f_ffff),
            nonce: height,
        };
        blocks.push(Block {
            header,
            txdata: Vec::new(),
        });
    }
}

fn tip_of(blocks: &[Block]) -> BlockStamp {
    let height = blocks.len().saturating_sub(1);
    BlockStamp::new(height as u32, blocks[height].block_hash())
}

#[async_trait]
impl ChainService for MockChainService {
    async fn start(&self) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        Self::pause(&self.start_delay_ms).await;
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(anyhow!("mock chain service refused to start"));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn get_block(&self, hash: BlockHash, _opts: &QueryOptions) -> Result<Block> {
        self.find(hash).map(|(_, block)| block)
    }

    async fn get_block_height(&self, hash: BlockHash) -> Result<u32> {
        Self::pause(&self.query_delay_ms).await;
        self.find(hash).map(|(height, _)| height)
    }

    async fn get_block_hash(&self, height: u32) -> Result<BlockHash> {
        Self::pause(&self.query_delay_ms).await;
        self.stamp_at(height)
            .map(|stamp| stamp.hash)
            .ok_or_else(|| anyhow!("no block at height {}", height))
    }

    async fn get_block_header(&self, hash: BlockHash) -> Result<block::Header> {
        self.find(hash).map(|(_, block)| block.header)
    }

    async fn best_block(&self) -> Result<BlockStamp> {
        Self::pause(&self.query_delay_ms).await;
        Ok(self.tip())
    }

    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst)
    }

    async fn send_transaction(&self, tx: &Transaction) -> Result<()> {
        log::trace!("[MOCK] send_transaction({})", tx.compute_txid());
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx.clone());
        Ok(())
    }

    async fn get_cfilter(
        &self,
        hash: BlockHash,
        filter_type: FilterType,
        _opts: &QueryOptions,
    ) -> Result<BlockFilter> {
        log::trace!("[MOCK] get_cfilter({}, type {:#04x})", hash, filter_type.as_u8());
        match filter_type {
            FilterType::Basic => {
                let (_, block) = self.find(hash)?;
                // Mock blocks carry no transactions, so no prevout is ever looked up.
                let filter = BlockFilter::new_script_filter(&block, |outpoint: &OutPoint| {
                    Err::<ScriptBuf, _>(bip158::Error::UtxoMissing(*outpoint))
                })?;
                Ok(filter)
            }
        }
    }
}
