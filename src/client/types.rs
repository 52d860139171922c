use std::collections::HashMap;

use bitcoin::{Address, BlockHash, OutPoint};

use crate::rescan::WatchedInput;

/// Items to watch plus, for rescans, the block range to cover.
///
/// `start: None` means genesis; `end: None` means "follow the tip". Both are ignored
/// by `notify_received`, which always continues from wherever the live rescan is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchRequest {
    pub addrs: Vec<Address>,
    pub inputs: Vec<WatchedInput>,
    pub start: Option<BlockHash>,
    pub end: Option<BlockHash>,
}

impl WatchRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_addrs(mut self, addrs: impl IntoIterator<Item = Address>) -> Self {
        self.addrs.extend(addrs);
        self
    }

    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = WatchedInput>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    /// Adds outpoints keyed the way wallets usually track them. Sorted so the
    /// resulting order does not depend on map iteration.
    pub fn with_outpoints(mut self, outpoints: &HashMap<OutPoint, Address>) -> Self {
        let mut inputs: Vec<WatchedInput> = outpoints
            .iter()
            .map(|(outpoint, addr)| WatchedInput::new(*outpoint, addr))
            .collect();
        inputs.sort_by_key(|input| input.outpoint);
        self.inputs.extend(inputs);
        self
    }

    pub fn from_block(mut self, hash: BlockHash) -> Self {
        self.start = Some(hash);
        self
    }

    pub fn to_block(mut self, hash: BlockHash) -> Self {
        self.end = Some(hash);
        self
    }
}
