use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::models::Height;
use crate::rpc::RawBlock;

/// Producers pause while more than this many blocks wait to be arranged.
pub const BUFFER_CAPACITY: usize = 5000;

/// Out-of-order holding area between the fetch workers and the arranger.
///
/// Workers claim heights through [`BlockBuffer::next_pending_height`] and insert whatever
/// they download; the arranger pops heights strictly in order.
#[derive(Debug)]
pub struct BlockBuffer {
    blocks: Mutex<HashMap<Height, RawBlock>>,
    max_height: AtomicI64,
    next_height: AtomicI64,
}

impl BlockBuffer {
    /// `stored_height` is the last height already persisted, `-1` on an empty database.
    pub fn new(stored_height: Height) -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            max_height: AtomicI64::new(stored_height),
            next_height: AtomicI64::new(stored_height),
        }
    }

    /// Stores a block. A second insert for the same height is ignored.
    pub fn put_block(&self, block: RawBlock) {
        let height = block.index;
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(height)
            .or_insert(block);
        self.max_height.fetch_max(height, Ordering::AcqRel);
    }

    pub fn pop_block(&self, height: Height) -> Option<RawBlock> {
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&height)
    }

    /// Hands out the next unclaimed height. Never returns the same value twice.
    pub fn next_pending_height(&self) -> Height {
        self.next_height.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn size(&self) -> usize {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Largest height ever inserted, or the initial stored height.
    pub fn highest_height(&self) -> Height {
        self.max_height.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.size() > BUFFER_CAPACITY
    }
}

#[cfg(test)]
pub(crate) fn test_block(height: Height) -> RawBlock {
    RawBlock {
        hash: format!("0x{:064x}", height),
        size: 100,
        version: 0,
        previous_block_hash: format!("0x{:064x}", height - 1),
        merkle_root: String::new(),
        time: 1_500_000_000 + height * 15,
        index: height,
        nonce: "0".to_string(),
        next_consensus: String::new(),
        script: Default::default(),
        tx: Vec::new(),
    }
}
