use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use log::{info, warn};
use tokio::sync::mpsc;

use super::buffer::BlockBuffer;
use crate::error::IndexerError;
use crate::models::Height;
use crate::rpc::{NodeClient, RawBlock};

const POLL_INTERVAL_MS: u64 = 20;
const WARN_EVERY_MS: u64 = 5_000;
const REFETCH_EVERY_MS: u64 = 40_000;

/// Outcome of one look into the buffer.
#[derive(Debug)]
pub enum Tick {
    /// The next height was there.
    Forward(RawBlock),
    /// Nothing to do yet.
    Idle,
    /// The next height has been missing for `waited`.
    Stalled { height: Height, waited: Duration },
    /// Missing for long enough that it should be downloaded directly.
    Refetch { height: Height, waited: Duration },
}

/// Cursor and miss accounting, kept separate from the I/O so it can be driven by tests.
#[derive(Debug)]
pub struct ArrangerState {
    next: Height,
    delay_ms: u64,
}

impl ArrangerState {
    pub fn new(stored_height: Height) -> Self {
        Self {
            next: stored_height + 1,
            delay_ms: 0,
        }
    }

    pub fn next_height(&self) -> Height {
        self.next
    }

    pub fn poll(&mut self, buffer: &BlockBuffer) -> Tick {
        if let Some(block) = buffer.pop_block(self.next) {
            self.next += 1;
            self.delay_ms = 0;
            return Tick::Forward(block);
        }

        // An empty buffer means the workers are waiting on the chain, not that a block is lost.
        if buffer.size() == 0 {
            return Tick::Idle;
        }

        self.delay_ms += POLL_INTERVAL_MS;
        let waited = Duration::from_millis(self.delay_ms);
        if self.delay_ms % REFETCH_EVERY_MS == 0 {
            Tick::Refetch {
                height: self.next,
                waited,
            }
        } else if self.delay_ms % WARN_EVERY_MS == 0 {
            Tick::Stalled {
                height: self.next,
                waited,
            }
        } else {
            Tick::Idle
        }
    }
}

/// Forwards buffered blocks to the persister strictly in height order.
pub struct Arranger {
    buffer: Arc<BlockBuffer>,
    client: Arc<NodeClient>,
    state: ArrangerState,
}

impl Arranger {
    pub fn new(buffer: Arc<BlockBuffer>, client: Arc<NodeClient>, stored_height: Height) -> Self {
        Self {
            buffer,
            client,
            state: ArrangerState::new(stored_height),
        }
    }

    pub async fn run(mut self, tx: mpsc::Sender<RawBlock>) -> Result<(), IndexerError> {
        info!(from_height = self.state.next_height(); "Arranger started");
        let pause = Duration::from_millis(POLL_INTERVAL_MS);

        loop {
            match self.state.poll(&self.buffer) {
                Tick::Forward(block) => {
                    tx.send(block)
                        .await
                        .map_err(|_| IndexerError::Fatal(anyhow!("Persister stopped receiving blocks")))?;
                    continue;
                },
                Tick::Idle => {},
                Tick::Stalled { height, waited } => {
                    warn!(
                        height = height,
                        waited_secs = waited.as_secs(),
                        buffered = self.buffer.size();
                        "Waiting for missing block"
                    );
                },
                Tick::Refetch { height, waited } => {
                    warn!(height = height, waited_secs = waited.as_secs(); "Re-downloading missing block");
                    if let Some(block) = self.client.download_block(height).await {
                        self.buffer.put_block(block);
                    }
                },
            }
            tokio::time::sleep(pause).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::buffer::test_block;
    use super::*;

    #[test]
    fn forwards_in_order_and_refetches_a_persistent_gap() {
        let buffer = BlockBuffer::new(50);
        for h in [51, 52, 54] {
            buffer.put_block(test_block(h));
        }
        let mut state = ArrangerState::new(50);

        assert!(matches!(state.poll(&buffer), Tick::Forward(b) if b.index == 51));
        assert!(matches!(state.poll(&buffer), Tick::Forward(b) if b.index == 52));

        let mut stalls = 0;
        let mut polls = 0;
        loop {
            polls += 1;
            match state.poll(&buffer) {
                Tick::Stalled { height, .. } => {
                    assert_eq!(height, 53);
                    stalls += 1;
                },
                Tick::Refetch { height, waited } => {
                    assert_eq!(height, 53);
                    assert_eq!(waited, Duration::from_secs(40));
                    break;
                },
                Tick::Idle => {},
                Tick::Forward(b) => panic!("forwarded {} past a gap", b.index),
            }
        }
        assert_eq!(polls, 2000);
        assert_eq!(stalls, 7);

        buffer.put_block(test_block(53));
        assert!(matches!(state.poll(&buffer), Tick::Forward(b) if b.index == 53));
        assert!(matches!(state.poll(&buffer), Tick::Forward(b) if b.index == 54));
        assert_eq!(state.next_height(), 55);
    }

    #[test]
    fn waiting_on_an_empty_buffer_does_not_count_as_a_stall() {
        let buffer = BlockBuffer::new(10);
        let mut state = ArrangerState::new(10);

        for _ in 0..5000 {
            assert!(matches!(state.poll(&buffer), Tick::Idle));
        }
        buffer.put_block(test_block(11));
        assert!(matches!(state.poll(&buffer), Tick::Forward(_)));
    }
}
