use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use log::{debug, info};
use tokio::task::JoinSet;

use super::buffer::BlockBuffer;
use crate::error::IndexerError;
use crate::models::Height;
use crate::rpc::NodeClient;

/// A "not found" this close to the best known height means the worker has caught up.
pub const TIP_MARGIN: Height = 50;

const BACKPRESSURE_PAUSE: Duration = Duration::from_millis(20);
const NOT_FOUND_PAUSE: Duration = Duration::from_millis(100);
const TIP_WAIT: Duration = Duration::from_secs(1);

/// Pool of block downloaders feeding the buffer.
///
/// While far behind the tip every worker claims fresh heights from the buffer's counter.
/// Once the chain tip is reached surplus workers retire until exactly one is left, which
/// then follows the tip block by block.
#[derive(Clone)]
pub struct FetchWorkers {
    buffer: Arc<BlockBuffer>,
    client: Arc<NodeClient>,
    live: Arc<AtomicUsize>,
}

impl FetchWorkers {
    pub fn new(buffer: Arc<BlockBuffer>, client: Arc<NodeClient>) -> Self {
        Self {
            buffer,
            client,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Runs `count` workers until the last one stops.
    ///
    /// Retiring workers are expected and reaped here. The last live worker never retires,
    /// so this only returns if a worker panicked.
    pub async fn run(self, count: usize) -> Result<(), IndexerError> {
        let mut workers = JoinSet::new();
        self.spawn(count, &mut workers);
        while let Some(joined) = workers.join_next().await {
            joined?;
            debug!(live = self.live(); "Fetch worker reaped");
        }
        Err(IndexerError::Fatal(anyhow!("All fetch workers stopped")))
    }

    /// Starts `count` workers on `tasks`.
    pub(crate) fn spawn(&self, count: usize, tasks: &mut JoinSet<()>) {
        // Register all workers up front so none of them starts out believing it is alone.
        self.live.fetch_add(count, Ordering::AcqRel);
        for id in 0..count {
            tasks.spawn(self.clone().fetch_loop(id));
        }
        info!(workers = count; "Fetch workers started");
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Whether a "not found" for `next` means the chain tip has been reached.
    ///
    /// An unknown best height, or a buffer still far below it, means some endpoint is
    /// missing rather than the chain having ended.
    fn caught_up(&self, next: Height) -> bool {
        let best = self.client.pool().best_height();
        best >= 0 && next > best - TIP_MARGIN && self.buffer.highest_height() >= best - TIP_MARGIN
    }

    async fn fetch_loop(self, id: usize) {
        let mut next = self.buffer.next_pending_height();
        let mut waited: u64 = 0;

        loop {
            if self.buffer.is_full() {
                tokio::time::sleep(BACKPRESSURE_PAUSE).await;
                continue;
            }

            if self.live() == 1 && next == self.buffer.highest_height() + 1 {
                tokio::time::sleep(TIP_WAIT).await;
                waited += 1;
                debug!(worker = id, height = next, waited_secs = waited; "Waiting for next block");
            }

            match self.client.download_block(next).await {
                None => {
                    if self.caught_up(next) && try_retire(&self.live) {
                        info!(worker = id, height = next; "Fetch worker caught up, retiring");
                        return;
                    }
                    if self.live() > 1 {
                        tokio::time::sleep(NOT_FOUND_PAUSE).await;
                    }
                    next = self.buffer.highest_height() + 1;
                },
                Some(block) => {
                    waited = 0;
                    self.buffer.put_block(block);
                    next = if self.live() == 1 {
                        self.buffer.highest_height() + 1
                    } else {
                        self.buffer.next_pending_height()
                    };
                },
            }
        }
    }
}

/// Decrements the live count unless this is the last worker.
fn try_retire(live: &AtomicUsize) -> bool {
    live.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n > 1).then(|| n - 1))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use url::Url;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::rpc::{EndpointPool, HttpClient};

    #[test]
    fn retiring_never_drops_below_one_worker() {
        let live = Arc::new(AtomicUsize::new(6));
        let handles: Vec<_> = (0..12)
            .map(|_| {
                let live = live.clone();
                std::thread::spawn(move || try_retire(&live))
            })
            .collect();

        let retired = handles.into_iter().map(|h| h.join().unwrap()).filter(|r| *r).count();
        assert_eq!(retired, 5);
        assert_eq!(live.load(Ordering::Acquire), 1);
    }

    async fn node_with_blocks(tip: Height) -> MockServer {
        let server = MockServer::start().await;
        for h in 0..=tip {
            Mock::given(method("POST"))
                .and(body_partial_json(json!({"method": "getblock", "params": [h, 1]})))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": {
                        "hash": format!("0x{:064x}", h),
                        "size": 10,
                        "version": 0,
                        "previousblockhash": "0x00",
                        "merkleroot": "0x00",
                        "time": 1_500_000_000 + h,
                        "index": h,
                        "nonce": "00",
                        "nextconsensus": "A",
                        "tx": []
                    }
                })))
                .mount(&server)
                .await;
        }
        server
    }

    #[tokio::test]
    async fn workers_fill_the_buffer_and_collapse_to_one_at_tip() {
        let server = node_with_blocks(5).await;
        let url = Url::parse(&server.uri()).unwrap();
        let http = Arc::new(HttpClient::new().unwrap());
        let pool = Arc::new(EndpointPool::new(vec![url.clone()], http.clone()));
        pool.set_height(&url, 5);

        let buffer = Arc::new(BlockBuffer::new(-1));
        let workers = FetchWorkers::new(buffer.clone(), Arc::new(NodeClient::new(pool, http)));
        let mut tasks = JoinSet::new();
        workers.spawn(3, &mut tasks);

        // Two workers retire; the last keeps polling the tip.
        for _ in 0..2 {
            let joined = tokio::time::timeout(Duration::from_secs(10), tasks.join_next()).await;
            assert!(matches!(joined, Ok(Some(Ok(())))));
        }
        assert_eq!(workers.live(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(buffer.highest_height(), 5);
        for h in 0..=5 {
            assert!(buffer.pop_block(h).is_some(), "missing block {}", h);
        }
        tasks.abort_all();
    }

    #[tokio::test]
    async fn unknown_tip_keeps_every_worker() {
        let server = node_with_blocks(5).await;
        let url = Url::parse(&server.uri()).unwrap();
        let http = Arc::new(HttpClient::new().unwrap());
        let pool = Arc::new(EndpointPool::new(vec![url.clone()], http.clone()));

        let buffer = Arc::new(BlockBuffer::new(-1));
        let workers = FetchWorkers::new(buffer.clone(), Arc::new(NodeClient::new(pool.clone(), http)));
        let mut tasks = JoinSet::new();
        workers.spawn(4, &mut tasks);

        // No endpoint has reported a height yet, so nothing is known to be the tip.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(workers.live(), 4);
        assert_eq!(buffer.highest_height(), -1);

        pool.set_height(&url, 5);
        let caught_up = tokio::time::timeout(Duration::from_secs(10), async {
            while buffer.highest_height() < 5 || workers.live() > 1 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(caught_up.is_ok(), "live={} highest={}", workers.live(), buffer.highest_height());
        tasks.abort_all();
    }

    #[tokio::test]
    async fn retired_workers_do_not_stop_the_pool() {
        let server = node_with_blocks(3).await;
        let url = Url::parse(&server.uri()).unwrap();
        let http = Arc::new(HttpClient::new().unwrap());
        let pool = Arc::new(EndpointPool::new(vec![url.clone()], http.clone()));
        pool.set_height(&url, 3);

        let buffer = Arc::new(BlockBuffer::new(-1));
        let workers = FetchWorkers::new(buffer.clone(), Arc::new(NodeClient::new(pool, http)));
        let running = tokio::spawn(workers.clone().run(3));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!running.is_finished());
        assert_eq!(workers.live(), 1);
        assert_eq!(buffer.highest_height(), 3);
        running.abort();
    }
}
