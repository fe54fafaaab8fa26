use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use url::Url;

use super::http_client::HttpClient;
use crate::models::Height;

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(3);

/// Configured node endpoints and the height each one last reported.
///
/// A height of `-1` means the endpoint did not answer its last probe, or a call against it
/// failed at the transport level since.
pub struct EndpointPool {
    endpoints: Vec<Url>,
    heights: RwLock<HashMap<Url, Height>>,
    best_height: AtomicI64,
    http: Arc<HttpClient>,
}

impl EndpointPool {
    pub fn new(endpoints: Vec<Url>, http: Arc<HttpClient>) -> Self {
        let heights = endpoints.iter().map(|u| (u.clone(), -1)).collect();
        Self {
            endpoints,
            heights: RwLock::new(heights),
            best_height: AtomicI64::new(-1),
            http,
        }
    }

    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }

    /// Probes every endpoint concurrently and replaces the height table.
    ///
    /// Returns the best height seen so far.
    pub async fn refresh(&self) -> Height {
        let (tx, mut rx) = mpsc::channel(self.endpoints.len().max(1));
        for url in self.endpoints.iter().cloned() {
            let http = self.http.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let height = query_height(&http, &url).await;
                let _ = tx.send((url, height)).await;
            });
        }
        drop(tx);

        let mut heights = HashMap::with_capacity(self.endpoints.len());
        while let Some((url, height)) = rx.recv().await {
            heights.insert(url, height);
        }
        let best = heights.values().copied().max().unwrap_or(-1);
        *self.heights.write().unwrap_or_else(PoisonError::into_inner) = heights;
        self.raise_best_height(best);
        self.best_height()
    }

    /// Picks a random endpoint whose last known height is at least `min_height`.
    ///
    /// Local endpoints are weighted double.
    pub fn select(&self, min_height: Height) -> Option<Url> {
        self.candidates(min_height).choose(&mut rand::thread_rng()).cloned()
    }

    fn candidates(&self, min_height: Height) -> Vec<Url> {
        let heights = self.heights.read().unwrap_or_else(PoisonError::into_inner);
        let mut candidates = Vec::with_capacity(self.endpoints.len() * 2);
        for url in &self.endpoints {
            let height = heights.get(url).copied().unwrap_or(-1);
            if height < 0 || height < min_height {
                continue;
            }
            candidates.push(url.clone());
            if is_local(url) {
                candidates.push(url.clone());
            }
        }
        candidates
    }

    pub fn mark_unavailable(&self, url: &Url) {
        let mut heights = self.heights.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(height) = heights.get_mut(url) {
            *height = -1;
        }
    }

    pub fn height_of(&self, url: &Url) -> Height {
        self.heights
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .copied()
            .unwrap_or(-1)
    }

    pub fn best_height(&self) -> Height {
        self.best_height.load(Ordering::Acquire)
    }

    pub fn raise_best_height(&self, height: Height) {
        self.best_height.fetch_max(height, Ordering::AcqRel);
    }

    pub fn log_status(&self) {
        let heights = self.heights.read().unwrap_or_else(PoisonError::into_inner);
        for url in &self.endpoints {
            match heights.get(url).copied().unwrap_or(-1) {
                h if h >= 0 => info!(endpoint:% = url, height = h; "Endpoint status"),
                _ => warn!(endpoint:% = url; "Endpoint unreachable"),
            }
        }
    }

    /// Refreshes the height table forever.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            interval.tick().await;
            let best = self.refresh().await;
            debug!(best_height = best; "Endpoint heights refreshed");
        }
    }

    #[cfg(test)]
    pub(crate) fn set_height(&self, url: &Url, height: Height) {
        self.heights
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.clone(), height);
        self.raise_best_height(height);
    }
}

fn is_local(url: &Url) -> bool {
    matches!(url.host_str(), Some("127.0.0.1") | Some("localhost"))
}

async fn query_height(http: &HttpClient, url: &Url) -> Height {
    match http.call::<i64>(url, "getblockcount", &[]).await {
        Ok(Some(count)) => count - 1,
        Ok(None) => -1,
        Err(e) => {
            debug!(endpoint:% = url, error:% = e; "Height probe failed");
            -1
        },
    }
}
