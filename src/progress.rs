//! Sync progress reporting for the block store and each downstream pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, info};

const OUTPUT_INTERVAL: Duration = Duration::from_secs(1);
const NOTIFY_AFTER: Duration = Duration::from_secs(5 * 60);

/// Cross-task sync signals.
///
/// The persister raises every registered refresh flag after each commit so that trackers
/// re-read their ceiling, and marks the block store as synced once it reaches the tip.
#[derive(Debug, Default)]
pub struct SyncSignals {
    refresh_flags: Mutex<Vec<Arc<AtomicBool>>>,
    blocks_synced: Arc<AtomicBool>,
}

impl SyncSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new refresh flag, initially raised.
    pub fn register(&self) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(true));
        self.refresh_flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(flag.clone());
        flag
    }

    pub fn raise_refresh(&self) {
        for flag in self.refresh_flags.lock().unwrap_or_else(PoisonError::into_inner).iter() {
            flag.store(true, Ordering::Release);
        }
    }

    pub fn blocks_synced(&self) -> Arc<AtomicBool> {
        self.blocks_synced.clone()
    }
}

/// Percentage and remaining-time estimate for one stage.
#[derive(Debug)]
pub struct ProgressTracker {
    name: &'static str,
    started: Instant,
    init: Option<(Instant, f64)>,
    last_output: Option<Instant>,
    percentage: f64,
    remaining: Option<Duration>,
    finished: bool,
    ceiling: i64,
    refresh: Arc<AtomicBool>,
    upstream: Option<Arc<AtomicBool>>,
    synced: Option<Arc<AtomicBool>>,
}

impl ProgressTracker {
    pub fn new(name: &'static str, refresh: Arc<AtomicBool>) -> Self {
        Self {
            name,
            started: Instant::now(),
            init: None,
            last_output: None,
            percentage: 0.0,
            remaining: None,
            finished: false,
            ceiling: 0,
            refresh,
            upstream: None,
            synced: None,
        }
    }

    /// Only count as finished once `upstream` is set.
    pub fn with_upstream(mut self, upstream: Arc<AtomicBool>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Set `flag` once this tracker finishes.
    pub fn publish_synced(mut self, flag: Arc<AtomicBool>) -> Self {
        self.synced = Some(flag);
        self
    }

    /// Whether the ceiling must be re-read before the next update. Consumes the refresh flag.
    pub fn needs_ceiling(&self) -> bool {
        let raised = self.refresh.swap(false, Ordering::AcqRel);
        raised || self.ceiling <= 0
    }

    pub fn set_ceiling(&mut self, ceiling: i64) {
        self.ceiling = ceiling;
    }

    pub fn percentage(&self) -> f64 {
        self.percentage
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.remaining
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Recomputes the estimate for `cursor`. Returns `true` when a line should be printed.
    pub fn update(&mut self, cursor: i64, now: Instant) -> bool {
        let at_tip = self.ceiling > 0 && cursor >= self.ceiling;
        self.percentage = if at_tip {
            100.0
        } else if self.ceiling > 0 {
            (cursor.max(0) as f64 * 100.0) / self.ceiling as f64
        } else {
            0.0
        };

        let (init_time, init_percentage) = *self.init.get_or_insert((now, self.percentage));
        self.remaining = if at_tip {
            Some(Duration::ZERO)
        } else if self.percentage > init_percentage {
            let elapsed = now.duration_since(init_time).as_secs_f64();
            let secs = elapsed * (100.0 - self.percentage) / (self.percentage - init_percentage);
            Some(Duration::from_secs_f64(secs))
        } else {
            None
        };

        let due = self
            .last_output
            .is_none_or(|t| now.duration_since(t) >= OUTPUT_INTERVAL);
        if at_tip || due {
            self.last_output = Some(now);
            return true;
        }
        false
    }

    /// Updates and logs progress at `cursor`, announcing completion once.
    pub fn report(&mut self, cursor: i64) {
        let now = Instant::now();
        if self.update(cursor, now) {
            let remaining = self
                .remaining
                .map(format_duration)
                .unwrap_or_else(|| "unknown".to_string());
            info!(
                stage = self.name,
                cursor = cursor,
                ceiling = self.ceiling,
                percent:% = format!("{:.4}", self.percentage),
                remaining = &*remaining;
                "Sync progress"
            );
        }

        let upstream_done = self.upstream.as_ref().is_none_or(|f| f.load(Ordering::Acquire));
        if self.finished || self.percentage < 100.0 || !upstream_done {
            return;
        }
        self.finished = true;
        if let Some(flag) = &self.synced {
            flag.store(true, Ordering::Release);
        }
        let took = now.duration_since(self.started);
        if took >= NOTIFY_AFTER {
            info!(stage = self.name, took = &*format_duration(took); "Fully synced");
        } else {
            debug!(stage = self.name; "Caught up");
        }
    }
}

/// Renders a duration as `1h 02m 03s`, dropping leading zero units.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}h {:02}m {:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}
