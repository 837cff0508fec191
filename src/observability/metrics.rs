//! Per-component atomic counters
//!
//! Each component (connection, publisher, consumer, worker) owns its own
//! counter set and exposes a [`Snapshot`]. A [`MetricsRegistry`] collects the
//! sources for the `/metrics` endpoint; there is no process-wide collector.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Counter name to value
pub type Snapshot = BTreeMap<String, i64>;

/// Monotonically increasing counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        i64::try_from(self.0.load(Ordering::Relaxed)).unwrap_or(i64::MAX)
    }
}

/// Anything that can report a counter snapshot
pub trait MetricsSource: Send + Sync {
    fn snapshot(&self) -> Snapshot;
}

macro_rules! counter_set {
    ($(#[$meta:meta])* $name:ident { $($field:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Default)]
        pub struct $name {
            $(pub $field: Counter,)+
        }

        impl $name {
            pub fn new() -> Self {
                Self::default()
            }

            pub fn snapshot(&self) -> Snapshot {
                let mut snapshot = Snapshot::new();
                $(snapshot.insert(stringify!($field).to_string(), self.$field.get());)+
                snapshot
            }
        }

        impl MetricsSource for $name {
            fn snapshot(&self) -> Snapshot {
                $name::snapshot(self)
            }
        }
    };
}

counter_set! {
    /// Broker connection lifecycle and traffic
    ConnectionMetrics {
        connections,
        disconnects,
        reconnects,
        errors,
        messages_published,
        messages_received,
    }
}

counter_set! {
    PublisherMetrics {
        published,
        errors,
        batches,
    }
}

counter_set! {
    /// Consumer dispatch outcomes
    ConsumerMetrics {
        messages_received,
        messages_processed,
        processing_errors,
        acks,
        nacks,
        max_retries_reached,
        dead_lettered,
    }
}

counter_set! {
    /// Worker job outcomes
    WorkerMetrics {
        messages_processed,
        processing_errors,
        retries,
        generation_failures,
        cancellations,
        jobs_completed,
        jobs_skipped,
        job_errors_captured,
    }
}

const LATENCY_WINDOW: usize = 1000;

/// Sliding window of the most recent processing times
#[derive(Debug, Default)]
pub struct LatencyWindow {
    samples: Mutex<VecDeque<u64>>,
}

impl LatencyWindow {
    pub fn record(&self, duration: Duration) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.push_back(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
            if samples.len() > LATENCY_WINDOW {
                samples.pop_front();
            }
        }
    }

    /// p50/p95/p99 in milliseconds, keyed for inclusion in a snapshot
    pub fn percentiles(&self) -> Snapshot {
        let mut sorted: Vec<u64> = self
            .samples
            .lock()
            .map(|samples| samples.iter().copied().collect())
            .unwrap_or_default();
        sorted.sort_unstable();

        let mut snapshot = Snapshot::new();
        for (key, p) in [
            ("processing_time_p50_ms", 50.0),
            ("processing_time_p95_ms", 95.0),
            ("processing_time_p99_ms", 99.0),
        ] {
            snapshot.insert(key.to_string(), percentile(&sorted, p).round() as i64);
        }
        snapshot
    }
}

/// Linear-interpolated percentile over sorted data
fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
    let lower = sorted_data[index.floor() as usize] as f64;
    let upper = sorted_data[index.ceil() as usize] as f64;
    lower + (upper - lower) * index.fract()
}

/// Named metric sources for export
#[derive(Default)]
pub struct MetricsRegistry {
    sources: RwLock<Vec<(String, Arc<dyn MetricsSource>)>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source; a later registration under the same name replaces it
    pub fn register(&self, name: impl Into<String>, source: Arc<dyn MetricsSource>) {
        let name = name.into();
        if let Ok(mut sources) = self.sources.write() {
            sources.retain(|(existing, _)| *existing != name);
            sources.push((name, source));
        }
    }

    pub fn snapshot_all(&self) -> BTreeMap<String, Snapshot> {
        self.sources
            .read()
            .map(|sources| {
                sources
                    .iter()
                    .map(|(name, source)| (name.clone(), source.snapshot()))
                    .collect()
            })
            .unwrap_or_default()
    }
}
