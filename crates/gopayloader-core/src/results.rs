//! Run results and live latency/RPS aggregation.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Requests per second over the whole run; max/min are per-second window
/// counts observed while the run was in flight.
#[derive(Debug, Default, Clone)]
pub struct Rps {
    pub average: f64,
    pub max: u64,
    pub min: u64,
}

#[derive(Debug, Default, Clone)]
pub struct Latency {
    pub average: Duration,
    pub max: Duration,
    pub min: Duration,
    pub total: Duration,
}

#[derive(Debug, Default, Clone)]
pub struct ByteSize {
    pub single: i64,
    pub total: i64,
    pub per_second: i64,
}

/// Aggregated outcome of a run. Partial when the run was cancelled.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub start: DateTime<Local>,
    pub end: DateTime<Local>,
    pub total: Duration,
    pub completed: u64,
    pub failed: u64,
    pub rps: Rps,
    pub latency: Latency,
    pub req_byte_size: ByteSize,
    pub resp_byte_size: ByteSize,
    pub responses: BTreeMap<u16, u64>,
    pub errors: BTreeMap<String, u64>,
}

/// What the live aggregator hands back once the last worker is done.
/// Latency figures are nanoseconds.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct LiveSummary {
    pub max: u64,
    pub min: u64,
    pub total: u64,
    pub rps_max: u64,
    pub rps_min: u64,
}

/// Drain the latency channel while the run is in flight, tracking min/max/
/// total and a per-second RPS window. Ends when every worker has dropped
/// its sender.
pub(crate) async fn aggregate(mut rx: mpsc::Receiver<u64>) -> LiveSummary {
    let mut max = 0u64;
    let mut min = u64::MAX;
    let mut total = 0u64;
    let mut rps_max = 0u64;
    let mut rps_min = u64::MAX;
    let mut window = 0u64;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            sample = rx.recv() => match sample {
                Some(ns) => {
                    if ns > max {
                        max = ns;
                    }
                    if ns < min {
                        min = ns;
                    }
                    total += ns;
                    window += 1;
                }
                None => break,
            },
            _ = ticker.tick() => {
                if window > rps_max {
                    rps_max = window;
                }
                if window < rps_min {
                    rps_min = window;
                }
                window = 0;
            }
        }
    }

    // fold the final partial second in so sub-second runs report something
    if window > 0 {
        if window > rps_max {
            rps_max = window;
        }
        if window < rps_min {
            rps_min = window;
        }
    }
    if min == u64::MAX {
        min = 0;
    }
    if rps_min == u64::MAX {
        rps_min = rps_max;
    }

    LiveSummary {
        max,
        min,
        total,
        rps_max,
        rps_min,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn aggregate_tracks_extrema_and_total() {
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(aggregate(rx));
        for ns in [5u64, 1, 9, 3] {
            tx.send(ns).await.unwrap();
        }
        drop(tx);
        let summary = handle.await.unwrap();
        assert_eq!(summary.max, 9);
        assert_eq!(summary.min, 1);
        assert_eq!(summary.total, 18);
        assert_eq!(summary.rps_max, 4);
    }

    #[tokio::test]
    async fn aggregate_handles_empty_run() {
        let (tx, rx) = mpsc::channel::<u64>(1);
        drop(tx);
        let summary = aggregate(rx).await;
        assert_eq!(summary.min, 0);
        assert_eq!(summary.max, 0);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.rps_min, 0);
    }
}
