//! Workers: one per connection, each executing requests under a load
//! regime. A worker owns its stats until it is joined; the engine only
//! touches the relaxed live counters while the run is in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Barrier};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::config::RunConfig;
use crate::http_clients::{Client, Request, Response};

/// Final per-worker tallies, handed to the engine at join.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub completed: u64,
    pub failed: u64,
    pub responses: HashMap<u16, u64>,
    pub errors: HashMap<String, u64>,
    pub req_size: i64,
    pub resp_size: i64,
}

/// Counters the progress display may read while the worker is running.
#[derive(Debug, Default)]
pub struct LiveCounters {
    pub completed: AtomicU64,
    pub failed: AtomicU64,
}

/// Receive half of the token stream plus the header tokens are sent under.
pub(crate) struct JwtStream {
    pub header: String,
    pub tokens: async_channel::Receiver<String>,
}

pub(crate) struct WorkerBase {
    client: Client,
    req: Request,
    resp: Response,
    stats: Stats,
    live: Arc<LiveCounters>,
    latency: mpsc::Sender<u64>,
    jwt_header: String,
    tokens: Option<async_channel::Receiver<String>>,
    cancel: CancellationToken,
}

impl WorkerBase {
    pub(crate) fn new(
        client: Client,
        req: Request,
        live: Arc<LiveCounters>,
        latency: mpsc::Sender<u64>,
        jwt: Option<JwtStream>,
        cancel: CancellationToken,
    ) -> Self {
        let stats = Stats {
            req_size: req.size(),
            ..Default::default()
        };
        let (jwt_header, tokens) = match jwt {
            Some(stream) => (stream.header, Some(stream.tokens)),
            None => (String::new(), None),
        };
        WorkerBase {
            client,
            req,
            resp: Response::default(),
            stats,
            live,
            latency,
            jwt_header,
            tokens,
            cancel,
        }
    }

    /// One request: pull a token if a stream is attached, execute, record.
    /// Returns false when the loop should stop (cancelled or stream closed).
    async fn run_once(&mut self) -> bool {
        let token = match &self.tokens {
            Some(rx) => tokio::select! {
                _ = self.cancel.cancelled() => return false,
                token = rx.recv() => match token {
                    Ok(token) => Some(token),
                    Err(_) => {
                        error!("jwt stream closed before worker finished");
                        return false;
                    }
                },
            },
            None => None,
        };
        if let Some(token) = token {
            if let Err(e) = self.req.set_header(&self.jwt_header, &token) {
                self.record_failure(e.to_string());
                return true;
            }
        }

        let begin = Instant::now();
        match self.client.execute(&self.req, &mut self.resp).await {
            Ok(()) => {
                let elapsed = begin.elapsed().as_nanos() as u64;
                let _ = self.latency.send(elapsed).await;
                self.stats.completed += 1;
                self.live.completed.fetch_add(1, Ordering::Relaxed);
                *self.stats.responses.entry(self.resp.status()).or_insert(0) += 1;
                if self.stats.resp_size == 0 {
                    self.stats.resp_size = self.resp.size();
                }
            }
            Err(e) => self.record_failure(e.to_string()),
        }
        self.resp.release();
        true
    }

    fn record_failure(&mut self, message: String) {
        self.stats.failed += 1;
        self.live.failed.fetch_add(1, Ordering::Relaxed);
        *self.stats.errors.entry(message).or_insert(0) += 1;
    }

    fn finish(mut self) -> Stats {
        self.client.close_idle();
        self.stats
    }
}

/// The three load regimes. All variants share the per-request subroutine
/// and only differ in their main loop.
pub(crate) enum Worker {
    /// Run exactly `reqs` iterations.
    FixedReqs { base: WorkerBase, reqs: u64 },
    /// Loop until the wall-clock deadline.
    FixedTime { base: WorkerBase, until: Duration },
    /// One request per tick; after the deadline, catch up back-to-back
    /// until the quota is met rather than under-deliver.
    FixedTimeReqs {
        base: WorkerBase,
        reqs: u64,
        until: Duration,
        req_every: Duration,
    },
}

pub(crate) fn new_worker(
    base: WorkerBase,
    cfg: &RunConfig,
    reqs: u64,
    req_every: Duration,
) -> Worker {
    if cfg.req_limited_only() {
        Worker::FixedReqs { base, reqs }
    } else if cfg.unlimited_reqs() {
        Worker::FixedTime {
            base,
            until: cfg.duration,
        }
    } else {
        Worker::FixedTimeReqs {
            base,
            reqs,
            until: cfg.duration,
            req_every,
        }
    }
}

impl Worker {
    pub(crate) async fn run(self, start: Arc<Barrier>) -> Stats {
        start.wait().await;
        match self {
            Worker::FixedReqs { mut base, reqs } => {
                for _ in 0..reqs {
                    if base.cancel.is_cancelled() || !base.run_once().await {
                        break;
                    }
                }
                base.finish()
            }
            Worker::FixedTime { mut base, until } => {
                let deadline = Instant::now() + until;
                while Instant::now() < deadline {
                    if base.cancel.is_cancelled() || !base.run_once().await {
                        break;
                    }
                }
                base.finish()
            }
            Worker::FixedTimeReqs {
                mut base,
                reqs,
                until,
                req_every,
            } => {
                let cancel = base.cancel.clone();
                let deadline = Instant::now() + until;
                let mut ticker = tokio::time::interval(req_every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
                let mut done = 0u64;
                while done < reqs {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if Instant::now() < deadline {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = ticker.tick() => {
                                if !base.run_once().await {
                                    break;
                                }
                                done += 1;
                            }
                        }
                    } else {
                        // deadline fired below quota; tolerate the overrun
                        if !base.run_once().await {
                            break;
                        }
                        done += 1;
                    }
                }
                base.finish()
            }
        }
    }
}
