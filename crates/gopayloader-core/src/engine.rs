//! The run engine: validates configuration, primes the JWT pipeline, fans
//! workers out behind a start barrier and aggregates live and final
//! statistics.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::{mpsc, watch, Barrier};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::http_clients::{self, Client, ClientSettings};
use crate::jwt::{self, JwtConfig, JwtGenerator};
use crate::results::{self, ByteSize, Latency, LiveSummary, Rps, RunResult};
use crate::worker::{self, JwtStream, LiveCounters, Stats, WorkerBase};

const LATENCY_CHANNEL_CAPACITY: usize = 1_000_000;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type TokenStreams = (
    async_channel::Receiver<String>,
    async_channel::Receiver<Error>,
);

/// Cache directory for generated tokens. `GOPAYLOADER_CACHE_DIR` overrides
/// the default `~/.cache/gopayloader`.
pub fn jwt_cache_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("GOPAYLOADER_CACHE_DIR") {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|home| home.join(".cache").join("gopayloader"))
        .ok_or(Error::NoCacheDir)
}

/// Delete every generated token store.
pub fn clear_cache() -> Result<()> {
    let dir = jwt_cache_dir()?;
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Configured,
    Validated,
    JwtReady,
    Running,
    Finalizing,
    Done,
    Aborted,
}

fn transition(from: EngineState, to: EngineState) -> EngineState {
    debug!(?from, ?to, "engine state change");
    to
}

pub struct Payloader {
    config: Arc<RunConfig>,
}

impl Payloader {
    pub fn new(config: RunConfig) -> Self {
        Payloader {
            config: Arc::new(config),
        }
    }

    /// Execute the configured run to completion or cancellation. Partial
    /// results are returned on cancellation after a short drain window.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunResult> {
        let cfg = &self.config;
        let mut state = EngineState::Configured;

        cfg.validate()?;
        state = transition(state, EngineState::Validated);

        let jwt_streams = self.prepare_jwts(&cancel).await?;
        state = transition(state, EngineState::JwtReady);

        let conns = u64::from(cfg.conns);
        let reqs_per_worker = cfg.reqs / conns;
        let remainder = cfg.reqs % conns;
        let req_every = if !cfg.duration.is_zero() && cfg.reqs != 0 {
            // interval() panics on a zero period
            Duration::from_nanos(
                (cfg.duration.as_nanos() / u128::from(reqs_per_worker.max(1))) as u64,
            )
            .max(Duration::from_nanos(1))
        } else {
            Duration::ZERO
        };
        self.print_summary(req_every);

        let (lat_tx, lat_rx) = mpsc::channel(LATENCY_CHANNEL_CAPACITY);
        let aggregator = tokio::spawn(results::aggregate(lat_rx));

        // construct every worker before spawning any, so a failed client
        // setup can't strand earlier workers on the barrier
        let settings = ClientSettings::from_config(cfg)?;
        let barrier = Arc::new(Barrier::new(cfg.conns as usize + 1));
        let mut lives = Vec::with_capacity(cfg.conns as usize);
        let mut workers = Vec::with_capacity(cfg.conns as usize);
        for i in 0..conns {
            let client = Client::connect(cfg.client, settings.clone()).await?;
            let req = http_clients::build_request(cfg)?;
            let live = Arc::new(LiveCounters::default());
            let jwt = jwt_streams.as_ref().map(|(tokens, _)| JwtStream {
                header: cfg.jwt_header.clone(),
                tokens: tokens.clone(),
            });
            let base = WorkerBase::new(
                client,
                req,
                live.clone(),
                lat_tx.clone(),
                jwt,
                cancel.clone(),
            );
            let quota = reqs_per_worker + u64::from(i < remainder);
            lives.push(live);
            workers.push(worker::new_worker(base, cfg, quota, req_every));
        }
        drop(lat_tx);

        let mut handles = Vec::with_capacity(workers.len());
        for worker in workers {
            handles.push(tokio::spawn(worker.run(barrier.clone())));
        }

        if let Some((_, errs)) = &jwt_streams {
            let errs = errs.clone();
            tokio::spawn(async move {
                if let Ok(e) = errs.recv().await {
                    error!("jwt stream failed; {}", e);
                }
            });
        }

        let (done_tx, done_rx) = watch::channel(false);
        let progress = if cfg.verbose {
            Some(spawn_progress(cfg, lives.clone(), done_rx))
        } else {
            None
        };

        state = transition(state, EngineState::Running);
        barrier.wait().await;
        let t0 = Instant::now();
        let start_wall = Local::now();

        let mut stats: Vec<Stats> = Vec::with_capacity(handles.len());
        let mut grace_deadline: Option<Instant> = None;
        for mut handle in handles {
            if cancel.is_cancelled() && grace_deadline.is_none() {
                grace_deadline = Some(Instant::now() + SHUTDOWN_GRACE);
            }
            let joined = match grace_deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, &mut handle).await {
                    Ok(res) => res,
                    Err(_) => {
                        handle.abort();
                        continue;
                    }
                },
                None => handle.await,
            };
            if let Ok(s) = joined {
                stats.push(s);
            }
        }

        let total = t0.elapsed();
        let end_wall = Local::now();
        state = transition(state, EngineState::Finalizing);

        let _ = done_tx.send(true);
        if let Some(p) = progress {
            let _ = p.await;
        }
        let summary = aggregator.await.unwrap_or_default();

        let result = finalize(start_wall, end_wall, total, &stats, summary);
        if cancel.is_cancelled() {
            transition(state, EngineState::Aborted);
        } else {
            transition(state, EngineState::Done);
        }
        Ok(result)
    }

    /// JWT phase: make sure the cache holds enough tokens, then open the
    /// stream the workers will drain.
    async fn prepare_jwts(&self, cancel: &CancellationToken) -> Result<Option<TokenStreams>> {
        let cfg = &self.config;
        if !cfg.jwt_enabled() {
            return Ok(None);
        }

        let dir = jwt_cache_dir()?;
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755))?;
        }

        if !cfg.jwts_filename.is_empty() {
            let path = dir.join(&cfg.jwts_filename);
            return jwt::stream_jwt_file(&path, cfg.reqs).await.map(Some);
        }

        let key_path = cfg
            .jwt_key
            .clone()
            .ok_or_else(|| Error::Config("jwt-key missing".to_string()))?;
        let generator = JwtGenerator::new(JwtConfig {
            key_path,
            kid: cfg.jwt_kid.clone(),
            sub: cfg.jwt_sub.clone(),
            iss: cfg.jwt_iss.clone(),
            aud: cfg.jwt_aud.clone(),
            custom_claims: cfg.jwt_claims.clone(),
        })?;
        generator.generate(cfg.reqs, &dir, cancel).await?;
        generator.jwts(cfg.reqs, &dir).await.map(Some)
    }

    fn print_summary(&self, req_every: Duration) {
        let cfg = &self.config;
        if cfg.req_limited_only() {
            println!(
                "Running {} requests over {} connections against {}",
                cfg.reqs, cfg.conns, cfg.req_uri
            );
        } else if cfg.unlimited_reqs() {
            println!(
                "Running unlimited requests for {:?} over {} connections against {}",
                cfg.duration, cfg.conns, cfg.req_uri
            );
        } else {
            println!(
                "Running {} requests spread across {:?} over {} connections against {}, one request every {:?} per connection",
                cfg.reqs, cfg.duration, cfg.conns, cfg.req_uri, req_every
            );
        }
    }
}

fn finalize(
    start: DateTime<Local>,
    end: DateTime<Local>,
    total: Duration,
    stats: &[Stats],
    live: LiveSummary,
) -> RunResult {
    let mut completed = 0u64;
    let mut failed = 0u64;
    let mut responses = BTreeMap::new();
    let mut errors = BTreeMap::new();
    let mut req_size = 0i64;
    let mut resp_size = 0i64;
    for s in stats {
        completed += s.completed;
        failed += s.failed;
        for (code, n) in &s.responses {
            *responses.entry(*code).or_insert(0) += n;
        }
        for (msg, n) in &s.errors {
            *errors.entry(msg.clone()).or_insert(0) += n;
        }
        if req_size == 0 {
            req_size = s.req_size;
        }
        if resp_size == 0 {
            resp_size = s.resp_size;
        }
    }

    let latency = Latency {
        total: Duration::from_nanos(live.total),
        max: Duration::from_nanos(live.max),
        min: Duration::from_nanos(live.min),
        average: if completed > 0 {
            Duration::from_nanos(live.total / completed)
        } else {
            Duration::ZERO
        },
    };
    let secs = total.as_secs_f64();
    let rps = Rps {
        average: if secs > 0.0 {
            completed as f64 / secs
        } else {
            completed as f64
        },
        max: live.rps_max,
        min: live.rps_min,
    };

    RunResult {
        start,
        end,
        total,
        completed,
        failed,
        rps,
        latency,
        req_byte_size: byte_size(req_size, completed, total),
        resp_byte_size: byte_size(resp_size, completed, total),
        responses,
        errors,
    }
}

fn byte_size(single: i64, completed: u64, total: Duration) -> ByteSize {
    let total_bytes = single * completed as i64;
    let secs = total.as_secs() as i64;
    ByteSize {
        single,
        total: total_bytes,
        per_second: if secs == 0 {
            total_bytes
        } else {
            total_bytes / secs
        },
    }
}

fn spawn_progress(
    cfg: &RunConfig,
    lives: Vec<Arc<LiveCounters>>,
    mut done: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let reqs = cfg.reqs;
    let duration = cfg.duration;
    let tick = cfg.ticker;
    tokio::spawn(async move {
        let bars = MultiProgress::new();
        let len = if reqs > 0 {
            reqs
        } else {
            duration.as_secs().max(1)
        };
        let bar = bars.add(ProgressBar::new(len));
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{bar:40.cyan/blue} {pos}/{len} {msg}")
                .unwrap(),
        );
        let success = bars.add(ProgressBar::new_spinner());
        success.set_style(ProgressStyle::default_spinner().template("{msg}").unwrap());
        let fails = bars.add(ProgressBar::new_spinner());
        fails.set_style(ProgressStyle::default_spinner().template("{msg}").unwrap());

        let started = Instant::now();
        let mut ticker = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let completed: u64 = lives.iter().map(|l| l.completed.load(Ordering::Relaxed)).sum();
                    let failed: u64 = lives.iter().map(|l| l.failed.load(Ordering::Relaxed)).sum();
                    if reqs > 0 {
                        bar.set_position((completed + failed).min(len));
                    } else {
                        bar.set_position(started.elapsed().as_secs().min(len));
                    }
                    success.set_message(format!("Successful requests: {}", completed));
                    fails.set_message(format!("Failed requests: {}", failed));
                }
                _ = done.changed() => break,
            }
        }
        bar.finish_and_clear();
        success.finish_and_clear();
        fails.finish_and_clear();
    })
}
