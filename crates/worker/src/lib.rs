//! rankd worker: the recalculation loop.
//!
//! One loop per process. Throughput comes from running more processes against
//! the same store; the store's claim is what keeps them from duplicating work.

#![forbid(unsafe_code)]

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use rankd_core::clock::elapsed;
use rankd_core::{
    BuilderError, Clock, CommitOutcome, ContestId, EngineConfig, EngineResult, RankingBuilder, RankingKey,
    RecalculationTicket, SystemClock,
};
use rankd_persist::RankingStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

mod command;
mod disciplines;

pub use command::CommandBuilder;
pub use disciplines::Disciplines;

/// Commit/abandon attempts against a busy store before giving up.
const RELEASE_ATTEMPTS: u32 = 3;
const RELEASE_BACKOFF: Duration = Duration::from_millis(50);

/// Outcome of a single loop iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// Nothing eligible.
    Idle,
    Committed { contest_id: ContestId, key: RankingKey, pages: usize, duration: Duration },
    /// Build or commit failed; the ranking was left stale for a prompt retry.
    Failed { contest_id: ContestId, key: RankingKey, error: String },
    /// The ticket no longer owned the ranking when results came back.
    Lost { contest_id: ContestId, key: RankingKey },
}

pub struct Worker {
    store: Arc<dyn RankingStore>,
    builder: Arc<dyn RankingBuilder>,
    clock: Arc<dyn Clock>,
    polling_interval: Duration,
}

impl Worker {
    pub fn new(store: Arc<dyn RankingStore>, builder: Arc<dyn RankingBuilder>, cfg: &EngineConfig) -> Self {
        Self { store, builder, clock: Arc::new(SystemClock), polling_interval: cfg.polling_interval }
    }

    /// Use a different clock for build timing. Should be the store's clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn polling_interval(&self) -> Duration {
        self.polling_interval
    }

    /// Claim at most one ranking, build it and publish the result.
    pub fn tick(&self) -> EngineResult<Tick> {
        let Some(ticket) = self.store.pick_one()? else {
            return Ok(Tick::Idle);
        };
        let started_at = self.clock.now();
        let started = Instant::now();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| self.builder.build(&ticket.contest_id, &ticket.key)))
            .unwrap_or_else(|payload| Err(BuilderError::Panicked(panic_message(payload.as_ref()))));
        histogram!("ranking_build_ms", started.elapsed().as_secs_f64() * 1000.0);
        let finished_at = self.clock.now();

        match result {
            Ok(built) => {
                let pages = built.pages.len();
                let committed =
                    self.retry_busy("commit", &ticket, || self.store.commit(&ticket, started_at, finished_at, &built));
                match committed {
                    Ok(CommitOutcome::Committed) => Ok(Tick::Committed {
                        contest_id: ticket.contest_id,
                        key: ticket.key,
                        pages,
                        duration: elapsed(started_at, finished_at),
                    }),
                    Ok(CommitOutcome::Lost) => Ok(Tick::Lost { contest_id: ticket.contest_id, key: ticket.key }),
                    Err(e) => {
                        counter!("ranking_commit_failed_total", 1u64, "kind" => e.kind().as_str());
                        error!(contest = %ticket.contest_id, key = %ticket.key, error = %e, "commit failed; releasing ticket");
                        self.release(ticket, started_at, finished_at, e.to_string())
                    }
                }
            }
            Err(e) => {
                counter!("ranking_build_failed_total", 1u64);
                error!(contest = %ticket.contest_id, key = %ticket.key, error = %e, "ranking build failed");
                self.release(ticket, started_at, finished_at, e.to_string())
            }
        }
    }

    /// Hand the ticket back without publishing, leaving the ranking stale.
    ///
    /// Only errors once the store refused the release on every attempt; the
    /// ticket then stays held until the TTL reclaims it.
    fn release(
        &self,
        ticket: RecalculationTicket,
        started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
        error: String,
    ) -> EngineResult<Tick> {
        let released = self.retry_busy("abandon", &ticket, || self.store.abandon(&ticket, started_at, failed_at));
        match released {
            Ok(CommitOutcome::Committed) => Ok(Tick::Failed { contest_id: ticket.contest_id, key: ticket.key, error }),
            Ok(CommitOutcome::Lost) => Ok(Tick::Lost { contest_id: ticket.contest_id, key: ticket.key }),
            Err(e) => {
                counter!("ranking_ticket_stranded_total", 1u64);
                error!(contest = %ticket.contest_id, key = %ticket.key, ticket = %ticket.id, error = %e, "could not release ticket");
                Err(e)
            }
        }
    }

    /// Run `op`, retrying transient storage errors with doubling backoff.
    fn retry_busy<T>(
        &self,
        what: &str,
        ticket: &RecalculationTicket,
        mut op: impl FnMut() -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut backoff = RELEASE_BACKOFF;
        let mut attempt = 1;
        loop {
            match op() {
                Err(e) if e.is_transient() && attempt < RELEASE_ATTEMPTS => {
                    warn!(contest = %ticket.contest_id, key = %ticket.key, attempt, error = %e, "{what} hit a busy store; retrying");
                    std::thread::sleep(backoff);
                    backoff *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Poll until `shutdown` flips to true (or its sender goes away while idle).
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(polling_ms = self.polling_interval.as_millis() as u64, "recalculation worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let me = Arc::clone(&self);
            let idle = match tokio::task::spawn_blocking(move || me.tick()).await {
                Ok(Ok(Tick::Idle)) => true,
                Ok(Ok(tick)) => {
                    debug!(?tick, "iteration done");
                    false
                }
                Ok(Err(e)) => {
                    counter!("ranking_worker_errors_total", 1u64, "kind" => e.kind().as_str());
                    if e.is_transient() {
                        debug!(error = %e, "store busy; retrying next poll");
                    } else {
                        warn!(error = %e, "recalculation iteration failed");
                    }
                    true
                }
                Err(e) => {
                    error!(error = %e, "recalculation task aborted");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.polling_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            debug!("shutdown sender dropped");
                            break;
                        }
                    }
                }
            }
        }
        info!("recalculation worker stopped");
    }
}

/// Spawn the loop on the current runtime. Send `true` (or drop the sender) to stop it.
pub fn spawn_worker(worker: Worker) -> (watch::Sender<bool>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(Arc::new(worker).run(rx));
    (tx, handle)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
