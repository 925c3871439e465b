use std::sync::Arc;

use chrono::Utc;
use tokio::{
    sync::{Mutex, Semaphore},
    task::{JoinHandle, JoinSet},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    domain::{AccountId, SiteId, Username},
    marathon::{Marathon, Phase, Resolution},
    ports::{Reputation, ReputationSource},
    store::Store,
};

/// Handle to one marathon's background polling task.
pub struct PollerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PollerHandle {
    /// Halt the schedule (pause). In-flight fetches may finish; their results
    /// carry a stale poll epoch and are discarded on arrival.
    pub fn halt(&self) {
        self.cancel.cancel();
    }

    /// Cancel the task and release its resources immediately (stop).
    pub fn abort(&self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

struct FetchJob {
    participant: usize,
    entry: usize,
    site: SiteId,
    username: Username,
    account: Option<AccountId>,
}

enum FetchOutcome {
    Success { account: AccountId, rep: Reputation },
    NotFound,
    /// Permanent resolution failure (e.g. several accounts share the
    /// username); the pair is excluded rather than retried.
    Unresolvable { reason: String },
    Failed { reason: String },
}

struct FetchResult {
    participant: usize,
    entry: usize,
    outcome: FetchOutcome,
}

/// Spawn the polling task for a running marathon.
///
/// One task per marathon drives all (participant, site) fetches; within a
/// tick they run concurrently under a bounded semaphore, each with its own
/// timeout. The first tick runs immediately so baselines land right after
/// start.
pub fn spawn(
    cfg: Arc<Config>,
    source: Arc<dyn ReputationSource>,
    store: Arc<Store>,
    marathon: Arc<Mutex<Marathon>>,
) -> PollerHandle {
    let cancel = CancellationToken::new();
    let tok = cancel.clone();
    let handle = tokio::spawn(async move {
        poll_loop(cfg, source, store, marathon, tok).await;
    });
    PollerHandle { cancel, handle }
}

async fn poll_loop(
    cfg: Arc<Config>,
    source: Arc<dyn ReputationSource>,
    store: Arc<Store>,
    marathon: Arc<Mutex<Marathon>>,
    cancel: CancellationToken,
) {
    let (session, interval) = {
        let m = marathon.lock().await;
        let interval = cfg.poll_interval_override.unwrap_or(m.refresh_interval());
        (m.session, interval)
    };
    info!(%session, interval_secs = interval.as_secs(), "poller started");

    loop {
        if !run_tick(&cfg, &source, &store, &marathon, &cancel).await {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => {}
        }
    }

    info!(%session, "poller stopped");
}

/// Run one tick. Returns false when the loop should end (cancelled, paused,
/// stopped, or expired).
async fn run_tick(
    cfg: &Arc<Config>,
    source: &Arc<dyn ReputationSource>,
    store: &Arc<Store>,
    marathon: &Arc<Mutex<Marathon>>,
    cancel: &CancellationToken,
) -> bool {
    if cancel.is_cancelled() {
        return false;
    }

    let now = Utc::now();
    let (epoch, session, jobs) = {
        let mut m = marathon.lock().await;
        if m.check_expiry(now) {
            info!(session = %m.session, "marathon expired");
            if let Err(e) = store.save(&m) {
                warn!(session = %m.session, "failed to persist expired marathon: {e}");
            }
            return false;
        }
        if m.phase != Phase::Running {
            return false;
        }
        (m.poll_epoch, m.session, collect_jobs(&mut m))
    };

    if jobs.is_empty() {
        return true;
    }

    let sem = Arc::new(Semaphore::new(cfg.fetch_concurrency));
    let mut set = JoinSet::new();
    for job in jobs {
        if cancel.is_cancelled() {
            return false;
        }
        let sem = sem.clone();
        let source = source.clone();
        let tok = cancel.clone();
        let fetch_timeout = cfg.fetch_timeout;
        set.spawn(async move {
            let Ok(_permit) = sem.acquire_owned().await else {
                return None;
            };
            if tok.is_cancelled() {
                return None;
            }
            Some(fetch_pair(source, job, fetch_timeout).await)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        if let Ok(Some(res)) = joined {
            results.push(res);
        }
    }

    let mut m = marathon.lock().await;
    if cancel.is_cancelled() || m.poll_epoch != epoch {
        // Paused/stopped mid-tick: these results belong to the old epoch.
        debug!(%session, "discarding stale poll results");
        return !cancel.is_cancelled();
    }

    apply_results(&mut m, cfg, results);
    if let Err(e) = store.save(&m) {
        warn!(%session, "failed to persist marathon state: {e}");
    }
    true
}

fn collect_jobs(m: &mut Marathon) -> Vec<FetchJob> {
    let mut jobs = Vec::new();
    for (pi, participant) in m.participants.iter_mut().enumerate() {
        for (ei, entry) in participant.entries.iter_mut().enumerate() {
            if entry.resolution == Resolution::NotFound {
                continue;
            }
            if entry.skip_ticks > 0 {
                entry.skip_ticks -= 1;
                continue;
            }
            jobs.push(FetchJob {
                participant: pi,
                entry: ei,
                site: entry.site.clone(),
                username: participant.username.clone(),
                account: match entry.resolution {
                    Resolution::Resolved(account) => Some(account),
                    _ => None,
                },
            });
        }
    }
    jobs
}

async fn fetch_pair(
    source: Arc<dyn ReputationSource>,
    job: FetchJob,
    fetch_timeout: std::time::Duration,
) -> FetchResult {
    let fail = |reason: String| FetchResult {
        participant: job.participant,
        entry: job.entry,
        outcome: FetchOutcome::Failed { reason },
    };

    // Resolve once; the account id is cached on the entry afterwards.
    let account = match job.account {
        Some(account) => account,
        None => match timeout(fetch_timeout, source.resolve_account(&job.site, &job.username)).await
        {
            Err(_) => return fail("resolution timed out".to_string()),
            Ok(Err(e @ crate::Error::Resolution { .. })) => {
                return FetchResult {
                    participant: job.participant,
                    entry: job.entry,
                    outcome: FetchOutcome::Unresolvable {
                        reason: e.to_string(),
                    },
                }
            }
            Ok(Err(e)) => return fail(e.to_string()),
            Ok(Ok(None)) => {
                return FetchResult {
                    participant: job.participant,
                    entry: job.entry,
                    outcome: FetchOutcome::NotFound,
                }
            }
            Ok(Ok(Some(account))) => account,
        },
    };

    match timeout(fetch_timeout, source.fetch_reputation(&job.site, account)).await {
        Err(_) => fail("fetch timed out".to_string()),
        Ok(Err(e)) => fail(e.to_string()),
        Ok(Ok(rep)) => FetchResult {
            participant: job.participant,
            entry: job.entry,
            outcome: FetchOutcome::Success { account, rep },
        },
    }
}

fn apply_results(m: &mut Marathon, cfg: &Config, results: Vec<FetchResult>) {
    let mut seq = m.next_baseline_seq;
    for result in results {
        let participant = &mut m.participants[result.participant];
        let username = participant.username.clone();
        let entry = &mut participant.entries[result.entry];
        match result.outcome {
            FetchOutcome::Success { account, rep } => {
                entry.record_success(account, rep.value, rep.at, &mut seq);
            }
            FetchOutcome::NotFound => {
                warn!(%username, site = %entry.site, "username not found; pair excluded");
                entry.resolution = Resolution::NotFound;
            }
            FetchOutcome::Unresolvable { reason } => {
                warn!(%username, site = %entry.site, "cannot resolve username; pair excluded: {reason}");
                entry.resolution = Resolution::NotFound;
            }
            FetchOutcome::Failed { reason } => {
                entry.record_failure(
                    cfg.failure_threshold,
                    cfg.backoff_cap_ticks,
                    cfg.degraded_retry_factor,
                );
                if entry.failures == cfg.failure_threshold {
                    warn!(
                        %username, site = %entry.site, failures = entry.failures,
                        "pair degraded, retrying at reduced rate: {reason}"
                    );
                } else {
                    debug!(%username, site = %entry.site, failures = entry.failures,
                        "fetch failed: {reason}");
                }
            }
        }
    }
    m.next_baseline_seq = seq;
}
