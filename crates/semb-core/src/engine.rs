use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    commands::{Command, CommandOutcome, StatusSnapshot},
    config::Config,
    domain::SessionId,
    errors::Error,
    leaderboard,
    marathon::{Marathon, Phase},
    poller::{self, PollerHandle},
    ports::ReputationSource,
    store::Store,
    Result,
};

/// Process-wide registry of independent marathons keyed by session id.
///
/// Each marathon lives behind its own `Mutex` (one exclusive-access scope per
/// marathon); the registry map is only locked long enough to clone a handle,
/// so independent marathons proceed concurrently.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    cfg: Arc<Config>,
    source: Arc<dyn ReputationSource>,
    store: Arc<Store>,
    sessions: Mutex<HashMap<SessionId, Arc<SessionHandle>>>,
}

struct SessionHandle {
    marathon: Arc<Mutex<Marathon>>,
    poller: Mutex<Option<PollerHandle>>,
}

impl SessionHandle {
    fn new(marathon: Marathon) -> Arc<Self> {
        Arc::new(Self {
            marathon: Arc::new(Mutex::new(marathon)),
            poller: Mutex::new(None),
        })
    }
}

impl Engine {
    pub fn new(cfg: Arc<Config>, source: Arc<dyn ReputationSource>) -> Result<Self> {
        let store = Arc::new(Store::new(cfg.state_dir.clone())?);
        Ok(Self {
            inner: Arc::new(EngineInner {
                cfg,
                source,
                store,
                sessions: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Restore persisted marathons; Running ones resume polling.
    pub async fn restore(&self) -> Result<usize> {
        let marathons = self.inner.store.load_all()?;
        let mut restored = 0usize;
        for marathon in marathons {
            let session = marathon.session;
            let was_running = marathon.phase == Phase::Running;
            let handle = SessionHandle::new(marathon);
            if was_running {
                let poller = self.spawn_poller(&handle);
                *handle.poller.lock().await = Some(poller);
            }
            self.inner.sessions.lock().await.insert(session, handle);
            restored += 1;
        }
        if restored > 0 {
            info!("restored {restored} marathon(s)");
        }
        Ok(restored)
    }

    async fn handle(&self, session: SessionId) -> Option<Arc<SessionHandle>> {
        self.inner.sessions.lock().await.get(&session).cloned()
    }

    fn spawn_poller(&self, handle: &SessionHandle) -> PollerHandle {
        poller::spawn(
            self.inner.cfg.clone(),
            self.inner.source.clone(),
            self.inner.store.clone(),
            handle.marathon.clone(),
        )
    }

    fn persist(&self, marathon: &Marathon) {
        if let Err(e) = self.inner.store.save(marathon) {
            warn!(session = %marathon.session, "failed to persist marathon: {e}");
        }
    }

    /// Validate and execute one front-end command against the session's
    /// marathon.
    pub async fn dispatch(&self, session: SessionId, command: Command) -> Result<CommandOutcome> {
        if command == Command::NewMarathon {
            return self.new_marathon(session).await;
        }

        let handle = self.handle(session).await.ok_or(Error::NoMarathon)?;
        let now = Utc::now();
        let mut m = handle.marathon.lock().await;

        // Observe natural expiry before validating the command.
        if m.check_expiry(now) {
            info!(%session, "marathon expired");
            if let Some(poller) = handle.poller.lock().await.take() {
                poller.abort();
            }
            self.persist(&m);
        }

        match command {
            Command::NewMarathon => unreachable!("handled above"),
            Command::SetSites(sites) => {
                m.set_sites(sites)?;
                self.persist(&m);
                Ok(CommandOutcome::SitesSet(m.sites.clone()))
            }
            Command::AddParticipants(usernames) => {
                m.add_participants(usernames.clone())?;
                self.persist(&m);
                Ok(CommandOutcome::ParticipantsAdded(usernames))
            }
            Command::SetDuration(duration) => {
                m.set_duration(duration)?;
                self.persist(&m);
                Ok(CommandOutcome::DurationSet(duration))
            }
            Command::Settings => Ok(CommandOutcome::Settings(m.settings())),
            Command::StartMarathon => {
                m.start(now)?;
                self.persist(&m);
                let poller = self.spawn_poller(&handle);
                let mut slot = handle.poller.lock().await;
                if let Some(old) = slot.take() {
                    old.abort();
                }
                *slot = Some(poller);
                info!(%session, "marathon started");
                Ok(CommandOutcome::Started)
            }
            Command::PauseMarathon => {
                m.pause(now)?;
                self.persist(&m);
                // In-flight fetches may finish; the epoch bump discards them.
                if let Some(poller) = handle.poller.lock().await.take() {
                    poller.halt();
                }
                info!(%session, "marathon paused");
                Ok(CommandOutcome::Paused)
            }
            Command::ResumeMarathon => {
                m.resume(now)?;
                self.persist(&m);
                let poller = self.spawn_poller(&handle);
                *handle.poller.lock().await = Some(poller);
                info!(%session, "marathon resumed");
                Ok(CommandOutcome::Resumed)
            }
            Command::StopMarathon => {
                m.stop()?;
                self.persist(&m);
                if let Some(poller) = handle.poller.lock().await.take() {
                    poller.abort();
                }
                info!(%session, "marathon stopped");
                Ok(CommandOutcome::Stopped)
            }
            Command::Leaderboard => {
                // Read-only snapshot; compute outside the lock so standings
                // never block polling longer than the copy.
                let snapshot = m.clone();
                drop(m);
                Ok(CommandOutcome::Leaderboard(leaderboard::compute(&snapshot)))
            }
            Command::Time => Ok(CommandOutcome::RemainingTime(m.remaining_time(now))),
            Command::Status => Ok(CommandOutcome::Status(StatusSnapshot {
                phase: m.phase,
                elapsed: m.elapsed(now),
                remaining: m.remaining_time(now),
                expired: m.is_expired(now),
            })),
        }
    }

    async fn new_marathon(&self, session: SessionId) -> Result<CommandOutcome> {
        let marathon = Marathon::new(session, self.inner.cfg.default_duration);
        self.persist(&marathon);
        let handle = SessionHandle::new(marathon);

        let previous = self
            .inner
            .sessions
            .lock()
            .await
            .insert(session, handle.clone());
        if let Some(previous) = previous {
            if let Some(poller) = previous.poller.lock().await.take() {
                poller.abort();
            }
        }

        info!(%session, "new marathon created");
        Ok(CommandOutcome::Created)
    }
}
