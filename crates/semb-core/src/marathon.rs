use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{AccountId, SessionId, SiteId, Username},
    errors::Error,
    Result,
};

/// Marathon lifecycle phase.
///
/// Valid transitions: Created -> Configured -> Running <-> Paused -> Stopped.
/// Running also auto-transitions to Stopped once elapsed >= duration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Created,
    Configured,
    Running,
    Paused,
    Stopped,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        self == Phase::Stopped
    }

    /// Settings commands are only allowed before the marathon starts.
    pub fn is_configurable(self) -> bool {
        matches!(self, Phase::Created | Phase::Configured)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Created => "created",
            Phase::Configured => "configured",
            Phase::Running => "running",
            Phase::Paused => "paused",
            Phase::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Username-to-account resolution state for one (participant, site) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Not yet looked up (or lookup failed transiently).
    Pending,
    Resolved(AccountId),
    /// Username does not exist on this site; excluded from aggregation.
    NotFound,
}

/// Tracking state for one (participant, site) pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SiteEntry {
    pub site: SiteId,
    pub resolution: Resolution,
    /// Reputation at first successful fetch after marathon start.
    pub baseline: Option<i64>,
    /// Monotonic capture order across the marathon; leaderboard tie-break key.
    pub baseline_seq: Option<u64>,
    pub last_known: Option<i64>,
    pub last_polled: Option<DateTime<Utc>>,
    pub failures: u32,
    /// Remaining ticks to skip before the next retry (backoff).
    pub skip_ticks: u32,
}

impl SiteEntry {
    fn new(site: SiteId) -> Self {
        Self {
            site,
            resolution: Resolution::Pending,
            baseline: None,
            baseline_seq: None,
            last_known: None,
            last_polled: None,
            failures: 0,
            skip_ticks: 0,
        }
    }

    pub fn delta(&self) -> i64 {
        match (self.baseline, self.last_known) {
            (Some(baseline), Some(current)) => current - baseline,
            _ => 0,
        }
    }

    pub fn is_degraded(&self, threshold: u32) -> bool {
        self.failures >= threshold
    }

    /// Whether this entry contributes to the leaderboard aggregate.
    /// Degraded entries still count (last-known delta); NotFound never does.
    pub fn aggregates(&self) -> bool {
        matches!(self.resolution, Resolution::Resolved(_)) && self.baseline.is_some()
    }

    pub fn record_success(
        &mut self,
        account: AccountId,
        value: i64,
        at: DateTime<Utc>,
        next_seq: &mut u64,
    ) {
        self.resolution = Resolution::Resolved(account);
        if self.baseline.is_none() {
            self.baseline = Some(value);
            self.baseline_seq = Some(*next_seq);
            *next_seq += 1;
        }
        self.last_known = Some(value);
        self.last_polled = Some(at);
        self.failures = 0;
        self.skip_ticks = 0;
    }

    /// Record a transient fetch failure and compute the backoff skip count.
    ///
    /// Retry intervals grow 1, 2, 4, ... ticks, capped at `cap` ticks. Once
    /// `failures >= threshold` the entry is degraded: retried every
    /// `degraded_factor` ticks instead, never abandoned.
    pub fn record_failure(&mut self, threshold: u32, cap: u32, degraded_factor: u32) {
        self.failures = self.failures.saturating_add(1);
        let interval = if self.failures >= threshold {
            degraded_factor
        } else {
            let exp = 1u32 << (self.failures - 1).min(16);
            exp.min(cap)
        };
        self.skip_ticks = interval.saturating_sub(1);
    }
}

/// One tracked participant: a username plus its per-site entries.
///
/// Entries are materialized at `start()` from the configured site set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Participant {
    pub username: Username,
    pub entries: Vec<SiteEntry>,
}

/// Read-only view of the current configuration, for `/settings`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettingsSnapshot {
    pub phase: Phase,
    pub sites: Vec<SiteId>,
    pub participants: Vec<Username>,
    pub duration: Duration,
}

/// A single time-boxed reputation-tracking competition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Marathon {
    pub session: SessionId,
    pub phase: Phase,
    pub duration: Duration,
    pub started_at: Option<DateTime<Utc>>,
    pub sites: Vec<SiteId>,
    pub participants: Vec<Participant>,
    /// Bumped on start/pause/resume/stop; in-flight poll results carrying a
    /// stale epoch are discarded so a pause never double-counts a delta.
    pub poll_epoch: u64,
    /// Next baseline capture sequence number.
    pub next_baseline_seq: u64,
}

impl Marathon {
    pub fn new(session: SessionId, default_duration: Duration) -> Self {
        Self {
            session,
            phase: Phase::Created,
            duration: default_duration,
            started_at: None,
            sites: Vec::new(),
            participants: Vec::new(),
            poll_epoch: 0,
            next_baseline_seq: 0,
        }
    }

    fn require_configurable(&self, command: &'static str) -> Result<()> {
        if self.phase.is_configurable() {
            Ok(())
        } else {
            Err(Error::InvalidPhase {
                command,
                phase: self.phase,
            })
        }
    }

    /// Replace the tracked site set. Only valid before start.
    pub fn set_sites(&mut self, sites: Vec<SiteId>) -> Result<()> {
        self.require_configurable("set_sites")?;
        if sites.is_empty() {
            return Err(Error::Usage("expected at least one site".to_string()));
        }
        let mut deduped: Vec<SiteId> = Vec::new();
        for site in sites {
            if !deduped.contains(&site) {
                deduped.push(site);
            }
        }
        self.sites = deduped;
        self.phase = Phase::Configured;
        Ok(())
    }

    /// Add participants by username. Only valid before start; duplicates are ignored.
    pub fn add_participants(&mut self, usernames: Vec<Username>) -> Result<()> {
        self.require_configurable("add_participants")?;
        if usernames.is_empty() {
            return Err(Error::Usage("expected at least one username".to_string()));
        }
        for username in usernames {
            if self.participants.iter().any(|p| p.username == username) {
                continue;
            }
            self.participants.push(Participant {
                username,
                entries: Vec::new(),
            });
        }
        self.phase = Phase::Configured;
        Ok(())
    }

    pub fn set_duration(&mut self, duration: Duration) -> Result<()> {
        self.require_configurable("set_duration")?;
        if duration.is_zero() {
            return Err(Error::Usage("duration must be positive".to_string()));
        }
        self.duration = duration;
        self.phase = Phase::Configured;
        Ok(())
    }

    /// Transition to Running and materialize the (participant, site) entries.
    ///
    /// Baselines are captured by the poller's first successful fetch per pair;
    /// until one lands the pair contributes a zero delta.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.phase.is_configurable() {
            return Err(Error::InvalidPhase {
                command: "start_marathon",
                phase: self.phase,
            });
        }
        if self.sites.is_empty() {
            return Err(Error::IncompleteConfig("no sites configured"));
        }
        if self.participants.is_empty() {
            return Err(Error::IncompleteConfig("no participants added"));
        }

        for participant in &mut self.participants {
            participant.entries = self
                .sites
                .iter()
                .map(|site| SiteEntry::new(site.clone()))
                .collect();
        }
        self.started_at = Some(now);
        self.phase = Phase::Running;
        self.poll_epoch += 1;
        Ok(())
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.check_expiry(now) {
            return Err(Error::Expired);
        }
        if self.phase != Phase::Running {
            return Err(Error::InvalidPhase {
                command: "pause_marathon",
                phase: self.phase,
            });
        }
        self.phase = Phase::Paused;
        self.poll_epoch += 1;
        Ok(())
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.phase != Phase::Paused {
            return Err(Error::InvalidPhase {
                command: "resume_marathon",
                phase: self.phase,
            });
        }
        if self.elapsed(now) >= self.duration {
            self.phase = Phase::Stopped;
            self.poll_epoch += 1;
            return Err(Error::Expired);
        }
        self.phase = Phase::Running;
        self.poll_epoch += 1;
        Ok(())
    }

    /// Stop from any non-terminal phase; final leaderboard data is retained.
    pub fn stop(&mut self) -> Result<()> {
        if self.phase.is_terminal() {
            return Err(Error::InvalidPhase {
                command: "stop_marathon",
                phase: self.phase,
            });
        }
        self.phase = Phase::Stopped;
        self.poll_epoch += 1;
        Ok(())
    }

    /// Auto-expiry: Running past `start + duration` transitions to Stopped.
    /// Returns true when the transition happened just now.
    pub fn check_expiry(&mut self, now: DateTime<Utc>) -> bool {
        if self.phase == Phase::Running && self.elapsed(now) >= self.duration {
            self.phase = Phase::Stopped;
            self.poll_epoch += 1;
            return true;
        }
        false
    }

    /// Whether the marathon ended by running out its clock (as opposed to an
    /// explicit stop well before the end).
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.phase == Phase::Stopped
            && self.started_at.is_some()
            && self.elapsed(now) >= self.duration
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        let Some(started_at) = self.started_at else {
            return Duration::ZERO;
        };
        (now - started_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// `duration - elapsed`, clamped to zero. Full duration before start,
    /// zero once stopped.
    pub fn remaining_time(&self, now: DateTime<Utc>) -> Duration {
        match self.phase {
            Phase::Created | Phase::Configured => self.duration,
            Phase::Running | Phase::Paused => self.duration.saturating_sub(self.elapsed(now)),
            Phase::Stopped => Duration::ZERO,
        }
    }

    /// Time between poll ticks, scaled to the marathon length.
    pub fn refresh_interval(&self) -> Duration {
        let mins = self.duration.as_secs() / 60;
        let interval_mins = if mins >= 120 {
            30
        } else if mins >= 45 {
            15
        } else if mins >= 15 {
            5
        } else if mins >= 10 {
            2
        } else {
            1
        };
        Duration::from_secs(interval_mins * 60)
    }

    pub fn settings(&self) -> SettingsSnapshot {
        SettingsSnapshot {
            phase: self.phase,
            sites: self.sites.clone(),
            participants: self
                .participants
                .iter()
                .map(|p| p.username.clone())
                .collect(),
            duration: self.duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn site(s: &str) -> SiteId {
        SiteId(s.to_string())
    }

    fn user(s: &str) -> Username {
        Username(s.to_string())
    }

    fn configured() -> Marathon {
        let mut m = Marathon::new(SessionId(1), Duration::from_secs(3600));
        m.set_sites(vec![site("stackoverflow")]).unwrap();
        m.add_participants(vec![user("alice"), user("bob")])
            .unwrap();
        m
    }

    #[test]
    fn settings_commands_move_created_to_configured() {
        let mut m = Marathon::new(SessionId(1), Duration::from_secs(3600));
        assert_eq!(m.phase, Phase::Created);
        m.set_duration(Duration::from_secs(1800)).unwrap();
        assert_eq!(m.phase, Phase::Configured);
    }

    #[test]
    fn start_requires_sites_and_participants() {
        let mut m = Marathon::new(SessionId(1), Duration::from_secs(3600));
        assert!(matches!(
            m.start(Utc::now()),
            Err(Error::IncompleteConfig(_))
        ));
        m.set_sites(vec![site("math")]).unwrap();
        assert!(matches!(
            m.start(Utc::now()),
            Err(Error::IncompleteConfig(_))
        ));
        assert_eq!(m.phase, Phase::Configured);

        m.add_participants(vec![user("alice")]).unwrap();
        m.start(Utc::now()).unwrap();
        assert_eq!(m.phase, Phase::Running);
        assert_eq!(m.participants[0].entries.len(), 1);
    }

    #[test]
    fn start_twice_is_invalid_phase_and_leaves_state_unchanged() {
        let mut m = configured();
        m.start(Utc::now()).unwrap();
        let started_at = m.started_at;
        let epoch = m.poll_epoch;
        assert!(matches!(
            m.start(Utc::now()),
            Err(Error::InvalidPhase { .. })
        ));
        assert_eq!(m.phase, Phase::Running);
        assert_eq!(m.started_at, started_at);
        assert_eq!(m.poll_epoch, epoch);
    }

    #[test]
    fn settings_commands_rejected_after_start() {
        let mut m = configured();
        m.start(Utc::now()).unwrap();
        let sites_before = m.sites.clone();
        assert!(matches!(
            m.set_sites(vec![site("tex")]),
            Err(Error::InvalidPhase { .. })
        ));
        assert_eq!(m.sites, sites_before);
        assert!(matches!(
            m.add_participants(vec![user("carol")]),
            Err(Error::InvalidPhase { .. })
        ));
        assert!(matches!(
            m.set_duration(Duration::from_secs(60)),
            Err(Error::InvalidPhase { .. })
        ));
    }

    #[test]
    fn pause_resume_toggle_and_bump_epoch() {
        let mut m = configured();
        m.start(Utc::now()).unwrap();
        let epoch = m.poll_epoch;

        m.pause(Utc::now()).unwrap();
        assert_eq!(m.phase, Phase::Paused);
        assert_eq!(m.poll_epoch, epoch + 1);

        assert!(matches!(
            m.pause(Utc::now()),
            Err(Error::InvalidPhase { .. })
        ));

        m.resume(Utc::now()).unwrap();
        assert_eq!(m.phase, Phase::Running);
        assert_eq!(m.poll_epoch, epoch + 2);
    }

    #[test]
    fn stop_is_valid_from_any_non_terminal_phase() {
        let mut m = Marathon::new(SessionId(1), Duration::from_secs(3600));
        m.stop().unwrap();
        assert_eq!(m.phase, Phase::Stopped);
        assert!(matches!(m.stop(), Err(Error::InvalidPhase { .. })));

        let mut m = configured();
        m.start(Utc::now()).unwrap();
        m.pause(Utc::now()).unwrap();
        m.stop().unwrap();
        assert_eq!(m.phase, Phase::Stopped);
    }

    #[test]
    fn running_expires_to_stopped() {
        let mut m = configured();
        m.set_duration(Duration::from_secs(600)).unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        m.start(t0).unwrap();

        let before_end = t0 + chrono::Duration::seconds(599);
        assert!(!m.check_expiry(before_end));
        assert_eq!(m.phase, Phase::Running);

        let at_end = t0 + chrono::Duration::seconds(600);
        assert!(m.check_expiry(at_end));
        assert_eq!(m.phase, Phase::Stopped);
        assert!(m.is_expired(at_end));
    }

    #[test]
    fn early_stop_is_not_reported_as_expiry() {
        let mut m = configured();
        m.set_duration(Duration::from_secs(600)).unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        m.start(t0).unwrap();
        m.stop().unwrap();
        assert!(!m.is_expired(t0 + chrono::Duration::seconds(10)));
    }

    #[test]
    fn resume_after_expiry_stops_and_reports_expired() {
        let mut m = configured();
        m.set_duration(Duration::from_secs(600)).unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        m.start(t0).unwrap();
        m.pause(t0 + chrono::Duration::seconds(10)).unwrap();

        let late = t0 + chrono::Duration::seconds(3600);
        assert!(matches!(m.resume(late), Err(Error::Expired)));
        assert_eq!(m.phase, Phase::Stopped);
    }

    #[test]
    fn remaining_time_clamps_to_zero() {
        let mut m = configured();
        m.set_duration(Duration::from_secs(600)).unwrap();
        assert_eq!(m.remaining_time(Utc::now()), Duration::from_secs(600));

        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        m.start(t0).unwrap();
        assert_eq!(
            m.remaining_time(t0 + chrono::Duration::seconds(100)),
            Duration::from_secs(500)
        );
        assert_eq!(
            m.remaining_time(t0 + chrono::Duration::seconds(9999)),
            Duration::ZERO
        );
    }

    #[test]
    fn refresh_interval_scales_with_duration() {
        let cases = [
            (3 * 3600, 30 * 60),
            (2 * 3600, 30 * 60),
            (3600, 15 * 60),
            (30 * 60, 5 * 60),
            (12 * 60, 2 * 60),
            (5 * 60, 60),
        ];
        for (duration_secs, interval_secs) in cases {
            let mut m = Marathon::new(SessionId(1), Duration::from_secs(3600));
            m.set_duration(Duration::from_secs(duration_secs)).unwrap();
            assert_eq!(
                m.refresh_interval(),
                Duration::from_secs(interval_secs),
                "duration {duration_secs}s"
            );
        }
    }

    #[test]
    fn backoff_retry_interval_doubles_then_caps() {
        let mut e = SiteEntry::new(site("stackoverflow"));
        let mut skips = Vec::new();
        for _ in 0..6 {
            e.record_failure(10, 8, 4);
            skips.push(e.skip_ticks);
        }
        // Retry intervals 1, 2, 4, 8, 8, 8 -> skip counts one less.
        assert_eq!(skips, vec![0, 1, 3, 7, 7, 7]);
    }

    #[test]
    fn degraded_entry_retries_at_reduced_rate() {
        let mut e = SiteEntry::new(site("stackoverflow"));
        for _ in 0..5 {
            e.record_failure(5, 8, 4);
        }
        assert!(e.is_degraded(5));
        assert_eq!(e.skip_ticks, 3);
    }

    #[test]
    fn success_resets_failures_and_keeps_baseline() {
        let mut e = SiteEntry::new(site("stackoverflow"));
        let mut seq = 0u64;
        e.record_success(AccountId(7), 100, Utc::now(), &mut seq);
        assert_eq!(e.baseline, Some(100));
        assert_eq!(e.baseline_seq, Some(0));
        assert_eq!(seq, 1);

        e.record_failure(5, 8, 4);
        e.record_success(AccountId(7), 150, Utc::now(), &mut seq);
        assert_eq!(e.baseline, Some(100));
        assert_eq!(e.last_known, Some(150));
        assert_eq!(e.delta(), 50);
        assert_eq!(e.failures, 0);
        assert_eq!(seq, 1);
    }
}
