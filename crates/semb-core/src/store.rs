use std::{fs, path::PathBuf};

use crate::{domain::SessionId, marathon::Marathon, Result};

/// JSON persistence for marathons, one file per session.
///
/// Round-trips phase, configuration, and every (participant, site) entry
/// losslessly so a restart keeps all deltas.
pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, session: SessionId) -> PathBuf {
        self.dir.join(format!("marathon-{}.json", session.0))
    }

    pub fn save(&self, marathon: &Marathon) -> Result<()> {
        let json = serde_json::to_string_pretty(marathon)?;
        fs::write(self.path(marathon.session), json)?;
        Ok(())
    }

    pub fn load(&self, session: SessionId) -> Result<Option<Marathon>> {
        let path = self.path(session);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Load every persisted marathon (used at startup to restore sessions).
    pub fn load_all(&self) -> Result<Vec<Marathon>> {
        let mut out = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with("marathon-") || !name.ends_with(".json") {
                continue;
            }
            let contents = fs::read_to_string(&path)?;
            match serde_json::from_str(&contents) {
                Ok(marathon) => out.push(marathon),
                Err(e) => {
                    tracing::warn!("skipping unreadable state file {}: {e}", path.display());
                }
            }
        }
        Ok(out)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountId, SiteId, Username};
    use chrono::Utc;
    use std::time::Duration;

    fn temp_store(tag: &str) -> (Store, PathBuf) {
        let dir = std::env::temp_dir().join(format!("semb-store-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        (Store::new(dir.clone()).unwrap(), dir)
    }

    #[test]
    fn round_trips_phase_and_deltas() {
        let (store, dir) = temp_store("roundtrip");

        let mut m = Marathon::new(SessionId(42), Duration::from_secs(3600));
        m.set_sites(vec![SiteId("stackoverflow".into())]).unwrap();
        m.add_participants(vec![Username("alice".into())]).unwrap();
        m.start(Utc::now()).unwrap();
        let mut seq = m.next_baseline_seq;
        m.participants[0].entries[0].record_success(AccountId(7), 100, Utc::now(), &mut seq);
        m.participants[0].entries[0].record_success(AccountId(7), 130, Utc::now(), &mut seq);
        m.next_baseline_seq = seq;

        store.save(&m).unwrap();
        let loaded = store.load(SessionId(42)).unwrap().unwrap();

        assert_eq!(loaded.phase, m.phase);
        assert_eq!(loaded.duration, m.duration);
        assert_eq!(loaded.started_at, m.started_at);
        let entry = &loaded.participants[0].entries[0];
        assert_eq!(entry.baseline, Some(100));
        assert_eq!(entry.last_known, Some(130));
        assert_eq!(entry.delta(), 30);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_missing_returns_none() {
        let (store, dir) = temp_store("missing");
        assert!(store.load(SessionId(1)).unwrap().is_none());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn save_overwrites_previous_state_for_the_session() {
        let (store, dir) = temp_store("overwrite");
        let mut m = Marathon::new(SessionId(3), Duration::from_secs(3600));
        store.save(&m).unwrap();
        m.add_participants(vec![Username("alice".into())]).unwrap();
        store.save(&m).unwrap();

        let loaded = store.load(SessionId(3)).unwrap().unwrap();
        assert_eq!(loaded.participants.len(), 1);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_all_finds_saved_marathons() {
        let (store, dir) = temp_store("all");
        for id in [1, 2] {
            let m = Marathon::new(SessionId(id), Duration::from_secs(3600));
            store.save(&m).unwrap();
        }
        let mut sessions: Vec<i64> = store.load_all().unwrap().iter().map(|m| m.session.0).collect();
        sessions.sort_unstable();
        assert_eq!(sessions, vec![1, 2]);
        let _ = fs::remove_dir_all(dir);
    }
}
