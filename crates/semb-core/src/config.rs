use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// Typed configuration for the engine.
///
/// Everything the spec leaves as an implementer-chosen default (polling
/// interval, backoff cap, failure threshold, ...) is an env-tunable here.
#[derive(Clone, Debug)]
pub struct Config {
    // Polling
    /// Overrides the duration-scaled refresh interval when set.
    pub poll_interval_override: Option<Duration>,
    pub fetch_timeout: Duration,
    pub fetch_concurrency: usize,

    // Failure handling
    pub failure_threshold: u32,
    pub backoff_cap_ticks: u32,
    pub degraded_retry_factor: u32,

    // Marathon defaults
    pub default_duration: Duration,

    // Persistence
    pub state_dir: PathBuf,

    // Stack Exchange API
    pub se_api_base: String,
    pub se_app_key: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let poll_interval_override = env_u64("SEMB_POLL_INTERVAL_SECS").map(Duration::from_secs);
        let fetch_timeout = Duration::from_secs(env_u64("SEMB_FETCH_TIMEOUT_SECS").unwrap_or(10));
        let fetch_concurrency = env_usize("SEMB_FETCH_CONCURRENCY").unwrap_or(4).max(1);

        let failure_threshold = env_u32("SEMB_FAILURE_THRESHOLD").unwrap_or(5).max(1);
        let backoff_cap_ticks = env_u32("SEMB_BACKOFF_CAP_TICKS").unwrap_or(8).max(1);
        let degraded_retry_factor = env_u32("SEMB_DEGRADED_RETRY_FACTOR").unwrap_or(4).max(1);

        let default_duration =
            Duration::from_secs(env_u64("SEMB_DEFAULT_DURATION_HOURS").unwrap_or(4) * 3600);
        if default_duration.is_zero() {
            return Err(Error::Config(
                "SEMB_DEFAULT_DURATION_HOURS must be positive".to_string(),
            ));
        }

        let state_dir =
            PathBuf::from(env_str("SEMB_STATE_DIR").unwrap_or("/tmp/semb-state".to_string()));
        fs::create_dir_all(&state_dir)?;

        let se_api_base = env_str("SEMB_API_BASE")
            .and_then(non_empty)
            .unwrap_or("https://api.stackexchange.com/2.3".to_string());
        let se_app_key = env_str("SEMB_APP_KEY").and_then(non_empty);

        Ok(Self {
            poll_interval_override,
            fetch_timeout,
            fetch_concurrency,
            failure_threshold,
            backoff_cap_ticks,
            degraded_retry_factor,
            default_duration,
            state_dir,
            se_api_base,
            se_app_key,
        })
    }
}

impl Default for Config {
    /// Built-in defaults, independent of the environment. Used by tests.
    fn default() -> Self {
        Self {
            poll_interval_override: None,
            fetch_timeout: Duration::from_secs(10),
            fetch_concurrency: 4,
            failure_threshold: 5,
            backoff_cap_ticks: 8,
            degraded_retry_factor: 4,
            default_duration: Duration::from_secs(4 * 3600),
            state_dir: std::env::temp_dir().join("semb-state"),
            se_api_base: "https://api.stackexchange.com/2.3".to_string(),
            se_app_key: None,
        }
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
