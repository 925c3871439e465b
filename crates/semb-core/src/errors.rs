use crate::domain::{SiteId, Username};
use crate::marathon::Phase;

/// Core error type for the marathon engine.
///
/// Adapter crates should map their specific errors into this type so the
/// front-end can render failures consistently (usage error vs transient).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("/{command} is not allowed while the marathon is {phase}")]
    InvalidPhase { command: &'static str, phase: Phase },

    #[error("cannot start marathon: {0}")]
    IncompleteConfig(&'static str),

    #[error("could not resolve {username} on {site}: {reason}")]
    Resolution {
        site: SiteId,
        username: Username,
        reason: String,
    },

    #[error("fetch failed for {site}: {reason}")]
    Fetch { site: SiteId, reason: String },

    #[error("marathon has ended")]
    Expired,

    #[error("no marathon in this session; use /new_marathon first")]
    NoMarathon,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("bad arguments: {0}")]
    Usage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;
