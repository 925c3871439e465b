use std::time::Duration;

use crate::{
    domain::{SiteId, Username},
    errors::Error,
    leaderboard::LeaderboardEntry,
    marathon::{Phase, SettingsSnapshot},
    Result,
};

/// A parsed front-end command. The chat front-end delivers
/// `(name, argumentList, sessionId)`; this is the typed form the engine
/// dispatches on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    NewMarathon,
    SetSites(Vec<SiteId>),
    AddParticipants(Vec<Username>),
    SetDuration(Duration),
    Settings,
    StartMarathon,
    PauseMarathon,
    ResumeMarathon,
    StopMarathon,
    Leaderboard,
    Time,
    Status,
}

impl Command {
    /// Parse a command name (with or without a leading `/`) plus its argument
    /// list into a typed command.
    pub fn parse(name: &str, args: &[String]) -> Result<Self> {
        let name = name.trim().trim_start_matches('/');
        match name {
            "new_marathon" => Ok(Command::NewMarathon),
            "set_sites" => {
                if args.is_empty() {
                    return Err(Error::Usage("expected at least one site".to_string()));
                }
                Ok(Command::SetSites(
                    args.iter().map(|s| SiteId(s.clone())).collect(),
                ))
            }
            "add_participants" => {
                if args.is_empty() {
                    return Err(Error::Usage("expected at least one username".to_string()));
                }
                Ok(Command::AddParticipants(
                    args.iter().map(|s| Username(s.clone())).collect(),
                ))
            }
            "set_duration" => Ok(Command::SetDuration(parse_duration(args)?)),
            "settings" => Ok(Command::Settings),
            "start_marathon" => Ok(Command::StartMarathon),
            "pause_marathon" => Ok(Command::PauseMarathon),
            "resume_marathon" => Ok(Command::ResumeMarathon),
            "stop_marathon" => Ok(Command::StopMarathon),
            "leaderboard" => Ok(Command::Leaderboard),
            "time" => Ok(Command::Time),
            "status" => Ok(Command::Status),
            other => Err(Error::UnknownCommand(other.to_string())),
        }
    }
}

/// `HOURS` or `HOURS MINUTES`.
fn parse_duration(args: &[String]) -> Result<Duration> {
    let (hours, minutes) = match args {
        [h] => (parse_num(h)?, 0),
        [h, m] => (parse_num(h)?, parse_num(m)?),
        _ => {
            return Err(Error::Usage(
                "expected one or two arguments: HOURS [MINUTES]".to_string(),
            ))
        }
    };
    let secs = hours * 3600 + minutes * 60;
    if secs == 0 {
        return Err(Error::Usage("duration must be positive".to_string()));
    }
    Ok(Duration::from_secs(secs))
}

fn parse_num(s: &str) -> Result<u64> {
    s.trim()
        .parse::<u64>()
        .map_err(|_| Error::Usage(format!("invalid number: {s}")))
}

/// Phase plus elapsed/remaining time, for `/status`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub phase: Phase,
    pub elapsed: Duration,
    pub remaining: Duration,
    /// True when the marathon stopped by running out its clock rather than
    /// by /stop_marathon, so the front-end can say so.
    pub expired: bool,
}

/// Structured result of a dispatched command. The front-end renders this as
/// text; the core never formats messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    Created,
    SitesSet(Vec<SiteId>),
    ParticipantsAdded(Vec<Username>),
    DurationSet(Duration),
    Settings(SettingsSnapshot),
    Started,
    Paused,
    Resumed,
    Stopped,
    Leaderboard(Vec<LeaderboardEntry>),
    RemainingTime(Duration),
    Status(StatusSnapshot),
}
