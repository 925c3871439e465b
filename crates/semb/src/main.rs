//! Console driver for the marathon engine.
//!
//! A chat front-end would deliver parsed commands to `Engine::dispatch` and
//! render the outcomes; this binary does the same over stdin so the engine
//! can be exercised locally. Lines look like `/set_sites stackoverflow math`,
//! optionally prefixed with `@<session>` to address a specific session.

use std::{sync::Arc, time::Duration};

use semb_core::{
    commands::{Command, CommandOutcome},
    config::Config,
    domain::SessionId,
    engine::Engine,
};
use semb_stackexchange::StackExchangeClient;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<(), semb_core::Error> {
    semb_core::logging::init("semb")?;

    let cfg = Arc::new(Config::load()?);
    let source = Arc::new(StackExchangeClient::new(&cfg));
    let engine = Engine::new(cfg, source)?;
    engine.restore().await?;

    println!("semb console ready; /new_marathon to begin, /quit to exit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }

        let (session, rest) = split_session(line);
        let mut parts = rest.split_whitespace();
        let Some(name) = parts.next() else {
            continue;
        };
        let args: Vec<String> = parts.map(|s| s.to_string()).collect();

        let result = match Command::parse(name, &args) {
            Ok(command) => engine.dispatch(session, command).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(outcome) => print!("{}", render(&outcome)),
            Err(e) => println!("error: {e}"),
        }
    }

    Ok(())
}

/// `@<session> /cmd ...` addresses a session explicitly; default is session 0.
fn split_session(line: &str) -> (SessionId, &str) {
    let Some(rest) = line.strip_prefix('@') else {
        return (SessionId(0), line);
    };
    let Some((id, cmd)) = rest.split_once(char::is_whitespace) else {
        return (SessionId(0), line);
    };
    match id.parse::<i64>() {
        Ok(id) => (SessionId(id), cmd.trim_start()),
        Err(_) => (SessionId(0), line),
    }
}

fn render(outcome: &CommandOutcome) -> String {
    match outcome {
        CommandOutcome::Created => "marathon created; set sites, participants and duration\n".to_string(),
        CommandOutcome::SitesSet(sites) => {
            let names: Vec<&str> = sites.iter().map(|s| s.0.as_str()).collect();
            format!("sites set: {}\n", names.join(", "))
        }
        CommandOutcome::ParticipantsAdded(users) => {
            let names: Vec<&str> = users.iter().map(|u| u.0.as_str()).collect();
            format!("participants added: {}\n", names.join(", "))
        }
        CommandOutcome::DurationSet(duration) => {
            format!("duration set to {}\n", format_duration(*duration))
        }
        CommandOutcome::Settings(settings) => {
            let sites: Vec<&str> = settings.sites.iter().map(|s| s.0.as_str()).collect();
            let users: Vec<&str> = settings.participants.iter().map(|u| u.0.as_str()).collect();
            format!(
                "phase: {}\nsites: {}\nparticipants: {}\nduration: {}\n",
                settings.phase,
                sites.join(", "),
                users.join(", "),
                format_duration(settings.duration),
            )
        }
        CommandOutcome::Started => "marathon started\n".to_string(),
        CommandOutcome::Paused => "marathon paused\n".to_string(),
        CommandOutcome::Resumed => "marathon resumed\n".to_string(),
        CommandOutcome::Stopped => "marathon stopped\n".to_string(),
        CommandOutcome::Leaderboard(entries) => {
            if entries.is_empty() {
                return "no participants\n".to_string();
            }
            let mut out = String::new();
            for entry in entries {
                out.push_str(&format!("{}. {} {:+}\n", entry.rank, entry.username, entry.delta));
            }
            out
        }
        CommandOutcome::RemainingTime(remaining) => {
            format!("time remaining: {}\n", format_duration(*remaining))
        }
        CommandOutcome::Status(status) => format!(
            "phase: {}{}, elapsed: {}, remaining: {}\n",
            status.phase,
            if status.expired { " (time ran out)" } else { "" },
            format_duration(status.elapsed),
            format_duration(status.remaining),
        ),
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
