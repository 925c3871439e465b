//! Core engine for the Stack Exchange Marathon bot.
//!
//! This crate is intentionally framework-agnostic. The chat front-end and the
//! Stack Exchange API live behind ports (traits) implemented elsewhere; the
//! core receives parsed commands and returns structured outcomes.

pub mod commands;
pub mod config;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod leaderboard;
pub mod logging;
pub mod marathon;
pub mod poller;
pub mod ports;
pub mod store;

pub use errors::{Error, Result};
