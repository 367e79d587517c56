//! logsentinel: log file error monitor.
//!
//! Tails append-only log files in a directory, records each distinct error
//! line exactly once in SQLite, and fans new errors out to an in-process
//! live feed and to Telegram chats. Subscribers opt in and out by sending
//! `/subscribe` and `/unsubscribe` to the bot.
//!
//! See `DESIGN.md` for the component breakdown.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod db;
pub mod logging;
pub mod matcher;

pub mod dispatch;
pub mod gateway;
pub mod tailer;
pub mod telegram;
