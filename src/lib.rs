//! Moltbot Watcher: a security monitor for the Moltbot agent.
//!
//! Tails Moltbot's JSONL session logs, flags inputs from new senders or
//! matching suspicious patterns, and alerts the operator over Telegram. The
//! operator can mute alerts, inspect recent activity, and stop or start
//! Moltbot from the same chat.
//!
//! See `DESIGN.md` for the module map.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod db;
pub mod logging;

pub mod event;
pub mod tailer;

pub mod classifier;
pub mod registry;

pub mod dispatcher;
pub mod mute;
pub mod recent;

pub mod commands;
pub mod process;

pub mod channel;
pub mod pipeline;
pub mod telegram;
