//! Core domain + application logic for the media archive bot.
//!
//! This crate is intentionally framework-agnostic. Telegram, ffmpeg and
//! the HTTP fetcher live behind ports (traits) implemented in adapter
//! crates.

pub mod archive;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod errors;
pub mod fetch;
pub mod logging;
pub mod machine;
pub mod messaging;
pub mod registry;
pub mod session;
pub mod staging;
pub mod tool;

pub use errors::{Error, Result};
