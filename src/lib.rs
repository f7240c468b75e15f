//! feedmailer: deliver RSS/Atom feed articles by email.
//!
//! - [`storage`] - SQLite store, article reconciliation and delivery selection
//! - [`feed`] - fetching and parsing feeds
//! - [`mail`] - rendering and sending mail
//! - [`app`] - subscription management and the refresh/deliver passes
//! - [`config`] - `config.toml`

pub mod app;
pub mod config;
pub mod feed;
pub mod mail;
pub mod storage;
pub mod util;
