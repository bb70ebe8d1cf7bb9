//! Encrypted local key-value storage and an offline-first API client for the
//! Otakus Nexus app.

pub mod api;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod logging;
pub mod queue;
pub mod store;
