//! Persistent storage: the TOML config file.

pub mod config;
