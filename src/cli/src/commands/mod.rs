//! Subcommand implementations.

pub mod config;
pub mod health;
pub mod user;
