//! Daemon and operator tooling around the mainframe coordinator core.

pub mod config;
pub mod db;
pub mod runtime;
