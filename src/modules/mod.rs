//! Core automounter modules.
//!
//! This module provides the main components of the daemon:
//!
//! - `constants`: Default paths, timers and limits
//! - `controller`: Namespace tree, tables and the mount state machine
//! - `sweep`: Unmounting, idle sweep, validation and re-initialisation
//! - `map`: Automount maps and map loaders
//! - `mount`: Mount and unmount helpers
//! - `session`: Single-threaded message loop around the controller

/// Daemon configuration and master map entries.
pub mod config;
/// Default paths, timers and limits.
pub mod constants;
pub mod controller;
/// Detaching from the terminal and the pid file.
pub mod daemon;
/// Controller error kinds.
pub mod error;
pub mod host;
pub mod map;
pub mod mount;
/// Namespace nodes and path handling.
pub mod namespace;
/// NFS servers shared between nodes.
pub mod server;
pub mod session;
pub mod sweep;
pub mod table;

#[cfg(test)]
pub(crate) mod testing;
