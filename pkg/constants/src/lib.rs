//! Centralized constants for the quota ledger workspace.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod cluster;
pub mod quota;
pub mod server;
pub mod state;
