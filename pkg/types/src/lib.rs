//! Plain data types shared by the quota ledger, the cluster registry and the daemon.

pub mod cluster;
pub mod config;
pub mod context;
pub mod quota;
pub mod validate;
