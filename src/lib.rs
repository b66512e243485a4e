//! Monitor, launch and terminate jobs on groups of machines reachable over SSH.
//!
//! The engine lives in [`core`]: machines are scanned concurrently through a
//! [`remote::RemoteExecutor`], their process tables are parsed into typed records,
//! filtered, aggregated per group, and consumed by the bulk dispatcher.

pub mod audit;
pub mod config;
pub mod core;
pub mod remote;
pub mod utils;
