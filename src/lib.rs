// ABOUTME: Library root for table-replicator
// ABOUTME: Incremental table mirroring driven by change-tracking versions

pub mod commands;
pub mod config;
pub mod postgres;
pub mod preflight;
pub mod sync;
pub mod utils;
