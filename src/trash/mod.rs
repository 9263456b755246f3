//! Quarantine ("trash") subsystem: soft-delete store with signed metadata,
//! bounded restoration, and retention cleanup.

pub mod manager;
pub mod meta;
