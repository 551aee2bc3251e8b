//! fleetsync: real-time telemetry synchronisation for a robot fleet.
//!
//! A push channel feeds status summaries and per-robot telemetry into a
//! single fleet store; presentation code reads immutable snapshots from it.

pub mod backend;
pub mod channel;
pub mod config;
pub mod dashboard;
pub mod fleet;
pub mod protocol;
pub mod session;
