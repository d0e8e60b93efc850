//! cirrus lease manager.
//!
//! Provisions and reclaims leased compute resources (servers and
//! containers) on a pool of physical nodes, tracking ownership, expiry,
//! and shared infrastructure in a relational ledger. The HTTP surface,
//! SSH ownership proof, and the cloud provider client live in their own
//! services; this crate is the orchestration core they embed.

pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod provider;
pub mod reaper;
pub mod registrar;
pub mod saga;
pub mod selector;
pub mod store;
