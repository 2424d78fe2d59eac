//! The edge caching service and its building blocks.
//!
//! The main entry point is the [`CacheOrchestrator`](orchestrator::CacheOrchestrator), which
//! combines an [`ObjectStore`](store::ObjectStore) with an
//! [`OriginClient`](origin::OriginClient).

#[macro_use]
pub mod metrics;

pub mod config;
pub mod orchestrator;
pub mod origin;
pub mod sniff;
pub mod store;
pub mod types;
pub mod utils;
