//! Groups satellite fire detections at monitored sites into incidents.
//!
//! Each site has at most one active incident. A new alert either extends it,
//! or, when the incident has been quiet past the inactivity threshold, closes
//! it and opens a new one. A periodic sweep closes incidents nobody extended.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod kafka;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod processor;
pub mod resolution;
pub mod sweeper;

pub use error::{IncidentError, StoreResult};
pub use orchestrator::{IncidentOrchestrator, IncidentSettings};
