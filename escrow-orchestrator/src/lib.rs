//! Milestone escrow workflow orchestrator
//!
//! Drives milestone-based escrow transactions through their lifecycle on an
//! external ledger and, after every accepted transition, fans out
//! best-effort side effects:
//! - event attestation on an evidence-anchoring network
//! - creative-work attestation on an IP registry
//! - real-time notifications
//! - transactional email
//!
//! Side effects run on a bounded worker pool and can never fail or delay the
//! transition that triggered them.

pub mod attestation;
pub mod cache;
pub mod canonical;
pub mod config;
pub mod dispatcher;
pub mod email;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod hasher;
pub mod ip_registry;
pub mod ledger;
pub mod lifecycle;
pub mod models;
pub mod notification;
pub mod orchestrator;
pub mod recorder;
pub mod telemetry;

pub use error::{ErrorKind, EscrowError};
pub use orchestrator::EscrowOrchestrator;

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;
