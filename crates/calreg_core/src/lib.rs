//! calreg_core: calibration reference registry
//!
//! Pure domain logic over storage ports, with no database driver:
//! - Serial naming with atomic counters (`naming`)
//! - Time-limited shared locks (`locks`)
//! - Stage / confirm / cancel submission workflow (`submission`)
//! - Rule-hierarchy derivation and catalog delivery (`derivation`, `delivery`)
//! - Blacklist propagation, delivery status, seeding and cleanup
//!
//! # Architecture
//!
//! ```text
//! StageRequest ──► certify ──► name ──► place ──► Ready batch
//!                                                     │ confirm (instrument lock)
//!                                                     ▼
//!                         derive new middle/top ──► deliver catalog ──► Confirmed
//! ```
//!
//! `MemoryStore` implements `RegistryStore` and `LockStore` for tests and for
//! the CLI's JSON-file adapter.

pub mod blacklist;
pub mod certify;
pub mod cleanup;
pub mod config;
pub mod content;
pub mod delivery;
pub mod derivation;
pub mod error;
pub mod locks;
pub mod naming;
pub mod ports;
pub mod rules;
pub mod seed;
pub mod service;
pub mod status;
pub mod store;
pub mod submission;
pub mod types;

// Re-export commonly used types
pub use certify::{BasicCertifier, CertificationReport, Certifier, CertifyOutcome};
pub use config::RegistryConfig;
pub use content::{ContentStore, LocalContentStore};
pub use error::RegistryError;
pub use locks::{LockManager, LockPolicy};
pub use naming::NamingService;
pub use ports::{LockStore, RegistryStore, Result};
pub use service::RegistryService;
pub use store::{MemoryState, MemoryStore};
pub use submission::{
    Candidate, ConfirmOutcome, StageOutcome, StageRequest, SubmissionService,
};
pub use types::*;
