//! `mailledger-core` — identifiers and the domain error model shared by the
//! job-processing crates.
//!
//! This crate contains **pure domain** primitives (no storage or threading).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{JobRecordId, QueueEntryId, WorkerId};
