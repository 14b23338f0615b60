//! Daemon wiring for the mailledger background workers.

pub mod roster;
pub mod shutdown;
