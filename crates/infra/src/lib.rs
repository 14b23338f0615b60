//! Infrastructure layer: job storage, the worker runtime and its workers,
//! configuration, and the boundary to the domain collaborators.

pub mod collaborator;
pub mod config;
pub mod jobs;
pub mod workers;

#[cfg(test)]
mod integration_tests;
