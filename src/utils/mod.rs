//! Shared helpers for binaries and delivery paths.

pub mod bootstrap;
pub mod retry;
