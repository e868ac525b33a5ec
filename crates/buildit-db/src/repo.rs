//! Repository traits and implementations.

pub mod build_request;

pub use build_request::{BuildRequestStore, ClaimOutcome, PgBuildRequestStore};
