//! Core domain types and traits for BuildIt CI/CD platform.
//!
//! This crate contains:
//! - Resource and build request identifiers
//! - Build requests, source stamps and workers
//! - The `Builder` trait and its user-overridable hooks
//! - `Deferred` results returned by hooks
//! - Lock specifications shared by configuration and scheduling

pub mod builder;
pub mod deferred;
pub mod error;
pub mod id;
pub mod lock;
pub mod request;
pub mod worker;

pub use builder::{
    Builder, BuilderConfig, CanStartBuildFn, MergeRequestsFn, NextBuildFn, NextWorkerFn,
};
pub use deferred::Deferred;
pub use error::{Error, Result};
pub use id::{BuildRequestId, ResourceId};
pub use lock::{AccessMode, LockAccessSpec, LockScope, LockSpec};
pub use request::{BuildRequest, NewBuildRequest, SourceStamp};
pub use worker::Worker;
