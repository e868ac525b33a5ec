//! KDL configuration parsing for BuildIt CI/CD.
//!
//! This crate handles parsing of:
//! - The master scheduling configuration (locks, worker locks, builders)
//! - Build request fixtures
//!
//! Parsing reports every error it finds through an [`ErrorCollector`]
//! rather than stopping at the first one.

pub mod error;
pub mod master;
mod nodes;
pub mod requests;

pub use error::{ConfigError, ConfigErrors, ConfigResult, ErrorCollector};
pub use master::{
    BuildPolicy, BuilderSpec, MasterConfig, WorkerPolicy, load_master_config, parse_master_config,
};
pub use requests::{load_build_requests, parse_build_requests};
