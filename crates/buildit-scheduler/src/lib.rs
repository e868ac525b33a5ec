//! Build request scheduling for BuildIt.
//!
//! Matches pending build requests to workers. The distributor decides when
//! and in which order builders are scanned; the chooser pairs workers with
//! requests for one builder and claims them in the shared store. Locks
//! arbitrate resources that builds on different workers share.

pub mod builder;
pub mod chooser;
pub mod distributor;
pub mod error;
pub mod lock;
pub mod lock_registry;
pub mod policy;
pub mod registry;

pub use builder::{RunningBuild, StaticBuilder};
pub use chooser::{BuildChooser, ScanReport, StartedBuild};
pub use distributor::{
    BuildRequestDistributor, DistributorOptions, SortBuildersFn, oldest_request_first,
};
pub use error::{LockError, SchedulerError, SchedulerResult};
pub use lock::{ConsumerId, Lock, LockAccess, LockSet};
pub use lock_registry::LockRegistry;
pub use registry::BuilderSet;
