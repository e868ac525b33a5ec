//! Builder trait and the hooks a builder configuration may override.
//!
//! Builders own their workers and know how to start a build; the scheduler
//! only asks them questions and hands them claimed requests.

use std::fmt;
use std::sync::Arc;

use crate::{BuildRequest, Deferred, Worker};

/// Picks a worker for the given candidate request, or `None` to give up.
///
/// The slice holds the available workers minus those already turned down
/// for this request during the current scan.
pub type NextWorkerFn =
    Arc<dyn Fn(&str, &[Worker], Option<&BuildRequest>) -> Deferred<Option<Worker>> + Send + Sync>;

/// Picks the next request to build out of the remaining ones.
pub type NextBuildFn =
    Arc<dyn Fn(&str, &[BuildRequest]) -> Deferred<Option<BuildRequest>> + Send + Sync>;

/// Final say on whether a worker may take a request.
pub type CanStartBuildFn = Arc<dyn Fn(&Worker, &BuildRequest) -> Deferred<bool> + Send + Sync>;

/// Whether `other` may be merged into the build of `request`.
pub type MergeRequestsFn =
    Arc<dyn Fn(&str, &BuildRequest, &BuildRequest) -> Deferred<bool> + Send + Sync>;

/// Optional scheduling hooks of a builder. `None` means "use the default".
#[derive(Clone, Default)]
pub struct BuilderConfig {
    pub next_worker: Option<NextWorkerFn>,
    pub next_build: Option<NextBuildFn>,
    pub can_start_build: Option<CanStartBuildFn>,
    pub merge_requests: Option<MergeRequestsFn>,
}

impl BuilderConfig {
    pub fn with_next_worker(mut self, hook: NextWorkerFn) -> Self {
        self.next_worker = Some(hook);
        self
    }

    pub fn with_next_build(mut self, hook: NextBuildFn) -> Self {
        self.next_build = Some(hook);
        self
    }

    pub fn with_can_start_build(mut self, hook: CanStartBuildFn) -> Self {
        self.can_start_build = Some(hook);
        self
    }

    pub fn with_merge_requests(mut self, hook: MergeRequestsFn) -> Self {
        self.merge_requests = Some(hook);
        self
    }
}

impl fmt::Debug for BuilderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuilderConfig")
            .field("next_worker", &self.next_worker.is_some())
            .field("next_build", &self.next_build.is_some())
            .field("can_start_build", &self.can_start_build.is_some())
            .field("merge_requests", &self.merge_requests.is_some())
            .finish()
    }
}

/// A configured builder, as consumed by the build request distributor.
pub trait Builder: Send + Sync {
    /// Unique builder name; build requests reference builders by it.
    fn name(&self) -> &str;

    /// Hooks for this builder. Read-only for the duration of a scan.
    fn config(&self) -> &BuilderConfig;

    /// Workers currently able to take a build for this builder.
    fn available_workers(&self) -> Vec<Worker>;

    /// Builder-level eligibility check (locks, worker state).
    fn can_start_with_worker(&self, worker: &Worker) -> Deferred<bool>;

    /// Start a build of the given claimed requests on `worker`.
    ///
    /// Resolving to `false` means the build was refused and the requests
    /// must be returned to the store.
    fn maybe_start_build(&self, worker: &Worker, requests: &[BuildRequest]) -> Deferred<bool>;

    /// Predicate deciding which requests merge into one build, if merging is on.
    fn merge_requests_fn(&self) -> Option<MergeRequestsFn> {
        self.config().merge_requests.clone()
    }
}
