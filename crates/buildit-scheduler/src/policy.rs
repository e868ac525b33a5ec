//! Built-in scheduling hooks.
//!
//! Builders without a hook get the chooser's defaults (random worker,
//! oldest request first, no merging). These cover the common alternatives.

use buildit_config::{BuildPolicy, BuilderSpec, WorkerPolicy};
use buildit_core::{
    BuildRequest, BuilderConfig, Deferred, MergeRequestsFn, NextBuildFn, NextWorkerFn, Worker,
};
use std::sync::Arc;

/// Always take the first offered worker, i.e. the builder's roster order.
pub fn first_worker() -> NextWorkerFn {
    Arc::new(
        |_builder: &str, workers: &[Worker], _request: Option<&BuildRequest>| {
            Deferred::Literal(workers.first().cloned())
        },
    )
}

/// Highest priority first; equal priorities fall back to submission order.
/// Requests without a priority rank as zero.
pub fn highest_priority_first() -> NextBuildFn {
    Arc::new(|_builder: &str, requests: &[BuildRequest]| {
        let best = requests
            .iter()
            .min_by(|a, b| {
                let (pa, pb) = (a.priority.unwrap_or(0), b.priority.unwrap_or(0));
                pb.cmp(&pa).then_with(|| a.scheduling_order(b))
            })
            .cloned();
        Deferred::Literal(best)
    })
}

/// Merge requests whose source stamps are compatible.
pub fn collapse_compatible() -> MergeRequestsFn {
    Arc::new(|_builder: &str, request: &BuildRequest, other: &BuildRequest| {
        Deferred::Literal(request.can_be_collapsed_with(other))
    })
}

/// Hooks for a builder as configured.
pub fn config_for(spec: &BuilderSpec) -> BuilderConfig {
    let mut config = BuilderConfig::default();
    if spec.next_worker == WorkerPolicy::First {
        config = config.with_next_worker(first_worker());
    }
    if spec.next_build == BuildPolicy::Priority {
        config = config.with_next_build(highest_priority_first());
    }
    if spec.collapse_requests {
        config = config.with_merge_requests(collapse_compatible());
    }
    config
}
