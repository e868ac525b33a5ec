//! In-process builder with a fixed worker roster.
//!
//! `StaticBuilder` is the `Builder` used when builders come from the master
//! configuration: it knows its workers and declared locks, and starting a
//! build means taking the worker and the locks until the build finishes.

use buildit_config::BuilderSpec;
use buildit_core::{
    BuildRequest, BuildRequestId, Builder, BuilderConfig, Deferred, Error, LockAccessSpec,
    ResourceId, Worker,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::error::{LockError, SchedulerError, SchedulerResult};
use crate::lock::LockSet;
use crate::lock_registry::LockRegistry;
use crate::policy;

/// A build that holds a worker and its locks.
#[derive(Debug, Clone)]
pub struct RunningBuild {
    pub id: ResourceId,
    pub worker: String,
    pub requests: Vec<BuildRequestId>,
    locks: LockSet,
}

#[derive(Default)]
struct BuilderState {
    /// Roster order is preserved; it is what `first_worker` picks from.
    workers: Vec<Worker>,
    running: HashMap<ResourceId, RunningBuild>,
}

pub struct StaticBuilder {
    name: String,
    config: BuilderConfig,
    locks: Vec<LockAccessSpec>,
    lock_registry: Arc<LockRegistry>,
    state: Mutex<BuilderState>,
}

impl StaticBuilder {
    pub fn new<I, S>(name: impl Into<String>, workers: I, lock_registry: Arc<LockRegistry>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            config: BuilderConfig::default(),
            locks: Vec::new(),
            lock_registry,
            state: Mutex::new(BuilderState {
                workers: workers.into_iter().map(Worker::new).collect(),
                running: HashMap::new(),
            }),
        }
    }

    /// Build from configuration, with the configured hook policies.
    pub fn from_spec(spec: &BuilderSpec, lock_registry: Arc<LockRegistry>) -> Self {
        Self::new(spec.name.clone(), spec.workers.clone(), lock_registry)
            .with_config(policy::config_for(spec))
            .with_locks(spec.locks.clone())
    }

    pub fn with_config(mut self, config: BuilderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_locks(mut self, locks: Vec<LockAccessSpec>) -> Self {
        self.locks = locks;
        self
    }

    fn state(&self) -> MutexGuard<'_, BuilderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a worker (or mark a known one available again after it reconnects).
    pub fn attach_worker(&self, name: &str) {
        let mut state = self.state();
        let busy = state.running.values().any(|b| b.worker == name);
        match state.workers.iter_mut().find(|w| w.name == name) {
            Some(worker) => worker.available = !busy,
            None => state.workers.push(Worker::new(name)),
        }
        info!(builder = %self.name, worker = name, "worker attached");
    }

    /// Remove a worker. Builds already running on it are left alone.
    pub fn detach_worker(&self, name: &str) -> bool {
        let mut state = self.state();
        let before = state.workers.len();
        state.workers.retain(|w| w.name != name);
        let removed = state.workers.len() != before;
        if removed {
            info!(builder = %self.name, worker = name, "worker detached");
        }
        removed
    }

    pub fn running_builds(&self) -> Vec<RunningBuild> {
        self.state().running.values().cloned().collect()
    }

    /// Finish a build: release its locks and free its worker.
    pub fn finish_build(&self, id: ResourceId) -> SchedulerResult<RunningBuild> {
        let mut state = self.state();
        let build = state
            .running
            .remove(&id)
            .ok_or(SchedulerError::UnknownBuild(id))?;

        if let Some(worker) = state.workers.iter_mut().find(|w| w.name == build.worker) {
            worker.available = true;
        }
        drop(state);

        build.locks.release(build.id)?;
        info!(builder = %self.name, worker = %build.worker, build_id = %build.id, "build finished");
        Ok(build)
    }

    fn lock_set_for(&self, worker: &str) -> Result<LockSet, LockError> {
        self.lock_registry.lock_set(&self.locks, worker)
    }
}

impl Builder for StaticBuilder {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &BuilderConfig {
        &self.config
    }

    fn available_workers(&self) -> Vec<Worker> {
        self.state()
            .workers
            .iter()
            .filter(|w| w.available)
            .cloned()
            .collect()
    }

    fn can_start_with_worker(&self, worker: &Worker) -> Deferred<bool> {
        match self.lock_set_for(&worker.name) {
            // a fresh consumer holds nothing and queues behind every waiter
            Ok(locks) => Deferred::Literal(locks.is_available(ResourceId::new())),
            Err(e) => Deferred::failed(Error::Internal(e.to_string())),
        }
    }

    fn maybe_start_build(&self, worker: &Worker, requests: &[BuildRequest]) -> Deferred<bool> {
        let locks = match self.lock_set_for(&worker.name) {
            Ok(locks) => locks,
            Err(e) => return Deferred::failed(Error::Internal(e.to_string())),
        };

        let mut state = self.state();
        let Some(slot) = state
            .workers
            .iter_mut()
            .find(|w| w.name == worker.name && w.available)
        else {
            debug!(builder = %self.name, worker = %worker.name, "worker no longer available");
            return Deferred::Literal(false);
        };

        let build_id = ResourceId::new();
        if !locks.try_acquire(build_id) {
            warn!(builder = %self.name, worker = %worker.name, "locks taken since the worker was checked");
            return Deferred::Literal(false);
        }
        slot.available = false;

        let build = RunningBuild {
            id: build_id,
            worker: worker.name.clone(),
            requests: requests.iter().map(|r| r.id).collect(),
            locks,
        };
        info!(
            builder = %self.name,
            worker = %build.worker,
            build_id = %build.id,
            request_ids = ?build.requests,
            "build started"
        );
        state.running.insert(build_id, build);
        Deferred::Literal(true)
    }
}
