//! Live lock objects, resolved from configured lock specs.
//!
//! Master locks exist once per process. Worker locks exist once per
//! (lock, worker) pair and are created the first time a worker needs them.

use buildit_core::{LockAccessSpec, LockScope, LockSpec};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::error::LockError;
use crate::lock::{Lock, LockAccess, LockSet};

#[derive(Default)]
struct RegistryState {
    specs: HashMap<String, LockSpec>,
    master_locks: HashMap<String, Arc<Lock>>,
    worker_locks: HashMap<(String, String), Arc<Lock>>,
}

#[derive(Default)]
pub struct LockRegistry {
    state: Mutex<RegistryState>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs(specs: impl IntoIterator<Item = LockSpec>) -> Result<Self, LockError> {
        let registry = Self::new();
        registry.reconfigure(specs)?;
        Ok(registry)
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the configured locks.
    ///
    /// A name may only be declared once per configuration (identical
    /// repeats are tolerated). Locks that survive keep their identity, so
    /// builds holding them are unaffected; only their max count changes.
    pub fn reconfigure(&self, specs: impl IntoIterator<Item = LockSpec>) -> Result<(), LockError> {
        let mut new_specs: HashMap<String, LockSpec> = HashMap::new();
        for spec in specs {
            match new_specs.get(&spec.name) {
                Some(existing) if *existing != spec => {
                    return Err(LockError::DuplicateName(spec.name));
                }
                Some(_) => {}
                None => {
                    new_specs.insert(spec.name.clone(), spec);
                }
            }
        }

        let mut state = self.state();
        state.master_locks.retain(|name, lock| {
            match new_specs.get(name) {
                Some(spec) if spec.scope == LockScope::Master => {
                    lock.set_max_count(spec.max_count);
                    true
                }
                _ => false,
            }
        });
        state.worker_locks.retain(|(name, worker), lock| {
            match new_specs.get(name) {
                Some(spec) if matches!(spec.scope, LockScope::Worker { .. }) => {
                    lock.set_max_count(spec.max_count_for(worker));
                    true
                }
                _ => false,
            }
        });
        info!(locks = new_specs.len(), "lock configuration loaded");
        state.specs = new_specs;
        Ok(())
    }

    pub fn spec(&self, name: &str) -> Option<LockSpec> {
        self.state().specs.get(name).cloned()
    }

    /// The lock instance `name` refers to on `worker`.
    pub fn lock_for(&self, name: &str, worker: &str) -> Result<Arc<Lock>, LockError> {
        let mut state = self.state();
        let spec = state
            .specs
            .get(name)
            .cloned()
            .ok_or_else(|| LockError::UnknownLock(name.to_string()))?;

        let lock = match spec.scope {
            LockScope::Master => state
                .master_locks
                .entry(spec.name.clone())
                .or_insert_with(|| Lock::new(spec.name.clone(), spec.max_count)),
            LockScope::Worker { .. } => state
                .worker_locks
                .entry((spec.name.clone(), worker.to_string()))
                .or_insert_with(|| {
                    debug!(lock = %spec.name, worker, "creating worker lock");
                    Lock::new(spec.name.clone(), spec.max_count_for(worker))
                }),
        };
        Ok(Arc::clone(lock))
    }

    pub fn resolve(&self, access: &LockAccessSpec, worker: &str) -> Result<LockAccess, LockError> {
        self.lock_for(&access.lock, worker)?
            .access(access.mode, access.count)
    }

    /// Resolve a builder's declared locks for a build on `worker`.
    pub fn lock_set(&self, accesses: &[LockAccessSpec], worker: &str) -> Result<LockSet, LockError> {
        let resolved = accesses
            .iter()
            .map(|a| self.resolve(a, worker))
            .collect::<Result<Vec<_>, _>>()?;
        LockSet::new(resolved)
    }
}
