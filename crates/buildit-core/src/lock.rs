//! Lock specifications.
//!
//! These describe locks as configured; the live lock objects are built from
//! them by the scheduler.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a consumer wants to hold a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    /// Sole holder of the lock.
    Exclusive,
    /// Shares the lock with other counting holders up to the lock's max count.
    Counting,
}

impl std::str::FromStr for AccessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exclusive" => Ok(Self::Exclusive),
            "counting" => Ok(Self::Counting),
            other => Err(format!("unknown access mode: {}", other)),
        }
    }
}

/// Where a lock lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockScope {
    /// One lock shared by every build on this master.
    Master,
    /// One lock per worker; individual workers may override the max count.
    Worker {
        max_count_for_workers: BTreeMap<String, u32>,
    },
}

/// A configured lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSpec {
    pub name: String,
    pub max_count: u32,
    pub scope: LockScope,
}

impl LockSpec {
    pub fn master(name: impl Into<String>, max_count: u32) -> Self {
        Self {
            name: name.into(),
            max_count,
            scope: LockScope::Master,
        }
    }

    pub fn worker(name: impl Into<String>, max_count: u32) -> Self {
        Self {
            name: name.into(),
            max_count,
            scope: LockScope::Worker {
                max_count_for_workers: BTreeMap::new(),
            },
        }
    }

    pub fn with_worker_max_count(mut self, worker: impl Into<String>, max_count: u32) -> Self {
        if let LockScope::Worker {
            max_count_for_workers,
        } = &mut self.scope
        {
            max_count_for_workers.insert(worker.into(), max_count);
        }
        self
    }

    /// Max count of the lock instance used on `worker`.
    pub fn max_count_for(&self, worker: &str) -> u32 {
        match &self.scope {
            LockScope::Master => self.max_count,
            LockScope::Worker {
                max_count_for_workers,
            } => max_count_for_workers
                .get(worker)
                .copied()
                .unwrap_or(self.max_count),
        }
    }
}

/// A builder's declared use of a lock, by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockAccessSpec {
    pub lock: String,
    pub mode: AccessMode,
    pub count: u32,
}

impl LockAccessSpec {
    pub fn exclusive(lock: impl Into<String>) -> Self {
        Self {
            lock: lock.into(),
            mode: AccessMode::Exclusive,
            count: 1,
        }
    }

    pub fn counting(lock: impl Into<String>, count: u32) -> Self {
        Self {
            lock: lock.into(),
            mode: AccessMode::Counting,
            count,
        }
    }
}
