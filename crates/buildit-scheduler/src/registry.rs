//! Live set of configured builders.

use buildit_core::Builder;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Builders by name. Reconfiguration adds and removes entries while the
/// distributor runs; a scan looks each builder up when it gets to it.
#[derive(Default)]
pub struct BuilderSet {
    builders: RwLock<BTreeMap<String, Arc<dyn Builder>>>,
}

impl BuilderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a builder, returning the one it replaced.
    pub fn insert(&self, builder: Arc<dyn Builder>) -> Option<Arc<dyn Builder>> {
        let name = builder.name().to_string();
        self.builders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, builder)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn Builder>> {
        self.builders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Builder>> {
        self.builders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Builder names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.builders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.builders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
