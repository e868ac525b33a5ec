//! Workers as seen by the scheduler.

use serde::{Deserialize, Serialize};

/// A worker attached to the master, identified by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    /// False while the worker is busy or detaching.
    pub available: bool,
}

impl Worker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            available: true,
        }
    }
}
