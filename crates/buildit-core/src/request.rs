//! Build requests and the source stamps they build.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::{BuildRequestId, ResourceId};

/// The revision of one codebase a buildset asks to build.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceStamp {
    /// Codebase name; the empty string is the default codebase.
    pub codebase: String,
    pub repository: String,
    pub project: String,
    pub branch: Option<String>,
    pub revision: Option<String>,
    /// Inline patch applied on top of the revision, if any.
    pub patch: Option<String>,
}

impl SourceStamp {
    pub fn new(codebase: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            codebase: codebase.into(),
            repository: repository.into(),
            ..Default::default()
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }
}

/// A unit of scheduling work awaiting assignment to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub id: BuildRequestId,
    /// Name of the builder this request targets.
    pub builder: String,
    /// Requests created by the same triggering event share a buildset.
    pub buildset_id: i64,
    pub submitted_at: DateTime<Utc>,
    pub priority: Option<i32>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<ResourceId>,
    pub complete_at: Option<DateTime<Utc>>,
    /// Source stamps of the owning buildset.
    pub sourcestamps: Vec<SourceStamp>,
}

impl BuildRequest {
    pub fn is_claimed(&self) -> bool {
        self.claimed_by.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.complete_at.is_some()
    }

    /// The set of codebases this request builds.
    pub fn codebases(&self) -> BTreeSet<&str> {
        self.sourcestamps
            .iter()
            .map(|ss| ss.codebase.as_str())
            .collect()
    }

    /// Default scheduling order: oldest submission first, then lowest id.
    pub fn scheduling_order(&self, other: &Self) -> Ordering {
        self.submitted_at
            .cmp(&other.submitted_at)
            .then(self.id.cmp(&other.id))
    }

    /// Whether `other` may be folded into the same build as this request.
    ///
    /// Both must build the same codebases, and for each codebase the same
    /// repository, branch and project. Patched source stamps never collapse.
    pub fn can_be_collapsed_with(&self, other: &Self) -> bool {
        if self.codebases() != other.codebases() {
            return false;
        }

        self.sourcestamps.iter().all(|ss| {
            other
                .sourcestamps
                .iter()
                .find(|o| o.codebase == ss.codebase)
                .is_some_and(|o| {
                    o.repository == ss.repository
                        && o.branch == ss.branch
                        && o.project == ss.project
                        && o.patch.is_none()
                        && ss.patch.is_none()
                })
        })
    }
}

/// A build request as submitted by the scheduling layer, before the store
/// assigns it an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBuildRequest {
    pub builder: String,
    pub buildset_id: i64,
    pub submitted_at: DateTime<Utc>,
    pub priority: Option<i32>,
    pub sourcestamps: Vec<SourceStamp>,
}

impl NewBuildRequest {
    pub fn new(builder: impl Into<String>, submitted_at: DateTime<Utc>) -> Self {
        Self {
            builder: builder.into(),
            buildset_id: 0,
            submitted_at,
            priority: None,
            sourcestamps: Vec::new(),
        }
    }

    pub fn with_buildset(mut self, buildset_id: i64) -> Self {
        self.buildset_id = buildset_id;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_sourcestamp(mut self, sourcestamp: SourceStamp) -> Self {
        self.sourcestamps.push(sourcestamp);
        self
    }

    /// Materialize the request under the id the store assigned.
    pub fn into_request(self, id: BuildRequestId) -> BuildRequest {
        BuildRequest {
            id,
            builder: self.builder,
            buildset_id: self.buildset_id,
            submitted_at: self.submitted_at,
            priority: self.priority,
            claimed_at: None,
            claimed_by: None,
            complete_at: None,
            sourcestamps: self.sourcestamps,
        }
    }
}
