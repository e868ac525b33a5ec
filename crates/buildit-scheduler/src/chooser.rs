//! Pairing of workers with build requests for one builder.
//!
//! A `BuildChooser` lives for a single scan of a single builder. It loads the
//! builder's unclaimed requests and available workers, then repeatedly picks
//! a request and a worker, gates the pair, merges compatible requests into
//! the batch, claims the batch in the shared store and asks the builder to
//! start it. Claim races and start refusals put the worker back in the pool.

use buildit_core::{BuildRequest, BuildRequestId, Builder, Deferred, Error, ResourceId, Worker};
use buildit_db::{BuildRequestStore, ClaimOutcome};
use chrono::Utc;
use futures::FutureExt;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use tracing::{debug, info, warn};

use crate::error::SchedulerResult;

/// A build started by a chooser run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedBuild {
    pub worker: String,
    /// The anchor request first, then merged requests in submission order.
    pub requests: Vec<BuildRequestId>,
}

/// What one chooser run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub builder: String,
    pub started: Vec<StartedBuild>,
    /// Batches lost to another claimant.
    pub claim_races: usize,
    /// Batches claimed but refused by the builder.
    pub refusals: usize,
    /// Worker/request pairs turned down by the gate.
    pub rejected_pairings: usize,
}

pub struct BuildChooser<'a> {
    builder: &'a dyn Builder,
    builder_name: &'a str,
    store: &'a dyn BuildRequestStore,
    claimant: ResourceId,
    rng: &'a mut StdRng,
    workers: Vec<Worker>,
    /// Remaining unclaimed requests, in scheduling order.
    requests: Vec<BuildRequest>,
    /// Workers proven unable to take a request during this run.
    rejected: HashMap<BuildRequestId, HashSet<String>>,
    /// Requests with no eligible worker left.
    exhausted: HashSet<BuildRequestId>,
    assigned: HashMap<BuildRequestId, String>,
    report: ScanReport,
}

impl<'a> BuildChooser<'a> {
    pub fn new(
        builder: &'a dyn Builder,
        store: &'a dyn BuildRequestStore,
        claimant: ResourceId,
        rng: &'a mut StdRng,
    ) -> Self {
        Self {
            builder,
            builder_name: builder.name(),
            store,
            claimant,
            rng,
            workers: Vec::new(),
            requests: Vec::new(),
            rejected: HashMap::new(),
            exhausted: HashSet::new(),
            assigned: HashMap::new(),
            report: ScanReport {
                builder: builder.name().to_string(),
                ..Default::default()
            },
        }
    }

    /// Start as many builds as possible. Errors from the store abort the
    /// run; hook failures only abandon the pairing they concern.
    pub async fn run(mut self) -> SchedulerResult<ScanReport> {
        let builder = self.builder_name;

        self.requests = self.store.get_unclaimed_build_requests(builder).await?;
        self.requests.sort_by(|a, b| a.scheduling_order(b));
        self.workers = self
            .builder
            .available_workers()
            .into_iter()
            .filter(|w| w.available)
            .collect();

        if self.requests.is_empty() || self.workers.is_empty() {
            debug!(
                builder,
                requests = self.requests.len(),
                workers = self.workers.len(),
                "nothing to schedule"
            );
            return Ok(self.report);
        }

        while !self.workers.is_empty() {
            let Some(request) = self.next_request().await else {
                break;
            };

            let candidates = self.candidate_workers(&request);
            if candidates.is_empty() {
                self.exhausted.insert(request.id);
                continue;
            }

            let Some(worker) = self.next_worker(&candidates, &request).await else {
                break;
            };

            if !self.can_start(&worker, &request).await {
                self.reject(&worker, [request.id]);
                continue;
            }

            let batch = self.merge(&worker, &request).await;
            self.claim_and_start(worker, batch).await?;
        }

        Ok(self.report)
    }

    async fn next_request(&mut self) -> Option<BuildRequest> {
        let pool: Vec<BuildRequest> = self
            .requests
            .iter()
            .filter(|r| !self.exhausted.contains(&r.id))
            .cloned()
            .collect();
        if pool.is_empty() {
            return None;
        }

        let builder = self.builder_name;
        let Some(hook) = self.builder.config().next_build.clone() else {
            return pool.into_iter().next();
        };

        match guarded("nextBuild", || hook(builder, &pool)).await {
            Ok(Some(choice)) => {
                let found = pool.into_iter().find(|r| r.id == choice.id);
                if found.is_none() {
                    warn!(builder, request_id = %choice.id, "nextBuild returned a request that is not pending");
                }
                found
            }
            Ok(None) => {
                debug!(builder, "nextBuild declined to pick a request");
                None
            }
            Err(e) => {
                warn!(builder, error = %e, "nextBuild hook failed");
                None
            }
        }
    }

    fn candidate_workers(&self, request: &BuildRequest) -> Vec<Worker> {
        let rejected = self.rejected.get(&request.id);
        self.workers
            .iter()
            .filter(|w| rejected.is_none_or(|names| !names.contains(&w.name)))
            .cloned()
            .collect()
    }

    async fn next_worker(&mut self, candidates: &[Worker], request: &BuildRequest) -> Option<Worker> {
        let builder = self.builder_name;
        let Some(hook) = self.builder.config().next_worker.clone() else {
            return candidates.choose(&mut *self.rng).cloned();
        };

        match guarded("nextWorker", || hook(builder, candidates, Some(request))).await {
            Ok(Some(choice)) => {
                let found = candidates.iter().find(|w| w.name == choice.name).cloned();
                if found.is_none() {
                    warn!(builder, worker = %choice.name, "nextWorker returned a worker that is not available");
                }
                found
            }
            Ok(None) => {
                debug!(builder, request_id = %request.id, "nextWorker declined to pick a worker");
                None
            }
            Err(e) => {
                warn!(builder, error = %e, "nextWorker hook failed");
                None
            }
        }
    }

    async fn can_start(&self, worker: &Worker, request: &BuildRequest) -> bool {
        let builder = self.builder_name;

        let target = self.builder;
        match guarded("canStartWithWorker", || target.can_start_with_worker(worker)).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(builder, worker = %worker.name, "builder cannot start on worker");
                return false;
            }
            Err(e) => {
                warn!(builder, worker = %worker.name, error = %e, "canStartWithWorker failed");
                return false;
            }
        }

        let Some(hook) = self.builder.config().can_start_build.clone() else {
            return true;
        };
        match guarded("canStartBuild", || hook(worker, request)).await {
            Ok(allowed) => {
                if !allowed {
                    debug!(builder, worker = %worker.name, request_id = %request.id, "canStartBuild refused pairing");
                }
                allowed
            }
            Err(e) => {
                warn!(builder, worker = %worker.name, request_id = %request.id, error = %e, "canStartBuild hook failed");
                false
            }
        }
    }

    fn reject(&mut self, worker: &Worker, ids: impl IntoIterator<Item = BuildRequestId>) {
        for id in ids {
            if self
                .rejected
                .entry(id)
                .or_default()
                .insert(worker.name.clone())
            {
                self.report.rejected_pairings += 1;
            }
        }
    }

    fn is_rejected(&self, worker: &Worker, id: BuildRequestId) -> bool {
        self.rejected
            .get(&id)
            .is_some_and(|names| names.contains(&worker.name))
    }

    /// Take `anchor` out of the pool together with every request that merges
    /// with it. Codebase sets must match whatever the merge hook says.
    async fn merge(&mut self, worker: &Worker, anchor: &BuildRequest) -> Vec<BuildRequest> {
        self.requests.retain(|r| r.id != anchor.id);
        let mut batch = vec![anchor.clone()];

        let Some(merge_fn) = self.builder.merge_requests_fn() else {
            return batch;
        };

        let builder = self.builder_name;
        let codebases = anchor.codebases();
        let others: Vec<BuildRequest> = self
            .requests
            .iter()
            .filter(|other| other.codebases() == codebases)
            .filter(|other| !self.is_rejected(worker, other.id))
            .filter(|other| {
                self.assigned
                    .get(&other.id)
                    .is_none_or(|name| *name == worker.name)
            })
            .cloned()
            .collect();

        for other in others {
            match guarded("mergeRequests", || merge_fn(builder, anchor, &other)).await {
                Ok(true) => batch.push(other),
                Ok(false) => {}
                Err(e) => {
                    warn!(builder, request_id = %anchor.id, other_id = %other.id, error = %e, "mergeRequests hook failed");
                }
            }
        }

        if batch.len() > 1 {
            let merged: HashSet<BuildRequestId> = batch.iter().map(|r| r.id).collect();
            self.requests.retain(|r| !merged.contains(&r.id));
            debug!(builder, request_id = %anchor.id, merged = batch.len() - 1, "merged build requests");
        }
        batch
    }

    fn return_requests(&mut self, requests: impl IntoIterator<Item = BuildRequest>) {
        self.requests.extend(requests);
        self.requests.sort_by(|a, b| a.scheduling_order(b));
    }

    async fn claim_and_start(&mut self, worker: Worker, batch: Vec<BuildRequest>) -> SchedulerResult<()> {
        let builder = self.builder_name;
        let ids: Vec<BuildRequestId> = batch.iter().map(|r| r.id).collect();

        let outcome = self
            .store
            .claim_build_requests(&ids, self.claimant, Utc::now())
            .await?;

        if let ClaimOutcome::AlreadyClaimed(conflicts) = outcome {
            info!(builder, request_ids = ?ids, conflicts = ?conflicts, "build requests already claimed elsewhere");
            self.report.claim_races += 1;
            // a claim race always loses at least one id, or the pool never shrinks
            let lost: HashSet<BuildRequestId> = if conflicts.is_empty() {
                ids.iter().copied().collect()
            } else {
                conflicts.into_iter().collect()
            };
            self.return_requests(batch.into_iter().filter(|r| !lost.contains(&r.id)));
            return Ok(());
        }

        let target = self.builder;
        let started = match guarded("maybeStartBuild", || {
            target.maybe_start_build(&worker, &batch)
        })
        .await
        {
            Ok(started) => started,
            Err(e) => {
                warn!(builder, worker = %worker.name, error = %e, "maybeStartBuild failed");
                false
            }
        };

        if started {
            info!(builder, worker = %worker.name, request_ids = ?ids, "started build");
            self.workers.retain(|w| w.name != worker.name);
            for id in &ids {
                self.assigned.insert(*id, worker.name.clone());
            }
            self.report.started.push(StartedBuild {
                worker: worker.name,
                requests: ids,
            });
        } else {
            info!(builder, worker = %worker.name, request_ids = ?ids, "build refused; unclaiming requests");
            self.store.unclaim_build_requests(&ids).await?;
            self.report.refusals += 1;
            self.reject(&worker, ids.iter().copied());
            self.return_requests(batch);
        }
        Ok(())
    }
}

/// Call a builder hook and wait for its result. A panic in the call or in
/// the returned future becomes a hook error.
async fn guarded<T: Send + 'static>(
    hook: &'static str,
    call: impl FnOnce() -> Deferred<T>,
) -> buildit_core::Result<T> {
    match AssertUnwindSafe(async move { call().resolve().await })
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(_) => Err(Error::hook(hook, "panicked")),
    }
}
