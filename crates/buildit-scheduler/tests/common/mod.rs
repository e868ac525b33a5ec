//! Test doubles shared by the scheduler integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use buildit_core::{
    BuildRequest, BuildRequestId, Builder, BuilderConfig, Deferred, NewBuildRequest, ResourceId,
    Worker,
};
use buildit_db::{BuildRequestStore, ClaimOutcome, DbResult, InMemoryBuildRequestStore};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// One call to `maybe_start_build`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartCall {
    pub builder: String,
    pub worker: String,
    pub requests: Vec<BuildRequestId>,
}

/// A builder that records what the scheduler asks of it.
pub struct FakeBuilder {
    name: String,
    config: BuilderConfig,
    workers: Vec<Worker>,
    busy: Mutex<HashSet<String>>,
    can_start: AtomicBool,
    start_result: AtomicBool,
    start_delay: Option<Duration>,
    panic_on_scan: bool,
    panic_on_start: bool,
    starts: Arc<Mutex<Vec<StartCall>>>,
    scan_log: Arc<Mutex<Vec<String>>>,
    pub start_entered: Arc<Notify>,
}

impl FakeBuilder {
    pub fn new(name: &str, workers: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            config: BuilderConfig::default(),
            workers: workers.iter().map(|w| Worker::new(*w)).collect(),
            busy: Mutex::new(HashSet::new()),
            can_start: AtomicBool::new(true),
            start_result: AtomicBool::new(true),
            start_delay: None,
            panic_on_scan: false,
            panic_on_start: false,
            starts: Arc::new(Mutex::new(Vec::new())),
            scan_log: Arc::new(Mutex::new(Vec::new())),
            start_entered: Arc::new(Notify::new()),
        }
    }

    pub fn with_config(mut self, config: BuilderConfig) -> Self {
        self.config = config;
        self
    }

    /// `can_start_with_worker` answers false.
    pub fn without_capacity(self) -> Self {
        self.can_start.store(false, Ordering::SeqCst);
        self
    }

    /// `maybe_start_build` answers false.
    pub fn refusing(self) -> Self {
        self.start_result.store(false, Ordering::SeqCst);
        self
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panic_on_scan = true;
        self
    }

    /// `maybe_start_build` panics after recording the call.
    pub fn panicking_on_start(mut self) -> Self {
        self.panic_on_start = true;
        self
    }

    /// Share a log of scanned builder names with other builders.
    pub fn with_scan_log(mut self, log: Arc<Mutex<Vec<String>>>) -> Self {
        self.scan_log = log;
        self
    }

    /// Share a log of start calls with other builders.
    pub fn with_start_log(mut self, log: Arc<Mutex<Vec<StartCall>>>) -> Self {
        self.starts = log;
        self
    }

    pub fn starts(&self) -> Vec<StartCall> {
        self.starts.lock().unwrap().clone()
    }

    pub fn scan_log(&self) -> Vec<String> {
        self.scan_log.lock().unwrap().clone()
    }
}

impl Builder for FakeBuilder {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &BuilderConfig {
        &self.config
    }

    fn available_workers(&self) -> Vec<Worker> {
        if self.panic_on_scan {
            panic!("builder {} blew up", self.name);
        }
        self.scan_log.lock().unwrap().push(self.name.clone());
        let busy = self.busy.lock().unwrap();
        self.workers
            .iter()
            .filter(|w| !busy.contains(&w.name))
            .cloned()
            .collect()
    }

    fn can_start_with_worker(&self, _worker: &Worker) -> Deferred<bool> {
        Deferred::Literal(self.can_start.load(Ordering::SeqCst))
    }

    fn maybe_start_build(&self, worker: &Worker, requests: &[BuildRequest]) -> Deferred<bool> {
        let call = StartCall {
            builder: self.name.clone(),
            worker: worker.name.clone(),
            requests: requests.iter().map(|r| r.id).collect(),
        };
        if self.panic_on_start {
            self.starts.lock().unwrap().push(call);
            panic!("builder {} failed to start", self.name);
        }

        let started = self.start_result.load(Ordering::SeqCst);
        if started {
            self.busy.lock().unwrap().insert(worker.name.clone());
        }
        self.start_entered.notify_one();

        let starts = Arc::clone(&self.starts);
        match self.start_delay {
            Some(delay) => Deferred::pending(async move {
                tokio::time::sleep(delay).await;
                starts.lock().unwrap().push(call);
                Ok(started)
            }),
            None => {
                starts.lock().unwrap().push(call);
                Deferred::Literal(started)
            }
        }
    }
}

/// In-memory store that records claims and can lose claim races on purpose.
#[derive(Default)]
pub struct TestStore {
    pub inner: InMemoryBuildRequestStore,
    claims: Mutex<Vec<Vec<BuildRequestId>>>,
    /// When set, the next claim finds its first id already taken by a rival.
    lose_next_claim: AtomicBool,
}

impl TestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, builder: &str, submitted_at: i64) -> BuildRequest {
        self.inner
            .add_build_request(NewBuildRequest::new(builder, at(submitted_at)))
            .await
            .unwrap()
    }

    pub async fn add_new(&self, request: NewBuildRequest) -> BuildRequest {
        self.inner.add_build_request(request).await.unwrap()
    }

    pub fn claims(&self) -> Vec<Vec<BuildRequestId>> {
        self.claims.lock().unwrap().clone()
    }

    pub fn lose_next_claim(&self) {
        self.lose_next_claim.store(true, Ordering::SeqCst);
    }

    pub async fn unclaimed(&self, builder: &str) -> Vec<BuildRequestId> {
        self.inner
            .get_unclaimed_build_requests(builder)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect()
    }
}

#[async_trait]
impl BuildRequestStore for TestStore {
    async fn add_build_request(&self, request: NewBuildRequest) -> DbResult<BuildRequest> {
        self.inner.add_build_request(request).await
    }

    async fn get_build_request(&self, id: BuildRequestId) -> DbResult<BuildRequest> {
        self.inner.get_build_request(id).await
    }

    async fn get_unclaimed_build_requests(&self, builder: &str) -> DbResult<Vec<BuildRequest>> {
        self.inner.get_unclaimed_build_requests(builder).await
    }

    async fn claim_build_requests(
        &self,
        ids: &[BuildRequestId],
        claimant: ResourceId,
        claimed_at: DateTime<Utc>,
    ) -> DbResult<ClaimOutcome> {
        self.claims.lock().unwrap().push(ids.to_vec());
        if self.lose_next_claim.swap(false, Ordering::SeqCst) {
            let rival = ResourceId::new();
            self.inner
                .claim_build_requests(&ids[..1], rival, claimed_at)
                .await?;
        }
        self.inner
            .claim_build_requests(ids, claimant, claimed_at)
            .await
    }

    async fn unclaim_build_requests(&self, ids: &[BuildRequestId]) -> DbResult<()> {
        self.inner.unclaim_build_requests(ids).await
    }

    async fn complete_build_requests(
        &self,
        ids: &[BuildRequestId],
        complete_at: DateTime<Utc>,
    ) -> DbResult<()> {
        self.inner.complete_build_requests(ids, complete_at).await
    }

    async fn get_oldest_request_time(&self, builder: &str) -> DbResult<Option<DateTime<Utc>>> {
        self.inner.get_oldest_request_time(builder).await
    }
}
