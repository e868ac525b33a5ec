//! Build request distributor.
//!
//! Turns "builder X may be able to start something" events into scans.
//! Requests for the same builder coalesce while they wait, and only one
//! scan loop runs at a time. Each scan sorts the dirty builders and runs
//! a fresh [`BuildChooser`] for every builder that still exists.

use buildit_core::{Deferred, ResourceId};
use buildit_db::BuildRequestStore;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::chooser::{BuildChooser, ScanReport};
use crate::registry::BuilderSet;

/// Reorders the builders of one scan. The result must be a permutation of
/// its input; anything else is ignored in favour of the input order.
pub type SortBuildersFn = Arc<dyn Fn(Vec<String>) -> Deferred<Vec<String>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct DistributorOptions {
    /// Claimant identity written to the store.
    pub master_id: ResourceId,
    /// Seed for the default random worker choice. `None` seeds from entropy.
    pub rng_seed: Option<u64>,
}

impl Default for DistributorOptions {
    fn default() -> Self {
        Self {
            master_id: ResourceId::new(),
            rng_seed: None,
        }
    }
}

#[derive(Default)]
struct LoopState {
    running: bool,
    loop_active: bool,
    pending: BTreeSet<String>,
}

struct Inner {
    builders: Arc<BuilderSet>,
    store: Arc<dyn BuildRequestStore>,
    master_id: ResourceId,
    sort_builders: RwLock<Option<SortBuildersFn>>,
    state: Mutex<LoopState>,
    /// Held for the whole life of a scan loop.
    activity: tokio::sync::Mutex<StdRng>,
    quiet: watch::Sender<bool>,
    reports: Mutex<Vec<ScanReport>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Schedules chooser runs across builders. Cheap to clone.
#[derive(Clone)]
pub struct BuildRequestDistributor {
    inner: Arc<Inner>,
}

impl BuildRequestDistributor {
    pub fn new(
        builders: Arc<BuilderSet>,
        store: Arc<dyn BuildRequestStore>,
        options: DistributorOptions,
    ) -> Self {
        let rng = match options.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (quiet, _) = watch::channel(true);

        Self {
            inner: Arc::new(Inner {
                builders,
                store,
                master_id: options.master_id,
                sort_builders: RwLock::new(None),
                state: Mutex::new(LoopState::default()),
                activity: tokio::sync::Mutex::new(rng),
                quiet,
                reports: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn master_id(&self) -> ResourceId {
        self.inner.master_id
    }

    pub fn builders(&self) -> &Arc<BuilderSet> {
        &self.inner.builders
    }

    /// Replace the builder ordering hook. `None` restores oldest-request-first.
    pub fn set_sort_builders(&self, hook: Option<SortBuildersFn>) {
        *self
            .inner
            .sort_builders
            .write()
            .unwrap_or_else(PoisonError::into_inner) = hook;
    }

    pub fn is_running(&self) -> bool {
        self.inner.state().running
    }

    pub fn start(&self) {
        let mut state = self.inner.state();
        if !state.running {
            state.running = true;
            info!(master_id = %self.inner.master_id, "build request distributor started");
        }
    }

    /// Stop scanning. Waits for an in-flight scan to finish and returns the
    /// builder names that were still waiting for one.
    pub async fn stop(&self) -> Vec<String> {
        self.inner.state().running = false;

        let _activity = self.inner.activity.lock().await;
        let leftover = {
            let mut state = self.inner.state();
            self.inner.quiet.send_replace(true);
            std::mem::take(&mut state.pending)
        };
        info!(
            master_id = %self.inner.master_id,
            unscanned = leftover.len(),
            "build request distributor stopped"
        );
        leftover.into_iter().collect()
    }

    /// Ask for the named builders to be scanned. Never blocks; must be called
    /// from within a tokio runtime. Ignored while the distributor is stopped.
    pub fn request_scan<I, S>(&self, builder_names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.inner.state();
        if !state.running {
            debug!("distributor not running; scan request dropped");
            return;
        }

        state.pending.extend(builder_names.into_iter().map(Into::into));
        if state.pending.is_empty() || state.loop_active {
            return;
        }
        state.loop_active = true;
        self.inner.quiet.send_replace(false);
        drop(state);

        tokio::spawn(run_loop(Arc::clone(&self.inner)));
    }

    pub fn request_scan_all(&self) {
        self.request_scan(self.inner.builders.names());
    }

    /// Resolves once no scan is running or pending.
    pub async fn wait_until_quiet(&self) {
        let mut quiet = self.inner.quiet.subscribe();
        // the sender lives as long as `inner`, which we hold
        let _ = quiet.wait_for(|q| *q).await;
    }

    /// Reports of every chooser run since the last call.
    pub fn take_reports(&self) -> Vec<ScanReport> {
        std::mem::take(
            &mut *self
                .inner
                .reports
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

async fn run_loop(inner: Arc<Inner>) {
    let mut rng = inner.activity.lock().await;

    loop {
        let worklist: Vec<String> = {
            let mut state = inner.state();
            if !state.running || state.pending.is_empty() {
                state.loop_active = false;
                inner.quiet.send_replace(true);
                break;
            }
            std::mem::take(&mut state.pending).into_iter().collect()
        };

        let ordered = sort_builders(&inner, worklist).await;
        debug!(builders = ?ordered, "scanning builders");

        for name in ordered {
            let Some(builder) = inner.builders.get(&name) else {
                debug!(builder = %name, "builder no longer configured; skipping");
                continue;
            };

            let span = info_span!("builder_scan", builder = %name);
            let chooser = BuildChooser::new(
                builder.as_ref(),
                inner.store.as_ref(),
                inner.master_id,
                &mut *rng,
            );
            let outcome = AssertUnwindSafe(chooser.run())
                .catch_unwind()
                .instrument(span)
                .await;

            match outcome {
                Ok(Ok(report)) => {
                    debug!(
                        builder = %name,
                        started = report.started.len(),
                        claim_races = report.claim_races,
                        refusals = report.refusals,
                        "builder scan finished"
                    );
                    inner
                        .reports
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(report);
                }
                Ok(Err(e)) => error!(builder = %name, error = %e, "builder scan failed"),
                Err(_) => error!(builder = %name, "builder scan panicked"),
            }
        }
    }
}

async fn sort_builders(inner: &Inner, names: Vec<String>) -> Vec<String> {
    let hook = inner
        .sort_builders
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();

    let Some(hook) = hook else {
        return oldest_request_first(inner.store.as_ref(), names).await;
    };

    match hook(names.clone()).resolve().await {
        Ok(sorted) if is_permutation(&names, &sorted) => sorted,
        Ok(sorted) => {
            warn!(given = ?names, returned = ?sorted, "sortBuilders returned a different set of builders");
            names
        }
        Err(e) => {
            warn!(error = %e, "sortBuilders hook failed");
            names
        }
    }
}

fn is_permutation(names: &[String], sorted: &[String]) -> bool {
    let mut a: Vec<&String> = names.iter().collect();
    let mut b: Vec<&String> = sorted.iter().collect();
    a.sort();
    b.sort();
    a == b
}

/// Builders with the oldest pending request first; builders with nothing
/// pending go last. Ties break on name.
pub async fn oldest_request_first(store: &dyn BuildRequestStore, names: Vec<String>) -> Vec<String> {
    let mut keyed: Vec<(Option<DateTime<Utc>>, String)> = Vec::with_capacity(names.len());
    for name in names {
        let oldest = match store.get_oldest_request_time(&name).await {
            Ok(oldest) => oldest,
            Err(e) => {
                warn!(builder = %name, error = %e, "could not read oldest request time");
                None
            }
        };
        keyed.push((oldest, name));
    }

    keyed.sort_by(|(ta, na), (tb, nb)| {
        ta.is_none()
            .cmp(&tb.is_none())
            .then(ta.cmp(tb))
            .then(na.cmp(nb))
    });
    keyed.into_iter().map(|(_, name)| name).collect()
}
