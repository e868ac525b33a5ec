//! Offline scheduling simulation.

use anyhow::{Context, Result};
use buildit_config::{load_build_requests, load_master_config};
use buildit_db::{
    BuildRequestStore, InMemoryBuildRequestStore, PgBuildRequestStore, create_pool,
    run_migrations,
};
use buildit_scheduler::{
    BuildRequestDistributor, BuilderSet, DistributorOptions, LockRegistry, ScanReport,
    StaticBuilder,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

pub struct SimulateOptions {
    pub seed: Option<u64>,
    pub master: String,
    pub rounds: u32,
    pub json: bool,
    /// PostgreSQL store to schedule against; in-memory when unset.
    pub database_url: Option<String>,
}

#[derive(Serialize)]
struct Round {
    round: u32,
    reports: Vec<ScanReport>,
}

#[derive(Serialize)]
struct Summary {
    master: String,
    rounds: Vec<Round>,
    unscheduled: usize,
}

/// Load a configuration and request fixtures into a build request store and
/// run the distributor over them.
pub async fn run(config_path: &str, requests_path: &str, options: SimulateOptions) -> Result<()> {
    let config = load_master_config(config_path)
        .with_context(|| format!("Failed to load config file: {}", config_path))?;
    let fixtures = load_build_requests(requests_path)
        .with_context(|| format!("Failed to load request fixtures: {}", requests_path))?;

    let locks = Arc::new(LockRegistry::from_specs(config.locks.clone())?);
    let builders = Arc::new(BuilderSet::new());
    let mut static_builders = Vec::with_capacity(config.builders.len());
    for spec in &config.builders {
        let builder = Arc::new(StaticBuilder::from_spec(spec, Arc::clone(&locks)));
        builders.insert(builder.clone());
        static_builders.push(builder);
    }

    let store = open_store(options.database_url.as_deref()).await?;
    let mut submitted = Vec::with_capacity(fixtures.len());
    for request in fixtures {
        if config.builder(&request.builder).is_none() {
            warn!(builder = %request.builder, "request for an unknown builder will never be scheduled");
        }
        submitted.push(store.add_build_request(request).await?.id);
    }

    let distributor = BuildRequestDistributor::new(
        Arc::clone(&builders),
        store.clone(),
        DistributorOptions {
            rng_seed: options.seed,
            ..Default::default()
        },
    );
    distributor.start();

    info!(master = %options.master, master_id = %distributor.master_id(), rounds = options.rounds, "simulating");
    let mut rounds = Vec::new();
    for round in 1..=options.rounds.max(1) {
        distributor.request_scan_all();
        distributor.wait_until_quiet().await;
        let reports = distributor.take_reports();
        let started: usize = reports.iter().map(|r| r.started.len()).sum();
        rounds.push(Round { round, reports });

        // builds from this round finish so the next round has workers again
        for builder in &static_builders {
            for build in builder.running_builds() {
                store
                    .complete_build_requests(&build.requests, Utc::now())
                    .await?;
                builder.finish_build(build.id)?;
            }
        }
        if started == 0 {
            break;
        }
    }
    distributor.stop().await;

    let mut unscheduled = 0;
    for id in submitted {
        if !store.get_build_request(id).await?.is_claimed() {
            unscheduled += 1;
        }
    }

    let summary = Summary {
        master: options.master,
        rounds,
        unscheduled,
    };
    if options.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

async fn open_store(database_url: Option<&str>) -> Result<Arc<dyn BuildRequestStore>> {
    let Some(url) = database_url else {
        return Ok(Arc::new(InMemoryBuildRequestStore::new()));
    };

    let pool = create_pool(url)
        .await
        .context("Failed to connect to the database")?;
    run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    info!("using PostgreSQL build request store");
    Ok(Arc::new(PgBuildRequestStore::new(pool)))
}

fn print_summary(summary: &Summary) {
    println!("Master: {}", summary.master);
    for round in &summary.rounds {
        println!("Round {}:", round.round);
        for report in &round.reports {
            for build in &report.started {
                let ids: Vec<String> = build.requests.iter().map(|id| id.to_string()).collect();
                println!(
                    "  {:<16} {:<16} requests {}",
                    report.builder,
                    build.worker,
                    ids.join(",")
                );
            }
            if report.claim_races > 0 || report.refusals > 0 {
                println!(
                    "  {:<16} claim races: {}, refusals: {}",
                    report.builder, report.claim_races, report.refusals
                );
            }
        }
    }
    println!("Unscheduled requests: {}", summary.unscheduled);
}
