use std::sync::Arc;
use std::time::Duration;

use barsync_core::{
    OwnerId, SeriesStore, SimulatedFeed, SyncConfig, SyncCoordinator, SyncStatus, Warehouse,
    WarehouseConfig,
};
use serde_json::json;
use tokio::time::Instant;
use tracing::info;

use crate::cli::SimulateArgs;
use crate::error::CliError;

use super::{clock_at, parse_keys, CommandResult};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub async fn run(
    args: &SimulateArgs,
    warehouse: WarehouseConfig,
) -> Result<CommandResult, CliError> {
    let keys = parse_keys(&args.keys)?;
    let clock = clock_at(args.now.as_deref())?;
    let mut config = SyncConfig::from_env()?;
    if let Some(max_concurrency) = args.max_concurrency {
        config.scheduler.max_concurrency = max_concurrency;
    }

    let store = Arc::new(SeriesStore::new(config.propagate));
    let warehouse = if args.resume || args.persist {
        Some(Warehouse::open(warehouse)?)
    } else {
        None
    };
    let mut warnings = Vec::new();

    let restored = match (&warehouse, args.resume) {
        (Some(warehouse), true) => store.load_from(warehouse)?,
        _ => 0,
    };

    let feed = SimulatedFeed::auto_respond();
    let coordinator =
        SyncCoordinator::with_store(config, Arc::new(feed.clone()), clock, Arc::clone(&store))?;
    let owner = OwnerId::new();
    coordinator.request_updates(owner, &keys, args.keep_alive);

    let deadline = Instant::now() + Duration::from_secs(args.timeout_secs);
    loop {
        coordinator.run_until_idle();
        let settled = keys.iter().all(|key| {
            !matches!(
                coordinator.status(key),
                SyncStatus::CatchingUp | SyncStatus::Backfilling
            )
        });
        if settled && coordinator.scheduler().stats().delayed == 0 {
            break;
        }
        if Instant::now() >= deadline {
            warnings.push(format!(
                "gave up waiting after {}s; some keys are still syncing",
                args.timeout_secs
            ));
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    let statuses = coordinator.statuses();
    for (key, status) in &statuses {
        if let SyncStatus::Failed { reason } = status {
            warnings.push(format!("{key} failed: {reason}"));
        }
    }
    let scheduler = coordinator.scheduler().stats();

    let persisted = match (&warehouse, args.persist) {
        (Some(warehouse), true) => store.persist_all(warehouse)?,
        _ => 0,
    };
    coordinator.cancel_updates(owner);
    info!(keys = keys.len(), persisted, "simulation finished");

    let series: Vec<_> = store
        .keys()
        .into_iter()
        .map(|key| {
            let snapshot = store.get(&key);
            json!({
                "key": key.to_string(),
                "bar_count": snapshot.bars.len(),
                "last_bar": snapshot.last_bar(),
                "coverage": snapshot.coverage.ranges(),
            })
        })
        .collect();
    let statuses: Vec<_> = statuses
        .into_iter()
        .map(|(key, status)| json!({ "key": key.to_string(), "status": status }))
        .collect();

    let data = json!({
        "feed_requests": feed.submitted().len(),
        "restored": restored,
        "persisted": persisted,
        "scheduler": scheduler,
        "statuses": statuses,
        "series": series,
    });
    Ok(CommandResult::ok(data).with_warnings(warnings))
}
