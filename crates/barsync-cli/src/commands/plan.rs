use std::sync::Arc;

use barsync_core::{
    CoverageRange, FetchPlanner, OwnerId, RequestIdAllocator, SeriesKey, SeriesPersistence,
    SeriesStore, UtcDateTime, Warehouse, WarehouseConfig,
};
use serde_json::json;

use crate::cli::PlanArgs;
use crate::error::CliError;

use super::{clock_at, CommandResult};

pub fn run(args: &PlanArgs, warehouse: WarehouseConfig) -> Result<CommandResult, CliError> {
    let key = SeriesKey::parse(&args.key)?;
    let clock = clock_at(args.now.as_deref())?;
    let store = Arc::new(SeriesStore::new(false));
    let mut warnings = Vec::new();

    if args.from_warehouse {
        let warehouse = Warehouse::open(warehouse)?;
        match warehouse.load(&key)? {
            Some((bars, coverage)) => {
                store.seed(&key, bars, coverage);
            }
            None => warnings.push(format!("no stored series for {key}, planning from empty")),
        }
    }

    let planner = FetchPlanner::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        RequestIdAllocator::new(),
    );
    let now = clock.now();
    let start = match args.start.as_deref() {
        Some(value) => UtcDateTime::parse(value)?,
        None => planner
            .lookback_window(key.granularity)
            .map_or(now, |window| window.start()),
    };
    let end = match args.end.as_deref() {
        Some(value) => UtcDateTime::parse(value)?,
        None => now,
    };
    let desired = CoverageRange::new(start, end)?;

    let requests = planner.plan(
        &key,
        desired,
        args.full_refetch,
        OwnerId::new(),
        args.keep_alive,
    );
    if requests.is_empty() {
        warnings.push(format!("{desired} is already covered or lies in the future"));
    }

    let data = json!({
        "key": key.to_string(),
        "now": now,
        "desired": desired,
        "max_request_seconds": key.granularity.max_request_seconds(),
        "request_count": requests.len(),
        "requests": requests,
    });
    Ok(CommandResult::ok(data).with_warnings(warnings))
}
