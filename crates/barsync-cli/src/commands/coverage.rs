use barsync_core::{SeriesPersistence, Warehouse, WarehouseConfig};
use serde_json::json;

use crate::cli::CoverageArgs;
use crate::error::CliError;

use super::{parse_keys, CommandResult};

pub fn run(args: &CoverageArgs, warehouse: WarehouseConfig) -> Result<CommandResult, CliError> {
    let warehouse = Warehouse::open(warehouse)?;
    let keys = if args.keys.is_empty() {
        SeriesPersistence::keys(&warehouse)?
    } else {
        parse_keys(&args.keys)?
    };

    let mut warnings = Vec::new();
    let mut series = Vec::with_capacity(keys.len());
    for key in keys {
        let Some((bars, coverage)) = warehouse.load(&key)? else {
            warnings.push(format!("no stored series for {key}"));
            continue;
        };
        series.push(json!({
            "key": key.to_string(),
            "bar_count": bars.len(),
            "first_bar": bars.first().map(|bar| bar.ts),
            "last_bar": bars.last().map(|bar| bar.ts),
            "coverage": coverage.ranges(),
        }));
    }

    let data = json!({
        "db_path": warehouse.db_path().display().to_string(),
        "series": series,
    });
    Ok(CommandResult::ok(data).with_warnings(warnings))
}
