mod coverage;
mod plan;
mod simulate;

use std::sync::Arc;

use barsync_core::{Clock, ManualClock, SeriesKey, SystemClock, UtcDateTime, WarehouseConfig};
use serde_json::Value;

use crate::cli::{Cli, Command};
use crate::error::CliError;
use crate::output::{Report, SCHEMA_VERSION};

pub struct CommandResult {
    pub data: Value,
    pub warnings: Vec<String>,
}

impl CommandResult {
    pub fn ok(data: Value) -> Self {
        Self {
            data,
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }
}

pub async fn run(cli: &Cli) -> Result<Report, CliError> {
    let warehouse = warehouse_config(cli);
    let (command, result) = match &cli.command {
        Command::Plan(args) => ("plan", plan::run(args, warehouse)?),
        Command::Coverage(args) => ("coverage", coverage::run(args, warehouse)?),
        Command::Simulate(args) => ("simulate", simulate::run(args, warehouse).await?),
    };

    Ok(Report {
        schema_version: SCHEMA_VERSION,
        command,
        generated_at: UtcDateTime::now().format_rfc3339(),
        warnings: result.warnings,
        data: result.data,
    })
}

fn warehouse_config(cli: &Cli) -> WarehouseConfig {
    cli.home
        .clone()
        .map(WarehouseConfig::in_home)
        .unwrap_or_default()
}

fn parse_keys(raw: &[String]) -> Result<Vec<SeriesKey>, CliError> {
    raw.iter()
        .map(|value| SeriesKey::parse(value).map_err(CliError::from))
        .collect()
}

/// A fixed clock when `now` is given, wall-clock otherwise.
fn clock_at(now: Option<&str>) -> Result<Arc<dyn Clock>, CliError> {
    Ok(match now {
        Some(value) => Arc::new(ManualClock::new(UtcDateTime::parse(value)?)),
        None => Arc::new(SystemClock),
    })
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use tempfile::tempdir;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("barsync").chain(args.iter().copied()))
            .expect("valid arguments")
    }

    #[tokio::test]
    async fn plan_reports_one_request_for_an_empty_daily_window() {
        let cli = parse(&[
            "plan",
            "AAPL@1d",
            "--start",
            "2024-01-01T00:00:00Z",
            "--end",
            "2024-01-04T00:00:00Z",
            "--now",
            "2024-02-01T00:00:00Z",
        ]);

        let report = run(&cli).await.expect("plan");

        assert_eq!(report.command, "plan");
        assert!(report.warnings.is_empty());
        assert_eq!(report.data["request_count"], 1);
        assert_eq!(report.data["requests"][0]["kind"], "catch_up");
    }

    #[tokio::test]
    async fn simulate_persists_and_coverage_reads_back() {
        let temp = tempdir().expect("tempdir");
        let home = temp.path().to_str().expect("utf-8 path");
        let simulate = parse(&[
            "--home",
            home,
            "simulate",
            "MSFT@1d",
            "--now",
            "2024-02-01T00:00:00Z",
            "--persist",
        ]);

        let report = run(&simulate).await.expect("simulate");
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert!(report.data["persisted"].as_u64().expect("persisted") >= 1);
        assert_eq!(report.data["statuses"][0]["status"]["status"], "initialized");

        let coverage = run(&parse(&["--home", home, "coverage", "MSFT@1d"]))
            .await
            .expect("coverage");
        let series = &coverage.data["series"][0];
        assert_eq!(series["key"], "MSFT@1d");
        assert!(series["bar_count"].as_u64().expect("bar count") > 0);
    }

    #[tokio::test]
    async fn malformed_key_maps_to_validation_exit_code() {
        let error = run(&parse(&["plan", "not-a-key"]))
            .await
            .expect_err("invalid key");
        assert_eq!(error.exit_code(), 2);
    }
}
