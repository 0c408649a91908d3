use serde::Serialize;
use serde_json::Value;

use crate::cli::OutputFormat;
use crate::error::CliError;

pub const SCHEMA_VERSION: &str = "v1";

/// Output envelope shared by every command.
#[derive(Debug, Serialize)]
pub struct Report {
    pub schema_version: &'static str,
    pub command: &'static str,
    pub generated_at: String,
    pub warnings: Vec<String>,
    pub data: Value,
}

pub fn render(report: &Report, format: OutputFormat, pretty: bool) -> Result<(), CliError> {
    match format {
        OutputFormat::Json => {
            let payload = if pretty {
                serde_json::to_string_pretty(report)?
            } else {
                serde_json::to_string(report)?
            };
            println!("{payload}");
        }
        OutputFormat::Table => render_table(report)?,
    }
    Ok(())
}

fn render_table(report: &Report) -> Result<(), CliError> {
    println!("command     : {}", report.command);
    println!("schema      : {}", report.schema_version);
    println!("generated_at: {}", report.generated_at);

    if !report.warnings.is_empty() {
        println!("warnings:");
        for warning in &report.warnings {
            println!("  - {warning}");
        }
    }

    println!("data:");
    let pretty_data = serde_json::to_string_pretty(&report.data)?;
    for line in pretty_data.lines() {
        println!("  {line}");
    }
    Ok(())
}
