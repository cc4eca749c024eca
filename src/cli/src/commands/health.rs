//! Health check command.
//!
//! Queries `/health` (or `/health/detailed`) and displays dependency status.

use anyhow::Result;
use clap::Args;
use serde_json::Value;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Include per-component latency and errors
    #[arg(short, long)]
    detailed: bool,
}

fn field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(|v| v.as_str()).unwrap_or("unknown")
}

pub async fn execute(args: HealthArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let path = if args.detailed { "/health/detailed" } else { "/health" };
    let (_, health) = client.get_raw(path).await?;

    match format {
        OutputFormat::Table => {
            let status = field(&health, "status");

            output::print_header("Service Health");
            output::print_detail("Status", output::health_status(status));
            output::print_detail("API URL", client.base_url());
            output::print_detail("Database", output::health_status(field(&health, "db")));
            output::print_detail("Redis", output::health_status(field(&health, "redis")));

            if let Some(version) = health.get("version").and_then(|v| v.as_str()) {
                output::print_detail("Version", version);
            }
            output::print_detail("Timestamp", field(&health, "timestamp"));

            if let Some(components) = health.get("components").and_then(|v| v.as_array()) {
                output::print_header("Components");
                for comp in components {
                    let latency = comp
                        .get("latency_ms")
                        .and_then(|v| v.as_u64())
                        .map(|ms| format!(" ({}ms)", ms))
                        .unwrap_or_default();
                    let error = comp
                        .get("error")
                        .and_then(|v| v.as_str())
                        .map(|e| format!(" - {}", e))
                        .unwrap_or_default();
                    output::print_detail(
                        field(comp, "name"),
                        format!("{}{}{}", output::health_status(field(comp, "status")), latency, error),
                    );
                }
            }

            if status == "ok" {
                output::print_success("All dependencies reachable");
            } else {
                output::print_error(&format!("Service status: {}", status));
            }
        }
        _ => output::print_item(&health, format)?,
    }

    Ok(())
}
