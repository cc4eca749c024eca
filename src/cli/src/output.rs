//! Terminal rendering for the Perch CLI.
//!
//! Users and health reports print as aligned tables and detail blocks, with
//! subscription and dependency states coloured by meaning. `--output json` and
//! `--output yaml` bypass all of that and print the API payload as-is.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use colored::*;
use serde::Serialize;
use std::fmt::Display;
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

/// Width of the key column in detail blocks.
const DETAIL_KEY_WIDTH: usize = 14;

/// Output format selection.
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Tables and detail blocks
    #[default]
    Table,
    /// The raw API payload as JSON
    Json,
    /// The raw API payload as YAML
    Yaml,
}

// ── Status lines ────────────────────────────────────────────────────────────

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Goes to stderr.
pub fn print_error(msg: &str) {
    eprintln!("{} {}", "error:".red().bold(), msg);
}

pub fn print_info(msg: &str) {
    println!("{} {}", "·".blue().bold(), msg);
}

// ── Domain values ───────────────────────────────────────────────────────────

/// A subscription status coloured by what it means for the user.
pub fn subscription_status(status: &str) -> ColoredString {
    match status {
        "active" => status.green().bold(),
        "expired" => status.red(),
        "canceled" => status.yellow(),
        "inactive" => status.dimmed(),
        other => other.normal(),
    }
}

/// A dependency status from `/health`.
pub fn health_status(status: &str) -> ColoredString {
    match status {
        "ok" => status.green().bold(),
        "error" => status.red().bold(),
        other => other.yellow(),
    }
}

/// `2024-03-08 12:00 UTC`, or `-` when unset.
pub fn timestamp(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Coarse distance from `now`: `in 6d 23h`, `3h 5m ago`, `now`.
pub fn relative(t: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = t - now;
    let future = delta.num_seconds() >= 0;
    let secs = delta.num_seconds().unsigned_abs();

    let (days, hours, minutes) = (secs / 86_400, secs % 86_400 / 3_600, secs % 3_600 / 60);
    let span = match (days, hours, minutes) {
        (0, 0, 0) => return "now".to_string(),
        (0, 0, m) => format!("{}m", m),
        (0, h, m) => format!("{}h {}m", h, m),
        (d, h, _) => format!("{}d {}h", d, h),
    };

    if future {
        format!("in {}", span)
    } else {
        format!("{} ago", span)
    }
}

/// Expiry with its distance from `now`, e.g. `2024-03-08 12:00 UTC (in 6d 23h)`.
pub fn expiry(t: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    match t {
        Some(at) => format!("{} ({})", timestamp(Some(at)), relative(at, now)),
        None => timestamp(None),
    }
}

// ── Blocks and tables ───────────────────────────────────────────────────────

/// One `key: value` line of a detail block, keys padded to a common width.
pub fn detail_line(key: &str, value: impl Display) -> String {
    let label = format!("{:<width$}", format!("{}:", key), width = DETAIL_KEY_WIDTH + 1);
    format!("  {} {}", label.cyan(), value)
}

pub fn print_detail(key: &str, value: impl Display) {
    println!("{}", detail_line(key, value));
}

pub fn print_header(title: &str) {
    println!();
    println!("{}", title.bold().underline());
}

/// Render rows as a table, or the list itself as JSON/YAML.
pub fn render_list<T: Tabled + Serialize>(items: &[T], format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Table if items.is_empty() => "No users yet.".dimmed().to_string(),
        OutputFormat::Table => Table::new(items)
            .with(Style::rounded())
            .with(Modify::new(Columns::first()).with(Alignment::left()))
            .to_string(),
        OutputFormat::Json => serde_json::to_string_pretty(items)?,
        OutputFormat::Yaml => serde_yaml::to_string(items)?.trim_end().to_string(),
    })
}

pub fn print_list<T: Tabled + Serialize>(items: &[T], format: OutputFormat) -> Result<()> {
    println!("{}", render_list(items, format)?);
    Ok(())
}

/// Print one payload as JSON (also used for `table`, which has no generic layout) or YAML.
pub fn print_item<T: Serialize>(item: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table | OutputFormat::Json => println!("{}", serde_json::to_string_pretty(item)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(item)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_subscription_status_colours() {
        assert_eq!(subscription_status("active").fgcolor(), Some(Color::Green));
        assert_eq!(subscription_status("expired").fgcolor(), Some(Color::Red));
        assert_eq!(subscription_status("canceled").fgcolor(), Some(Color::Yellow));
        assert_eq!(subscription_status("inactive").fgcolor(), None);
        assert_eq!(subscription_status("paused").fgcolor(), None);
        assert_eq!(&*subscription_status("active"), "active");
    }

    #[test]
    fn test_health_status_colours() {
        assert_eq!(health_status("ok").fgcolor(), Some(Color::Green));
        assert_eq!(health_status("error").fgcolor(), Some(Color::Red));
        assert_eq!(health_status("unknown").fgcolor(), Some(Color::Yellow));
    }

    #[test]
    fn test_timestamp() {
        assert_eq!(timestamp(Some(at(12, 0))), "2024-03-01 12:00 UTC");
        assert_eq!(timestamp(None), "-");
    }

    #[test]
    fn test_relative() {
        let now = at(12, 0);
        assert_eq!(relative(now + Duration::days(7) - Duration::minutes(30), now), "in 6d 23h");
        assert_eq!(relative(at(8, 55), now), "3h 5m ago");
        assert_eq!(relative(now + Duration::seconds(90), now), "in 1m");
        assert_eq!(relative(now + Duration::seconds(20), now), "now");
    }

    #[test]
    fn test_expiry() {
        let now = at(12, 0);
        assert_eq!(expiry(Some(at(14, 0)), now), "2024-03-01 14:00 UTC (in 2h 0m)");
        assert_eq!(expiry(None, now), "-");
    }

    #[test]
    fn test_detail_line_aligns_values() {
        colored::control::set_override(false);
        assert_eq!(detail_line("ID", "42"), "  ID:             42");
        assert_eq!(detail_line("Subscription", subscription_status("active")), "  Subscription:   active");
    }

    #[derive(Serialize, Tabled)]
    struct Row {
        name: String,
    }

    #[test]
    fn test_render_list_formats() {
        let rows = vec![Row { name: "Ada".into() }];
        assert!(render_list(&rows, OutputFormat::Table).unwrap().contains("Ada"));
        assert_eq!(
            render_list(&rows, OutputFormat::Json).unwrap(),
            "[\n  {\n    \"name\": \"Ada\"\n  }\n]"
        );
        assert_eq!(render_list(&rows, OutputFormat::Yaml).unwrap(), "- name: Ada");
        assert!(render_list::<Row>(&[], OutputFormat::Table).unwrap().contains("No users yet."));
    }
}
