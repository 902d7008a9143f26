//! Command implementations.
//!
//! Each command sends one operator request and prints the answer, either as
//! a plain table or, with `--json`, as pretty-printed JSON.

pub mod links;
pub mod node;
pub mod two_factor;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

/// Prints a value as pretty JSON.
fn print_json(value: &impl serde::Serialize) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to encode JSON output")?;
    println!("{text}");
    Ok(())
}

/// Prints a plain message, or `{"message": ...}` in JSON mode.
fn print_message(message: &str, json: bool) -> Result<()> {
    if json {
        print_json(&serde_json::json!({ "message": message }))
    } else {
        println!("{message}");
        Ok(())
    }
}

/// Formats seconds as a short human-readable duration.
fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

/// Formats the time remaining until `at`, or `expired`.
fn format_remaining(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    u64::try_from((at - now).num_seconds())
        .ok()
        .filter(|secs| *secs > 0)
        .map_or_else(|| "expired".to_string(), |secs| format!("in {}", format_duration(secs)))
}
