//! Result rendering for the terminal.

use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use fanquery_core::{QueryResult, QueryStatus};
use serde_json::{json, Value};

/// Output format of `fanquery run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table.
    Table,
    /// JSON array, one object per query.
    Json,
}

fn colored_status(status: QueryStatus) -> String {
    match status {
        QueryStatus::Success => status.as_str().green().to_string(),
        QueryStatus::Error => status.as_str().red().to_string(),
        QueryStatus::Paused => status.as_str().yellow().to_string(),
        QueryStatus::Pending => status.as_str().dimmed().to_string(),
    }
}

/// Renders results as a table.
#[must_use]
pub fn table(results: &[QueryResult]) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["#", "Key", "Status", "Value", "Error"]);

    for (index, result) in results.iter().enumerate() {
        let value = match result.value() {
            Some(value) if result.is_seeded => format!("{value} (seed)"),
            Some(value) => value.to_string(),
            None => "-".to_string(),
        };
        let error = result
            .error
            .as_ref()
            .map_or_else(|| "-".to_string(), ToString::to_string);
        table.add_row(vec![
            index.to_string(),
            result.key.to_string(),
            colored_status(result.status),
            value,
            error,
        ]);
    }
    table.to_string()
}

/// Renders results as a JSON array.
#[must_use]
pub fn json(results: &[QueryResult]) -> Value {
    Value::Array(
        results
            .iter()
            .map(|result| {
                json!({
                    "key": result.key.to_json(),
                    "status": result.status.as_str(),
                    "value": result.value().cloned(),
                    "seeded": result.is_seeded,
                    "error": result.error.as_ref().map(ToString::to_string),
                })
            })
            .collect(),
    )
}

/// One-line summary of a batch notification.
#[must_use]
pub fn summary(version: u64, results: &[QueryResult]) -> String {
    let settled = results
        .iter()
        .filter(|r| !r.is_fetching && !r.is_pending())
        .count();
    let failed = results.iter().filter(|r| r.is_error()).count();
    format!(
        "update #{version}: {settled}/{} settled, {failed} failed",
        results.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanquery_core::{QueryDescriptor, QueryKey, QueryState};

    fn paused() -> QueryResult {
        fanquery_core::project(
            &QueryState::default(),
            &QueryDescriptor::skipped(QueryKey::from("later")).with_seed(json!(0)),
        )
    }

    #[test]
    fn test_json_shape() {
        let out = json(&[paused()]);
        assert_eq!(
            out,
            json!([{
                "key": ["later"],
                "status": "paused",
                "value": 0,
                "seeded": true,
                "error": null,
            }])
        );
    }

    #[test]
    fn test_table_lists_every_result() {
        let rendered = table(&[paused(), paused()]);
        assert!(rendered.contains("later"));
        assert!(rendered.contains("0 (seed)"));
    }

    #[test]
    fn test_summary_counts_settled() {
        assert_eq!(summary(3, &[paused()]), "update #3: 1/1 settled, 0 failed");
    }
}
