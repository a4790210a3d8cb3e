use crate::report::summary_path;
use crate::utils::errors::MonitoringError;
use polars::prelude::{Column, DataFrame, NamedFrom};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::Path;

const TEXT_COLUMNS: [&str; 3] = ["execution_id", "function_name", "source"];

/// Loads `{strategy}_summary.json` from `dir` as a DataFrame.
pub fn load_summary_frame(dir: &Path, strategy: &str) -> Result<DataFrame, MonitoringError> {
    let path = summary_path(dir, strategy);
    let contents = std::fs::read_to_string(&path)?;
    let entries: Vec<Map<String, Value>> = serde_json::from_str(&contents)?;
    summary_frame(&entries)
}

/// DataFrame: execution_id | function_name | source | one f64 column per numeric key
pub fn summary_frame(entries: &[Map<String, Value>]) -> Result<DataFrame, MonitoringError> {
    let mut columns: Vec<Column> = TEXT_COLUMNS
        .iter()
        .map(|&key| {
            let values: Vec<Option<String>> = entries
                .iter()
                .map(|e| e.get(key).and_then(Value::as_str).map(str::to_string))
                .collect();
            Column::new(key.into(), values)
        })
        .collect();

    let numeric_keys: BTreeSet<&str> = entries
        .iter()
        .flat_map(|entry| entry.iter())
        .filter(|(_, value)| value.is_number())
        .map(|(key, _)| key.as_str())
        .collect();
    for key in numeric_keys {
        let values: Vec<Option<f64>> = entries
            .iter()
            .map(|e| e.get(key).and_then(Value::as_f64))
            .collect();
        columns.push(Column::new(key.into(), values));
    }

    DataFrame::new(columns)
        .map_err(|e| MonitoringError::Other(format!("Failed to create summary DataFrame: {}", e)))
}
