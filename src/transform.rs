use jiff::civil::Date;
use log::{info, warn};

use crate::batch::RowBatch;

/// Columns coerced to integers, with 0 standing in for missing values.
const INTERVAL_COLUMNS: [&str; 2] = ["case_positive_specimen_interval", "case_onset_interval"];

/// Categorical columns that default to "Unknown" when a value is missing.
/// `res_state` is not here: it is required, a row without it is dropped.
const CATEGORICAL_COLUMNS: [&str; 11] = [
    "age_group",
    "sex",
    "race",
    "ethnicity",
    "exposure_yn",
    "current_status",
    "symptom_status",
    "death_yn",
    "hosp_yn",
    "icu_yn",
    "underlying_conditions_yn",
];

/// A row missing either of these is dropped.
const REQUIRED_COLUMNS: [&str; 2] = ["res_state", "state_fips_code"];

/// Parse a `case_month` cell.  The feed reports month granularity
/// ("2021-03"), older extracts carry full dates, and CSV exports sometimes
/// append a midnight timestamp.
pub fn parse_case_month(value: &str) -> Option<Date> {
    let value = value.trim();
    let value = match value.split_once('T') {
        Some((date_part, _)) => date_part,
        None => value,
    };
    if let Ok(date) = Date::strptime("%Y-%m-%d", value) {
        return Some(date);
    }
    Date::strptime("%Y-%m-%d", format!("{}-01", value)).ok()
}

fn parse_interval(value: &str) -> i64 {
    let value = value.trim();
    value
        .parse::<i64>()
        .or_else(|_| value.parse::<f64>().map(|f| f as i64))
        .unwrap_or(0)
}

/// Clean one raw batch: normalize dates, coerce the interval columns, fill
/// categorical defaults, and drop rows that are unusable.  Pure, no I/O
/// beyond logging the row counts.
pub fn clean(mut batch: RowBatch) -> RowBatch {
    if batch.is_empty() {
        warn!("received an empty batch, no data to transform");
        return batch;
    }
    let before = batch.len();

    // normalize case_month to an ISO date, drop rows that do not parse
    if let Some(col) = batch.column_index("case_month") {
        for row in 0..batch.len() {
            let parsed = batch.value(row, col).and_then(parse_case_month);
            batch.set(row, col, parsed.map(|d| d.to_string()));
        }
        batch.retain_rows(|row| row[col].is_some());
    }

    for name in INTERVAL_COLUMNS {
        if let Some(col) = batch.column_index(name) {
            for row in 0..batch.len() {
                let n = batch.value(row, col).map_or(0, parse_interval);
                batch.set(row, col, Some(n.to_string()));
            }
        }
    }

    for name in CATEGORICAL_COLUMNS {
        if let Some(col) = batch.column_index(name) {
            for row in 0..batch.len() {
                let value = match batch.value(row, col) {
                    Some(s) => s.trim().to_string(),
                    None => "Unknown".to_string(),
                };
                batch.set(row, col, Some(value));
            }
        }
    }

    // res_state is trimmed but never default-filled; a blank value is missing
    if let Some(col) = batch.column_index("res_state") {
        for row in 0..batch.len() {
            if let Some(s) = batch.value(row, col) {
                let trimmed = s.trim().to_string();
                let value = if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed)
                };
                batch.set(row, col, value);
            }
        }
    }

    for name in REQUIRED_COLUMNS {
        match batch.column_index(name) {
            Some(col) => batch.retain_rows(|row| row[col].is_some()),
            None => {
                warn!("required column '{}' absent from batch, dropping all rows", name);
                batch.retain_rows(|_| false);
            }
        }
    }

    if !batch.has_column("process") {
        batch.add_column("process", Some("Unknown".to_string()));
    }

    info!("cleaned data: {} of {} rows remain after cleaning", batch.len(), before);
    batch
}
