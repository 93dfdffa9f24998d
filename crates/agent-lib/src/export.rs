//! Sample export in CSV and JSON
//!
//! Column order matches the `samples` schema; JSON output is an array of
//! objects. Both render into any `io::Write`, so callers can stream to a
//! file or a pipe.

use crate::models::Sample;
use crate::store::{Store, StoreError};
use std::io::Write;
use thiserror::Error;

/// Columns in schema order.
const COLUMNS: &[&str] = &[
    "ts",
    "host",
    "cpu_pct",
    "mem_pct",
    "disk_read_bps",
    "disk_write_bps",
    "net_up_bps",
    "net_down_bps",
    "swap_pct",
    "proc_count",
    "cpu_temp",
];

#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Export a window of samples as CSV with a header row.
pub fn export_csv<W: Write>(
    store: &Store,
    from: i64,
    to: i64,
    out: &mut W,
) -> Result<usize, ExportError> {
    let samples = store.read_samples(from, to, None)?;
    writeln!(out, "{}", COLUMNS.join(","))?;
    for s in &samples {
        writeln!(out, "{}", csv_row(s))?;
    }
    Ok(samples.len())
}

/// Export a window of samples as a JSON array of objects.
pub fn export_json<W: Write>(
    store: &Store,
    from: i64,
    to: i64,
    out: &mut W,
) -> Result<usize, ExportError> {
    let samples = store.read_samples(from, to, None)?;
    let rows: Vec<serde_json::Value> = samples.iter().map(json_row).collect();
    serde_json::to_writer(&mut *out, &rows)?;
    writeln!(out)?;
    Ok(samples.len())
}

fn csv_row(s: &Sample) -> String {
    let cpu_temp = s
        .cpu_temp
        .map(|t| format!("{t}"))
        .unwrap_or_default();
    format!(
        "{},{},{},{},{},{},{},{},{},{},{}",
        s.ts,
        csv_field(&s.host),
        s.cpu_pct,
        s.mem_pct,
        s.disk_read_bps,
        s.disk_write_bps,
        s.net_up_bps,
        s.net_down_bps,
        s.swap_pct,
        s.proc_count,
        cpu_temp
    )
}

/// Quote a text field when it contains a delimiter or quote.
fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Object with keys in schema order (serde_json preserves insertion
/// order with the default feature set used here via Map).
fn json_row(s: &Sample) -> serde_json::Value {
    serde_json::json!({
        "ts": s.ts,
        "host": s.host,
        "cpu_pct": s.cpu_pct,
        "mem_pct": s.mem_pct,
        "disk_read_bps": s.disk_read_bps,
        "disk_write_bps": s.disk_write_bps,
        "net_up_bps": s.net_up_bps,
        "net_down_bps": s.net_down_bps,
        "swap_pct": s.swap_pct,
        "proc_count": s.proc_count,
        "cpu_temp": s.cpu_temp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_store() -> Store {
        let store = Store::open_memory().unwrap();
        let samples = vec![
            Sample {
                ts: 100,
                host: "host-a".to_string(),
                cpu_pct: 10.5,
                mem_pct: 40.0,
                swap_pct: 1.0,
                disk_read_bps: 1000.0,
                disk_write_bps: 2000.0,
                net_up_bps: 300.0,
                net_down_bps: 400.0,
                proc_count: 120,
                cpu_temp: Some(51.0),
            },
            Sample {
                ts: 101,
                host: "host-a".to_string(),
                cpu_pct: 11.0,
                mem_pct: 41.0,
                swap_pct: 1.0,
                disk_read_bps: 1100.0,
                disk_write_bps: 2100.0,
                net_up_bps: 310.0,
                net_down_bps: 410.0,
                proc_count: 121,
                cpu_temp: None,
            },
        ];
        store.insert_samples(&samples).unwrap();
        store
    }

    #[test]
    fn test_csv_header_and_rows() {
        let store = seeded_store();
        let mut out = Vec::new();
        let count = export_csv(&store, 0, 1000, &mut out).unwrap();
        assert_eq!(count, 2);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "ts,host,cpu_pct,mem_pct,disk_read_bps,disk_write_bps,net_up_bps,net_down_bps,swap_pct,proc_count,cpu_temp"
        );
        assert!(lines[1].starts_with("100,host-a,10.5,"));
        // Absent temperature renders as an empty trailing field.
        assert!(lines[2].ends_with(",121,"));
    }

    #[test]
    fn test_json_array_of_objects() {
        let store = seeded_store();
        let mut out = Vec::new();
        export_json(&store, 0, 1000, &mut out).unwrap();

        let rows: Vec<serde_json::Value> = serde_json::from_slice(&out).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["ts"], 100);
        assert_eq!(rows[0]["cpu_temp"], 51.0);
        assert_eq!(rows[1]["cpu_temp"], serde_json::Value::Null);
    }

    #[test]
    fn test_window_filter_applies() {
        let store = seeded_store();
        let mut out = Vec::new();
        let count = export_csv(&store, 101, 200, &mut out).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("with,comma"), "\"with,comma\"");
        assert_eq!(csv_field("with\"quote"), "\"with\"\"quote\"");
    }
}
