//! Parallel copy engine bridging CSV files and token-ring wide-column
//! clusters.
//!
//! Two operations, both coordinator/worker shaped:
//!
//! - [`ExportTask`] pulls a table (or a token sub-range of it) into one or
//!   more CSV files, scanning token ranges in parallel against their
//!   replicas.
//! - [`ImportTask`] pushes CSV rows into a table through a feeder that
//!   paces input by ingest rate and workers that batch rows by replica
//!   group, retrying transient failures with exponential backoff.
//!
//! The engine is embedded by a host shell, which supplies the cluster
//! handle (any [`ringcopy::driver::ClusterDriver`]), the merged option
//! map and the input/output plumbing, then maps the run summary to a
//! process exit code.

use std::time::Duration;

use anyhow::{Result, bail};
use ringcopy::cql::TableMeta;

pub mod config;
mod export;
mod export_worker;
mod feeder;
mod import;
mod import_worker;
mod messages;
mod reader;
mod writer;

pub use export::{ExportSummary, ExportTask};
pub use import::{ImportSource, ImportSummary, ImportTask};
pub use writer::ExportDest;

/// All table columns when none are given, otherwise the given columns
/// as-is. Import may list columns that only exist in the input (they get
/// skipped); validation against the schema happens where statements are
/// built.
pub(crate) fn resolve_columns(columns: &[String], table: &TableMeta) -> Result<Vec<String>> {
    if columns.is_empty() {
        let all: Vec<String> = table.columns.iter().map(|c| c.name.clone()).collect();
        if all.is_empty() {
            bail!("no column specified");
        }
        return Ok(all);
    }
    Ok(columns.to_vec())
}

/// Human-readable duration, e.g. `1 hour, 2 minutes, and 3.400 seconds`.
#[must_use]
pub fn describe_interval(elapsed: Duration) -> String {
    let mut seconds = elapsed.as_secs_f64();
    let mut parts: Vec<String> = Vec::new();
    for (length, unit) in [(86_400u64, "day"), (3_600, "hour"), (60, "minute")] {
        let num = (seconds as u64) / length;
        if num > 0 {
            parts.push(if num > 1 {
                format!("{num} {unit}s")
            } else {
                format!("{num} {unit}")
            });
        }
        seconds %= length as f64;
    }
    let tail = format!("{seconds:.3} seconds");
    match parts.len() {
        0 => tail,
        1 => format!("{} and {tail}", parts[0]),
        _ => format!("{}, and {tail}", parts.join(", ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringcopy::cql::{ColumnMeta, CqlType};

    #[test]
    fn interval_description() {
        assert_eq!(describe_interval(Duration::from_millis(1500)), "1.500 seconds");
        assert_eq!(
            describe_interval(Duration::from_secs(3_600 + 120 + 3)),
            "1 hour, 2 minutes, and 3.000 seconds"
        );
        assert_eq!(
            describe_interval(Duration::from_secs(2 * 86_400)),
            "2 days and 0.000 seconds"
        );
    }

    #[test]
    fn column_resolution() {
        let table = TableMeta {
            keyspace: "ks".into(),
            table: "t".into(),
            columns: vec![
                ColumnMeta { name: "a".into(), cql_type: CqlType::Int },
                ColumnMeta { name: "b".into(), cql_type: CqlType::Text },
            ],
            partition_key: vec!["a".into()],
            primary_key: vec!["a".into()],
        };
        assert_eq!(resolve_columns(&[], &table).unwrap(), vec!["a", "b"]);
        assert_eq!(
            resolve_columns(&["b".to_owned()], &table).unwrap(),
            vec!["b"]
        );
    }

    #[test]
    fn single_unit_reads_naturally() {
        assert_eq!(
            describe_interval(Duration::from_secs(61)),
            "1 minute and 1.000 seconds"
        );
    }
}
