//! Export coordination: token-range generation, dispatch, retry
//! bookkeeping and writing results to the destination.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use ringcopy::channel::{FanIn, PipeSender, fan_in, pipe};
use ringcopy::cql::HostAddr;
use ringcopy::driver::{ClusterDriver, ClusterMetadata};
use ringcopy::options::CopyOptions;
use ringcopy::rate::RateMeter;
use ringcopy::ring::TokenRange;
use tokio::task::JoinHandle;

use crate::messages::{ExportMsg, ExportWork, RangeAssignment};
use crate::writer::{ExportDest, ExportWriter};
use crate::{describe_interval, resolve_columns};
use crate::export_worker::ExportWorker;

/// Mutable per-range bookkeeping, owned by the coordinator.
#[derive(Debug, Clone)]
struct RangeState {
    hosts: Vec<HostAddr>,
    attempts: u32,
    rows: u64,
}

/// The outcome of an export run.
#[derive(Debug)]
pub struct ExportSummary {
    pub exported_rows: u64,
    pub num_files: usize,
    pub ranges_total: usize,
    pub ranges_failed: usize,
    pub worker_died: bool,
    pub elapsed: Duration,
}

impl ExportSummary {
    /// Full success: every range exported, every worker alive at the end.
    #[must_use]
    pub fn ok(&self) -> bool {
        !self.worker_died && self.ranges_failed == 0
    }

    /// Process exit code for the host shell.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.ok())
    }
}

/// A table-to-CSV export run.
pub struct ExportTask {
    cluster: Arc<dyn ClusterDriver>,
    keyspace: String,
    table: String,
    columns: Vec<String>,
    options: CopyOptions,
    dest: ExportDest,
}

impl ExportTask {
    /// Configure an export of `keyspace.table`; an empty column list
    /// means every column.
    pub fn new(
        cluster: Arc<dyn ClusterDriver>,
        keyspace: &str,
        table: &str,
        columns: Vec<String>,
        options: CopyOptions,
        dest: ExportDest,
    ) -> Self {
        Self {
            cluster,
            keyspace: keyspace.to_owned(),
            table: table.to_owned(),
            columns,
            options,
            dest,
        }
    }

    /// Run the export to completion.
    ///
    /// # Errors
    ///
    /// Fails on unrecognized options, a bad token window, schema lookup
    /// failures or destination I/O errors. Per-range failures do not
    /// error; they are reported in the summary.
    pub async fn run(mut self) -> Result<ExportSummary> {
        let started = Instant::now();
        if !self.options.unrecognized.is_empty() {
            let keys: Vec<&str> =
                self.options.unrecognized.keys().map(String::as_str).collect();
            bail!("Unrecognized COPY TO options: {}", keys.join(", "));
        }

        let meta = self.cluster.metadata();
        let table_meta = self.cluster.table_meta(&self.keyspace, &self.table)?;
        self.columns = resolve_columns(&self.columns, &table_meta)?;
        for name in &self.columns {
            if table_meta.column(name).is_none() {
                bail!("unknown column {name:?} in {}.{}", self.keyspace, self.table);
            }
        }

        let mut ranges = compute_ranges(&meta, &self.options)?;
        let total = ranges.len();
        if total == 0 {
            bail!(
                "found no ranges to query, check begin and end tokens: {:?} - {:?}",
                self.options.copy.begin_token,
                self.options.copy.end_token
            );
        }

        let mut writer = ExportWriter::new(self.dest.clone(), &self.columns, &self.options);
        writer.open()?;

        tracing::info!(
            table = %format!("{}.{}", self.keyspace, self.table),
            columns = ?self.columns,
            ranges = total,
            workers = self.options.copy.num_processes,
            "starting export"
        );

        let num_workers = self.options.copy.num_processes;
        let mut results: FanIn<ExportMsg> = fan_in();
        let mut work_channels: Vec<PipeSender<ExportWork>> = Vec::with_capacity(num_workers);
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let (tx, rx) = pipe();
            let worker = ExportWorker::new(
                Arc::clone(&self.cluster),
                self.keyspace.clone(),
                self.table.clone(),
                self.columns.clone(),
                table_meta.partition_key.clone(),
                self.options.copy.clone(),
                self.options.dialect,
                rx,
                results.sender(),
            );
            handles.push(tokio::spawn(worker.run()));
            work_channels.push(tx);
        }

        let mut meter = RateMeter::new(
            self.options.copy.report_frequency,
            true,
            self.options.copy.rate_file.clone(),
        )?;
        let max_attempts = self.options.copy.max_attempts;

        let keys: Vec<TokenRange> = ranges.keys().copied().collect();
        send_work(&work_channels, &mut ranges, &keys);

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        while succeeded + failed < total && handles.iter().all(|h| !h.is_finished()) {
            for msg in results.recv_timeout(Duration::from_millis(100)).await {
                match msg {
                    ExportMsg::RangeFinished => succeeded += 1,
                    ExportMsg::Page { range, data, rows } => {
                        writer.write(&data, rows)?;
                        meter.increment(rows);
                        if let Some(state) = ranges.get_mut(&range) {
                            state.rows += rows;
                        }
                    }
                    ExportMsg::RangeFailed { range, error } => {
                        let Some(state) = ranges.get(&range) else {
                            tracing::error!(range = %range, error, "result for unknown range");
                            continue;
                        };
                        if state.attempts < max_attempts && state.rows == 0 {
                            tracing::warn!(
                                range = %range,
                                error,
                                attempt = state.attempts,
                                max_attempts,
                                "range failed, will retry"
                            );
                            send_work(&work_channels, &mut ranges, &[range]);
                        } else {
                            tracing::error!(
                                range = %range,
                                error,
                                rows = state.rows,
                                attempts = state.attempts,
                                "range failed permanently"
                            );
                            failed += 1;
                        }
                    }
                    ExportMsg::WorkerFailed { error } => {
                        tracing::error!(error, "error from export worker");
                    }
                }
            }
        }

        let worker_died = handles.iter().any(JoinHandle::is_finished);
        if worker_died {
            tracing::error!("an export worker died, aborting");
        }
        if succeeded < total {
            tracing::error!(
                exported = succeeded,
                total,
                "some ranges were not exported, records may be missing"
            );
        }

        for tx in &work_channels {
            let _ = tx.send(ExportWork::Shutdown);
        }
        drop(work_channels);
        for handle in handles {
            let _ = handle.await;
        }

        let exported_rows = meter.finish();
        writer.close()?;
        let elapsed = started.elapsed();
        tracing::info!(
            rows = exported_rows,
            files = writer.num_files,
            took = %describe_interval(elapsed),
            "export finished"
        );

        Ok(ExportSummary {
            exported_rows,
            num_files: writer.num_files,
            ranges_total: total,
            ranges_failed: failed,
            worker_died,
            elapsed,
        })
    }
}

/// Round-robin the given ranges over the worker channels, bumping each
/// range's attempt count.
fn send_work(
    channels: &[PipeSender<ExportWork>],
    ranges: &mut BTreeMap<TokenRange, RangeState>,
    to_send: &[TokenRange],
) {
    let mut i = 0usize;
    for range in to_send {
        let Some(state) = ranges.get_mut(range) else {
            continue;
        };
        state.attempts += 1;
        let assignment = RangeAssignment {
            range: *range,
            hosts: state.hosts.clone(),
            attempts: state.attempts,
        };
        let _ = channels[i].send(ExportWork::Range(assignment));
        i = if i + 1 < channels.len() { i + 1 } else { 0 };
    }
}

/// Generate the token ranges to export and their candidate replicas.
///
/// Walks the sorted ring, skipping the partitioner's minimum token,
/// intersecting each `(prev, curr]` slice with the caller's token window;
/// the wrap-around slice reuses the first slot's replicas. Without token
/// metadata everything collapses to a single range at the contact host.
fn compute_ranges(
    meta: &ClusterMetadata,
    options: &CopyOptions,
) -> Result<BTreeMap<TokenRange, RangeState>> {
    let begin_token = options.copy.begin_token;
    let end_token = options.copy.end_token;
    let min_token = meta.partitioner.min_token();
    let mut ranges = BTreeMap::new();

    let range_state = |replicas: Option<&[HostAddr]>| -> RangeState {
        let mut hosts: Vec<HostAddr> = replicas
            .unwrap_or_default()
            .iter()
            .filter(|r| {
                meta.hosts
                    .get(*r)
                    .is_some_and(|h| h.is_up && h.datacenter == meta.local_dc)
            })
            .cloned()
            .collect();
        if hosts.is_empty() {
            // fall back to the contact host when no local replica is up
            hosts.push(meta.contact_point.clone());
        }
        RangeState { hosts, attempts: 0, rows: 0 }
    };

    if let (Some(begin), Some(min)) = (begin_token, min_token) {
        if begin < min {
            bail!("begin token {begin} must be bigger or equal to min token {min}");
        }
    }
    if let (Some(begin), Some(end)) = (begin_token, end_token) {
        if begin > end {
            bail!("begin token {begin} must be smaller than end token {end}");
        }
    }

    let whole_window = TokenRange { begin: begin_token, end: end_token };
    if meta.ring.is_empty() || min_token.is_none() {
        ranges.insert(whole_window, range_state(None));
        return Ok(ranges);
    }
    if meta.ring.len() == 1 {
        ranges.insert(whole_window, range_state(Some(&meta.ring[0].1)));
        return Ok(ranges);
    }

    let intersect = |prev: Option<i64>, curr: i64| -> Option<TokenRange> {
        let mut lo = prev;
        let mut hi = curr;
        if let Some(begin) = begin_token {
            if hi < begin {
                return None;
            }
            if lo.is_none_or(|l| l < begin) {
                lo = Some(begin);
            }
        }
        if let Some(end) = end_token {
            if lo.is_some_and(|l| l > end) {
                return None;
            }
            if hi > end {
                hi = end;
            }
        }
        Some(TokenRange { begin: lo, end: Some(hi) })
    };

    let first_slot_state = range_state(Some(&meta.ring[0].1));
    let mut previous: Option<i64> = None;
    for (token, replicas) in &meta.ring {
        if Some(*token) == min_token {
            continue;
        }
        let Some(current) = intersect(previous, *token) else {
            continue;
        };
        ranges.insert(current, range_state(Some(replicas)));
        previous = Some(*token);
    }

    // The wrap-around slice is owned by the first slot's replicas.
    if let Some(prev) = previous {
        if end_token.is_none_or(|end| prev < end) {
            ranges.insert(TokenRange { begin: Some(prev), end: end_token }, first_slot_state);
        }
    }

    Ok(ranges)
}
