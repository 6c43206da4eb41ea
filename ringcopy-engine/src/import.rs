//! Import coordination: spawns the feeder and workers, aggregates
//! progress and errors, owns the error file.

use std::fs::OpenOptions;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result, bail};
use ringcopy::channel::{FanIn, PipeSender, fan_in, pipe};
use ringcopy::driver::ClusterDriver;
use ringcopy::options::{CopyOptions, Dialect};
use ringcopy::rate::RateMeter;
use tokio::task::JoinHandle;

use crate::feeder::{Feeder, FeederInput};
use crate::import_worker::ImportWorker;
use crate::messages::{ChunkBound, FeedingSummary, ImportMsg, PipeMsg, TaskError};
use crate::{describe_interval, resolve_columns};

/// Where import rows come from.
pub enum ImportSource {
    /// Comma-separated glob patterns.
    Files(String),
    /// The host's standard input; rows end at `\.` on a line by itself.
    Stdin(Box<dyn BufRead + Send>),
}

/// The outcome of an import run.
#[derive(Debug)]
pub struct ImportSummary {
    /// Rows accounted for by the workers, including rows that ended in
    /// the error file.
    pub received_rows: u64,
    /// Rows the feeder handed to workers.
    pub sent_rows: u64,
    pub num_sources: u64,
    pub skipped_rows: u64,
    pub parse_errors: u64,
    pub insert_errors: u64,
    /// Rows persisted to the error file.
    pub failed_rows: u64,
    pub err_file: PathBuf,
    pub child_died: bool,
    pub limit_exceeded: bool,
    pub elapsed: Duration,
}

impl ImportSummary {
    /// Full success: every row delivered, no failed rows, all children
    /// alive until shutdown.
    #[must_use]
    pub fn ok(&self) -> bool {
        !self.child_died
            && !self.limit_exceeded
            && self.failed_rows == 0
            && self.received_rows == self.sent_rows
    }

    /// Process exit code for the host shell.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.ok())
    }
}

/// Error-file bookkeeping and the maximum-errors guard. Only the
/// coordinator writes the error file.
struct ImportErrorHandler {
    err_file: PathBuf,
    dialect: Dialect,
    max_attempts: u32,
    max_parse_errors: i64,
    max_insert_errors: i64,
    parse_errors: u64,
    insert_errors: u64,
    num_rows_failed: u64,
}

impl ImportErrorHandler {
    /// Rotate any pre-existing error file aside with a timestamp suffix.
    fn new(options: &CopyOptions) -> Result<Self> {
        let err_file = options.copy.err_file.clone();
        if err_file.is_file() {
            let mut rotated = err_file.as_os_str().to_owned();
            rotated.push(chrono::Local::now().format(".%Y%m%d_%H%M%S").to_string());
            let rotated = PathBuf::from(rotated);
            tracing::info!(
                from = %err_file.display(),
                to = %rotated.display(),
                "renaming existing error file"
            );
            std::fs::rename(&err_file, &rotated)
                .with_context(|| format!("rotating {}", err_file.display()))?;
        }
        Ok(Self {
            err_file,
            dialect: options.dialect,
            max_attempts: options.copy.max_attempts,
            max_parse_errors: options.copy.max_parse_errors,
            max_insert_errors: options.copy.max_insert_errors,
            parse_errors: 0,
            insert_errors: 0,
            num_rows_failed: 0,
        })
    }

    fn max_exceeded(&self) -> bool {
        if self.max_insert_errors >= 0 && self.insert_errors > self.max_insert_errors as u64 {
            tracing::error!(
                max = self.max_insert_errors,
                "exceeded maximum number of insert errors"
            );
            return true;
        }
        if self.max_parse_errors >= 0 && self.parse_errors > self.max_parse_errors as u64 {
            tracing::error!(
                max = self.max_parse_errors,
                "exceeded maximum number of parse errors"
            );
            return true;
        }
        false
    }

    /// Append failed rows to the error file in the input dialect.
    fn add_failed_rows(&mut self, rows: &[Vec<String>]) -> Result<()> {
        self.num_rows_failed += rows.len() as u64;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.err_file)
            .with_context(|| format!("opening {}", self.err_file.display()))?;
        let mut builder = csv::WriterBuilder::new();
        builder
            .delimiter(self.dialect.delimiter)
            .quote(self.dialect.quote)
            .double_quote(self.dialect.double_quote);
        if let Some(escape) = self.dialect.escape {
            builder.escape(escape);
        }
        let mut w = builder.from_writer(file);
        for row in rows {
            w.write_record(row)?;
        }
        w.flush()?;
        Ok(())
    }

    /// Classify and account one error report; parse errors and final
    /// insert errors land in the error file.
    fn handle_error(&mut self, err: &TaskError) -> Result<()> {
        if err.is_parse_error() {
            self.parse_errors += err.rows.len() as u64;
            self.add_failed_rows(&err.rows)?;
            tracing::error!(
                rows = err.rows.len(),
                name = %err.name,
                msg = %err.msg,
                "failed to import rows, given up without retries"
            );
        } else {
            self.insert_errors += err.rows.len() as u64;
            if err.is_final {
                self.add_failed_rows(&err.rows)?;
                tracing::error!(
                    rows = err.rows.len(),
                    name = %err.name,
                    msg = %err.msg,
                    attempts = err.attempts,
                    "failed to import rows, given up"
                );
            } else {
                tracing::warn!(
                    rows = err.rows.len(),
                    name = %err.name,
                    msg = %err.msg,
                    attempt = err.attempts,
                    max_attempts = self.max_attempts,
                    "failed to import rows, will retry"
                );
            }
        }
        Ok(())
    }
}

/// A CSV-to-table import run.
pub struct ImportTask {
    cluster: Arc<dyn ClusterDriver>,
    keyspace: String,
    table: String,
    columns: Vec<String>,
    options: CopyOptions,
    source: ImportSource,
}

impl ImportTask {
    /// Configure an import into `keyspace.table`; an empty column list
    /// means every column.
    pub fn new(
        cluster: Arc<dyn ClusterDriver>,
        keyspace: &str,
        table: &str,
        columns: Vec<String>,
        options: CopyOptions,
        source: ImportSource,
    ) -> Self {
        Self {
            cluster,
            keyspace: keyspace.to_owned(),
            table: table.to_owned(),
            columns,
            options,
            source,
        }
    }

    /// Run the import to completion.
    ///
    /// # Errors
    ///
    /// Fails on unrecognized options, missing primary-key columns,
    /// error-file I/O problems or schema lookup failures. Row-level
    /// failures do not error; they are reported in the summary.
    pub async fn run(mut self) -> Result<ImportSummary> {
        let started = Instant::now();
        if !self.options.unrecognized.is_empty() {
            let keys: Vec<&str> =
                self.options.unrecognized.keys().map(String::as_str).collect();
            bail!("Unrecognized COPY FROM options: {}", keys.join(", "));
        }

        let table_meta = self.cluster.table_meta(&self.keyspace, &self.table)?;
        let columns = resolve_columns(&self.columns, &table_meta)?;
        let skip_cols = &self.options.copy.skip_cols;
        let valid_columns: Vec<String> =
            columns.iter().filter(|c| !skip_cols.contains(c)).cloned().collect();
        let skip_indexes: Vec<usize> = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| skip_cols.contains(c))
            .map(|(i, _)| i)
            .collect();
        if valid_columns.is_empty() {
            bail!("no column specified");
        }
        for pk in &table_meta.primary_key {
            if !valid_columns.contains(pk) {
                bail!("primary key column '{pk}' missing or skipped");
            }
        }

        let mut handler = ImportErrorHandler::new(&self.options)?;

        tracing::info!(
            table = %format!("{}.{}", self.keyspace, self.table),
            columns = ?valid_columns,
            workers = self.options.copy.num_processes,
            "starting import"
        );

        let num_workers = self.options.copy.num_processes;
        let mut results: FanIn<ImportMsg> = fan_in();
        let mut worker_channels: Vec<PipeSender<ChunkBound>> = Vec::with_capacity(num_workers);
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(num_workers + 1);
        for _ in 0..num_workers {
            let (tx, rx) = pipe();
            let worker = ImportWorker::new(
                Arc::clone(&self.cluster),
                self.keyspace.clone(),
                self.table.clone(),
                valid_columns.clone(),
                skip_indexes.clone(),
                self.options.copy.clone(),
                self.options.dialect,
                rx,
                results.sender(),
            );
            handles.push(tokio::spawn(worker.run()));
            worker_channels.push(tx);
        }

        let (feeder_tx, feeder_rx) = pipe();
        let feeder_input = match &self.source {
            ImportSource::Files(pattern) => FeederInput::Files(pattern.clone()),
            ImportSource::Stdin(_) => FeederInput::Pipe,
        };
        let feeder = Feeder::new(
            feeder_input,
            self.options.copy.clone(),
            feeder_rx,
            results.sender(),
            worker_channels.clone(),
        );
        handles.push(tokio::spawn(feeder.run()));

        // Stdin is drained before the progress loop; reporting starts
        // once input is fully consumed.
        if let ImportSource::Stdin(reader) = &mut self.source {
            tracing::info!(r"use \. on a line by itself to end input");
            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).context("reading stdin")? == 0 {
                    break;
                }
                let row = line.trim_end_matches(['\n', '\r']);
                if row == r"\." {
                    break;
                }
                let _ = feeder_tx.send(PipeMsg::Row(row.to_owned()));
            }
            let _ = feeder_tx.send(PipeMsg::Eof);
        }

        let mut meter = RateMeter::new(
            self.options.copy.report_frequency,
            true,
            self.options.copy.rate_file.clone(),
        )?;

        let mut feeding: Option<FeedingSummary> = None;
        let mut child_died = false;
        let mut limit_exceeded = false;
        loop {
            if let Some(summary) = feeding {
                if meter.grand_total() >= summary.sent {
                    break;
                }
            }
            for msg in results.recv_timeout(Duration::from_millis(100)).await {
                match msg {
                    ImportMsg::Progress(imported) => meter.increment(imported),
                    ImportMsg::Error(err) => handler.handle_error(&err)?,
                    ImportMsg::FeederDone(summary) => feeding = Some(summary),
                }
            }
            if handler.max_exceeded() {
                limit_exceeded = true;
                break;
            }
            if handles.iter().any(JoinHandle::is_finished) {
                child_died = true;
                tracing::error!("a child task died unexpectedly, aborting");
                break;
            }
        }

        if handler.num_rows_failed > 0 {
            tracing::error!(
                rows = handler.num_rows_failed,
                err_file = %handler.err_file.display(),
                "failed rows written to the error file"
            );
        }

        let _ = feeder_tx.send(PipeMsg::Shutdown);
        for tx in &worker_channels {
            let _ = tx.send(ChunkBound::Shutdown);
        }
        drop(worker_channels);
        for handle in handles {
            let _ = handle.await;
        }

        let received_rows = meter.finish();
        let elapsed = started.elapsed();
        let summary = ImportSummary {
            received_rows,
            sent_rows: feeding.map_or(0, |s| s.sent),
            num_sources: feeding.map_or(0, |s| s.num_sources),
            skipped_rows: feeding.map_or(0, |s| s.skip_rows),
            parse_errors: handler.parse_errors,
            insert_errors: handler.insert_errors,
            failed_rows: handler.num_rows_failed,
            err_file: handler.err_file,
            child_died,
            limit_exceeded,
            elapsed,
        };
        tracing::info!(
            rows = summary.received_rows,
            sources = summary.num_sources,
            skipped = summary.skipped_rows,
            took = %describe_interval(summary.elapsed),
            "import finished"
        );
        Ok(summary)
    }
}
