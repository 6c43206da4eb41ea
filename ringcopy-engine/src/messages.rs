//! Typed messages flowing between the coordinator and its children.
//!
//! Every child-bound channel understands `Shutdown` as the poison pill:
//! drain and exit within one receive quantum.

use ringcopy::cql::HostAddr;
use ringcopy::error::is_parse_error_tag;
use ringcopy::ring::TokenRange;

/// Work dispatched to an export worker.
#[derive(Debug)]
pub(crate) enum ExportWork {
    Range(RangeAssignment),
    Shutdown,
}

/// One token range to scan, with its candidate replicas.
#[derive(Debug, Clone)]
pub(crate) struct RangeAssignment {
    pub range: TokenRange,
    pub hosts: Vec<HostAddr>,
    pub attempts: u32,
}

/// Results and errors coming back from export workers.
#[derive(Debug)]
pub(crate) enum ExportMsg {
    /// A range ran to completion.
    RangeFinished,
    /// One page of CSV data for a range.
    Page { range: TokenRange, data: String, rows: u64 },
    /// The range failed; the coordinator decides whether to retry.
    RangeFailed { range: TokenRange, error: String },
    /// The worker itself is broken.
    WorkerFailed { error: String },
}

/// A bundle of raw CSV lines on its way to an import worker.
#[derive(Debug)]
pub(crate) struct Chunk {
    pub id: u64,
    pub rows: Vec<String>,
    pub attempts: u32,
}

/// Work dispatched to an import worker.
#[derive(Debug)]
pub(crate) enum ChunkBound {
    Chunk(Chunk),
    Shutdown,
}

/// Coordinator-bound rows for the feeder's pipe reader, plus the pill.
#[derive(Debug)]
pub(crate) enum PipeMsg {
    Row(String),
    Eof,
    Shutdown,
}

/// An error report from the feeder or an import worker.
#[derive(Debug, Clone)]
pub(crate) struct TaskError {
    /// Taxonomy tag, e.g. `ParseError` or `WriteTimeout`.
    pub name: String,
    pub msg: String,
    /// The offending rows, rendered for the error file.
    pub rows: Vec<Vec<String>>,
    pub attempts: u32,
    /// Set when no further retry will happen for these rows.
    pub is_final: bool,
}

impl TaskError {
    pub(crate) fn new(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self { name: name.into(), msg: msg.into(), rows: Vec::new(), attempts: 1, is_final: true }
    }

    pub(crate) fn with_rows(
        name: impl Into<String>,
        msg: impl Into<String>,
        rows: Vec<Vec<String>>,
    ) -> Self {
        Self { name: name.into(), msg: msg.into(), rows, attempts: 1, is_final: true }
    }

    /// Parse-class errors are never retried and count against
    /// `maxparseerrors`.
    pub(crate) fn is_parse_error(&self) -> bool {
        is_parse_error_tag(&self.name)
    }
}

/// The feeder's account of a finished feeding run.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FeedingSummary {
    /// Rows handed to workers.
    pub sent: u64,
    /// Input files actually opened.
    pub num_sources: u64,
    /// Rows skipped per the `skiprows` option.
    pub skip_rows: u64,
}

/// Progress and errors aggregated by the import coordinator.
#[derive(Debug)]
pub(crate) enum ImportMsg {
    /// A chunk completed; the payload is its full row count.
    Progress(u64),
    Error(TaskError),
    FeederDone(FeedingSummary),
}
