//! Per-run copy options: operation tuning, CSV dialect and leftovers.
//!
//! Options arrive as a flat string map (the host shell merges its config
//! overlay and command line first) and are parsed once into typed,
//! read-only settings. Keys nobody recognizes are kept aside so the
//! coordinator can reject the run with their names.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::driver::ConsistencyLevel;

/// Copy direction; `To` exports, `From` imports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    To,
    From,
}

impl Direction {
    /// The word used in config overlay section names.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::To => "to",
            Direction::From => "from",
        }
    }
}

/// An option value failed validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("invalid value {value:?} for option {key}")]
    BadValue { key: &'static str, value: String },
    #[error("boolean styles must be two distinct non-empty strings, got {0:?}")]
    BadBoolStyle(String),
    #[error("dialect option {key} must be a single character, got {value:?}")]
    BadDialectChar { key: &'static str, value: String },
    #[error("unsupported encoding {0:?}, this engine is UTF-8 native")]
    BadEncoding(String),
}

/// CSV dialect shared by import parsing, export writing and the error
/// file. When quote and escape collide the dialect switches to
/// double-quote mode and drops the escape character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    pub delimiter: u8,
    pub quote: u8,
    pub escape: Option<u8>,
    pub double_quote: bool,
}

impl Default for Dialect {
    fn default() -> Self {
        Self { delimiter: b',', quote: b'"', escape: Some(b'\\'), double_quote: false }
    }
}

/// Operation tuning, fully defaulted; see each field's option name.
#[derive(Debug, Clone)]
pub struct CopySettings {
    /// `null` (or `nullval`): the sentinel standing for SQL-null.
    pub nullval: String,
    /// `header`: emit or skip a header row.
    pub header: bool,
    /// `maxrequests`: max in-flight requests per export worker.
    pub max_requests: usize,
    /// `pagesize`: rows per result page on export.
    pub page_size: usize,
    /// `pagetimeout`: per-page timeout; defaults to 10 s per 1000 rows of
    /// page size, floored at 10 s.
    pub page_timeout: Duration,
    /// `maxattempts`: attempt budget for ranges, batches and backoff.
    pub max_attempts: u32,
    /// `datetimeformat`: strftime pattern for timestamps.
    pub datetime_format: String,
    /// `chunksize`: rows per chunk handed to an import worker.
    pub chunk_size: usize,
    /// `ingestrate`: rows per second the feeder may dispatch.
    pub ingest_rate: u64,
    /// `maxbatchsize` / `minbatchsize`: replica batch slicing bounds.
    pub max_batch_size: usize,
    pub min_batch_size: usize,
    /// `reportfrequency`: rate-meter window.
    pub report_frequency: Duration,
    /// `consistencylevel`: write/read consistency.
    pub consistency_level: ConsistencyLevel,
    /// `decimalsep` / `thousandssep`: numeric separators.
    pub decimal_sep: char,
    pub thousands_sep: Option<char>,
    /// `boolstyle`: the true and false spellings, in that order.
    pub bool_style: (String, String),
    /// `numprocesses`: worker count (the feeder comes on top on import).
    pub num_processes: usize,
    /// `begintoken` / `endtoken`: optional export token window.
    pub begin_token: Option<i64>,
    pub end_token: Option<i64>,
    /// `maxrows`: import row cap, `-1` for unbounded.
    pub max_rows: i64,
    /// `skiprows`: rows skipped at the start of the input.
    pub skip_rows: u64,
    /// `skipcols`: column names dropped on import.
    pub skip_cols: Vec<String>,
    /// `maxparseerrors` / `maxinserterrors`: error budgets, `-1` unbounded.
    pub max_parse_errors: i64,
    pub max_insert_errors: i64,
    /// `errfile`: failed-row destination.
    pub err_file: PathBuf,
    /// `ratefile`: optional rate log destination.
    pub rate_file: Option<PathBuf>,
    /// `maxoutputsize`: rows per export file, `-1` for a single file.
    pub max_output_size: i64,
    /// `preparedstatements`: bind values instead of inlining literals.
    pub prepared_statements: bool,
}

/// The per-run option record: tuning, dialect and unrecognized leftovers.
#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub copy: CopySettings,
    pub dialect: Dialect,
    pub unrecognized: BTreeMap<String, String>,
}

impl CopyOptions {
    /// Parse a merged option map for a run against `ks.table`.
    ///
    /// Every value except the file-path options has its backslash escape
    /// sequences decoded first.
    ///
    /// # Errors
    ///
    /// Returns an [`OptionsError`] for malformed or out-of-range values.
    pub fn parse(
        opts: &BTreeMap<String, String>,
        keyspace: &str,
        table: &str,
    ) -> Result<Self, OptionsError> {
        let mut opts = clean_options(opts);

        let quote = pop_dialect_char(&mut opts, "quote", b'"')?;
        let escape = pop_dialect_char(&mut opts, "escape", b'\\')?;
        let delimiter = pop_dialect_char(&mut opts, "delimiter", b',')?;
        let dialect = if quote == escape {
            Dialect { delimiter, quote, escape: None, double_quote: true }
        } else {
            Dialect { delimiter, quote, escape: Some(escape), double_quote: false }
        };

        let nullval = opts
            .remove("nullval")
            .or_else(|| opts.remove("null"))
            .unwrap_or_default();
        let header = pop_bool(&mut opts, "header", false)?;
        let encoding = opts.remove("encoding").unwrap_or_else(|| "utf8".to_owned());
        if !matches!(encoding.to_ascii_lowercase().as_str(), "utf8" | "utf-8") {
            return Err(OptionsError::BadEncoding(encoding));
        }
        let max_requests = pop_parse(&mut opts, "maxrequests", 6usize)?;
        let page_size = pop_parse(&mut opts, "pagesize", 1000usize)?;
        let default_page_timeout = 10.max(10 * (page_size as u64) / 1000);
        let page_timeout =
            Duration::from_secs(pop_parse(&mut opts, "pagetimeout", default_page_timeout)?);
        let max_attempts = pop_parse(&mut opts, "maxattempts", 5u32)?;
        let datetime_format = opts
            .remove("datetimeformat")
            .unwrap_or_else(|| "%Y-%m-%d %H:%M:%S%z".to_owned());
        let chunk_size = pop_parse(&mut opts, "chunksize", 5000usize)?;
        let ingest_rate = pop_parse(&mut opts, "ingestrate", 200_000u64)?;
        let max_batch_size = pop_parse(&mut opts, "maxbatchsize", 20usize)?;
        let min_batch_size = pop_parse(&mut opts, "minbatchsize", 10usize)?;
        let report_frequency =
            Duration::from_secs_f64(pop_parse(&mut opts, "reportfrequency", 0.25f64)?);
        let consistency_level = match opts.remove("consistencylevel") {
            Some(v) => v
                .parse()
                .map_err(|_| OptionsError::BadValue { key: "consistencylevel", value: v })?,
            None => ConsistencyLevel::One,
        };
        let decimal_sep = pop_single_char(&mut opts, "decimalsep", '.')?;
        let thousands_sep = match opts.remove("thousandssep") {
            None => None,
            Some(v) if v.is_empty() => None,
            Some(v) => {
                let mut chars = v.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Some(c),
                    _ => {
                        return Err(OptionsError::BadValue { key: "thousandssep", value: v });
                    }
                }
            }
        };
        let bool_style = parse_bool_style(
            &opts.remove("boolstyle").unwrap_or_else(|| "True, False".to_owned()),
        )?;
        let num_processes =
            pop_parse(&mut opts, "numprocesses", default_num_processes())?;
        let begin_token = pop_optional_token(&mut opts, "begintoken")?;
        let end_token = pop_optional_token(&mut opts, "endtoken")?;
        let max_rows = pop_parse(&mut opts, "maxrows", -1i64)?;
        let skip_rows = pop_parse(&mut opts, "skiprows", 0u64)?;
        let skip_cols = opts
            .remove("skipcols")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        let max_parse_errors = pop_parse(&mut opts, "maxparseerrors", -1i64)?;
        let max_insert_errors = pop_parse(&mut opts, "maxinserterrors", -1i64)?;
        let err_file = PathBuf::from(
            opts.remove("errfile")
                .unwrap_or_else(|| format!("import_{keyspace}_{table}.err")),
        );
        let rate_file = opts.remove("ratefile").filter(|v| !v.is_empty()).map(PathBuf::from);
        let max_output_size = pop_parse(&mut opts, "maxoutputsize", -1i64)?;
        let prepared_statements = pop_bool(&mut opts, "preparedstatements", true)?;

        Ok(Self {
            copy: CopySettings {
                nullval,
                header,
                max_requests,
                page_size,
                page_timeout,
                max_attempts,
                datetime_format,
                chunk_size,
                ingest_rate,
                max_batch_size,
                min_batch_size,
                report_frequency,
                consistency_level,
                decimal_sep,
                thousands_sep,
                bool_style,
                num_processes,
                begin_token,
                end_token,
                max_rows,
                skip_rows,
                skip_cols,
                max_parse_errors,
                max_insert_errors,
                err_file,
                rate_file,
                max_output_size,
                prepared_statements,
            },
            dialect,
            unrecognized: opts,
        })
    }
}

/// One worker per core, keeping a core free for the coordinator.
fn default_num_processes() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

/// Decode backslash escapes everywhere except the file-path options, whose
/// values are taken verbatim.
fn clean_options(opts: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    opts.iter()
        .map(|(k, v)| {
            let key = k.to_ascii_lowercase();
            let value =
                if key == "errfile" || key == "ratefile" { v.clone() } else { unescape(v) };
            (key, value)
        })
        .collect()
}

/// Decode the standard backslash escape sequences; unknown escapes keep
/// the backslash.
#[must_use]
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn parse_bool_style(v: &str) -> Result<(String, String), OptionsError> {
    let parts: Vec<&str> = v.split(',').map(str::trim).collect();
    match parts.as_slice() {
        [t, f] if !t.is_empty() && !f.is_empty() && t != f => {
            Ok(((*t).to_owned(), (*f).to_owned()))
        }
        _ => Err(OptionsError::BadBoolStyle(v.to_owned())),
    }
}

fn pop_parse<T: std::str::FromStr>(
    opts: &mut BTreeMap<String, String>,
    key: &'static str,
    default: T,
) -> Result<T, OptionsError> {
    match opts.remove(key) {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|_| OptionsError::BadValue { key, value: v }),
    }
}

fn pop_bool(
    opts: &mut BTreeMap<String, String>,
    key: &'static str,
    default: bool,
) -> Result<bool, OptionsError> {
    match opts.remove(key) {
        None => Ok(default),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(OptionsError::BadValue { key, value: v }),
        },
    }
}

fn pop_dialect_char(
    opts: &mut BTreeMap<String, String>,
    key: &'static str,
    default: u8,
) -> Result<u8, OptionsError> {
    match opts.remove(key) {
        None => Ok(default),
        Some(v) => match v.as_bytes() {
            [b] => Ok(*b),
            _ => Err(OptionsError::BadDialectChar { key, value: v }),
        },
    }
}

fn pop_single_char(
    opts: &mut BTreeMap<String, String>,
    key: &'static str,
    default: char,
) -> Result<char, OptionsError> {
    match opts.remove(key) {
        None => Ok(default),
        Some(v) => {
            let mut chars = v.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(c),
                _ => Err(OptionsError::BadValue { key, value: v }),
            }
        }
    }
}

fn pop_optional_token(
    opts: &mut BTreeMap<String, String>,
    key: &'static str,
) -> Result<Option<i64>, OptionsError> {
    match opts.remove(key) {
        None => Ok(None),
        Some(v) if v.is_empty() => Ok(None),
        Some(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| OptionsError::BadValue { key, value: v }),
    }
}
