//! Per-column conversion between CSV fields and native values.
//!
//! Import builds a fixed table of per-column parser closures indexed like
//! the row, so the hot loop is a plain walk; collection literals are split
//! on top-level separators honoring nesting and single quotes. Export is
//! the inverse: native values to canonical field strings.

use std::borrow::Cow;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::format::{Item, StrftimeItems};
use chrono::{
    DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone as _,
    Timelike as _, Utc,
};
use num_bigint::BigInt;
use regex::Regex;
use uuid::Uuid;

use crate::cql::{CqlType, TableMeta, Value, protect_value, serialize_partition_key};
use crate::error::ParseError;
use crate::options::CopySettings;

/// Matches the CQL date-time literal shapes: date, optional time, optional
/// numeric offset.
const TIMESTAMP_PATTERN: &str = r"^(\d{4})-(\d{2})-(\d{2})[ T]?(?:(\d{2}):(\d{2})(?::(\d{2}))?)?(?:([+-])(\d{2}):?(\d{2}))?$";

const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%z";

/// Shared conversion settings, referenced by every per-column closure.
struct ConvertContext {
    nullval: String,
    bool_style: (String, String),
    decimal_sep: char,
    thousands_sep: Option<char>,
    datetime_format: String,
    timestamp_re: Regex,
}

impl ConvertContext {
    fn new(settings: &CopySettings) -> Self {
        Self {
            nullval: settings.nullval.clone(),
            bool_style: settings.bool_style.clone(),
            decimal_sep: settings.decimal_sep,
            thousands_sep: settings.thousands_sep,
            datetime_format: validated_format(&settings.datetime_format),
            timestamp_re: Regex::new(TIMESTAMP_PATTERN).expect("timestamp pattern is valid"),
        }
    }
}

/// Fall back to the default pattern if the configured one has directives
/// the formatter cannot render.
fn validated_format(fmt: &str) -> String {
    let broken = StrftimeItems::new(fmt).any(|item| matches!(item, Item::Error));
    if broken {
        tracing::warn!(format = fmt, "unusable datetimeformat, using the default");
        DEFAULT_TIMESTAMP_FORMAT.to_owned()
    } else {
        fmt.to_owned()
    }
}

/// Strip one layer of single quotes, undoubling embedded quotes.
fn unprotect(s: &str) -> Cow<'_, str> {
    if s.len() >= 2 && s.starts_with('\'') && s.ends_with('\'') {
        Cow::Owned(s[1..s.len() - 1].replace("''", "'"))
    } else {
        Cow::Borrowed(s)
    }
}

/// Split the inside of a bracketed literal on top-level `sep`, honoring
/// `{}[]()` nesting and single-quote runs. The outermost bracket pair is
/// expected in place and is not part of any element.
fn split_collection(val: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut level = 0i32;
    let mut quoted = false;
    let mut last = 1usize;
    for (i, c) in val.char_indices() {
        match c {
            '{' | '[' | '(' if !quoted => level += 1,
            '}' | ']' | ')' if !quoted => level -= 1,
            '\'' => quoted = !quoted,
            c if c == sep && level == 1 && !quoted => {
                parts.push(&val[last..i]);
                last = i + 1;
            }
            _ => {}
        }
    }
    if last < val.len().saturating_sub(1) {
        parts.push(&val[last..val.len() - 1]);
    }
    parts
}

/// Split a map or UDT entry at its first top-level colon.
fn split_pair(entry: &str) -> Result<(&str, &str), ParseError> {
    let mut level = 0i32;
    let mut quoted = false;
    for (i, c) in entry.char_indices() {
        match c {
            '{' | '[' | '(' if !quoted => level += 1,
            '}' | ']' | ')' if !quoted => level -= 1,
            '\'' => quoted = !quoted,
            ':' if level == 0 && !quoted => {
                return Ok((&entry[..i], &entry[i + 1..]));
            }
            _ => {}
        }
    }
    Err(ParseError::new(format!("missing ':' in map entry {entry:?}")))
}

/// Check the outer bracket pair of a collection literal; the brackets stay
/// in place for [`split_collection`].
fn expect_outer<'a>(v: &'a str, open: char, close: char, ty: &CqlType) -> Result<&'a str, ParseError> {
    if v.len() >= 2 && v.starts_with(open) && v.ends_with(close) {
        Ok(v)
    } else {
        Err(ParseError::new(format!("can't parse {v:?} as {ty}")))
    }
}

fn strip_seps(ctx: &ConvertContext, v: &str, decimal: bool) -> String {
    let mut s = v.to_owned();
    if let Some(t) = ctx.thousands_sep {
        s = s.replace(t, "");
    }
    if decimal && ctx.decimal_sep != '.' {
        s = s.replace(ctx.decimal_sep, ".");
    }
    s
}

fn parse_int<T: std::str::FromStr>(ctx: &ConvertContext, v: &str, ty: &CqlType) -> Result<T, ParseError> {
    strip_seps(ctx, v, false)
        .trim()
        .parse()
        .map_err(|_| ParseError::new(format!("can't parse {v:?} as {ty}")))
}

fn parse_float<T: std::str::FromStr>(ctx: &ConvertContext, v: &str, ty: &CqlType) -> Result<T, ParseError> {
    strip_seps(ctx, v, true)
        .trim()
        .parse()
        .map_err(|_| ParseError::new(format!("can't parse {v:?} as {ty}")))
}

const NANOS_PER_SEC: i64 = 1_000_000_000;

fn parse_value(ctx: &ConvertContext, ty: &CqlType, raw: &str) -> Result<Value, ParseError> {
    let v = unprotect(raw);
    let v = v.as_ref();
    match ty {
        CqlType::Ascii | CqlType::Text | CqlType::Varchar | CqlType::Inet => {
            Ok(Value::Text(v.to_owned()))
        }
        CqlType::Blob => {
            let hex = v
                .strip_prefix("0x")
                .or_else(|| v.strip_prefix("0X"))
                .ok_or_else(|| ParseError::new(format!("blob value {v:?} must start with 0x")))?;
            decode_hex(hex)
                .map(Value::Blob)
                .ok_or_else(|| ParseError::new(format!("can't parse {v:?} as blob")))
        }
        CqlType::Boolean => {
            if v.eq_ignore_ascii_case(&ctx.bool_style.0) {
                Ok(Value::Boolean(true))
            } else if v.eq_ignore_ascii_case(&ctx.bool_style.1) {
                Ok(Value::Boolean(false))
            } else {
                Err(ParseError::new(format!(
                    "boolean value {v:?} is neither {:?} nor {:?}",
                    ctx.bool_style.0, ctx.bool_style.1
                )))
            }
        }
        CqlType::TinyInt => Ok(Value::TinyInt(parse_int(ctx, v, ty)?)),
        CqlType::SmallInt => Ok(Value::SmallInt(parse_int(ctx, v, ty)?)),
        CqlType::Int => Ok(Value::Int(parse_int(ctx, v, ty)?)),
        CqlType::Bigint | CqlType::Counter => Ok(Value::BigInt(parse_int(ctx, v, ty)?)),
        CqlType::Varint => {
            let s = strip_seps(ctx, v, false);
            s.trim()
                .parse::<BigInt>()
                .map(Value::Varint)
                .map_err(|_| ParseError::new(format!("can't parse {v:?} as varint")))
        }
        CqlType::Float => Ok(Value::Float(parse_float(ctx, v, ty)?)),
        CqlType::Double => Ok(Value::Double(parse_float(ctx, v, ty)?)),
        CqlType::Decimal => {
            let s = strip_seps(ctx, v, true);
            s.trim()
                .parse::<BigDecimal>()
                .map(Value::Decimal)
                .map_err(|_| ParseError::new(format!("can't parse {v:?} as decimal")))
        }
        CqlType::Uuid | CqlType::TimeUuid => Uuid::parse_str(v.trim())
            .map(Value::Uuid)
            .map_err(|_| ParseError::new(format!("can't parse {v:?} as uuid"))),
        CqlType::Date => parse_date(v),
        CqlType::Time => parse_time(v),
        CqlType::Timestamp => parse_timestamp(ctx, v),
        CqlType::List(sub) => {
            let v = expect_outer(v, '[', ']', ty)?;
            let items = split_collection(v, ',')
                .iter()
                .map(|e| parse_value(ctx, sub, e.trim()))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::List(items))
        }
        CqlType::Set(sub) => {
            let v = expect_outer(v, '{', '}', ty)?;
            let items = split_collection(v, ',')
                .iter()
                .map(|e| parse_value(ctx, sub, e.trim()))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Set(items))
        }
        CqlType::Tuple(subtypes) => {
            let v = expect_outer(v, '(', ')', ty)?;
            let elems = split_collection(v, ',');
            let items = subtypes
                .iter()
                .zip(elems.iter())
                .map(|(t, e)| parse_value(ctx, t, e.trim()))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Tuple(items))
        }
        CqlType::Map(kt, vt) => {
            let v = expect_outer(v, '{', '}', ty)?;
            let mut entries = Vec::new();
            for e in split_collection(v, ',') {
                let (k, val) = split_pair(e)?;
                entries.push((
                    parse_value(ctx, kt, k.trim())?,
                    parse_value(ctx, vt, val.trim())?,
                ));
            }
            Ok(Value::Map(entries))
        }
        CqlType::Udt { fields, .. } => {
            let v = expect_outer(v, '{', '}', ty)?;
            let entries = split_collection(v, ',');
            let mut out = Vec::new();
            for ((field_name, field_ty), entry) in fields.iter().zip(entries.iter()) {
                let (_, val) = split_pair(entry)?;
                out.push((field_name.clone(), parse_value(ctx, field_ty, val.trim())?));
            }
            Ok(Value::Udt(out))
        }
        CqlType::Frozen(sub) | CqlType::Reversed(sub) => parse_value(ctx, sub, raw),
    }
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

const EPOCH: NaiveDate = match NaiveDate::from_ymd_opt(1970, 1, 1) {
    Some(d) => d,
    None => unreachable!(),
};

/// Days since the epoch, or an ISO date.
fn parse_date(v: &str) -> Result<Value, ParseError> {
    if let Ok(days) = v.trim().parse::<i32>() {
        return Ok(Value::Date(days));
    }
    let date = NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d")
        .map_err(|_| ParseError::new(format!("can't parse {v:?} as date")))?;
    let days = date.signed_duration_since(EPOCH).num_days();
    i32::try_from(days)
        .map(Value::Date)
        .map_err(|_| ParseError::new(format!("date {v:?} out of range")))
}

/// Nanoseconds since midnight, or a clock time.
fn parse_time(v: &str) -> Result<Value, ParseError> {
    let v = v.trim();
    if let Ok(nanos) = v.parse::<i64>() {
        return Ok(Value::Time(nanos));
    }
    let t = NaiveTime::parse_from_str(v, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(v, "%H:%M:%S"))
        .or_else(|_| NaiveTime::parse_from_str(v, "%H:%M"))
        .map_err(|_| ParseError::new(format!("can't parse {v:?} as time")))?;
    let nanos =
        i64::from(t.num_seconds_from_midnight()) * NANOS_PER_SEC + i64::from(t.nanosecond());
    Ok(Value::Time(nanos))
}

/// The configured format first, then the CQL literal shapes; milliseconds
/// since the epoch. A missing offset means local time.
fn parse_timestamp(ctx: &ConvertContext, v: &str) -> Result<Value, ParseError> {
    let v = v.trim();
    if let Ok(dt) = DateTime::parse_from_str(v, &ctx.datetime_format) {
        return Ok(Value::Timestamp(dt.timestamp_millis()));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(v, &ctx.datetime_format) {
        return Ok(Value::Timestamp(naive.and_utc().timestamp_millis()));
    }

    let caps = ctx.timestamp_re.captures(v).ok_or_else(|| {
        ParseError::new(format!(
            "can't interpret {v:?} as a date with format {:?}",
            ctx.datetime_format
        ))
    })?;
    let group = |i: usize| caps.get(i).map(|m| m.as_str());
    let num = |i: usize| -> i64 { group(i).and_then(|s| s.parse().ok()).unwrap_or(0) };

    let date = NaiveDate::from_ymd_opt(num(1) as i32, num(2) as u32, num(3) as u32)
        .ok_or_else(|| ParseError::new(format!("can't interpret {v:?} as a date")))?;
    let time = NaiveTime::from_hms_opt(num(4) as u32, num(5) as u32, num(6) as u32)
        .ok_or_else(|| ParseError::new(format!("can't interpret {v:?} as a time of day")))?;
    let naive = NaiveDateTime::new(date, time);

    let millis = match group(7) {
        Some(sign) => {
            let secs = (num(8) * 3600 + num(9) * 60) * if sign == "-" { -1 } else { 1 };
            let offset = FixedOffset::east_opt(secs as i32)
                .ok_or_else(|| ParseError::new(format!("bad utc offset in {v:?}")))?;
            offset
                .from_local_datetime(&naive)
                .single()
                .map(|dt| dt.timestamp_millis())
                .unwrap_or_else(|| naive.and_utc().timestamp_millis() - i64::from(offset.local_minus_utc()) * 1000)
        }
        None => Local
            .from_local_datetime(&naive)
            .earliest()
            .map_or_else(|| naive.and_utc().timestamp_millis(), |dt| dt.timestamp_millis()),
    };
    Ok(Value::Timestamp(millis))
}

/// Export-side value rendering with the run's dialect of separators,
/// boolean spellings and timestamp format.
pub struct ValueFormatter {
    nullval: String,
    bool_style: (String, String),
    decimal_sep: char,
    thousands_sep: Option<char>,
    datetime_format: String,
}

impl ValueFormatter {
    #[must_use]
    pub fn new(settings: &CopySettings) -> Self {
        Self {
            nullval: settings.nullval.clone(),
            bool_style: settings.bool_style.clone(),
            decimal_sep: settings.decimal_sep,
            thousands_sep: settings.thousands_sep,
            datetime_format: validated_format(&settings.datetime_format),
        }
    }

    /// Render one top-level CSV field.
    #[must_use]
    pub fn format(&self, v: &Value) -> String {
        match v {
            Value::Null => self.nullval.clone(),
            Value::Text(s) => s.clone(),
            Value::Blob(b) => format_blob(b),
            Value::Boolean(b) => {
                if *b { self.bool_style.0.clone() } else { self.bool_style.1.clone() }
            }
            Value::TinyInt(n) => self.format_integer(&n.to_string()),
            Value::SmallInt(n) => self.format_integer(&n.to_string()),
            Value::Int(n) => self.format_integer(&n.to_string()),
            Value::BigInt(n) => self.format_integer(&n.to_string()),
            Value::Varint(n) => self.format_integer(&n.to_string()),
            Value::Float(f) => self.format_floating(&f.to_string()),
            Value::Double(f) => self.format_floating(&f.to_string()),
            Value::Decimal(d) => self.format_floating(&d.to_string()),
            Value::Uuid(u) => u.hyphenated().to_string(),
            Value::Date(days) => format_date(*days),
            Value::Time(nanos) => format_time(*nanos),
            Value::Timestamp(ms) => self.format_timestamp(*ms),
            Value::List(_)
            | Value::Set(_)
            | Value::Map(_)
            | Value::Tuple(_)
            | Value::Udt(_) => {
                let mut out = String::new();
                self.format_nested(v, &mut out);
                out
            }
        }
    }

    /// Render a value inside a collection literal. Text and temporal
    /// values are single-quoted so separators stay unambiguous; numeric
    /// separators are not applied at this level.
    fn format_nested(&self, v: &Value, out: &mut String) {
        match v {
            Value::Null => out.push_str("null"),
            Value::Text(s) => out.push_str(&protect_value(s)),
            Value::Date(days) => out.push_str(&protect_value(&format_date(*days))),
            Value::Time(nanos) => out.push_str(&protect_value(&format_time(*nanos))),
            Value::Timestamp(ms) => out.push_str(&protect_value(&self.format_timestamp(*ms))),
            Value::Blob(b) => out.push_str(&format_blob(b)),
            Value::Boolean(b) => out.push_str(if *b {
                &self.bool_style.0
            } else {
                &self.bool_style.1
            }),
            Value::TinyInt(n) => out.push_str(&n.to_string()),
            Value::SmallInt(n) => out.push_str(&n.to_string()),
            Value::Int(n) => out.push_str(&n.to_string()),
            Value::BigInt(n) => out.push_str(&n.to_string()),
            Value::Varint(n) => out.push_str(&n.to_string()),
            Value::Float(f) => out.push_str(&f.to_string()),
            Value::Double(f) => out.push_str(&f.to_string()),
            Value::Decimal(d) => out.push_str(&d.to_string()),
            Value::Uuid(u) => out.push_str(&u.hyphenated().to_string()),
            Value::List(items) => self.format_seq(items, '[', ']', out),
            Value::Set(items) => self.format_seq(items, '{', '}', out),
            Value::Tuple(items) => self.format_seq(items, '(', ')', out),
            Value::Map(entries) => {
                out.push('{');
                for (i, (k, val)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.format_nested(k, out);
                    out.push_str(": ");
                    self.format_nested(val, out);
                }
                out.push('}');
            }
            Value::Udt(fields) => {
                out.push('{');
                for (i, (name, val)) in fields.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(name);
                    out.push_str(": ");
                    self.format_nested(val, out);
                }
                out.push('}');
            }
        }
    }

    fn format_seq(&self, items: &[Value], open: char, close: char, out: &mut String) {
        out.push(open);
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            self.format_nested(item, out);
        }
        out.push(close);
    }

    fn format_integer(&self, digits: &str) -> String {
        match self.thousands_sep {
            Some(sep) => group_thousands(digits, sep),
            None => digits.to_owned(),
        }
    }

    fn format_floating(&self, s: &str) -> String {
        let (int_part, frac_part) = match s.split_once('.') {
            Some((i, f)) => (i.to_owned(), Some(f.to_owned())),
            None => (s.to_owned(), None),
        };
        let int_part = self.format_integer(&int_part);
        match frac_part {
            Some(f) => format!("{int_part}{}{f}", self.decimal_sep),
            None => int_part,
        }
    }

    fn format_timestamp(&self, ms: i64) -> String {
        Utc.timestamp_millis_opt(ms)
            .single()
            .map_or_else(|| ms.to_string(), |dt| dt.format(&self.datetime_format).to_string())
    }
}

fn format_blob(b: &[u8]) -> String {
    let mut out = String::with_capacity(2 + b.len() * 2);
    out.push_str("0x");
    for byte in b {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn format_date(days: i32) -> String {
    EPOCH
        .checked_add_signed(chrono::Duration::days(i64::from(days)))
        .map_or_else(|| days.to_string(), |d| d.format("%Y-%m-%d").to_string())
}

fn format_time(nanos: i64) -> String {
    let secs = nanos.div_euclid(NANOS_PER_SEC);
    let frac = nanos.rem_euclid(NANOS_PER_SEC);
    let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
    if frac == 0 {
        format!("{h:02}:{m:02}:{s:02}")
    } else {
        let frac = format!("{frac:09}");
        format!("{h:02}:{m:02}:{s:02}.{}", frac.trim_end_matches('0'))
    }
}

/// Insert a grouping separator every three digits of the integer part.
fn group_thousands(digits: &str, sep: char) -> String {
    let (sign, body) = digits
        .strip_prefix('-')
        .map_or(("", digits), |rest| ("-", rest));
    let mut grouped = String::new();
    let len = body.len();
    for (i, c) in body.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            grouped.push(sep);
        }
        grouped.push(c);
    }
    format!("{sign}{grouped}")
}

/// A converted import row: the statement payload plus the serialized
/// partition key that routes it on the ring.
#[derive(Debug, Clone)]
pub struct ImportedRow {
    pub payload: RowPayload,
    pub routing_key: Vec<u8>,
}

/// Bound values for prepared statements, or protected literals for
/// statement text.
#[derive(Debug, Clone)]
pub enum RowPayload {
    Bound(Vec<Value>),
    Literal(Vec<String>),
}

type ColumnParser = Box<dyn Fn(&str) -> Result<Value, ParseError> + Send + Sync>;

/// Converts parsed CSV rows for one table, one closure per column.
pub struct RowConverter {
    ctx: Arc<ConvertContext>,
    columns: Vec<String>,
    types: Vec<CqlType>,
    parsers: Vec<ColumnParser>,
    pk_indexes: Vec<usize>,
    partition_indexes: Vec<usize>,
    prepared: bool,
}

impl std::fmt::Debug for RowConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowConverter")
            .field("columns", &self.columns)
            .field("types", &self.types)
            .field("pk_indexes", &self.pk_indexes)
            .field("partition_indexes", &self.partition_indexes)
            .field("prepared", &self.prepared)
            .finish_non_exhaustive()
    }
}

impl RowConverter {
    /// Build the converter for `columns` of `table`.
    ///
    /// With `prepared` unset, rows convert to protected literals instead
    /// of bound values; partition-key fields still go through the real
    /// parsers for routing.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] when a column or primary-key column is
    /// missing from the schema or the column list.
    pub fn new(
        table: &TableMeta,
        columns: &[String],
        settings: &CopySettings,
        prepared: bool,
    ) -> Result<Self, ParseError> {
        let types = columns
            .iter()
            .map(|name| {
                table
                    .column(name)
                    .map(|c| c.cql_type.clone())
                    .ok_or_else(|| ParseError::new(format!("unknown column {name:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let index_of = |name: &str| -> Result<usize, ParseError> {
            columns.iter().position(|c| c == name).ok_or_else(|| {
                ParseError::new(format!("primary key column {name:?} missing or skipped"))
            })
        };
        let pk_indexes = table
            .primary_key
            .iter()
            .map(|n| index_of(n))
            .collect::<Result<Vec<_>, _>>()?;
        let partition_indexes = table
            .partition_key
            .iter()
            .map(|n| index_of(n))
            .collect::<Result<Vec<_>, _>>()?;

        let ctx = Arc::new(ConvertContext::new(settings));
        let parsers = types
            .iter()
            .map(|ty| {
                let ctx = Arc::clone(&ctx);
                let ty = ty.clone();
                Box::new(move |raw: &str| parse_value(&ctx, &ty, raw)) as ColumnParser
            })
            .collect();

        Ok(Self { ctx, columns: columns.to_vec(), types, parsers, pk_indexes, partition_indexes, prepared })
    }

    /// Column names this converter expects, in row order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Indexes of primary-key columns within the row.
    #[must_use]
    pub fn pk_indexes(&self) -> &[usize] {
        &self.pk_indexes
    }

    /// Whether the column at `idx` needs single-quoting in statement text.
    #[must_use]
    pub fn needs_quoting(&self, idx: usize) -> bool {
        self.types[idx].needs_quoting()
    }

    /// Convert one parsed CSV row.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] for a bad field count, a null primary key
    /// or any field that fails its column parser.
    pub fn convert_row(&self, fields: &[String]) -> Result<ImportedRow, ParseError> {
        if fields.len() != self.parsers.len() {
            return Err(ParseError::new(format!(
                "Invalid row length {} should be {}",
                fields.len(),
                self.parsers.len()
            )));
        }
        for &i in &self.pk_indexes {
            if fields[i] == self.ctx.nullval {
                return Err(ParseError::new(self.null_pk_message(i)));
            }
        }

        let mut partition_values: Vec<Option<Value>> = vec![None; fields.len()];
        for &i in &self.partition_indexes {
            partition_values[i] = Some((self.parsers[i])(&fields[i])?);
        }

        let payload = if self.prepared {
            let mut values = Vec::with_capacity(fields.len());
            for (i, field) in fields.iter().enumerate() {
                if let Some(v) = partition_values[i].take() {
                    values.push(v);
                } else if *field == self.ctx.nullval {
                    values.push(Value::Null);
                } else {
                    values.push((self.parsers[i])(field)?);
                }
            }
            RowPayload::Bound(values)
        } else {
            let literals = fields
                .iter()
                .enumerate()
                .map(|(i, field)| {
                    if *field == self.ctx.nullval && !self.pk_indexes.contains(&i) {
                        "NULL".to_owned()
                    } else if self.needs_quoting(i) {
                        protect_value(field)
                    } else {
                        field.clone()
                    }
                })
                .collect();
            RowPayload::Literal(literals)
        };

        let routing_values: Vec<&Value> = match &payload {
            RowPayload::Bound(values) => {
                self.partition_indexes.iter().map(|&i| &values[i]).collect()
            }
            RowPayload::Literal(_) => self
                .partition_indexes
                .iter()
                .map(|&i| partition_values[i].as_ref().expect("partition value parsed above"))
                .collect(),
        };
        let routing_key = serialize_partition_key(&routing_values)?;

        Ok(ImportedRow { payload, routing_key })
    }

    fn null_pk_message(&self, idx: usize) -> String {
        let mut msg = format!(
            "Cannot insert null value for primary key column '{}'.",
            self.columns[idx]
        );
        if self.ctx.nullval.is_empty() {
            msg.push_str(
                " If you want to insert empty strings, consider using the WITH NULL=<marker> option for COPY.",
            );
        }
        msg
    }
}
