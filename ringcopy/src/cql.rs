//! CQL schema model: column types, native values, table metadata and the
//! binary partition-key serialization used for token routing.
//!
//! Types are a tagged enum carrying their subtype vectors so converters can
//! be built as a flat per-column closure table, and so user-defined types
//! keep their field order.

use std::fmt;

use bigdecimal::BigDecimal;
use num_bigint::BigInt;
use uuid::Uuid;

use crate::error::ParseError;

/// A host address in `host:port` or bare-host form.
pub type HostAddr = String;

/// CQL column type, including collection and user-defined shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CqlType {
    Ascii,
    Bigint,
    Blob,
    Boolean,
    Counter,
    Date,
    Decimal,
    Double,
    Float,
    Inet,
    Int,
    SmallInt,
    Text,
    Time,
    Timestamp,
    TimeUuid,
    TinyInt,
    Uuid,
    Varchar,
    Varint,
    List(Box<CqlType>),
    Set(Box<CqlType>),
    Map(Box<CqlType>, Box<CqlType>),
    Tuple(Vec<CqlType>),
    /// User-defined type with its declared field order.
    Udt {
        name: String,
        fields: Vec<(String, CqlType)>,
    },
    Frozen(Box<CqlType>),
    Reversed(Box<CqlType>),
}

impl CqlType {
    /// Parse a type string as found in schema metadata, e.g.
    /// `map<int, frozen<list<text>>>`. User-defined types cannot be named
    /// in this form; they come from metadata directly.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] for unknown names or malformed nesting.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let s = s.trim();
        let (name, args) = match s.find('<') {
            Some(open) => {
                if !s.ends_with('>') {
                    return Err(ParseError::new(format!("malformed type string {s:?}")));
                }
                (&s[..open], Some(&s[open + 1..s.len() - 1]))
            }
            None => (s, None),
        };

        let simple = |ty: CqlType| -> Result<CqlType, ParseError> {
            if args.is_some() {
                return Err(ParseError::new(format!("type {name} takes no parameters")));
            }
            Ok(ty)
        };

        match name.to_ascii_lowercase().as_str() {
            "ascii" => simple(CqlType::Ascii),
            "bigint" => simple(CqlType::Bigint),
            "blob" => simple(CqlType::Blob),
            "boolean" => simple(CqlType::Boolean),
            "counter" => simple(CqlType::Counter),
            "date" => simple(CqlType::Date),
            "decimal" => simple(CqlType::Decimal),
            "double" => simple(CqlType::Double),
            "float" => simple(CqlType::Float),
            "inet" => simple(CqlType::Inet),
            "int" => simple(CqlType::Int),
            "smallint" => simple(CqlType::SmallInt),
            "text" => simple(CqlType::Text),
            "time" => simple(CqlType::Time),
            "timestamp" => simple(CqlType::Timestamp),
            "timeuuid" => simple(CqlType::TimeUuid),
            "tinyint" => simple(CqlType::TinyInt),
            "uuid" => simple(CqlType::Uuid),
            "varchar" => simple(CqlType::Varchar),
            "varint" => simple(CqlType::Varint),
            "list" => Ok(CqlType::List(Box::new(Self::parse(one_arg(name, args)?)?))),
            "set" => Ok(CqlType::Set(Box::new(Self::parse(one_arg(name, args)?)?))),
            "frozen" => Ok(CqlType::Frozen(Box::new(Self::parse(one_arg(name, args)?)?))),
            "reversed" => Ok(CqlType::Reversed(Box::new(Self::parse(one_arg(name, args)?)?))),
            "map" => {
                let parts = split_type_args(args_or_err(name, args)?);
                if parts.len() != 2 {
                    return Err(ParseError::new("map takes exactly two parameters"));
                }
                Ok(CqlType::Map(
                    Box::new(Self::parse(parts[0])?),
                    Box::new(Self::parse(parts[1])?),
                ))
            }
            "tuple" => {
                let parts = split_type_args(args_or_err(name, args)?);
                let subtypes = parts
                    .iter()
                    .map(|p| Self::parse(p))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(CqlType::Tuple(subtypes))
            }
            other => Err(ParseError::new(format!("unknown type name {other:?}"))),
        }
    }

    /// The bare type name, matching schema `typestring` tags.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            CqlType::Ascii => "ascii",
            CqlType::Bigint => "bigint",
            CqlType::Blob => "blob",
            CqlType::Boolean => "boolean",
            CqlType::Counter => "counter",
            CqlType::Date => "date",
            CqlType::Decimal => "decimal",
            CqlType::Double => "double",
            CqlType::Float => "float",
            CqlType::Inet => "inet",
            CqlType::Int => "int",
            CqlType::SmallInt => "smallint",
            CqlType::Text => "text",
            CqlType::Time => "time",
            CqlType::Timestamp => "timestamp",
            CqlType::TimeUuid => "timeuuid",
            CqlType::TinyInt => "tinyint",
            CqlType::Uuid => "uuid",
            CqlType::Varchar => "varchar",
            CqlType::Varint => "varint",
            CqlType::List(_) => "list",
            CqlType::Set(_) => "set",
            CqlType::Map(..) => "map",
            CqlType::Tuple(_) => "tuple",
            CqlType::Udt { .. } => "udt",
            CqlType::Frozen(_) => "frozen",
            CqlType::Reversed(_) => "reversed",
        }
    }

    /// Strip `frozen`/`reversed` wrappers down to the payload type.
    #[must_use]
    pub fn unwrap_shell(&self) -> &CqlType {
        match self {
            CqlType::Frozen(inner) | CqlType::Reversed(inner) => inner.unwrap_shell(),
            other => other,
        }
    }

    /// Whether this column holds a counter (possibly under a wrapper).
    #[must_use]
    pub fn is_counter(&self) -> bool {
        matches!(self.unwrap_shell(), CqlType::Counter)
    }

    /// Text-like types whose literals must be single-quoted in CQL text.
    #[must_use]
    pub fn needs_quoting(&self) -> bool {
        matches!(
            self.unwrap_shell(),
            CqlType::Ascii
                | CqlType::Text
                | CqlType::Varchar
                | CqlType::Inet
                | CqlType::Timestamp
                | CqlType::Date
                | CqlType::Time
        )
    }
}

fn args_or_err<'a>(name: &str, args: Option<&'a str>) -> Result<&'a str, ParseError> {
    args.ok_or_else(|| ParseError::new(format!("type {name} requires parameters")))
}

fn one_arg<'a>(name: &str, args: Option<&'a str>) -> Result<&'a str, ParseError> {
    let args = args_or_err(name, args)?;
    if split_type_args(args).len() != 1 {
        return Err(ParseError::new(format!("type {name} takes one parameter")));
    }
    Ok(args)
}

/// Split `int, frozen<map<int, text>>` on top-level commas.
fn split_type_args(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = s[start..].trim();
    if !last.is_empty() {
        parts.push(last);
    }
    parts
}

/// A native CQL value as moved between CSV fields and the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    /// ascii, text, varchar and inet payloads.
    Text(String),
    Blob(Vec<u8>),
    Boolean(bool),
    TinyInt(i8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Varint(BigInt),
    Float(f32),
    Double(f64),
    Decimal(BigDecimal),
    Uuid(Uuid),
    /// Days since the epoch (may be negative).
    Date(i32),
    /// Nanoseconds since midnight.
    Time(i64),
    /// Milliseconds since the epoch.
    Timestamp(i64),
    List(Vec<Value>),
    Set(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Tuple(Vec<Value>),
    /// Field values in the type's declared order.
    Udt(Vec<(String, Value)>),
}

impl Value {
    /// Whether this is the SQL-null sentinel.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// One column of a table schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub cql_type: CqlType,
}

/// Table schema as read from cluster metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    pub keyspace: String,
    pub table: String,
    /// All columns in schema order.
    pub columns: Vec<ColumnMeta>,
    /// Partition-key column names, in key order.
    pub partition_key: Vec<String>,
    /// Full primary key (partition key plus clustering columns).
    pub primary_key: Vec<String>,
}

impl TableMeta {
    /// Look up a column by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// `"ks"."table"` with identifier protection applied.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", protect_name(&self.keyspace), protect_name(&self.table))
    }
}

/// Quote an identifier unless it is a lowercase bareword.
#[must_use]
pub fn protect_name(name: &str) -> String {
    let bare = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if bare {
        name.to_owned()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Single-quote a literal, doubling embedded quotes.
#[must_use]
pub fn protect_value(v: &str) -> String {
    format!("'{}'", v.replace('\'', "''"))
}

/// Serialize a value in the CQL binary form used for token computation.
///
/// Only types legal in a partition key are supported.
///
/// # Errors
///
/// Returns a [`ParseError`] for nulls and non-key types.
pub fn serialize_value(v: &Value, out: &mut Vec<u8>) -> Result<(), ParseError> {
    match v {
        Value::Null => Err(ParseError::new("cannot serialize a null partition key")),
        Value::Text(s) => {
            out.extend_from_slice(s.as_bytes());
            Ok(())
        }
        Value::Blob(b) => {
            out.extend_from_slice(b);
            Ok(())
        }
        Value::Boolean(b) => {
            out.push(u8::from(*b));
            Ok(())
        }
        Value::TinyInt(n) => {
            out.extend_from_slice(&n.to_be_bytes());
            Ok(())
        }
        Value::SmallInt(n) => {
            out.extend_from_slice(&n.to_be_bytes());
            Ok(())
        }
        Value::Int(n) => {
            out.extend_from_slice(&n.to_be_bytes());
            Ok(())
        }
        Value::BigInt(n) | Value::Time(n) | Value::Timestamp(n) => {
            out.extend_from_slice(&n.to_be_bytes());
            Ok(())
        }
        Value::Varint(n) => {
            out.extend_from_slice(&n.to_signed_bytes_be());
            Ok(())
        }
        Value::Float(f) => {
            out.extend_from_slice(&f.to_be_bytes());
            Ok(())
        }
        Value::Double(f) => {
            out.extend_from_slice(&f.to_be_bytes());
            Ok(())
        }
        Value::Decimal(d) => {
            let (unscaled, scale) = d.as_bigint_and_exponent();
            let scale = i32::try_from(scale)
                .map_err(|_| ParseError::new("decimal scale out of range"))?;
            out.extend_from_slice(&scale.to_be_bytes());
            out.extend_from_slice(&unscaled.to_signed_bytes_be());
            Ok(())
        }
        Value::Uuid(u) => {
            out.extend_from_slice(u.as_bytes());
            Ok(())
        }
        Value::Date(days) => {
            // Wire form is an unsigned day count centered on 2^31.
            let biased = (i64::from(*days) + (1i64 << 31)) as u64 as u32;
            out.extend_from_slice(&biased.to_be_bytes());
            Ok(())
        }
        Value::List(_)
        | Value::Set(_)
        | Value::Map(_)
        | Value::Tuple(_)
        | Value::Udt(_) => Err(ParseError::new(format!(
            "type cannot appear in a partition key: {v:?}"
        ))),
    }
}

/// Serialize the partition key of a row for token routing.
///
/// A single-column key is its value's raw serialization; a composite key
/// packs each component as `(u16 length, bytes, 0)`.
///
/// # Errors
///
/// Returns a [`ParseError`] if any component cannot be serialized.
pub fn serialize_partition_key(values: &[&Value]) -> Result<Vec<u8>, ParseError> {
    let mut out = Vec::new();
    if let [single] = values {
        serialize_value(single, &mut out)?;
        return Ok(out);
    }
    for v in values {
        let mut component = Vec::new();
        serialize_value(v, &mut component)?;
        let len = u16::try_from(component.len())
            .map_err(|_| ParseError::new("partition key component too long"))?;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&component);
        out.push(0);
    }
    Ok(out)
}

impl fmt::Display for CqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CqlType::List(t) => write!(f, "list<{t}>"),
            CqlType::Set(t) => write!(f, "set<{t}>"),
            CqlType::Map(k, v) => write!(f, "map<{k}, {v}>"),
            CqlType::Tuple(ts) => {
                write!(f, "tuple<")?;
                for (i, t) in ts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, ">")
            }
            CqlType::Udt { name, .. } => write!(f, "{name}"),
            CqlType::Frozen(t) => write!(f, "frozen<{t}>"),
            CqlType::Reversed(t) => write!(f, "reversed<{t}>"),
            other => write!(f, "{}", other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_types() {
        assert_eq!(CqlType::parse("int").unwrap(), CqlType::Int);
        assert_eq!(
            CqlType::parse("list<text>").unwrap(),
            CqlType::List(Box::new(CqlType::Text))
        );
        assert_eq!(
            CqlType::parse("map<int, frozen<set<uuid>>>").unwrap(),
            CqlType::Map(
                Box::new(CqlType::Int),
                Box::new(CqlType::Frozen(Box::new(CqlType::Set(Box::new(
                    CqlType::Uuid
                )))))
            )
        );
        assert!(CqlType::parse("rings<int>").is_err());
        assert!(CqlType::parse("map<int>").is_err());
    }

    #[test]
    fn shell_unwrapping() {
        let t = CqlType::Reversed(Box::new(CqlType::Frozen(Box::new(CqlType::Counter))));
        assert!(t.is_counter());
        assert_eq!(t.unwrap_shell(), &CqlType::Counter);
    }

    #[test]
    fn name_protection() {
        assert_eq!(protect_name("plain_name"), "plain_name");
        assert_eq!(protect_name("CamelCase"), "\"CamelCase\"");
        assert_eq!(protect_name("with\"quote"), "\"with\"\"quote\"");
        assert_eq!(protect_name("9lives"), "\"9lives\"");
    }

    #[test]
    fn value_protection() {
        assert_eq!(protect_value("it's"), "'it''s'");
    }

    #[test]
    fn composite_key_packing() {
        let a = Value::Int(7);
        let b = Value::Text("x".into());
        let single = serialize_partition_key(&[&a]).unwrap();
        assert_eq!(single, 7i32.to_be_bytes().to_vec());

        let packed = serialize_partition_key(&[&a, &b]).unwrap();
        // (len, bytes, 0) per component
        assert_eq!(packed, vec![0, 4, 0, 0, 0, 7, 0, 0, 1, b'x', 0]);
    }

    #[test]
    fn null_keys_are_rejected() {
        assert!(serialize_partition_key(&[&Value::Null]).is_err());
    }
}
