//! Metric records: the unit of data produced by inputs.
//!
//! A [`Metric`] is a self-describing record: a measurement name, a map of
//! string tags, a map of named field values and a timestamp. Metrics are
//! created by the [`Accumulator`](crate::accumulator::Accumulator), which
//! normalizes the raw readings pushed by inputs, and rendered on the wire in
//! the line-protocol shape by their [`Display`](std::fmt::Display)
//! implementation.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A measurement timestamp (wall clock).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(SystemTime);

impl Timestamp {
    /// Returns the current time.
    pub fn now() -> Self {
        Self(SystemTime::now())
    }

    /// Rounds the timestamp to a multiple of `precision` since the UNIX epoch.
    ///
    /// Halfway values round up. A zero or one-nanosecond precision leaves the
    /// timestamp unchanged.
    pub fn round(self, precision: Duration) -> Self {
        let p = precision.as_nanos();
        if p <= 1 {
            return self;
        }
        let nanos = self.to_unix_nanos();
        let rem = nanos % p;
        let rounded = if rem * 2 >= p { nanos - rem + p } else { nanos - rem };
        Self(UNIX_EPOCH + nanos_to_duration(rounded))
    }

    /// Nanoseconds elapsed since the UNIX epoch.
    pub fn to_unix_nanos(self) -> u128 {
        self.0.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_nanos()
    }
}

impl From<SystemTime> for Timestamp {
    fn from(t: SystemTime) -> Self {
        Self(t)
    }
}

impl From<Timestamp> for SystemTime {
    fn from(t: Timestamp) -> Self {
        t.0
    }
}

fn nanos_to_duration(nanos: u128) -> Duration {
    Duration::new((nanos / 1_000_000_000) as u64, (nanos % 1_000_000_000) as u32)
}

/// A single sampled value.
///
/// Inputs may hand over raw `u64` counters; the accumulator converts them to
/// signed integers (clamping values above `i64::MAX`), so published metrics
/// only carry the types that downstream consumers support.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}
impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v.into())
    }
}
impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::UInt(v)
    }
}
impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::UInt(v.into())
    }
}
impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}
impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}
impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_owned())
    }
}
impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl fmt::Display for FieldValue {
    /// Line-protocol rendering: integers suffixed `i`, raw unsigned counters
    /// suffixed `u`, strings quoted with `"` and `\` escaped.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{v}i"),
            FieldValue::UInt(v) => write!(f, "{v}u"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Str(v) => {
                write!(f, "\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\""))
            }
        }
    }
}

/// How the values of a metric accumulate over time.
///
/// This is a label carried alongside the record, for the benefit of
/// downstream consumers. It does not change how the fields are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Monotonically increasing value.
    Counter,
    /// Value that goes up and down.
    Gauge,
    /// No accumulation semantics declared.
    Untyped,
}

/// Metric tags: unique keys, ordered iteration.
pub type Tags = BTreeMap<String, String>;

/// Metric fields: unique keys, ordered iteration.
pub type Fields = BTreeMap<String, FieldValue>;

/// Error raised by [`Metric::new`] when the record would be invalid.
#[derive(Debug, thiserror::Error)]
pub enum MetricError {
    #[error("measurement name is empty")]
    NoName,
    #[error("at least one field is required")]
    NoFields,
}

/// One complete metric record.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    name: String,
    tags: Tags,
    fields: Fields,
    timestamp: Timestamp,
    value_type: ValueType,
}

impl Metric {
    /// Creates a new metric record.
    ///
    /// Fails when the name or the field set is empty: such a record cannot be
    /// serialized.
    pub fn new(
        name: impl Into<String>,
        tags: Tags,
        fields: Fields,
        timestamp: Timestamp,
        value_type: ValueType,
    ) -> Result<Metric, MetricError> {
        let name = name.into();
        if name.is_empty() {
            return Err(MetricError::NoName);
        }
        if fields.is_empty() {
            return Err(MetricError::NoFields);
        }
        Ok(Metric {
            name,
            tags,
            fields,
            timestamp,
            value_type,
        })
    }

    /// The measurement name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }
}

impl fmt::Display for Metric {
    /// Renders the record as one line-protocol line:
    /// `name,tag=value field=value <unix nanoseconds>`, tags and fields in
    /// key order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_escaped(f, &self.name, ", ")?;
        for (key, value) in &self.tags {
            f.write_str(",")?;
            write_escaped(f, key, ",= ")?;
            f.write_str("=")?;
            write_escaped(f, value, ",= ")?;
        }
        let mut first = true;
        for (key, value) in &self.fields {
            f.write_str(if first { " " } else { "," })?;
            first = false;
            write_escaped(f, key, ",= ")?;
            write!(f, "={value}")?;
        }
        write!(f, " {}", self.timestamp.to_unix_nanos())
    }
}

fn write_escaped(f: &mut fmt::Formatter<'_>, s: &str, special: &str) -> fmt::Result {
    for c in s.chars() {
        if special.contains(c) {
            write!(f, "\\{c}")?;
        } else {
            write!(f, "{c}")?;
        }
    }
    Ok(())
}

/// Builds a [`Tags`] map from `key => value` pairs.
///
/// # Example
/// ```
/// use rackmon::tags;
///
/// let t = tags! { "port" => "swp1", "role" => "uplink" };
/// assert_eq!(t["port"], "swp1");
/// ```
#[macro_export]
macro_rules! tags {
    () => { $crate::metric::Tags::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::metric::Tags::new();
        $( map.insert(::std::string::String::from($key), ::std::string::String::from($value)); )+
        map
    }};
}

/// Builds a [`Fields`] map from `key => value` pairs.
///
/// Values are converted with [`FieldValue::from`](crate::metric::FieldValue),
/// so any supported primitive works on the right-hand side.
///
/// # Example
/// ```
/// use rackmon::fields;
///
/// let f = fields! { "rx_bytes" => 1024u64, "link_up" => true };
/// assert_eq!(f.len(), 2);
/// ```
#[macro_export]
macro_rules! fields {
    () => { $crate::metric::Fields::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::metric::Fields::new();
        $( map.insert(::std::string::String::from($key), $crate::metric::FieldValue::from($value)); )+
        map
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ts(nanos: u64) -> Timestamp {
        Timestamp::from(UNIX_EPOCH + Duration::from_nanos(nanos))
    }

    #[test]
    fn round_to_second() {
        let second = Duration::from_secs(1);
        assert_eq!(ts(1_400_000_000).round(second), ts(1_000_000_000));
        assert_eq!(ts(1_500_000_000).round(second), ts(2_000_000_000));
        assert_eq!(ts(2_500_000_000).round(second), ts(3_000_000_000));
        assert_eq!(ts(3_000_000_000).round(second), ts(3_000_000_000));
    }

    #[test]
    fn round_disabled() {
        assert_eq!(ts(123).round(Duration::ZERO), ts(123));
        assert_eq!(ts(123).round(Duration::from_nanos(1)), ts(123));
    }

    #[test]
    fn round_to_microsecond() {
        let micro = Duration::from_micros(1);
        assert_eq!(ts(1_499).round(micro), ts(1_000));
        assert_eq!(ts(1_500).round(micro), ts(2_000));
    }

    #[test]
    fn new_rejects_empty() {
        let fields = crate::fields! { "x" => 1i64 };
        let err = Metric::new("", Tags::new(), fields, ts(0), ValueType::Untyped).unwrap_err();
        assert!(matches!(err, MetricError::NoName));

        let err = Metric::new("m", Tags::new(), Fields::new(), ts(0), ValueType::Untyped).unwrap_err();
        assert!(matches!(err, MetricError::NoFields));
    }

    #[test]
    fn display_line_protocol() {
        let tags = crate::tags! { "host" => "a,b" };
        let mut fields = Fields::new();
        fields.insert("b".into(), FieldValue::Bool(true));
        fields.insert("f".into(), FieldValue::Float(0.5));
        fields.insert("i".into(), FieldValue::Int(-3));
        fields.insert("s".into(), FieldValue::Str("say \"hi\"".into()));
        fields.insert("u".into(), FieldValue::UInt(7));
        let m = Metric::new("m x", tags, fields, ts(123), ValueType::Untyped).unwrap();
        assert_eq!(
            m.to_string(),
            r#"m\ x,host=a\,b b=true,f=0.5,i=-3i,s="say \"hi\"",u=7u 123"#
        );
    }

    #[test]
    fn display_escapes_tag_keys() {
        let mut tags = Tags::new();
        tags.insert("k ey".into(), "v=1".into());
        let fields = crate::fields! { "n" => 1i64 };
        let m = Metric::new("m", tags, fields, ts(0), ValueType::Gauge).unwrap();
        assert_eq!(m.to_string(), r"m,k\ ey=v\=1 n=1i 0");
    }

    #[test]
    fn fields_macro_converts_values() {
        let f = crate::fields! {
            "i" => -1i64,
            "u" => 2u64,
            "f" => 0.25,
            "b" => false,
            "s" => "text",
        };
        assert_eq!(f["i"], FieldValue::Int(-1));
        assert_eq!(f["u"], FieldValue::UInt(2));
        assert_eq!(f["f"], FieldValue::Float(0.25));
        assert_eq!(f["b"], FieldValue::Bool(false));
        assert_eq!(f["s"], FieldValue::Str("text".into()));
    }
}
