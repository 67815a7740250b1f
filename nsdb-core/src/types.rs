//! Core value and record types for NSDb

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Reserved field name for the record timestamp
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Reserved field name for the record value
pub const VALUE_FIELD: &str = "value";

/// Tagged primitive value stored in records and used in comparisons
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NsdbValue {
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit float
    Float(f64),
    /// Fixed-point numeric, carried as f64
    Decimal(f64),
    /// UTF-8 string
    String(String),
}

/// Type tag of an [`NsdbValue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Int,
    Float,
    Decimal,
    String,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Int => write!(f, "INT"),
            ValueType::Float => write!(f, "FLOAT"),
            ValueType::Decimal => write!(f, "DECIMAL"),
            ValueType::String => write!(f, "VARCHAR"),
        }
    }
}

impl ValueType {
    /// Whether values of this type can be aggregated with sum/min/max/avg
    pub fn is_numeric(&self) -> bool {
        !matches!(self, ValueType::String)
    }
}

impl NsdbValue {
    /// Get the type tag of this value
    pub fn value_type(&self) -> ValueType {
        match self {
            NsdbValue::Int(_) => ValueType::Int,
            NsdbValue::Float(_) => ValueType::Float,
            NsdbValue::Decimal(_) => ValueType::Decimal,
            NsdbValue::String(_) => ValueType::String,
        }
    }

    /// Whether this value is one of the numeric variants
    pub fn is_numeric(&self) -> bool {
        self.value_type().is_numeric()
    }

    /// Get as f64 if numeric
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NsdbValue::Int(v) => Some(*v as f64),
            NsdbValue::Float(v) | NsdbValue::Decimal(v) => Some(*v),
            NsdbValue::String(_) => None,
        }
    }

    /// Get as i64 if an integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            NsdbValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Compare two values.
    ///
    /// Equal tags compare directly; mixed numeric tags compare through f64.
    /// Any other mixed-tag comparison yields `None` (incomparable), which
    /// makes the enclosing predicate evaluate false.
    pub fn compare(&self, other: &NsdbValue) -> Option<Ordering> {
        match (self, other) {
            (NsdbValue::Int(a), NsdbValue::Int(b)) => Some(a.cmp(b)),
            (NsdbValue::String(a), NsdbValue::String(b)) => Some(a.cmp(b)),
            _ => {
                let a = self.as_f64()?;
                let b = other.as_f64()?;
                Some(a.total_cmp(&b))
            }
        }
    }

    /// Order-preserving byte encoding, stable across restarts.
    ///
    /// Layout: one tag byte, then big-endian payload. Signed integers are
    /// sign-flipped; floats use the total-order bit trick. Numeric variants
    /// share a tag so that a typed field keeps a single ordered dictionary.
    pub fn to_sort_key(&self) -> Vec<u8> {
        match self {
            NsdbValue::Int(v) => {
                let mut key = Vec::with_capacity(9);
                key.push(0x01);
                key.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes());
                key
            }
            NsdbValue::Float(v) | NsdbValue::Decimal(v) => {
                let bits = v.to_bits();
                let ordered = if bits & (1 << 63) != 0 {
                    !bits
                } else {
                    bits | (1 << 63)
                };
                let mut key = Vec::with_capacity(9);
                key.push(0x02);
                key.extend_from_slice(&ordered.to_be_bytes());
                key
            }
            NsdbValue::String(s) => {
                let mut key = Vec::with_capacity(1 + s.len());
                key.push(0x03);
                key.extend_from_slice(s.as_bytes());
                key
            }
        }
    }

    /// Sum used by the sum/avg aggregates. Int+Int stays exact; any float
    /// or decimal operand promotes the result.
    pub fn add(&self, other: &NsdbValue) -> Option<NsdbValue> {
        match (self, other) {
            (NsdbValue::Int(a), NsdbValue::Int(b)) => Some(NsdbValue::Int(a + b)),
            (NsdbValue::Decimal(_), _) | (_, NsdbValue::Decimal(_)) => {
                Some(NsdbValue::Decimal(self.as_f64()? + other.as_f64()?))
            }
            _ => Some(NsdbValue::Float(self.as_f64()? + other.as_f64()?)),
        }
    }

    /// Division used to finalize avg from (sum, count)
    pub fn divide_by(&self, count: u64) -> Option<NsdbValue> {
        if count == 0 {
            return None;
        }
        let quotient = self.as_f64()? / count as f64;
        match self {
            NsdbValue::Decimal(_) => Some(NsdbValue::Decimal(quotient)),
            _ => Some(NsdbValue::Float(quotient)),
        }
    }
}

impl fmt::Display for NsdbValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NsdbValue::Int(v) => write!(f, "{}", v),
            NsdbValue::Float(v) | NsdbValue::Decimal(v) => write!(f, "{}", v),
            NsdbValue::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for NsdbValue {
    fn from(v: i64) -> Self {
        NsdbValue::Int(v)
    }
}

impl From<f64> for NsdbValue {
    fn from(v: f64) -> Self {
        NsdbValue::Float(v)
    }
}

impl From<&str> for NsdbValue {
    fn from(v: &str) -> Self {
        NsdbValue::String(v.to_string())
    }
}

impl From<String> for NsdbValue {
    fn from(v: String) -> Self {
        NsdbValue::String(v)
    }
}

/// Match a string against a wildcard pattern where `$` and `%` each match
/// zero or more characters; every other character is literal.
pub fn matches_wildcard(s: &str, pattern: &str) -> bool {
    let mut regex_pattern = String::with_capacity(pattern.len() + 2);
    regex_pattern.push('^');
    for c in pattern.chars() {
        if c == '$' || c == '%' {
            regex_pattern.push_str(".*");
        } else {
            regex_pattern.push_str(&regex::escape(&c.to_string()));
        }
    }
    regex_pattern.push('$');

    regex::Regex::new(&regex_pattern)
        .map(|re| re.is_match(s))
        .unwrap_or(false)
}

/// A single time-stamped observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bit {
    /// Milliseconds since Unix epoch
    pub timestamp: Timestamp,
    /// The observed value (numeric)
    pub value: NsdbValue,
    /// Indexed attributes, filterable
    pub dimensions: BTreeMap<String, NsdbValue>,
    /// Indexed attributes, filterable and groupable
    pub tags: BTreeMap<String, NsdbValue>,
}

impl Bit {
    /// Create a new record with no dimensions or tags
    pub fn new(timestamp: Timestamp, value: impl Into<NsdbValue>) -> Self {
        Self {
            timestamp,
            value: value.into(),
            dimensions: BTreeMap::new(),
            tags: BTreeMap::new(),
        }
    }

    /// Add a dimension
    pub fn with_dimension(mut self, key: impl Into<String>, value: impl Into<NsdbValue>) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }

    /// Add a tag
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<NsdbValue>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Look up a field by name, covering the reserved `timestamp` and
    /// `value` fields as well as dimensions and tags.
    pub fn field(&self, name: &str) -> Option<NsdbValue> {
        match name {
            TIMESTAMP_FIELD => Some(NsdbValue::Int(self.timestamp)),
            VALUE_FIELD => Some(self.value.clone()),
            _ => self
                .dimensions
                .get(name)
                .or_else(|| self.tags.get(name))
                .cloned(),
        }
    }

    /// Iterate over dimensions, then tags, each in name order
    pub fn attributes(&self) -> impl Iterator<Item = (&String, &NsdbValue)> {
        self.dimensions.iter().chain(self.tags.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_comparison_across_tags() {
        let a = NsdbValue::Int(3);
        let b = NsdbValue::Float(3.5);
        assert_eq!(a.compare(&b), Some(Ordering::Less));
        assert_eq!(b.compare(&a), Some(Ordering::Greater));
        assert_eq!(
            NsdbValue::Decimal(3.0).compare(&NsdbValue::Int(3)),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn test_mixed_tags_incomparable() {
        let s = NsdbValue::String("3".into());
        assert_eq!(s.compare(&NsdbValue::Int(3)), None);
        assert_eq!(NsdbValue::Float(1.0).compare(&s), None);
    }

    #[test]
    fn test_sort_key_ordering() {
        let values = [-10i64, -1, 0, 1, 42, i64::MAX];
        let keys: Vec<_> = values
            .iter()
            .map(|v| NsdbValue::Int(*v).to_sort_key())
            .collect();
        for w in keys.windows(2) {
            assert!(w[0] < w[1]);
        }

        let floats = [-2.5f64, -0.1, 0.0, 0.1, 7.25];
        let fkeys: Vec<_> = floats
            .iter()
            .map(|v| NsdbValue::Float(*v).to_sort_key())
            .collect();
        for w in fkeys.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn test_wildcard_matching() {
        assert!(matches_wildcard("server-01", "server$"));
        assert!(matches_wildcard("server-01", "%01"));
        assert!(matches_wildcard("server-01", "ser%01"));
        assert!(!matches_wildcard("server-01", "host$"));
        assert!(matches_wildcard("anything", "$"));
        // literal regex metacharacters are not special
        assert!(matches_wildcard("a.b", "a.b"));
        assert!(!matches_wildcard("axb", "a.b"));
    }

    #[test]
    fn test_add_and_divide() {
        assert_eq!(
            NsdbValue::Int(2).add(&NsdbValue::Int(3)),
            Some(NsdbValue::Int(5))
        );
        assert_eq!(
            NsdbValue::Int(2).add(&NsdbValue::Float(0.5)),
            Some(NsdbValue::Float(2.5))
        );
        assert_eq!(
            NsdbValue::Float(7.0).divide_by(2),
            Some(NsdbValue::Float(3.5))
        );
        assert_eq!(NsdbValue::Float(7.0).divide_by(0), None);
    }

    #[test]
    fn test_bit_field_lookup() {
        let bit = Bit::new(100, 1.5)
            .with_dimension("host", "h1")
            .with_tag("city", "rome");
        assert_eq!(bit.field("timestamp"), Some(NsdbValue::Int(100)));
        assert_eq!(bit.field("value"), Some(NsdbValue::Float(1.5)));
        assert_eq!(bit.field("host"), Some(NsdbValue::String("h1".into())));
        assert_eq!(bit.field("city"), Some(NsdbValue::String("rome".into())));
        assert_eq!(bit.field("missing"), None);
    }
}
