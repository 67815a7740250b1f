//! Statement AST for the NSDb SQL dialect
//!
//! Statements are the wire contract between the core and any RPC façade:
//! every node serializes with serde and parses back to an identical tree.

mod parser;

pub use parser::StatementParser;

use crate::types::{matches_wildcard, Bit, NsdbValue, Timestamp, TIMESTAMP_FIELD};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A parsed statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Select(SelectStatement),
    Insert(InsertStatement),
    Delete(DeleteStatement),
    Drop(DropStatement),
}

/// SELECT statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectStatement {
    pub db: String,
    pub namespace: String,
    pub metric: String,
    pub distinct: bool,
    pub fields: FieldSelection,
    pub condition: Option<Expression>,
    pub group_by: Option<GroupBy>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

/// INSERT statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertStatement {
    pub db: String,
    pub namespace: String,
    pub metric: String,
    pub timestamp: Option<Timestamp>,
    pub dimensions: BTreeMap<String, NsdbValue>,
    pub tags: BTreeMap<String, NsdbValue>,
    pub value: NsdbValue,
}

impl InsertStatement {
    /// Build the record this statement inserts, stamping `now` when the
    /// statement carries no explicit timestamp.
    pub fn to_bit(&self, now_ms: Timestamp) -> Bit {
        Bit {
            timestamp: self.timestamp.unwrap_or(now_ms),
            value: self.value.clone(),
            dimensions: self.dimensions.clone(),
            tags: self.tags.clone(),
        }
    }
}

/// DELETE statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteStatement {
    pub db: String,
    pub namespace: String,
    pub metric: String,
    pub condition: Expression,
}

/// DROP METRIC statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropStatement {
    pub db: String,
    pub namespace: String,
    pub metric: String,
}

/// Projected fields of a SELECT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldSelection {
    /// `SELECT *`
    All,
    /// Explicit field list
    List(Vec<Field>),
}

/// A projected field, optionally aggregated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub aggregation: Option<Aggregation>,
}

impl Field {
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aggregation: None,
        }
    }

    pub fn aggregated(name: impl Into<String>, aggregation: Aggregation) -> Self {
        Self {
            name: name.into(),
            aggregation: Some(aggregation),
        }
    }
}

/// Aggregation functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggregation {
    Count,
    Sum,
    Min,
    Max,
    First,
    Last,
    /// Derived aggregation: executed as {count, sum}, divided at merge time
    Avg,
}

impl Aggregation {
    /// Parse from a function name
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "count" => Some(Aggregation::Count),
            "sum" => Some(Aggregation::Sum),
            "min" => Some(Aggregation::Min),
            "max" => Some(Aggregation::Max),
            "first" => Some(Aggregation::First),
            "last" => Some(Aggregation::Last),
            "avg" => Some(Aggregation::Avg),
            _ => None,
        }
    }

    /// Whether this aggregation is legal without a GROUP BY
    pub fn is_global(&self) -> bool {
        matches!(self, Aggregation::Count | Aggregation::Avg)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Aggregation::Count => "count",
            Aggregation::Sum => "sum",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
            Aggregation::First => "first",
            Aggregation::Last => "last",
            Aggregation::Avg => "avg",
        }
    }
}

/// GROUP BY clause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GroupBy {
    /// Group by a tag's value
    Simple { field: String },
    /// Group by timestamp bucketed to multiples of the interval
    Temporal { quantity: i64, unit: TimeUnit },
}

impl GroupBy {
    /// Bucket width in milliseconds for temporal grouping
    pub fn interval_ms(&self) -> Option<i64> {
        match self {
            GroupBy::Simple { .. } => None,
            GroupBy::Temporal { quantity, unit } => Some(quantity * unit.as_millis()),
        }
    }
}

/// Time units accepted in relative time literals and temporal grouping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    pub fn as_millis(&self) -> i64 {
        match self {
            TimeUnit::Millisecond => 1,
            TimeUnit::Second => 1_000,
            TimeUnit::Minute => 60_000,
            TimeUnit::Hour => 3_600_000,
            TimeUnit::Day => 86_400_000,
        }
    }

    /// Parse a unit word
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "ms" | "millisecond" | "milliseconds" => Some(TimeUnit::Millisecond),
            "s" | "sec" | "second" | "seconds" => Some(TimeUnit::Second),
            "min" | "minute" | "minutes" => Some(TimeUnit::Minute),
            "h" | "hour" | "hours" => Some(TimeUnit::Hour),
            "d" | "day" | "days" => Some(TimeUnit::Day),
            _ => None,
        }
    }
}

/// ORDER BY clause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub field: String,
    pub direction: OrderDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDirection {
    Asc,
    Desc,
}

/// Ordering on the timestamp field, when the ORDER BY targets it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOrdering {
    Ascending,
    Descending,
}

/// Comparison operators other than equality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

/// Sign of a relative time offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelativeOperator {
    Plus,
    Minus,
}

/// A comparison operand: a literal, or an offset from the current time
/// resolved against a caller-supplied clock at plan time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ComparisonValue {
    Absolute(NsdbValue),
    Relative {
        operator: RelativeOperator,
        quantity: i64,
        unit: TimeUnit,
    },
}

impl ComparisonValue {
    /// Resolve to an absolute literal against the given clock
    pub fn resolve(&self, now_ms: Timestamp) -> NsdbValue {
        match self {
            ComparisonValue::Absolute(v) => v.clone(),
            ComparisonValue::Relative {
                operator,
                quantity,
                unit,
            } => {
                let offset = quantity * unit.as_millis();
                let ts = match operator {
                    RelativeOperator::Plus => now_ms + offset,
                    RelativeOperator::Minus => now_ms - offset,
                };
                NsdbValue::Int(ts)
            }
        }
    }

    fn as_absolute(&self) -> Option<&NsdbValue> {
        match self {
            ComparisonValue::Absolute(v) => Some(v),
            ComparisonValue::Relative { .. } => None,
        }
    }
}

/// Recursive filter expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    Equality {
        dimension: String,
        value: ComparisonValue,
    },
    Comparison {
        dimension: String,
        operator: ComparisonOperator,
        value: ComparisonValue,
    },
    /// Inclusive range (`BETWEEN lower AND upper`)
    Range {
        dimension: String,
        lower: ComparisonValue,
        upper: ComparisonValue,
    },
    /// Wildcard match, `$` and `%` each matching zero or more characters
    Like { dimension: String, pattern: String },
    /// Field is absent (`ISNULL`)
    Nullable { dimension: String },
    Not(Box<Expression>),
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
}

impl Expression {
    /// AND-combine two expressions
    pub fn and(self, other: Expression) -> Expression {
        Expression::And(Box::new(self), Box::new(other))
    }

    /// Replace every relative operand with its absolute resolution
    pub fn resolve(&self, now_ms: Timestamp) -> Expression {
        match self {
            Expression::Equality { dimension, value } => Expression::Equality {
                dimension: dimension.clone(),
                value: ComparisonValue::Absolute(value.resolve(now_ms)),
            },
            Expression::Comparison {
                dimension,
                operator,
                value,
            } => Expression::Comparison {
                dimension: dimension.clone(),
                operator: *operator,
                value: ComparisonValue::Absolute(value.resolve(now_ms)),
            },
            Expression::Range {
                dimension,
                lower,
                upper,
            } => Expression::Range {
                dimension: dimension.clone(),
                lower: ComparisonValue::Absolute(lower.resolve(now_ms)),
                upper: ComparisonValue::Absolute(upper.resolve(now_ms)),
            },
            Expression::Like { .. } | Expression::Nullable { .. } => self.clone(),
            Expression::Not(inner) => Expression::Not(Box::new(inner.resolve(now_ms))),
            Expression::And(l, r) => {
                Expression::And(Box::new(l.resolve(now_ms)), Box::new(r.resolve(now_ms)))
            }
            Expression::Or(l, r) => {
                Expression::Or(Box::new(l.resolve(now_ms)), Box::new(r.resolve(now_ms)))
            }
        }
    }

    /// Evaluate this expression against a record.
    ///
    /// Operands must already be resolved: an unresolved relative operand is
    /// incomparable and makes the predicate false, like any mixed-tag
    /// comparison.
    pub fn matches(&self, bit: &Bit) -> bool {
        match self {
            Expression::Equality { dimension, value } => {
                match (bit.field(dimension), value.as_absolute()) {
                    (Some(field), Some(v)) => field.compare(v) == Some(Ordering::Equal),
                    _ => false,
                }
            }
            Expression::Comparison {
                dimension,
                operator,
                value,
            } => match (bit.field(dimension), value.as_absolute()) {
                (Some(field), Some(v)) => match field.compare(v) {
                    Some(ord) => match operator {
                        ComparisonOperator::Less => ord == Ordering::Less,
                        ComparisonOperator::LessOrEqual => ord != Ordering::Greater,
                        ComparisonOperator::Greater => ord == Ordering::Greater,
                        ComparisonOperator::GreaterOrEqual => ord != Ordering::Less,
                    },
                    None => false,
                },
                _ => false,
            },
            Expression::Range {
                dimension,
                lower,
                upper,
            } => match (bit.field(dimension), lower.as_absolute(), upper.as_absolute()) {
                (Some(field), Some(lo), Some(hi)) => {
                    matches!(field.compare(lo), Some(Ordering::Greater | Ordering::Equal))
                        && matches!(field.compare(hi), Some(Ordering::Less | Ordering::Equal))
                }
                _ => false,
            },
            Expression::Like { dimension, pattern } => match bit.field(dimension) {
                Some(NsdbValue::String(s)) => matches_wildcard(&s, pattern),
                _ => false,
            },
            Expression::Nullable { dimension } => bit.field(dimension).is_none(),
            Expression::Not(inner) => !inner.matches(bit),
            Expression::And(l, r) => l.matches(bit) && r.matches(bit),
            Expression::Or(l, r) => l.matches(bit) || r.matches(bit),
        }
    }
}

/// A simple single-field filter used by [`SelectStatement::add_conditions`]
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleFilter {
    pub field: String,
    pub value: Option<NsdbValue>,
    pub operator: FilterOperator,
}

/// Operators accepted by [`SimpleFilter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    Equality,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    Like,
    IsNull,
    IsNotNull,
}

impl SimpleFilter {
    fn to_expression(&self) -> Option<Expression> {
        let dimension = self.field.clone();
        match self.operator {
            FilterOperator::Equality => Some(Expression::Equality {
                dimension,
                value: ComparisonValue::Absolute(self.value.clone()?),
            }),
            FilterOperator::GreaterThan
            | FilterOperator::GreaterOrEqual
            | FilterOperator::LessThan
            | FilterOperator::LessOrEqual => {
                let operator = match self.operator {
                    FilterOperator::GreaterThan => ComparisonOperator::Greater,
                    FilterOperator::GreaterOrEqual => ComparisonOperator::GreaterOrEqual,
                    FilterOperator::LessThan => ComparisonOperator::Less,
                    _ => ComparisonOperator::LessOrEqual,
                };
                Some(Expression::Comparison {
                    dimension,
                    operator,
                    value: ComparisonValue::Absolute(self.value.clone()?),
                })
            }
            FilterOperator::Like => match self.value.clone()? {
                NsdbValue::String(pattern) => Some(Expression::Like { dimension, pattern }),
                _ => None,
            },
            FilterOperator::IsNull => Some(Expression::Nullable { dimension }),
            FilterOperator::IsNotNull => Some(Expression::Not(Box::new(Expression::Nullable {
                dimension,
            }))),
        }
    }
}

impl SelectStatement {
    /// AND-combine an inclusive time range on `field` with the existing
    /// condition, or set it when no condition exists.
    pub fn enrich_with_time_range(mut self, field: &str, from: Timestamp, to: Timestamp) -> Self {
        let range = Expression::Range {
            dimension: field.to_string(),
            lower: ComparisonValue::Absolute(NsdbValue::Int(from)),
            upper: ComparisonValue::Absolute(NsdbValue::Int(to)),
        };
        self.condition = Some(match self.condition.take() {
            Some(existing) => existing.and(range),
            None => range,
        });
        self
    }

    /// Reduce a list of simple filters into a left-folded And and combine
    /// it with the existing condition. Filters that cannot form a valid
    /// expression (e.g. a LIKE on a numeric literal) are skipped.
    pub fn add_conditions(mut self, filters: &[SimpleFilter]) -> Self {
        let mut exprs = filters.iter().filter_map(SimpleFilter::to_expression);
        let folded = match exprs.next() {
            Some(first) => exprs.fold(first, Expression::and),
            None => return self,
        };
        self.condition = Some(match self.condition.take() {
            Some(existing) => existing.and(folded),
            None => folded,
        });
        self
    }

    /// Ascending/Descending iff the ORDER BY targets the timestamp field
    pub fn time_ordering(&self) -> Option<TimeOrdering> {
        self.order.as_ref().and_then(|o| {
            if o.field == TIMESTAMP_FIELD {
                Some(match o.direction {
                    OrderDirection::Asc => TimeOrdering::Ascending,
                    OrderDirection::Desc => TimeOrdering::Descending,
                })
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select(metric: &str) -> SelectStatement {
        SelectStatement {
            db: "db".into(),
            namespace: "ns".into(),
            metric: metric.into(),
            distinct: false,
            fields: FieldSelection::All,
            condition: None,
            group_by: None,
            order: None,
            limit: None,
        }
    }

    #[test]
    fn test_enrich_with_time_range() {
        let s = select("m").enrich_with_time_range("timestamp", 10, 20);
        assert_eq!(
            s.condition,
            Some(Expression::Range {
                dimension: "timestamp".into(),
                lower: ComparisonValue::Absolute(NsdbValue::Int(10)),
                upper: ComparisonValue::Absolute(NsdbValue::Int(20)),
            })
        );

        // a second enrichment ANDs with the existing condition
        let s = s.enrich_with_time_range("timestamp", 30, 40);
        assert!(matches!(s.condition, Some(Expression::And(_, _))));
    }

    #[test]
    fn test_add_conditions_left_fold() {
        let s = select("m").add_conditions(&[
            SimpleFilter {
                field: "host".into(),
                value: Some("h1".into()),
                operator: FilterOperator::Equality,
            },
            SimpleFilter {
                field: "value".into(),
                value: Some(NsdbValue::Int(5)),
                operator: FilterOperator::GreaterThan,
            },
            SimpleFilter {
                field: "city".into(),
                value: None,
                operator: FilterOperator::IsNotNull,
            },
        ]);
        // ((host = h1 AND value > 5) AND NOT(city ISNULL))
        match s.condition.unwrap() {
            Expression::And(left, right) => {
                assert!(matches!(*left, Expression::And(_, _)));
                assert!(matches!(*right, Expression::Not(_)));
            }
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn test_time_ordering() {
        let mut s = select("m");
        assert_eq!(s.time_ordering(), None);

        s.order = Some(Order {
            field: "timestamp".into(),
            direction: OrderDirection::Desc,
        });
        assert_eq!(s.time_ordering(), Some(TimeOrdering::Descending));

        s.order = Some(Order {
            field: "value".into(),
            direction: OrderDirection::Asc,
        });
        assert_eq!(s.time_ordering(), None);
    }

    #[test]
    fn test_relative_resolution() {
        let v = ComparisonValue::Relative {
            operator: RelativeOperator::Minus,
            quantity: 100,
            unit: TimeUnit::Millisecond,
        };
        assert_eq!(v.resolve(1000), NsdbValue::Int(900));

        let v = ComparisonValue::Relative {
            operator: RelativeOperator::Plus,
            quantity: 2,
            unit: TimeUnit::Hour,
        };
        assert_eq!(v.resolve(0), NsdbValue::Int(7_200_000));
    }

    #[test]
    fn test_expression_matches() {
        let bit = Bit::new(150, 2.5)
            .with_dimension("host", "server-01")
            .with_tag("city", "rome");

        let cond = Expression::Range {
            dimension: "timestamp".into(),
            lower: ComparisonValue::Absolute(NsdbValue::Int(100)),
            upper: ComparisonValue::Absolute(NsdbValue::Int(200)),
        }
        .and(Expression::Like {
            dimension: "host".into(),
            pattern: "server$".into(),
        });
        assert!(cond.matches(&bit));

        let cond = Expression::Not(Box::new(Expression::Nullable {
            dimension: "city".into(),
        }));
        assert!(cond.matches(&bit));

        // mixed-tag comparison evaluates false
        let cond = Expression::Equality {
            dimension: "host".into(),
            value: ComparisonValue::Absolute(NsdbValue::Int(1)),
        };
        assert!(!cond.matches(&bit));
    }

    #[test]
    fn test_statement_serde_round_trip() {
        let stmt = Statement::Select(SelectStatement {
            db: "db".into(),
            namespace: "ns".into(),
            metric: "people".into(),
            distinct: true,
            fields: FieldSelection::List(vec![
                Field::plain("name"),
                Field::aggregated("value", Aggregation::Sum),
            ]),
            condition: Some(Expression::Comparison {
                dimension: "timestamp".into(),
                operator: ComparisonOperator::GreaterOrEqual,
                value: ComparisonValue::Relative {
                    operator: RelativeOperator::Minus,
                    quantity: 2,
                    unit: TimeUnit::Hour,
                },
            }),
            group_by: Some(GroupBy::Simple {
                field: "city".into(),
            }),
            order: Some(Order {
                field: "timestamp".into(),
                direction: OrderDirection::Desc,
            }),
            limit: Some(10),
        });

        let encoded = bincode::serialize(&stmt).unwrap();
        let decoded: Statement = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, stmt);
    }
}
