//! Time-range sharding
//!
//! A metric's storage is partitioned into locations, aligned inclusive
//! time intervals of `shard.interval` width. Reads derive a timestamp
//! bound from the statement's condition and touch only intersecting
//! locations.

use crate::statement::{ComparisonOperator, Expression};
use crate::types::{Timestamp, TIMESTAMP_FIELD};
use serde::{Deserialize, Serialize};

/// A time-range partition of a metric's storage on a single node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub metric: String,
    pub node: String,
    /// Inclusive lower bound, ms
    pub from: Timestamp,
    /// Inclusive upper bound, ms
    pub to: Timestamp,
}

impl Location {
    /// The location covering `ts`, aligned to multiples of `interval_ms`
    pub fn aligned(metric: &str, node: &str, ts: Timestamp, interval_ms: i64) -> Self {
        let from = ts.div_euclid(interval_ms) * interval_ms;
        Self {
            metric: metric.to_string(),
            node: node.to_string(),
            from,
            to: from + interval_ms - 1,
        }
    }

    /// Directory name under the metric's index path
    pub fn directory_name(&self) -> String {
        format!("{}_{}", self.from, self.to)
    }

    /// Parse a `<from>_<to>` directory name
    pub fn parse_directory_name(name: &str) -> Option<(Timestamp, Timestamp)> {
        // split on the last underscore: `from` may itself be negative
        let (from, to) = name.rsplit_once('_')?;
        let from = from.parse::<i64>().ok()?;
        let to = to.parse::<i64>().ok()?;
        if from > to {
            return None;
        }
        Some((from, to))
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.from && ts <= self.to
    }

    /// Whether this location intersects the given bound
    pub fn intersects(&self, bounds: &TimeRangeBound) -> bool {
        let lower_ok = bounds.to.map_or(true, |to| self.from <= to);
        let upper_ok = bounds.from.map_or(true, |from| self.to >= from);
        lower_ok && upper_ok
    }
}

/// A possibly unbounded inclusive timestamp interval; `None` means open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRangeBound {
    pub from: Option<Timestamp>,
    pub to: Option<Timestamp>,
}

impl TimeRangeBound {
    pub fn unbounded() -> Self {
        Self {
            from: None,
            to: None,
        }
    }

    pub fn between(from: Timestamp, to: Timestamp) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    /// Whether the bound excludes every timestamp
    pub fn is_empty(&self) -> bool {
        matches!((self.from, self.to), (Some(f), Some(t)) if f > t)
    }

    /// Intersection of two bounds (logical AND)
    pub fn intersect(self, other: Self) -> Self {
        Self {
            from: max_opt(self.from, other.from),
            to: min_opt(self.to, other.to),
        }
    }

    /// Convex hull of two bounds (logical OR). Over-approximates a true
    /// union: a gap between the operands is covered.
    pub fn hull(self, other: Self) -> Self {
        Self {
            from: match (self.from, other.from) {
                (Some(a), Some(b)) => Some(a.min(b)),
                _ => None,
            },
            to: match (self.to, other.to) {
                (Some(a), Some(b)) => Some(a.max(b)),
                _ => None,
            },
        }
    }

    /// Derive the timestamp bound a condition implies.
    ///
    /// Relative operands are resolved against `now_ms` first. Predicates
    /// over non-timestamp fields contribute an unbounded interval, and NOT
    /// widens to unbounded; the result may over-approximate but never
    /// under-approximates the matching time range.
    pub fn extract(condition: &Expression, now_ms: Timestamp) -> Self {
        match condition {
            Expression::Equality { dimension, value } if dimension == TIMESTAMP_FIELD => {
                match value.resolve(now_ms).as_i64() {
                    Some(ts) => Self::between(ts, ts),
                    None => Self::unbounded(),
                }
            }
            Expression::Comparison {
                dimension,
                operator,
                value,
            } if dimension == TIMESTAMP_FIELD => match value.resolve(now_ms).as_i64() {
                Some(ts) => match operator {
                    ComparisonOperator::Greater => Self {
                        from: Some(ts + 1),
                        to: None,
                    },
                    ComparisonOperator::GreaterOrEqual => Self {
                        from: Some(ts),
                        to: None,
                    },
                    ComparisonOperator::Less => Self {
                        from: None,
                        to: Some(ts - 1),
                    },
                    ComparisonOperator::LessOrEqual => Self {
                        from: None,
                        to: Some(ts),
                    },
                },
                None => Self::unbounded(),
            },
            Expression::Range {
                dimension,
                lower,
                upper,
            } if dimension == TIMESTAMP_FIELD => {
                match (
                    lower.resolve(now_ms).as_i64(),
                    upper.resolve(now_ms).as_i64(),
                ) {
                    (Some(lo), Some(hi)) => Self::between(lo, hi),
                    _ => Self::unbounded(),
                }
            }
            Expression::And(left, right) => {
                Self::extract(left, now_ms).intersect(Self::extract(right, now_ms))
            }
            Expression::Or(left, right) => {
                Self::extract(left, now_ms).hull(Self::extract(right, now_ms))
            }
            _ => Self::unbounded(),
        }
    }
}

fn max_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (v, None) | (None, v) => v,
    }
}

fn min_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (v, None) | (None, v) => v,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::{ComparisonValue, RelativeOperator, TimeUnit};
    use crate::types::NsdbValue;

    fn ts_cmp(op: ComparisonOperator, ts: i64) -> Expression {
        Expression::Comparison {
            dimension: "timestamp".into(),
            operator: op,
            value: ComparisonValue::Absolute(NsdbValue::Int(ts)),
        }
    }

    #[test]
    fn test_aligned_location() {
        let loc = Location::aligned("m", "node-1", 12, 5);
        assert_eq!((loc.from, loc.to), (10, 14));
        assert!(loc.contains(10));
        assert!(loc.contains(14));
        assert!(!loc.contains(15));

        // negative timestamps align downwards
        let loc = Location::aligned("m", "node-1", -1, 5);
        assert_eq!((loc.from, loc.to), (-5, -1));
    }

    #[test]
    fn test_directory_name_round_trip() {
        let loc = Location::aligned("m", "node-1", 12, 5);
        assert_eq!(loc.directory_name(), "10_14");
        assert_eq!(Location::parse_directory_name("10_14"), Some((10, 14)));
        assert_eq!(Location::parse_directory_name("-5_-1"), Some((-5, -1)));
        assert_eq!(Location::parse_directory_name("14_10"), None);
        assert_eq!(Location::parse_directory_name("segment.nsdb"), None);
    }

    #[test]
    fn test_extract_range_and_comparisons() {
        let expr = Expression::Range {
            dimension: "timestamp".into(),
            lower: ComparisonValue::Absolute(NsdbValue::Int(10)),
            upper: ComparisonValue::Absolute(NsdbValue::Int(20)),
        };
        assert_eq!(
            TimeRangeBound::extract(&expr, 0),
            TimeRangeBound::between(10, 20)
        );

        assert_eq!(
            TimeRangeBound::extract(&ts_cmp(ComparisonOperator::Greater, 10), 0),
            TimeRangeBound {
                from: Some(11),
                to: None
            }
        );
        assert_eq!(
            TimeRangeBound::extract(&ts_cmp(ComparisonOperator::LessOrEqual, 10), 0),
            TimeRangeBound {
                from: None,
                to: Some(10)
            }
        );
    }

    #[test]
    fn test_extract_and_intersects_or_hulls() {
        let and = ts_cmp(ComparisonOperator::GreaterOrEqual, 10)
            .and(ts_cmp(ComparisonOperator::LessOrEqual, 20));
        assert_eq!(TimeRangeBound::extract(&and, 0), TimeRangeBound::between(10, 20));

        let or = Expression::Or(
            Box::new(Expression::Range {
                dimension: "timestamp".into(),
                lower: ComparisonValue::Absolute(NsdbValue::Int(0)),
                upper: ComparisonValue::Absolute(NsdbValue::Int(5)),
            }),
            Box::new(Expression::Range {
                dimension: "timestamp".into(),
                lower: ComparisonValue::Absolute(NsdbValue::Int(50)),
                upper: ComparisonValue::Absolute(NsdbValue::Int(60)),
            }),
        );
        // convex hull covers the gap
        assert_eq!(TimeRangeBound::extract(&or, 0), TimeRangeBound::between(0, 60));
    }

    #[test]
    fn test_extract_non_timestamp_unbounded() {
        let expr = Expression::Equality {
            dimension: "city".into(),
            value: ComparisonValue::Absolute(NsdbValue::String("rome".into())),
        };
        assert_eq!(TimeRangeBound::extract(&expr, 0), TimeRangeBound::unbounded());

        // OR with an unbounded side widens fully
        let or = Expression::Or(
            Box::new(ts_cmp(ComparisonOperator::GreaterOrEqual, 10)),
            Box::new(expr),
        );
        assert_eq!(TimeRangeBound::extract(&or, 0), TimeRangeBound::unbounded());
    }

    #[test]
    fn test_extract_relative() {
        let expr = Expression::Comparison {
            dimension: "timestamp".into(),
            operator: ComparisonOperator::GreaterOrEqual,
            value: ComparisonValue::Relative {
                operator: RelativeOperator::Minus,
                quantity: 100,
                unit: TimeUnit::Millisecond,
            },
        };
        assert_eq!(
            TimeRangeBound::extract(&expr, 1000),
            TimeRangeBound {
                from: Some(900),
                to: None
            }
        );
    }

    #[test]
    fn test_intersects() {
        let loc = Location::aligned("m", "n", 10, 10); // [10, 19]
        assert!(loc.intersects(&TimeRangeBound::unbounded()));
        assert!(loc.intersects(&TimeRangeBound::between(15, 30)));
        assert!(loc.intersects(&TimeRangeBound::between(0, 10)));
        assert!(!loc.intersects(&TimeRangeBound::between(20, 30)));
        assert!(!loc.intersects(&TimeRangeBound::between(0, 9)));
    }

    #[test]
    fn test_empty_intersection() {
        let b = TimeRangeBound::between(0, 5).intersect(TimeRangeBound::between(10, 20));
        assert!(b.is_empty());
    }
}
