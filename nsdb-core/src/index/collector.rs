//! Aggregating collectors
//!
//! A collector folds matching records into per-group aggregate states that
//! merge associatively across shards: `sum`/`count` add, `min`/`max`
//! compare, `first`/`last` keep the earliest/latest timestamp, and `avg`
//! carries (count, sum) and divides only at finalize.

use crate::statement::Aggregation;
use crate::types::{Bit, NsdbValue};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// How collected records are bucketed
#[derive(Debug, Clone, PartialEq)]
pub enum Grouping {
    /// Single scalar result
    Global,
    /// One bucket per distinct value of a tag
    ByTag(String),
    /// One bucket per timestamp interval, keyed at multiples of it
    ByInterval(i64),
}

/// The key identifying a bucket in the collector's output
#[derive(Debug, Clone, PartialEq)]
pub enum GroupLabel {
    Global,
    Tag(NsdbValue),
    TimeBucket(i64),
}

/// Per-bucket aggregate state
#[derive(Debug, Clone, PartialEq)]
enum AggregateState {
    Count(u64),
    Sum(Option<NsdbValue>),
    Min(Option<NsdbValue>),
    Max(Option<NsdbValue>),
    First(Option<(i64, NsdbValue)>),
    Last(Option<(i64, NsdbValue)>),
    Avg { count: u64, sum: Option<NsdbValue> },
}

impl AggregateState {
    fn new(aggregation: Aggregation) -> Self {
        match aggregation {
            Aggregation::Count => AggregateState::Count(0),
            Aggregation::Sum => AggregateState::Sum(None),
            Aggregation::Min => AggregateState::Min(None),
            Aggregation::Max => AggregateState::Max(None),
            Aggregation::First => AggregateState::First(None),
            Aggregation::Last => AggregateState::Last(None),
            Aggregation::Avg => AggregateState::Avg {
                count: 0,
                sum: None,
            },
        }
    }

    fn update(&mut self, bit: &Bit, field: &str) {
        let value = if field == "*" {
            Some(bit.value.clone())
        } else {
            bit.field(field)
        };

        match self {
            AggregateState::Count(count) => {
                if value.is_some() {
                    *count += 1;
                }
            }
            AggregateState::Sum(sum) => {
                if let Some(v) = value {
                    *sum = add_opt(sum.take(), &v);
                }
            }
            AggregateState::Min(min) => {
                if let Some(v) = value {
                    *min = pick(min.take(), v, Ordering::Less);
                }
            }
            AggregateState::Max(max) => {
                if let Some(v) = value {
                    *max = pick(max.take(), v, Ordering::Greater);
                }
            }
            AggregateState::First(first) => {
                if let Some(v) = value {
                    // earliest timestamp wins, ties keep the incumbent
                    match first {
                        Some((ts, _)) if *ts <= bit.timestamp => {}
                        _ => *first = Some((bit.timestamp, v)),
                    }
                }
            }
            AggregateState::Last(last) => {
                if let Some(v) = value {
                    // latest timestamp wins, ties take the newcomer
                    match last {
                        Some((ts, _)) if *ts > bit.timestamp => {}
                        _ => *last = Some((bit.timestamp, v)),
                    }
                }
            }
            AggregateState::Avg { count, sum } => {
                if let Some(v) = value {
                    *count += 1;
                    *sum = add_opt(sum.take(), &v);
                }
            }
        }
    }

    fn merge(&mut self, other: &AggregateState) {
        match (self, other) {
            (AggregateState::Count(a), AggregateState::Count(b)) => *a += b,
            (AggregateState::Sum(a), AggregateState::Sum(Some(b))) => {
                *a = add_opt(a.take(), b);
            }
            (AggregateState::Min(a), AggregateState::Min(Some(b))) => {
                *a = pick(a.take(), b.clone(), Ordering::Less);
            }
            (AggregateState::Max(a), AggregateState::Max(Some(b))) => {
                *a = pick(a.take(), b.clone(), Ordering::Greater);
            }
            (AggregateState::First(a), AggregateState::First(Some((ts, v)))) => match a {
                Some((existing, _)) if *existing <= *ts => {}
                _ => *a = Some((*ts, v.clone())),
            },
            (AggregateState::Last(a), AggregateState::Last(Some((ts, v)))) => match a {
                Some((existing, _)) if *existing > *ts => {}
                _ => *a = Some((*ts, v.clone())),
            },
            (
                AggregateState::Avg { count: ca, sum: sa },
                AggregateState::Avg { count: cb, sum: sb },
            ) => {
                *ca += cb;
                if let Some(b) = sb {
                    *sa = add_opt(sa.take(), b);
                }
            }
            // empty right-hand states merge as no-ops; mismatched shapes
            // cannot occur for collectors built from the same plan
            _ => {}
        }
    }

    fn finalize(&self) -> Option<NsdbValue> {
        match self {
            AggregateState::Count(count) => Some(NsdbValue::Int(*count as i64)),
            AggregateState::Sum(sum) => sum.clone(),
            AggregateState::Min(min) => min.clone(),
            AggregateState::Max(max) => max.clone(),
            AggregateState::First(first) => first.as_ref().map(|(_, v)| v.clone()),
            AggregateState::Last(last) => last.as_ref().map(|(_, v)| v.clone()),
            AggregateState::Avg { count, sum } => sum.as_ref()?.divide_by(*count),
        }
    }
}

fn add_opt(acc: Option<NsdbValue>, value: &NsdbValue) -> Option<NsdbValue> {
    match acc {
        Some(acc) => acc.add(value),
        None => Some(value.clone()),
    }
}

fn pick(acc: Option<NsdbValue>, value: NsdbValue, keep_when: Ordering) -> Option<NsdbValue> {
    match acc {
        Some(acc) => {
            if value.compare(&acc) == Some(keep_when) {
                Some(value)
            } else {
                Some(acc)
            }
        }
        None => Some(value),
    }
}

/// A mergeable, grouped aggregation over records
#[derive(Debug, Clone)]
pub struct AggregateCollector {
    grouping: Grouping,
    aggregation: Aggregation,
    field: String,
    groups: BTreeMap<Vec<u8>, (GroupLabel, AggregateState)>,
}

impl AggregateCollector {
    pub fn new(grouping: Grouping, aggregation: Aggregation, field: impl Into<String>) -> Self {
        Self {
            grouping,
            aggregation,
            field: field.into(),
            groups: BTreeMap::new(),
        }
    }

    /// Fold one record into its bucket. Records missing the grouping tag
    /// are skipped.
    pub fn collect(&mut self, bit: &Bit) {
        let (key, label) = match &self.grouping {
            Grouping::Global => (Vec::new(), GroupLabel::Global),
            Grouping::ByTag(tag) => match bit.tags.get(tag) {
                Some(value) => (value.to_sort_key(), GroupLabel::Tag(value.clone())),
                None => return,
            },
            Grouping::ByInterval(interval) => {
                let bucket = bit.timestamp.div_euclid(*interval) * interval;
                (
                    NsdbValue::Int(bucket).to_sort_key(),
                    GroupLabel::TimeBucket(bucket),
                )
            }
        };

        let aggregation = self.aggregation;
        let (_, state) = self
            .groups
            .entry(key)
            .or_insert_with(|| (label, AggregateState::new(aggregation)));
        state.update(bit, &self.field);
    }

    /// Merge a collector produced by another shard of the same plan
    pub fn merge(&mut self, other: &AggregateCollector) {
        for (key, (label, state)) in &other.groups {
            let aggregation = self.aggregation;
            let (_, existing) = self
                .groups
                .entry(key.clone())
                .or_insert_with(|| (label.clone(), AggregateState::new(aggregation)));
            existing.merge(state);
        }
    }

    /// Finalize every bucket, in group-key order
    pub fn finalize(&self) -> Vec<(GroupLabel, NsdbValue)> {
        self.groups
            .values()
            .filter_map(|(label, state)| state.finalize().map(|v| (label.clone(), v)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
