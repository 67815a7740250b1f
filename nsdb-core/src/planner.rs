//! Statement planner
//!
//! Lowers a statement AST plus the metric's schema into a physical plan:
//! a backing index query, projection, sort, limit and optional aggregating
//! collector. Relative time operands are resolved against the supplied
//! clock, so planning is a pure function of (statement, schema, clock).

use crate::index::{AggregateCollector, Grouping, IndexQuery, SortSpec};
use crate::schema::{FieldKind, Schema};
use crate::statement::{
    Aggregation, ComparisonOperator, ComparisonValue, DeleteStatement, Expression, FieldSelection,
    GroupBy, SelectStatement,
};
use crate::types::{NsdbValue, Timestamp};
use crate::{NsdbError, Result};

/// Projected fields of a physical query
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    All,
    Fields(Vec<String>),
}

/// Collector specification for aggregated plans
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorSpec {
    pub grouping: Grouping,
    pub aggregation: Aggregation,
    pub field: String,
}

impl CollectorSpec {
    /// Build a fresh collector for one shard of this plan
    pub fn collector(&self) -> AggregateCollector {
        AggregateCollector::new(self.grouping.clone(), self.aggregation, self.field.clone())
    }
}

/// The lowered, executable representation of a SELECT
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalQuery {
    /// Backing query executed per shard
    pub query: IndexQuery,
    /// Resolved condition, re-applied to merged rows to drop shard-routing
    /// over-approximation false positives
    pub condition: Option<Expression>,
    pub projection: Projection,
    pub distinct: bool,
    pub sort: Option<SortSpec>,
    pub limit: Option<usize>,
    pub collector: Option<CollectorSpec>,
}

/// Statement planner
pub struct StatementPlanner;

impl StatementPlanner {
    /// Plan a SELECT against its schema
    pub fn plan(
        statement: &SelectStatement,
        schema: &Schema,
        now_ms: Timestamp,
        default_limit: usize,
    ) -> Result<PhysicalQuery> {
        let condition = statement
            .condition
            .as_ref()
            .map(|c| c.resolve(now_ms));
        let query = match &condition {
            Some(condition) => Self::lower_condition(condition, schema)?,
            None => IndexQuery::All,
        };

        let (projection, aggregated) = Self::analyze_fields(&statement.fields, schema)?;
        let collector = Self::plan_grouping(statement, schema, aggregated)?;

        let sort = match &statement.order {
            Some(order) => {
                if schema.field(&order.field).is_none() {
                    return Err(NsdbError::Plan(format!(
                        "unknown order field: {}",
                        order.field
                    )));
                }
                Some(SortSpec {
                    field: order.field.clone(),
                    descending: order.direction == crate::statement::OrderDirection::Desc,
                })
            }
            None => None,
        };

        // unbounded non-aggregated reads get the configured safety cap
        let limit = match (statement.limit, &collector) {
            (Some(limit), _) => Some(limit),
            (None, Some(_)) => None,
            (None, None) => Some(default_limit),
        };

        Ok(PhysicalQuery {
            query,
            condition,
            projection,
            distinct: statement.distinct,
            sort,
            limit,
            collector,
        })
    }

    /// Lower a DELETE's condition to its backing query
    pub fn plan_delete(
        statement: &DeleteStatement,
        schema: &Schema,
        now_ms: Timestamp,
    ) -> Result<(IndexQuery, Expression)> {
        let condition = statement.condition.resolve(now_ms);
        let query = Self::lower_condition(&condition, schema)?;
        Ok((query, condition))
    }

    /// Translate a resolved expression into an index query
    pub fn lower_condition(condition: &Expression, schema: &Schema) -> Result<IndexQuery> {
        match condition {
            Expression::Equality { dimension, value } => {
                let kind = Self::known_field(schema, dimension)?;
                let value = Self::absolute(value)?;
                Self::check_type(dimension, kind, &value)?;
                Ok(IndexQuery::Term {
                    field: dimension.clone(),
                    value,
                })
            }
            Expression::Comparison {
                dimension,
                operator,
                value,
            } => {
                let kind = Self::known_field(schema, dimension)?;
                if !kind.value_type().is_numeric() {
                    return Err(NsdbError::Plan(format!(
                        "comparison on non-numeric field: {}",
                        dimension
                    )));
                }
                let value = Self::absolute(value)?;
                Self::check_type(dimension, kind, &value)?;
                Ok(match operator {
                    ComparisonOperator::Greater => IndexQuery::GreaterThan {
                        field: dimension.clone(),
                        value,
                        inclusive: false,
                    },
                    ComparisonOperator::GreaterOrEqual => IndexQuery::GreaterThan {
                        field: dimension.clone(),
                        value,
                        inclusive: true,
                    },
                    ComparisonOperator::Less => IndexQuery::LessThan {
                        field: dimension.clone(),
                        value,
                        inclusive: false,
                    },
                    ComparisonOperator::LessOrEqual => IndexQuery::LessThan {
                        field: dimension.clone(),
                        value,
                        inclusive: true,
                    },
                })
            }
            Expression::Range {
                dimension,
                lower,
                upper,
            } => {
                let kind = Self::known_field(schema, dimension)?;
                if !kind.value_type().is_numeric() {
                    return Err(NsdbError::Plan(format!(
                        "range on non-numeric field: {}",
                        dimension
                    )));
                }
                let lower = Self::absolute(lower)?;
                let upper = Self::absolute(upper)?;
                Self::check_type(dimension, kind, &lower)?;
                Self::check_type(dimension, kind, &upper)?;
                Ok(IndexQuery::Range {
                    field: dimension.clone(),
                    lower,
                    upper,
                })
            }
            Expression::Like { dimension, pattern } => {
                let kind = Self::known_field(schema, dimension)?;
                if kind.value_type() != crate::types::ValueType::String {
                    return Err(NsdbError::Plan(format!(
                        "LIKE on non-string field: {}",
                        dimension
                    )));
                }
                Ok(IndexQuery::Wildcard {
                    field: dimension.clone(),
                    pattern: pattern.clone(),
                })
            }
            Expression::Nullable { dimension } => {
                Self::known_field(schema, dimension)?;
                Ok(IndexQuery::Exists {
                    field: dimension.clone(),
                }
                .negate())
            }
            Expression::Not(inner) => Ok(Self::lower_condition(inner, schema)?.negate()),
            Expression::And(left, right) => Ok(IndexQuery::Bool {
                must: vec![
                    Self::lower_condition(left, schema)?,
                    Self::lower_condition(right, schema)?,
                ],
                should: Vec::new(),
                must_not: Vec::new(),
            }),
            Expression::Or(left, right) => Ok(IndexQuery::Bool {
                must: Vec::new(),
                should: vec![
                    Self::lower_condition(left, schema)?,
                    Self::lower_condition(right, schema)?,
                ],
                must_not: Vec::new(),
            }),
        }
    }

    fn known_field(schema: &Schema, field: &str) -> Result<FieldKind> {
        schema
            .field(field)
            .ok_or_else(|| NsdbError::Plan(format!("unknown field: {}", field)))
    }

    fn absolute(value: &ComparisonValue) -> Result<NsdbValue> {
        match value {
            ComparisonValue::Absolute(v) => Ok(v.clone()),
            ComparisonValue::Relative { .. } => Err(NsdbError::Internal(
                "relative operand survived resolution".into(),
            )),
        }
    }

    fn check_type(field: &str, kind: FieldKind, value: &NsdbValue) -> Result<()> {
        let field_type = kind.value_type();
        let compatible = if field_type.is_numeric() {
            value.is_numeric()
        } else {
            !value.is_numeric()
        };
        if compatible {
            Ok(())
        } else {
            Err(NsdbError::Plan(format!(
                "type mismatch on field {}: expected {}, got {}",
                field,
                field_type,
                value.value_type()
            )))
        }
    }

    /// Split the projection into plain fields and at most one aggregation
    fn analyze_fields(
        fields: &FieldSelection,
        schema: &Schema,
    ) -> Result<(Projection, Option<(String, Aggregation)>)> {
        let list = match fields {
            FieldSelection::All => return Ok((Projection::All, None)),
            FieldSelection::List(list) => list,
        };

        let mut plain = Vec::new();
        let mut aggregated = None;
        for field in list {
            match field.aggregation {
                Some(aggregation) => {
                    if aggregated.is_some() {
                        return Err(NsdbError::Plan(
                            "multiple aggregations are not supported".into(),
                        ));
                    }
                    if field.name != "*" {
                        let kind = Self::known_field(schema, &field.name)?;
                        if aggregation != Aggregation::Count && !kind.value_type().is_numeric() {
                            return Err(NsdbError::Plan(format!(
                                "{} on non-numeric field: {}",
                                aggregation.name(),
                                field.name
                            )));
                        }
                    } else if aggregation != Aggregation::Count {
                        return Err(NsdbError::Plan(format!(
                            "{}(*) is not a valid aggregation",
                            aggregation.name()
                        )));
                    }
                    aggregated = Some((field.name.clone(), aggregation));
                }
                None => {
                    if field.name == "*" {
                        return Err(NsdbError::Plan(
                            "* cannot be combined with other projected fields".into(),
                        ));
                    }
                    Self::known_field(schema, &field.name)?;
                    plain.push(field.name.clone());
                }
            }
        }

        if aggregated.is_some() && !plain.is_empty() {
            return Err(NsdbError::Plan(
                "plain fields cannot be combined with an aggregation".into(),
            ));
        }

        let projection = if plain.is_empty() {
            Projection::All
        } else {
            Projection::Fields(plain)
        };
        Ok((projection, aggregated))
    }

    fn plan_grouping(
        statement: &SelectStatement,
        schema: &Schema,
        aggregated: Option<(String, Aggregation)>,
    ) -> Result<Option<CollectorSpec>> {
        match (&statement.group_by, aggregated) {
            (None, None) => Ok(None),
            (None, Some((field, aggregation))) => {
                if !aggregation.is_global() {
                    return Err(NsdbError::Plan(format!(
                        "{} requires a GROUP BY",
                        aggregation.name()
                    )));
                }
                Ok(Some(CollectorSpec {
                    grouping: Grouping::Global,
                    aggregation,
                    field,
                }))
            }
            (Some(_), None) => Err(NsdbError::Plan(
                "GROUP BY requires an aggregated field".into(),
            )),
            (Some(group_by), Some((field, aggregation))) => {
                let grouping = match group_by {
                    GroupBy::Simple { field: tag } => {
                        let kind = Self::known_field(schema, tag)?;
                        if !kind.is_tag() {
                            return Err(NsdbError::Plan(format!(
                                "GROUP BY on non-tag field: {}",
                                tag
                            )));
                        }
                        Grouping::ByTag(tag.clone())
                    }
                    GroupBy::Temporal { .. } => {
                        let interval = group_by.interval_ms().unwrap_or(0);
                        if interval <= 0 {
                            return Err(NsdbError::Plan(
                                "temporal GROUP BY interval must be positive".into(),
                            ));
                        }
                        Grouping::ByInterval(interval)
                    }
                };
                Ok(Some(CollectorSpec {
                    grouping,
                    aggregation,
                    field,
                }))
            }
        }
    }
}
