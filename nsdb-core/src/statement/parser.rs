//! Parser for the NSDb SQL dialect
//!
//! Supports:
//! - SELECT with DISTINCT, aggregations, WHERE expressions, GROUP BY
//!   (tag or `interval quantity unit`), ORDER BY, LIMIT
//! - INSERT INTO metric [TS n] DIM (k=v, ...) TAGS (k=v, ...) VAL n
//! - DELETE FROM metric WHERE expr
//! - DROP METRIC metric
//! - Relative time literals `now ± quantity unit`
//!
//! The dialect is not standard SQL (TS/DIM/TAGS/VAL, bare interval
//! grouping, relative times), so statements are parsed by a recursive
//! descent over the sqlparser token stream instead of its generic parser.

use super::{
    Aggregation, ComparisonOperator, ComparisonValue, DeleteStatement, DropStatement, Expression,
    Field, FieldSelection, GroupBy, InsertStatement, Order, OrderDirection, RelativeOperator,
    SelectStatement, Statement, TimeUnit,
};
use crate::types::NsdbValue;
use crate::{NsdbError, Result};
use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::BTreeMap;

/// Statement parser for the NSDb dialect
pub struct StatementParser;

impl StatementParser {
    /// Parse a statement in the context of a (db, namespace) session
    pub fn parse(db: &str, namespace: &str, input: &str) -> Result<Statement> {
        let dialect = GenericDialect {};
        let tokens = Tokenizer::new(&dialect, input)
            .tokenize()
            .map_err(|e| NsdbError::Parse(e.to_string()))?;

        let tokens: Vec<Token> = tokens
            .into_iter()
            .filter(|t| !matches!(t, Token::Whitespace(_)))
            .collect();

        let mut parser = TokenStream {
            tokens,
            pos: 0,
            db: db.to_string(),
            namespace: namespace.to_string(),
        };
        let statement = parser.parse_statement()?;
        parser.expect_end()?;
        Ok(statement)
    }
}

struct TokenStream {
    tokens: Vec<Token>,
    pos: usize,
    db: String,
    namespace: String,
}

impl TokenStream {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// Consume the next token if it is the given keyword (case-insensitive)
    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if let Some(Token::Word(w)) = self.peek() {
            if w.value.eq_ignore_ascii_case(keyword) {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(NsdbError::Parse(format!(
                "expected {}, found {}",
                keyword,
                self.describe_next()
            )))
        }
    }

    fn eat_token(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn expect_token(&mut self, token: Token) -> Result<()> {
        if self.eat_token(&token) {
            Ok(())
        } else {
            Err(NsdbError::Parse(format!(
                "expected {}, found {}",
                token,
                self.describe_next()
            )))
        }
    }

    fn expect_identifier(&mut self) -> Result<String> {
        match self.advance() {
            Some(Token::Word(w)) => Ok(w.value),
            other => Err(NsdbError::Parse(format!(
                "expected identifier, found {}",
                Self::describe(other.as_ref())
            ))),
        }
    }

    fn expect_end(&mut self) -> Result<()> {
        match self.peek() {
            None | Some(Token::SemiColon) => Ok(()),
            Some(t) => Err(NsdbError::Parse(format!("unexpected trailing input: {}", t))),
        }
    }

    fn describe_next(&self) -> String {
        Self::describe(self.peek())
    }

    fn describe(token: Option<&Token>) -> String {
        match token {
            Some(t) => t.to_string(),
            None => "end of input".to_string(),
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_statement(&mut self) -> Result<Statement> {
        if self.eat_keyword("SELECT") {
            self.parse_select().map(Statement::Select)
        } else if self.eat_keyword("INSERT") {
            self.parse_insert().map(Statement::Insert)
        } else if self.eat_keyword("DELETE") {
            self.parse_delete().map(Statement::Delete)
        } else if self.eat_keyword("DROP") {
            self.parse_drop().map(Statement::Drop)
        } else {
            Err(NsdbError::Parse(format!(
                "expected SELECT, INSERT, DELETE or DROP, found {}",
                self.describe_next()
            )))
        }
    }

    fn parse_select(&mut self) -> Result<SelectStatement> {
        let distinct = self.eat_keyword("DISTINCT");
        let fields = self.parse_field_selection()?;

        self.expect_keyword("FROM")?;
        let metric = self.expect_identifier()?;

        let condition = if self.eat_keyword("WHERE") {
            Some(self.parse_expression()?)
        } else {
            None
        };

        let group_by = if self.eat_keyword("GROUP") {
            self.expect_keyword("BY")?;
            Some(self.parse_group_by()?)
        } else {
            None
        };

        let order = if self.eat_keyword("ORDER") {
            self.expect_keyword("BY")?;
            let field = self.expect_identifier()?;
            let direction = if self.eat_keyword("DESC") {
                OrderDirection::Desc
            } else {
                self.eat_keyword("ASC");
                OrderDirection::Asc
            };
            Some(Order { field, direction })
        } else {
            None
        };

        let limit = if self.eat_keyword("LIMIT") {
            Some(self.parse_unsigned()?)
        } else {
            None
        };

        Ok(SelectStatement {
            db: self.db.clone(),
            namespace: self.namespace.clone(),
            metric,
            distinct,
            fields,
            condition,
            group_by,
            order,
            limit,
        })
    }

    fn parse_field_selection(&mut self) -> Result<FieldSelection> {
        // a lone `*` projects every field; a `*` inside a list is kept so
        // the planner can reject the combination with a descriptive error
        if self.peek() == Some(&Token::Mul) {
            let from_follows = matches!(
                self.tokens.get(self.pos + 1),
                Some(Token::Word(w)) if w.value.eq_ignore_ascii_case("FROM")
            );
            if from_follows {
                self.pos += 1;
                return Ok(FieldSelection::All);
            }
        }

        let mut fields = Vec::new();
        loop {
            fields.push(self.parse_field()?);
            if !self.eat_token(&Token::Comma) {
                break;
            }
        }
        Ok(FieldSelection::List(fields))
    }

    fn parse_field(&mut self) -> Result<Field> {
        if self.eat_token(&Token::Mul) {
            return Ok(Field::plain("*"));
        }

        let name = self.expect_identifier()?;
        if self.peek() == Some(&Token::LParen) {
            let aggregation = Aggregation::from_name(&name)
                .ok_or_else(|| NsdbError::Parse(format!("unknown aggregation: {}", name)))?;
            self.expect_token(Token::LParen)?;
            let argument = if self.eat_token(&Token::Mul) {
                "*".to_string()
            } else {
                self.expect_identifier()?
            };
            self.expect_token(Token::RParen)?;
            Ok(Field::aggregated(argument, aggregation))
        } else {
            Ok(Field::plain(name))
        }
    }

    fn parse_group_by(&mut self) -> Result<GroupBy> {
        if self.eat_keyword("INTERVAL") {
            let quantity = self.parse_signed()?;
            let unit = self.parse_time_unit()?;
            Ok(GroupBy::Temporal { quantity, unit })
        } else {
            let field = self.expect_identifier()?;
            Ok(GroupBy::Simple { field })
        }
    }

    fn parse_insert(&mut self) -> Result<InsertStatement> {
        self.expect_keyword("INTO")?;
        let metric = self.expect_identifier()?;

        let timestamp = if self.eat_keyword("TS") {
            self.eat_token(&Token::Eq);
            Some(self.parse_signed()?)
        } else {
            None
        };

        let dimensions = if self.eat_keyword("DIM") {
            self.parse_assignments()?
        } else {
            BTreeMap::new()
        };

        let tags = if self.eat_keyword("TAGS") {
            self.parse_assignments()?
        } else {
            BTreeMap::new()
        };

        self.expect_keyword("VAL")?;
        self.eat_token(&Token::Eq);
        let value = self.parse_literal()?;
        if !value.is_numeric() {
            return Err(NsdbError::Parse("VAL must be numeric".into()));
        }

        Ok(InsertStatement {
            db: self.db.clone(),
            namespace: self.namespace.clone(),
            metric,
            timestamp,
            dimensions,
            tags,
            value,
        })
    }

    fn parse_assignments(&mut self) -> Result<BTreeMap<String, NsdbValue>> {
        self.expect_token(Token::LParen)?;
        let mut map = BTreeMap::new();
        loop {
            let key = self.expect_identifier()?;
            self.expect_token(Token::Eq)?;
            let value = self.parse_literal()?;
            map.insert(key, value);
            if !self.eat_token(&Token::Comma) {
                break;
            }
        }
        self.expect_token(Token::RParen)?;
        Ok(map)
    }

    fn parse_delete(&mut self) -> Result<DeleteStatement> {
        self.expect_keyword("FROM")?;
        let metric = self.expect_identifier()?;
        self.expect_keyword("WHERE")?;
        let condition = self.parse_expression()?;

        Ok(DeleteStatement {
            db: self.db.clone(),
            namespace: self.namespace.clone(),
            metric,
            condition,
        })
    }

    fn parse_drop(&mut self) -> Result<DropStatement> {
        self.expect_keyword("METRIC")?;
        let metric = self.expect_identifier()?;
        Ok(DropStatement {
            db: self.db.clone(),
            namespace: self.namespace.clone(),
            metric,
        })
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_expression(&mut self) -> Result<Expression> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expression> {
        let mut expr = self.parse_and()?;
        while self.eat_keyword("OR") {
            let right = self.parse_and()?;
            expr = Expression::Or(Box::new(expr), Box::new(right));
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expression> {
        let mut expr = self.parse_unary()?;
        while self.eat_keyword("AND") {
            let right = self.parse_unary()?;
            expr = Expression::And(Box::new(expr), Box::new(right));
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expression> {
        if self.eat_keyword("NOT") {
            let inner = self.parse_unary()?;
            return Ok(Expression::Not(Box::new(inner)));
        }
        if self.eat_token(&Token::LParen) {
            let inner = self.parse_expression()?;
            self.expect_token(Token::RParen)?;
            return Ok(inner);
        }
        self.parse_predicate()
    }

    fn parse_predicate(&mut self) -> Result<Expression> {
        let dimension = self.expect_identifier()?;

        if self.eat_keyword("ISNULL") {
            return Ok(Expression::Nullable { dimension });
        }
        if self.eat_keyword("ISNOTNULL") {
            return Ok(Expression::Not(Box::new(Expression::Nullable {
                dimension,
            })));
        }
        if self.eat_keyword("LIKE") {
            let pattern = match self.advance() {
                Some(Token::SingleQuotedString(s)) | Some(Token::DoubleQuotedString(s)) => s,
                other => {
                    return Err(NsdbError::Parse(format!(
                        "LIKE pattern must be a string, found {}",
                        Self::describe(other.as_ref())
                    )))
                }
            };
            return Ok(Expression::Like { dimension, pattern });
        }
        if self.eat_keyword("BETWEEN") {
            let lower = self.parse_comparison_value()?;
            self.expect_keyword("AND")?;
            let upper = self.parse_comparison_value()?;
            return Ok(Expression::Range {
                dimension,
                lower,
                upper,
            });
        }

        let operator = match self.advance() {
            Some(Token::Eq) => None,
            Some(Token::Lt) => Some(ComparisonOperator::Less),
            Some(Token::LtEq) => Some(ComparisonOperator::LessOrEqual),
            Some(Token::Gt) => Some(ComparisonOperator::Greater),
            Some(Token::GtEq) => Some(ComparisonOperator::GreaterOrEqual),
            other => {
                return Err(NsdbError::Parse(format!(
                    "unknown operator after {}: {}",
                    dimension,
                    Self::describe(other.as_ref())
                )))
            }
        };
        let value = self.parse_comparison_value()?;

        Ok(match operator {
            None => Expression::Equality { dimension, value },
            Some(operator) => Expression::Comparison {
                dimension,
                operator,
                value,
            },
        })
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    fn parse_comparison_value(&mut self) -> Result<ComparisonValue> {
        if self.eat_keyword("NOW") {
            let operator = match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    RelativeOperator::Plus
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    RelativeOperator::Minus
                }
                // bare `now`
                _ => {
                    return Ok(ComparisonValue::Relative {
                        operator: RelativeOperator::Plus,
                        quantity: 0,
                        unit: TimeUnit::Millisecond,
                    })
                }
            };
            let quantity = self.parse_signed()?;
            let unit = self.parse_time_unit()?;
            return Ok(ComparisonValue::Relative {
                operator,
                quantity,
                unit,
            });
        }

        self.parse_literal().map(ComparisonValue::Absolute)
    }

    fn parse_literal(&mut self) -> Result<NsdbValue> {
        let negative = self.eat_token(&Token::Minus);
        match self.advance() {
            Some(Token::Number(n, _)) => {
                let value = Self::parse_number(&n)?;
                Ok(if negative { negate(value) } else { value })
            }
            Some(Token::SingleQuotedString(s)) | Some(Token::DoubleQuotedString(s)) if !negative => {
                Ok(NsdbValue::String(s))
            }
            other => Err(NsdbError::Parse(format!(
                "expected literal, found {}",
                Self::describe(other.as_ref())
            ))),
        }
    }

    fn parse_number(n: &str) -> Result<NsdbValue> {
        if n.contains('.') || n.contains('e') || n.contains('E') {
            n.parse::<f64>()
                .map(NsdbValue::Float)
                .map_err(|_| NsdbError::Parse(format!("invalid number: {}", n)))
        } else {
            n.parse::<i64>()
                .map(NsdbValue::Int)
                .map_err(|_| NsdbError::Parse(format!("invalid number: {}", n)))
        }
    }

    fn parse_signed(&mut self) -> Result<i64> {
        match self.parse_literal()? {
            NsdbValue::Int(v) => Ok(v),
            other => Err(NsdbError::Parse(format!(
                "expected integer, found {}",
                other
            ))),
        }
    }

    fn parse_unsigned(&mut self) -> Result<usize> {
        let v = self.parse_signed()?;
        usize::try_from(v).map_err(|_| NsdbError::Parse(format!("expected unsigned, found {}", v)))
    }

    fn parse_time_unit(&mut self) -> Result<TimeUnit> {
        match self.advance() {
            Some(Token::Word(w)) => TimeUnit::from_name(&w.value)
                .ok_or_else(|| NsdbError::Parse(format!("unknown time unit: {}", w.value))),
            other => Err(NsdbError::Parse(format!(
                "expected time unit, found {}",
                Self::describe(other.as_ref())
            ))),
        }
    }
}

fn negate(value: NsdbValue) -> NsdbValue {
    match value {
        NsdbValue::Int(v) => NsdbValue::Int(-v),
        NsdbValue::Float(v) => NsdbValue::Float(-v),
        NsdbValue::Decimal(v) => NsdbValue::Decimal(-v),
        NsdbValue::String(s) => NsdbValue::String(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Statement {
        StatementParser::parse("db", "ns", input).unwrap()
    }

    fn parse_select(input: &str) -> SelectStatement {
        match parse(input) {
            Statement::Select(s) => s,
            other => panic!("expected select, got {:?}", other),
        }
    }

    #[test]
    fn test_select_all() {
        let s = parse_select("SELECT * FROM people");
        assert_eq!(s.metric, "people");
        assert_eq!(s.fields, FieldSelection::All);
        assert!(!s.distinct);
        assert!(s.condition.is_none());
    }

    #[test]
    fn test_select_distinct_fields() {
        let s = parse_select("select distinct name, surname from people limit 5");
        assert!(s.distinct);
        assert_eq!(
            s.fields,
            FieldSelection::List(vec![Field::plain("name"), Field::plain("surname")])
        );
        assert_eq!(s.limit, Some(5));
    }

    #[test]
    fn test_select_aggregations() {
        let s = parse_select("SELECT count(*), avg(value) FROM people GROUP BY city");
        assert_eq!(
            s.fields,
            FieldSelection::List(vec![
                Field::aggregated("*", Aggregation::Count),
                Field::aggregated("value", Aggregation::Avg),
            ])
        );
        assert_eq!(
            s.group_by,
            Some(GroupBy::Simple {
                field: "city".into()
            })
        );
    }

    #[test]
    fn test_unknown_aggregation_rejected() {
        let err = StatementParser::parse("db", "ns", "SELECT stddev(value) FROM m").unwrap_err();
        assert!(err.to_string().contains("unknown aggregation"));
    }

    #[test]
    fn test_where_precedence_and_parens() {
        let s = parse_select("SELECT * FROM m WHERE a = 1 OR b = 2 AND c = 3");
        // OR is the weakest binder: a = 1 OR (b = 2 AND c = 3)
        match s.condition.unwrap() {
            Expression::Or(left, right) => {
                assert!(matches!(*left, Expression::Equality { .. }));
                assert!(matches!(*right, Expression::And(_, _)));
            }
            other => panic!("expected Or, got {:?}", other),
        }

        let s = parse_select("SELECT * FROM m WHERE (a = 1 OR b = 2) AND c = 3");
        match s.condition.unwrap() {
            Expression::And(left, right) => {
                assert!(matches!(*left, Expression::Or(_, _)));
                assert!(matches!(*right, Expression::Equality { .. }));
            }
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn test_where_operators() {
        let s = parse_select(
            "SELECT * FROM m WHERE age >= 18 AND name LIKE 'ro$' AND city ISNOTNULL AND NOT height ISNULL",
        );
        let condition = format!("{:?}", s.condition.unwrap());
        assert!(condition.contains("GreaterOrEqual"));
        assert!(condition.contains("Like"));
        assert!(condition.contains("Not"));
        assert!(condition.contains("Nullable"));
    }

    #[test]
    fn test_between() {
        let s = parse_select("SELECT * FROM m WHERE timestamp BETWEEN 10 AND 20");
        assert_eq!(
            s.condition,
            Some(Expression::Range {
                dimension: "timestamp".into(),
                lower: ComparisonValue::Absolute(NsdbValue::Int(10)),
                upper: ComparisonValue::Absolute(NsdbValue::Int(20)),
            })
        );
    }

    #[test]
    fn test_relative_time() {
        let s = parse_select("SELECT * FROM m WHERE timestamp >= now - 100 ms");
        assert_eq!(
            s.condition,
            Some(Expression::Comparison {
                dimension: "timestamp".into(),
                operator: ComparisonOperator::GreaterOrEqual,
                value: ComparisonValue::Relative {
                    operator: RelativeOperator::Minus,
                    quantity: 100,
                    unit: TimeUnit::Millisecond,
                },
            })
        );

        let s = parse_select("SELECT * FROM m WHERE timestamp < NOW + 2 h");
        assert_eq!(
            s.condition,
            Some(Expression::Comparison {
                dimension: "timestamp".into(),
                operator: ComparisonOperator::Less,
                value: ComparisonValue::Relative {
                    operator: RelativeOperator::Plus,
                    quantity: 2,
                    unit: TimeUnit::Hour,
                },
            })
        );
    }

    #[test]
    fn test_temporal_group_by() {
        let s = parse_select("SELECT avg(value) FROM m GROUP BY interval 30 d");
        assert_eq!(
            s.group_by,
            Some(GroupBy::Temporal {
                quantity: 30,
                unit: TimeUnit::Day
            })
        );

        // unit glued to the quantity tokenizes as number + word
        let s = parse_select("SELECT avg(value) FROM m GROUP BY interval 60ms");
        assert_eq!(s.group_by.unwrap().interval_ms(), Some(60));
    }

    #[test]
    fn test_order_by() {
        let s = parse_select("SELECT * FROM m ORDER BY timestamp DESC LIMIT 2");
        assert_eq!(
            s.order,
            Some(Order {
                field: "timestamp".into(),
                direction: OrderDirection::Desc
            })
        );
        let s = parse_select("SELECT * FROM m ORDER BY value");
        assert_eq!(s.order.unwrap().direction, OrderDirection::Asc);
    }

    #[test]
    fn test_insert() {
        let stmt = parse(
            "INSERT INTO people TS 1000 DIM (name = 'john', height = 5.5) TAGS (city = 'rome') VAL 23",
        );
        match stmt {
            Statement::Insert(i) => {
                assert_eq!(i.metric, "people");
                assert_eq!(i.timestamp, Some(1000));
                assert_eq!(i.dimensions.get("name"), Some(&NsdbValue::String("john".into())));
                assert_eq!(i.dimensions.get("height"), Some(&NsdbValue::Float(5.5)));
                assert_eq!(i.tags.get("city"), Some(&NsdbValue::String("rome".into())));
                assert_eq!(i.value, NsdbValue::Int(23));
            }
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[test]
    fn test_insert_minimal() {
        let stmt = parse("INSERT INTO m VAL 1.5");
        match stmt {
            Statement::Insert(i) => {
                assert_eq!(i.timestamp, None);
                assert!(i.dimensions.is_empty());
                assert!(i.tags.is_empty());
                assert_eq!(i.value, NsdbValue::Float(1.5));
            }
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[test]
    fn test_insert_rejects_string_value() {
        assert!(StatementParser::parse("db", "ns", "INSERT INTO m VAL 'x'").is_err());
    }

    #[test]
    fn test_delete() {
        let stmt = parse("DELETE FROM people WHERE timestamp < 100");
        match stmt {
            Statement::Delete(d) => {
                assert_eq!(d.metric, "people");
                assert!(matches!(d.condition, Expression::Comparison { .. }));
            }
            other => panic!("expected delete, got {:?}", other),
        }
        // DELETE without WHERE is rejected
        assert!(StatementParser::parse("db", "ns", "DELETE FROM people").is_err());
    }

    #[test]
    fn test_drop() {
        let stmt = parse("DROP METRIC people");
        assert_eq!(
            stmt,
            Statement::Drop(DropStatement {
                db: "db".into(),
                namespace: "ns".into(),
                metric: "people".into(),
            })
        );
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        assert!(StatementParser::parse("db", "ns", "SELECT * FROM m garbage").is_err());
    }

    #[test]
    fn test_unknown_operator_rejected() {
        assert!(StatementParser::parse("db", "ns", "SELECT * FROM m WHERE a != 1").is_err());
    }

    #[test]
    fn test_negative_literals() {
        let s = parse_select("SELECT * FROM m WHERE value > -1.5");
        assert_eq!(
            s.condition,
            Some(Expression::Comparison {
                dimension: "value".into(),
                operator: ComparisonOperator::Greater,
                value: ComparisonValue::Absolute(NsdbValue::Float(-1.5)),
            })
        );
    }
}
