//! Engine - root handle coordinating schemas, shards and accumulators
//!
//! Reads are planned once, fanned out over the intersecting locations,
//! and merged: flat results are unioned, re-filtered, globally sorted and
//! truncated; aggregated results merge per group key through the
//! collector. Writes and deletes go through the namespace's accumulator
//! and become visible after its next flush.

use crate::accumulator::{AccumulatorActor, AccumulatorHandle, Operation};
use crate::config::NsdbConfig;
use crate::index::{GroupLabel, Grouping, IndexQuery};
use crate::planner::{PhysicalQuery, Projection, StatementPlanner};
use crate::schema::{Schema, SchemaRegistry};
use crate::sharding::TimeRangeBound;
use crate::statement::{
    DeleteStatement, SelectStatement, Statement, TimeOrdering,
};
use crate::storage::{MetricKey, ShardStorage};
use crate::types::{Bit, Timestamp};
use crate::{NsdbError, Result};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Outcome of executing a statement
#[derive(Debug, Clone, PartialEq)]
pub enum StatementResult {
    /// Rows of a SELECT
    SelectExecuted(Vec<Bit>),
    /// An INSERT was accepted by the accumulator (not yet durable)
    InsertAccepted,
    /// A DELETE was accepted by the accumulator (not yet durable)
    DeleteAccepted,
    /// DROP METRIC completed
    MetricDropped,
}

const DEFAULT_NODE: &str = "local";

/// The single-node storage and query engine
pub struct Engine {
    config: NsdbConfig,
    schemas: SchemaRegistry,
    storage: Arc<ShardStorage>,
    accumulators: RwLock<HashMap<(String, String), Arc<AccumulatorHandle>>>,
}

impl Engine {
    /// Open the engine over its base path
    pub fn open(config: NsdbConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.base_path)?;
        let schemas = SchemaRegistry::open(&config.base_path)?;
        let storage = Arc::new(ShardStorage::open(
            &config.base_path,
            DEFAULT_NODE,
            config.shard_interval_ms(),
        )?);

        info!(base_path = %config.base_path.display(), "engine started");
        Ok(Self {
            config,
            schemas,
            storage,
            accumulators: RwLock::new(HashMap::new()),
        })
    }

    fn accumulator(&self, db: &str, namespace: &str) -> Arc<AccumulatorHandle> {
        let key = (db.to_string(), namespace.to_string());
        if let Some(handle) = self.accumulators.read().get(&key) {
            return Arc::clone(handle);
        }
        let mut accumulators = self.accumulators.write();
        let entry = accumulators.entry(key).or_insert_with(|| {
            Arc::new(AccumulatorActor::spawn(
                db,
                namespace,
                Arc::clone(&self.storage),
                self.config.write_scheduler_interval,
                self.config.passivate_after,
            ))
        });
        Arc::clone(entry)
    }

    fn now_ms() -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Execute any statement with the system clock and configured deadline
    pub fn execute(&self, statement: &Statement) -> Result<StatementResult> {
        self.execute_at(statement, Self::now_ms())
    }

    /// Execute with an explicit clock; the read deadline starts now
    pub fn execute_at(&self, statement: &Statement, now_ms: Timestamp) -> Result<StatementResult> {
        match statement {
            Statement::Select(select) => {
                let deadline = Instant::now() + self.config.read_timeout;
                self.query_at(select, now_ms, deadline)
                    .map(StatementResult::SelectExecuted)
            }
            Statement::Insert(insert) => {
                self.write(
                    &insert.db,
                    &insert.namespace,
                    &insert.metric,
                    insert.to_bit(now_ms),
                )?;
                Ok(StatementResult::InsertAccepted)
            }
            Statement::Delete(delete) => {
                self.delete_at(delete, now_ms)?;
                Ok(StatementResult::DeleteAccepted)
            }
            Statement::Drop(drop) => {
                self.drop_metric(&drop.db, &drop.namespace, &drop.metric)?;
                Ok(StatementResult::MetricDropped)
            }
        }
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Validate a record against the metric's schema (installing or
    /// widening it) and enqueue the write. The returned acknowledgement
    /// does not imply durability; the record is visible after the next
    /// accumulator flush.
    pub fn write(&self, db: &str, namespace: &str, metric: &str, bit: Bit) -> Result<()> {
        self.schemas.update_from_record(db, namespace, metric, &bit)?;
        self.accumulator(db, namespace).enqueue(Operation::Write {
            metric: metric.to_string(),
            bit,
        })
    }

    /// Enqueue the deletion of every record exactly matching `bit`
    pub fn delete_record(&self, db: &str, namespace: &str, metric: &str, bit: Bit) -> Result<()> {
        self.require_schema(db, namespace, metric)?;
        self.accumulator(db, namespace)
            .enqueue(Operation::DeleteByRecord {
                metric: metric.to_string(),
                bit,
            })
    }

    fn delete_at(&self, statement: &DeleteStatement, now_ms: Timestamp) -> Result<()> {
        let schema = self.require_schema(&statement.db, &statement.namespace, &statement.metric)?;
        let (query, condition) = StatementPlanner::plan_delete(statement, &schema, now_ms)?;

        let key = MetricKey::new(&statement.db, &statement.namespace, &statement.metric);
        let shards = self.storage.shards(&key)?;
        let bounds = TimeRangeBound::extract(&condition, now_ms);
        let accumulator = self.accumulator(&statement.db, &statement.namespace);
        for location in shards.locations_for(&bounds) {
            accumulator.enqueue(Operation::DeleteByQuery {
                metric: statement.metric.clone(),
                location,
                query: query.clone(),
            })?;
        }
        Ok(())
    }

    /// Close and remove a metric's indices, schema and pending buffer
    pub fn drop_metric(&self, db: &str, namespace: &str, metric: &str) -> Result<()> {
        self.require_schema(db, namespace, metric)?;
        self.accumulator(db, namespace).forget_metric(metric)?;
        self.storage
            .drop_metric(&MetricKey::new(db, namespace, metric))?;
        self.schemas.delete(db, namespace, metric)?;
        info!(db, namespace, metric, "metric dropped");
        Ok(())
    }

    /// Remove a namespace: its schemas, indices and accumulator
    pub fn drop_namespace(&self, db: &str, namespace: &str) -> Result<()> {
        let key = (db.to_string(), namespace.to_string());
        if let Some(handle) = self.accumulators.write().remove(&key) {
            handle.shutdown();
        }
        self.storage.drop_namespace(db, namespace)?;
        self.schemas.delete_all(db, namespace)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    fn require_schema(&self, db: &str, namespace: &str, metric: &str) -> Result<Schema> {
        self.schemas
            .get(db, namespace, metric)?
            .ok_or_else(|| NsdbError::UnknownMetric(metric.to_string()))
    }

    /// Execute a SELECT with the system clock
    pub fn query(&self, statement: &SelectStatement) -> Result<Vec<Bit>> {
        let deadline = Instant::now() + self.config.read_timeout;
        self.query_at(statement, Self::now_ms(), deadline)
    }

    /// Execute a SELECT with an explicit clock and deadline
    pub fn query_at(
        &self,
        statement: &SelectStatement,
        now_ms: Timestamp,
        deadline: Instant,
    ) -> Result<Vec<Bit>> {
        let schema = self.require_schema(&statement.db, &statement.namespace, &statement.metric)?;
        let plan = StatementPlanner::plan(
            statement,
            &schema,
            now_ms,
            self.config.default_limit,
        )?;

        let key = MetricKey::new(&statement.db, &statement.namespace, &statement.metric);
        let shards = self.storage.shards(&key)?;
        let bounds = plan
            .condition
            .as_ref()
            .map(|c| TimeRangeBound::extract(c, now_ms))
            .unwrap_or_else(TimeRangeBound::unbounded);
        let mut locations = shards.locations_for(&bounds);

        match &plan.collector {
            Some(spec) => {
                let mut merged = spec.collector();
                for location in &locations {
                    self.check_deadline(deadline)?;
                    let searcher = shards.index_for(location)?.searcher();
                    let mut partial = spec.collector();
                    searcher.collect(&plan.query, &mut partial);
                    merged.merge(&partial);
                }
                debug!(metric = %statement.metric, shards = locations.len(), "aggregated query");
                Ok(Self::collector_rows(&merged.finalize(), spec.grouping.clone(), &plan))
            }
            None => {
                // with a timestamp sort over time-disjoint shards the scan
                // can stop as soon as the leading shards fill the limit
                let time_ordering = statement.time_ordering();
                if time_ordering == Some(TimeOrdering::Descending) {
                    locations.reverse();
                }

                let mut rows: Vec<Bit> = Vec::new();
                for location in &locations {
                    self.check_deadline(deadline)?;
                    let searcher = shards.index_for(location)?.searcher();
                    let per_shard_limit = if statement.distinct { None } else { plan.limit };
                    let hits = searcher.query(&plan.query, per_shard_limit, plan.sort.as_ref());
                    rows.extend(
                        hits.into_iter()
                            .filter(|bit| Self::post_filter(&plan, bit)),
                    );

                    if time_ordering.is_some() && !plan.distinct {
                        if let Some(limit) = plan.limit {
                            if rows.len() >= limit {
                                break;
                            }
                        }
                    }
                }

                if let Some(sort) = &plan.sort {
                    rows.sort_by(|a, b| crate::index::compare_rows(a, b, sort));
                }
                let mut rows: Vec<Bit> = rows
                    .into_iter()
                    .map(|bit| Self::project(bit, &plan.projection))
                    .collect();
                if plan.distinct {
                    rows = Self::distinct(rows);
                }
                if let Some(limit) = plan.limit {
                    rows.truncate(limit);
                }
                debug!(metric = %statement.metric, shards = locations.len(), rows = rows.len(), "query");
                Ok(rows)
            }
        }
    }

    fn check_deadline(&self, deadline: Instant) -> Result<()> {
        if Instant::now() > deadline {
            Err(NsdbError::Timeout(self.config.read_timeout))
        } else {
            Ok(())
        }
    }

    fn post_filter(plan: &PhysicalQuery, bit: &Bit) -> bool {
        plan.condition.as_ref().map_or(true, |c| c.matches(bit))
    }

    fn project(bit: Bit, projection: &Projection) -> Bit {
        match projection {
            Projection::All => bit,
            Projection::Fields(names) => {
                let keep: HashSet<&str> = names.iter().map(String::as_str).collect();
                Bit {
                    timestamp: bit.timestamp,
                    value: bit.value,
                    dimensions: bit
                        .dimensions
                        .into_iter()
                        .filter(|(k, _)| keep.contains(k.as_str()))
                        .collect(),
                    tags: bit
                        .tags
                        .into_iter()
                        .filter(|(k, _)| keep.contains(k.as_str()))
                        .collect(),
                }
            }
        }
    }

    /// Keep the first row per distinct (value, dimensions, tags); the
    /// timestamp does not participate in distinctness.
    fn distinct(rows: Vec<Bit>) -> Vec<Bit> {
        let mut seen: HashSet<Vec<u8>> = HashSet::new();
        rows.into_iter()
            .filter(|bit| {
                match bincode::serialize(&(&bit.value, &bit.dimensions, &bit.tags)) {
                    Ok(key) => seen.insert(key),
                    Err(_) => true,
                }
            })
            .collect()
    }

    /// Materialize finalized collector buckets as result rows
    fn collector_rows(
        buckets: &[(GroupLabel, crate::types::NsdbValue)],
        grouping: Grouping,
        plan: &PhysicalQuery,
    ) -> Vec<Bit> {
        let mut rows: Vec<Bit> = buckets
            .iter()
            .map(|(label, value)| match (label, &grouping) {
                (GroupLabel::Tag(tag_value), Grouping::ByTag(tag)) => {
                    Bit::new(0, value.clone()).with_tag(tag.clone(), tag_value.clone())
                }
                (GroupLabel::TimeBucket(bucket), _) => Bit::new(*bucket, value.clone()),
                _ => Bit::new(0, value.clone()),
            })
            .collect();

        if let Some(sort) = &plan.sort {
            rows.sort_by(|a, b| crate::index::compare_rows(a, b, sort));
        }
        if let Some(limit) = plan.limit {
            rows.truncate(limit);
        }
        rows
    }

    // ------------------------------------------------------------------
    // Pass-throughs
    // ------------------------------------------------------------------

    /// The metric's schema, without planning
    pub fn get_schema(&self, db: &str, namespace: &str, metric: &str) -> Result<Schema> {
        self.require_schema(db, namespace, metric)
    }

    /// The metrics of a namespace
    pub fn get_metrics(&self, db: &str, namespace: &str) -> Result<Vec<String>> {
        self.schemas.metrics(db, namespace)
    }

    /// Total stored records of a metric across its shards
    pub fn get_count(&self, db: &str, namespace: &str, metric: &str) -> Result<u64> {
        self.require_schema(db, namespace, metric)?;
        let shards = self.storage.shards(&MetricKey::new(db, namespace, metric))?;
        let mut total = 0;
        for location in shards.all_locations() {
            total += shards.index_for(&location)?.searcher().count(&IndexQuery::All);
        }
        Ok(total)
    }

    /// Force every accumulator to flush, making pending writes visible
    pub fn flush(&self) -> Result<()> {
        let handles: Vec<Arc<AccumulatorHandle>> =
            self.accumulators.read().values().cloned().collect();
        for handle in handles {
            handle.flush()?;
        }
        Ok(())
    }

    /// Drain every accumulator and stop their actors
    pub fn shutdown(&self) {
        let handles: Vec<Arc<AccumulatorHandle>> = {
            let mut accumulators = self.accumulators.write();
            accumulators.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.shutdown();
        }
        info!("engine stopped");
    }
}
