//! Shard storage
//!
//! Owns the `index/<db>/<namespace>/<metric>/<from>_<to>/` tree: one
//! directory of locations per metric, each holding a [`TimeSeriesIndex`].
//! Locations are allocated lazily on first write and re-discovered from
//! directory names after a restart. Idle index handles can be passivated;
//! their content stays on disk.

use crate::index::TimeSeriesIndex;
use crate::sharding::{Location, TimeRangeBound};
use crate::types::Timestamp;
use crate::Result;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Identity of a metric within the storage tree
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricKey {
    pub db: String,
    pub namespace: String,
    pub metric: String,
}

impl MetricKey {
    pub fn new(db: &str, namespace: &str, metric: &str) -> Self {
        Self {
            db: db.to_string(),
            namespace: namespace.to_string(),
            metric: metric.to_string(),
        }
    }
}

/// Root of the on-disk index tree
pub struct ShardStorage {
    base_path: PathBuf,
    node: String,
    shard_interval_ms: i64,
    metrics: RwLock<HashMap<MetricKey, Arc<MetricShards>>>,
}

impl ShardStorage {
    /// Open the storage rooted at `<base_path>/index`
    pub fn open(base_path: impl AsRef<Path>, node: &str, shard_interval_ms: i64) -> Result<Self> {
        let base_path = base_path.as_ref().join("index");
        fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            node: node.to_string(),
            shard_interval_ms,
            metrics: RwLock::new(HashMap::new()),
        })
    }

    /// Get (or lazily create) a metric's shard set
    pub fn shards(&self, key: &MetricKey) -> Result<Arc<MetricShards>> {
        if let Some(shards) = self.metrics.read().get(key) {
            shards.touch();
            return Ok(Arc::clone(shards));
        }

        let path = self
            .base_path
            .join(&key.db)
            .join(&key.namespace)
            .join(&key.metric);
        let shards = Arc::new(MetricShards::open(
            path,
            &key.metric,
            &self.node,
            self.shard_interval_ms,
        )?);

        let mut metrics = self.metrics.write();
        let entry = metrics
            .entry(key.clone())
            .or_insert_with(|| Arc::clone(&shards));
        entry.touch();
        Ok(Arc::clone(entry))
    }

    /// Close and delete a metric's indices
    pub fn drop_metric(&self, key: &MetricKey) -> Result<()> {
        self.metrics.write().remove(key);
        let path = self
            .base_path
            .join(&key.db)
            .join(&key.namespace)
            .join(&key.metric);
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        info!(metric = %key.metric, "dropped metric indices");
        Ok(())
    }

    /// Close and delete every index of a namespace
    pub fn drop_namespace(&self, db: &str, namespace: &str) -> Result<()> {
        self.metrics
            .write()
            .retain(|key, _| !(key.db == db && key.namespace == namespace));
        let path = self.base_path.join(db).join(namespace);
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        info!(db, namespace, "dropped namespace indices");
        Ok(())
    }

    /// Close index handles idle for longer than `after`
    pub fn passivate_idle(&self, after: Duration) {
        for (key, shards) in self.metrics.read().iter() {
            if shards.idle_for() >= after && shards.close_handles() {
                debug!(metric = %key.metric, "passivated idle indices");
            }
        }
    }
}

/// A metric's ordered set of locations and their open indices
pub struct MetricShards {
    path: PathBuf,
    metric: String,
    node: String,
    shard_interval_ms: i64,
    /// Locations keyed by interval start
    locations: RwLock<BTreeMap<Timestamp, Location>>,
    /// Open index handles keyed by location directory name
    indices: RwLock<HashMap<String, Arc<TimeSeriesIndex>>>,
    last_access: Mutex<Instant>,
}

impl MetricShards {
    fn open(path: PathBuf, metric: &str, node: &str, shard_interval_ms: i64) -> Result<Self> {
        fs::create_dir_all(&path)?;

        // re-discover locations persisted by earlier runs
        let mut locations = BTreeMap::new();
        for entry in fs::read_dir(&path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match Location::parse_directory_name(&name) {
                Some((from, to)) => {
                    locations.insert(
                        from,
                        Location {
                            metric: metric.to_string(),
                            node: node.to_string(),
                            from,
                            to,
                        },
                    );
                }
                None => warn!(metric, dir = %name, "ignoring unrecognized shard directory"),
            }
        }
        if !locations.is_empty() {
            debug!(metric, count = locations.len(), "re-discovered locations");
        }

        Ok(Self {
            path,
            metric: metric.to_string(),
            node: node.to_string(),
            shard_interval_ms,
            locations: RwLock::new(locations),
            indices: RwLock::new(HashMap::new()),
            last_access: Mutex::new(Instant::now()),
        })
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_access.lock().elapsed()
    }

    /// Close open handles; returns whether any were open
    fn close_handles(&self) -> bool {
        let mut indices = self.indices.write();
        let had_open = !indices.is_empty();
        indices.clear();
        had_open
    }

    /// The location covering a write timestamp, created aligned if absent
    pub fn location_for(&self, ts: Timestamp) -> Location {
        self.touch();
        let mut locations = self.locations.write();
        if let Some((_, location)) = locations.range(..=ts).next_back() {
            if location.contains(ts) {
                return location.clone();
            }
        }
        let location = Location::aligned(&self.metric, &self.node, ts, self.shard_interval_ms);
        locations.insert(location.from, location.clone());
        location
    }

    /// Locations intersecting a read bound, in time order
    pub fn locations_for(&self, bounds: &TimeRangeBound) -> Vec<Location> {
        self.touch();
        if bounds.is_empty() {
            return Vec::new();
        }
        self.locations
            .read()
            .values()
            .filter(|l| l.intersects(bounds))
            .cloned()
            .collect()
    }

    /// Every known location, in time order
    pub fn all_locations(&self) -> Vec<Location> {
        self.locations.read().values().cloned().collect()
    }

    /// The open index of a location, opening it on first use
    pub fn index_for(&self, location: &Location) -> Result<Arc<TimeSeriesIndex>> {
        self.touch();
        let dir = location.directory_name();
        if let Some(index) = self.indices.read().get(&dir) {
            return Ok(Arc::clone(index));
        }

        let index = Arc::new(TimeSeriesIndex::open(self.path.join(&dir))?);
        let mut indices = self.indices.write();
        let entry = indices.entry(dir).or_insert(index);
        Ok(Arc::clone(entry))
    }

    /// Drop cached searchers on every open index of this metric
    pub fn invalidate_searchers(&self) {
        for index in self.indices.read().values() {
            index.invalidate_searchers();
        }
    }
}
