//! Per-shard inverted index over time-stamped records
//!
//! Each metric shard owns one index directory. Records are stored whole;
//! dimension, tag and value terms are indexed in ordered per-field
//! dictionaries mapping sort keys to document bitmaps, and timestamps in
//! their own ordered map. Queries combine bitmaps (term, range, wildcard,
//! existence, boolean), and reads run against immutable snapshots that a
//! commit atomically replaces.

mod collector;

pub use collector::{AggregateCollector, GroupLabel, Grouping};

use crate::types::{matches_wildcard, Bit, NsdbValue, TIMESTAMP_FIELD, VALUE_FIELD};
use crate::{NsdbError, Result};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::{Mutex, MutexGuard, RwLock};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// A physical query against a single index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexQuery {
    /// Every live document
    All,
    /// Exact term on a field
    Term { field: String, value: NsdbValue },
    /// Inclusive range on a field
    Range {
        field: String,
        lower: NsdbValue,
        upper: NsdbValue,
    },
    /// Open lower-bounded range
    GreaterThan {
        field: String,
        value: NsdbValue,
        inclusive: bool,
    },
    /// Open upper-bounded range
    LessThan {
        field: String,
        value: NsdbValue,
        inclusive: bool,
    },
    /// Wildcard match over string terms, `$`/`%` matching any substring
    Wildcard { field: String, pattern: String },
    /// Documents carrying the field
    Exists { field: String },
    /// Boolean combination: MUST intersects, SHOULD unions, MUST NOT subtracts
    Bool {
        must: Vec<IndexQuery>,
        should: Vec<IndexQuery>,
        must_not: Vec<IndexQuery>,
    },
}

impl IndexQuery {
    /// Negate a query as a boolean MUST NOT clause
    pub fn negate(self) -> IndexQuery {
        IndexQuery::Bool {
            must: Vec::new(),
            should: Vec::new(),
            must_not: vec![self],
        }
    }
}

/// Sort descriptor for index reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub descending: bool,
}

/// An immutable searchable snapshot of an index
pub struct IndexSnapshot {
    docs: Vec<Bit>,
    live: RoaringBitmap,
    /// Per-field ordered term dictionary (value and attribute fields)
    postings: HashMap<String, BTreeMap<Vec<u8>, RoaringBitmap>>,
    /// Ordered timestamp dictionary
    timestamps: BTreeMap<i64, RoaringBitmap>,
}

impl IndexSnapshot {
    fn empty() -> Self {
        Self {
            docs: Vec::new(),
            live: RoaringBitmap::new(),
            postings: HashMap::new(),
            timestamps: BTreeMap::new(),
        }
    }

    fn from_docs(docs: Vec<Bit>) -> Self {
        let mut snapshot = Self::empty();
        for doc in docs {
            snapshot.add(doc);
        }
        snapshot
    }

    fn add(&mut self, bit: Bit) {
        let id = self.docs.len() as u32;
        self.live.insert(id);
        self.timestamps
            .entry(bit.timestamp)
            .or_default()
            .insert(id);

        let mut index_term = |field: &str, value: &NsdbValue| {
            self.postings
                .entry(field.to_string())
                .or_default()
                .entry(value.to_sort_key())
                .or_default()
                .insert(id);
        };
        index_term(VALUE_FIELD, &bit.value);
        for (name, value) in bit.attributes() {
            index_term(name, value);
        }

        self.docs.push(bit);
    }

    fn live_docs(&self) -> Vec<Bit> {
        self.live
            .iter()
            .map(|id| self.docs[id as usize].clone())
            .collect()
    }

    /// Evaluate a query to a bitmap of live document ids
    fn eval(&self, query: &IndexQuery) -> RoaringBitmap {
        match query {
            IndexQuery::All => self.live.clone(),
            IndexQuery::Term { field, value } => {
                if field == TIMESTAMP_FIELD {
                    match value.as_i64() {
                        Some(ts) => self
                            .timestamps
                            .get(&ts)
                            .map(|b| b & &self.live)
                            .unwrap_or_default(),
                        None => RoaringBitmap::new(),
                    }
                } else {
                    self.postings
                        .get(field)
                        .and_then(|terms| terms.get(&value.to_sort_key()))
                        .map(|b| b & &self.live)
                        .unwrap_or_default()
                }
            }
            IndexQuery::Range {
                field,
                lower,
                upper,
            } => self.eval_range(
                field,
                Bound::Included(lower.clone()),
                Bound::Included(upper.clone()),
            ),
            IndexQuery::GreaterThan {
                field,
                value,
                inclusive,
            } => {
                let bound = if *inclusive {
                    Bound::Included(value.clone())
                } else {
                    Bound::Excluded(value.clone())
                };
                self.eval_range(field, bound, Bound::Unbounded)
            }
            IndexQuery::LessThan {
                field,
                value,
                inclusive,
            } => {
                let bound = if *inclusive {
                    Bound::Included(value.clone())
                } else {
                    Bound::Excluded(value.clone())
                };
                self.eval_range(field, Bound::Unbounded, bound)
            }
            IndexQuery::Wildcard { field, pattern } => {
                let mut acc = RoaringBitmap::new();
                if let Some(terms) = self.postings.get(field) {
                    for (key, bitmap) in terms {
                        // string terms carry the 0x03 tag byte
                        if key.first() == Some(&0x03) {
                            if let Ok(term) = std::str::from_utf8(&key[1..]) {
                                if matches_wildcard(term, pattern) {
                                    acc |= bitmap;
                                }
                            }
                        }
                    }
                }
                acc & &self.live
            }
            IndexQuery::Exists { field } => {
                if field == TIMESTAMP_FIELD {
                    return self.live.clone();
                }
                let mut acc = RoaringBitmap::new();
                if let Some(terms) = self.postings.get(field) {
                    for bitmap in terms.values() {
                        acc |= bitmap;
                    }
                }
                acc & &self.live
            }
            IndexQuery::Bool {
                must,
                should,
                must_not,
            } => {
                let mut acc = if !must.is_empty() {
                    let mut acc = self.eval(&must[0]);
                    for q in &must[1..] {
                        acc &= self.eval(q);
                    }
                    acc
                } else if !should.is_empty() {
                    let mut acc = RoaringBitmap::new();
                    for q in should {
                        acc |= self.eval(q);
                    }
                    acc
                } else {
                    self.live.clone()
                };
                for q in must_not {
                    acc -= self.eval(q);
                }
                acc
            }
        }
    }

    fn eval_range(
        &self,
        field: &str,
        lower: Bound<NsdbValue>,
        upper: Bound<NsdbValue>,
    ) -> RoaringBitmap {
        let mut acc = RoaringBitmap::new();
        if field == TIMESTAMP_FIELD {
            let to_ts = |b: &Bound<NsdbValue>| match b {
                Bound::Included(v) => v.as_i64().map(Bound::Included),
                Bound::Excluded(v) => v.as_i64().map(Bound::Excluded),
                Bound::Unbounded => Some(Bound::Unbounded),
            };
            match (to_ts(&lower), to_ts(&upper)) {
                (Some(lo), Some(hi)) => {
                    for bitmap in self.timestamps.range((lo, hi)).map(|(_, b)| b) {
                        acc |= bitmap;
                    }
                }
                _ => return RoaringBitmap::new(),
            }
        } else if let Some(terms) = self.postings.get(field) {
            let lo = map_bound(lower);
            let hi = map_bound(upper);
            for bitmap in terms.range((lo, hi)).map(|(_, b)| b) {
                acc |= bitmap;
            }
        }
        acc & &self.live
    }

    /// Run a query, optionally top-K sorted, otherwise in index order
    pub fn query(
        &self,
        query: &IndexQuery,
        limit: Option<usize>,
        sort: Option<&SortSpec>,
    ) -> Vec<Bit> {
        let matching = self.eval(query);
        let mut hits: Vec<&Bit> = matching.iter().map(|id| &self.docs[id as usize]).collect();

        if let Some(sort) = sort {
            hits.sort_by(|a, b| compare_rows(a, b, sort));
        }
        if let Some(limit) = limit {
            hits.truncate(limit);
        }
        hits.into_iter().cloned().collect()
    }

    /// Feed every matching record to an aggregating collector
    pub fn collect(&self, query: &IndexQuery, collector: &mut AggregateCollector) {
        for id in self.eval(query) {
            collector.collect(&self.docs[id as usize]);
        }
    }

    /// Number of documents matching the query
    pub fn count(&self, query: &IndexQuery) -> u64 {
        self.eval(query).len()
    }
}

fn map_bound(bound: Bound<NsdbValue>) -> Bound<Vec<u8>> {
    match bound {
        Bound::Included(v) => Bound::Included(v.to_sort_key()),
        Bound::Excluded(v) => Bound::Excluded(v.to_sort_key()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Order two records by a field's sort key; documents missing the field
/// sort last in either direction, ties keep index order.
pub fn compare_rows(a: &Bit, b: &Bit, sort: &SortSpec) -> std::cmp::Ordering {
    let ka = a.field(&sort.field).map(|v| v.to_sort_key());
    let kb = b.field(&sort.field).map(|v| v.to_sort_key());
    match (ka, kb) {
        (Some(ka), Some(kb)) => {
            if sort.descending {
                kb.cmp(&ka)
            } else {
                ka.cmp(&kb)
            }
        }
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    }
}

/// Pending mutation buffered in a writer
enum WriteOp {
    Write(Bit),
    DeleteRecord(Bit),
    DeleteQuery(IndexQuery),
}

/// One shard's index: a searchable snapshot plus an exclusive write path
pub struct TimeSeriesIndex {
    path: PathBuf,
    current: RwLock<Arc<IndexSnapshot>>,
    /// Searcher cache, invalidated by every commit
    searcher: RwLock<Option<Arc<IndexSnapshot>>>,
    writer_lock: Mutex<()>,
}

const SEGMENT_FILE: &str = "segment.nsdb";

impl TimeSeriesIndex {
    /// Open (or create) the index stored in `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let segment = path.join(SEGMENT_FILE);
        let snapshot = if segment.exists() {
            let docs = read_segment(&segment)?;
            debug!(path = %path.display(), docs = docs.len(), "reloaded segment");
            IndexSnapshot::from_docs(docs)
        } else {
            IndexSnapshot::empty()
        };

        Ok(Self {
            path,
            current: RwLock::new(Arc::new(snapshot)),
            searcher: RwLock::new(None),
            writer_lock: Mutex::new(()),
        })
    }

    /// Acquire the index's writer. At most one writer is open at a time;
    /// a second caller blocks until the first commits or is dropped.
    pub fn writer(&self) -> IndexWriter<'_> {
        IndexWriter {
            index: self,
            _guard: self.writer_lock.lock(),
            pending: Vec::new(),
        }
    }

    /// Acquire a searcher over the most recently committed snapshot
    pub fn searcher(&self) -> Arc<IndexSnapshot> {
        if let Some(cached) = self.searcher.read().as_ref() {
            return Arc::clone(cached);
        }
        let snapshot = Arc::clone(&self.current.read());
        *self.searcher.write() = Some(Arc::clone(&snapshot));
        snapshot
    }

    /// Drop the searcher cache; the next read re-acquires the latest snapshot
    pub fn invalidate_searchers(&self) {
        *self.searcher.write() = None;
    }

    /// Remove the index directory and every stored document
    pub fn delete_all(&self) -> Result<()> {
        let _guard = self.writer_lock.lock();
        if self.path.exists() {
            fs::remove_dir_all(&self.path)?;
        }
        *self.current.write() = Arc::new(IndexSnapshot::empty());
        self.invalidate_searchers();
        Ok(())
    }
}

/// Exclusive buffered writer over a [`TimeSeriesIndex`]
pub struct IndexWriter<'a> {
    index: &'a TimeSeriesIndex,
    _guard: MutexGuard<'a, ()>,
    pending: Vec<WriteOp>,
}

impl IndexWriter<'_> {
    /// Buffer a record write after validating it
    pub fn write(&mut self, bit: Bit) -> Result<()> {
        let errors = validate(&bit);
        if !errors.is_empty() {
            return Err(NsdbError::InvalidFormat(errors.join("; ")));
        }
        self.pending.push(WriteOp::Write(bit));
        Ok(())
    }

    /// Buffer the deletion of every document exactly matching the record
    pub fn delete_record(&mut self, bit: Bit) {
        self.pending.push(WriteOp::DeleteRecord(bit));
    }

    /// Buffer a mass-deletion by backing query
    pub fn delete_query(&mut self, query: IndexQuery) {
        self.pending.push(WriteOp::DeleteQuery(query));
    }

    /// Apply pending operations in order, persist the segment, and swap
    /// the searchable snapshot. Cached searchers are invalidated.
    pub fn commit(self) -> Result<()> {
        let mut working = {
            let current = self.index.current.read();
            IndexSnapshot::from_docs(current.live_docs())
        };

        for op in &self.pending {
            match op {
                WriteOp::Write(bit) => working.add(bit.clone()),
                WriteOp::DeleteRecord(bit) => {
                    let matching: Vec<u32> = working
                        .timestamps
                        .get(&bit.timestamp)
                        .map(|b| b & &working.live)
                        .unwrap_or_default()
                        .iter()
                        .filter(|id| &working.docs[*id as usize] == bit)
                        .collect();
                    for id in matching {
                        working.live.remove(id);
                    }
                }
                WriteOp::DeleteQuery(query) => {
                    let matching = working.eval(query);
                    working.live -= matching;
                }
            }
        }

        // compact on commit: the persisted and searchable snapshot holds
        // live documents only
        let committed = IndexSnapshot::from_docs(working.live_docs());
        write_segment(&self.index.path.join(SEGMENT_FILE), &committed.docs)?;

        *self.index.current.write() = Arc::new(committed);
        self.index.invalidate_searchers();
        Ok(())
    }
}

/// Validate a record for indexing, returning every error found
pub fn validate(bit: &Bit) -> Vec<String> {
    let mut errors = Vec::new();
    if !bit.value.is_numeric() {
        errors.push("value must be numeric".to_string());
    }
    for (name, _) in bit.attributes() {
        if name.is_empty() {
            errors.push("empty field name".to_string());
        }
        if name == TIMESTAMP_FIELD || name == VALUE_FIELD {
            errors.push(format!("{} is a reserved field name", name));
        }
    }
    for name in bit.dimensions.keys() {
        if bit.tags.contains_key(name) {
            errors.push(format!("{} is both a dimension and a tag", name));
        }
    }
    errors
}

/// Segment layout: 4-byte payload length, bincode payload, CRC32
fn write_segment(path: &Path, docs: &[Bit]) -> Result<()> {
    let payload = bincode::serialize(docs).map_err(|e| NsdbError::InvalidFormat(e.to_string()))?;

    let mut buf = BytesMut::with_capacity(payload.len() + 8);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);
    buf.put_u32_le(crc32fast::hash(&payload));

    fs::write(path, &buf)?;
    Ok(())
}

fn read_segment(path: &Path) -> Result<Vec<Bit>> {
    let data = fs::read(path)?;
    if data.len() < 8 {
        return Err(NsdbError::InvalidFormat("segment too short".into()));
    }

    let mut cursor = std::io::Cursor::new(data.as_slice());
    let len = cursor.get_u32_le() as usize;
    if data.len() < 8 + len {
        warn!(path = %path.display(), "truncated segment");
        return Err(NsdbError::InvalidFormat("truncated segment".into()));
    }

    let payload = &data[4..4 + len];
    let expected = {
        let mut c = std::io::Cursor::new(&data[4 + len..8 + len]);
        c.get_u32_le()
    };
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(NsdbError::ChecksumMismatch { expected, actual });
    }

    bincode::deserialize(payload).map_err(|e| NsdbError::InvalidFormat(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_bits() -> Vec<Bit> {
        vec![
            Bit::new(10, 1i64)
                .with_dimension("name", "A")
                .with_tag("city", "rome"),
            Bit::new(20, 2i64)
                .with_dimension("name", "B")
                .with_tag("city", "paris"),
            Bit::new(30, 3i64)
                .with_dimension("name", "A")
                .with_tag("city", "rome"),
        ]
    }

    fn populated(dir: &TempDir) -> TimeSeriesIndex {
        let index = TimeSeriesIndex::open(dir.path().join("idx")).unwrap();
        let mut writer = index.writer();
        for bit in sample_bits() {
            writer.write(bit).unwrap();
        }
        writer.commit().unwrap();
        index
    }

    #[test]
    fn test_term_query() {
        let dir = TempDir::new().unwrap();
        let index = populated(&dir);
        let searcher = index.searcher();

        let hits = searcher.query(
            &IndexQuery::Term {
                field: "name".into(),
                value: "A".into(),
            },
            None,
            None,
        );
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|b| b.field("name") == Some("A".into())));
    }

    #[test]
    fn test_timestamp_range_query() {
        let dir = TempDir::new().unwrap();
        let index = populated(&dir);
        let searcher = index.searcher();

        let hits = searcher.query(
            &IndexQuery::Range {
                field: "timestamp".into(),
                lower: NsdbValue::Int(10),
                upper: NsdbValue::Int(20),
            },
            None,
            None,
        );
        let timestamps: Vec<i64> = hits.iter().map(|b| b.timestamp).collect();
        assert_eq!(timestamps, vec![10, 20]);
    }

    #[test]
    fn test_half_open_range() {
        let dir = TempDir::new().unwrap();
        let index = populated(&dir);
        let searcher = index.searcher();

        let hits = searcher.query(
            &IndexQuery::GreaterThan {
                field: "value".into(),
                value: NsdbValue::Int(1),
                inclusive: false,
            },
            None,
            None,
        );
        assert_eq!(hits.len(), 2);

        let hits = searcher.query(
            &IndexQuery::LessThan {
                field: "value".into(),
                value: NsdbValue::Int(2),
                inclusive: true,
            },
            None,
            None,
        );
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_wildcard_and_exists() {
        let dir = TempDir::new().unwrap();
        let index = populated(&dir);
        let searcher = index.searcher();

        let hits = searcher.query(
            &IndexQuery::Wildcard {
                field: "city".into(),
                pattern: "ro$".into(),
            },
            None,
            None,
        );
        assert_eq!(hits.len(), 2);

        let hits = searcher.query(
            &IndexQuery::Exists {
                field: "name".into(),
            }
            .negate(),
            None,
            None,
        );
        assert!(hits.is_empty());
    }

    #[test]
    fn test_bool_combination() {
        let dir = TempDir::new().unwrap();
        let index = populated(&dir);
        let searcher = index.searcher();

        let query = IndexQuery::Bool {
            must: vec![
                IndexQuery::Term {
                    field: "name".into(),
                    value: "A".into(),
                },
                IndexQuery::GreaterThan {
                    field: "timestamp".into(),
                    value: NsdbValue::Int(10),
                    inclusive: false,
                },
            ],
            should: Vec::new(),
            must_not: Vec::new(),
        };
        let hits = searcher.query(&query, None, None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].timestamp, 30);
    }

    #[test]
    fn test_top_k_sorted() {
        let dir = TempDir::new().unwrap();
        let index = populated(&dir);
        let searcher = index.searcher();

        let hits = searcher.query(
            &IndexQuery::All,
            Some(2),
            Some(&SortSpec {
                field: "timestamp".into(),
                descending: true,
            }),
        );
        let timestamps: Vec<i64> = hits.iter().map(|b| b.timestamp).collect();
        assert_eq!(timestamps, vec![30, 20]);
    }

    #[test]
    fn test_delete_record_removes_duplicates() {
        let dir = TempDir::new().unwrap();
        let index = TimeSeriesIndex::open(dir.path().join("idx")).unwrap();
        let duplicate = Bit::new(10, 1i64).with_dimension("name", "A");

        let mut writer = index.writer();
        writer.write(duplicate.clone()).unwrap();
        writer.write(duplicate.clone()).unwrap();
        writer.write(Bit::new(10, 2i64).with_dimension("name", "A")).unwrap();
        writer.commit().unwrap();

        let mut writer = index.writer();
        writer.delete_record(duplicate);
        writer.commit().unwrap();

        let searcher = index.searcher();
        let hits = searcher.query(&IndexQuery::All, None, None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].value, NsdbValue::Int(2));
    }

    #[test]
    fn test_delete_by_query() {
        let dir = TempDir::new().unwrap();
        let index = populated(&dir);

        let mut writer = index.writer();
        writer.delete_query(IndexQuery::Term {
            field: "city".into(),
            value: "rome".into(),
        });
        writer.commit().unwrap();

        let searcher = index.searcher();
        assert_eq!(searcher.count(&IndexQuery::All), 1);
    }

    #[test]
    fn test_searcher_invalidation_on_commit() {
        let dir = TempDir::new().unwrap();
        let index = populated(&dir);

        let before = index.searcher();
        assert_eq!(before.count(&IndexQuery::All), 3);

        let mut writer = index.writer();
        writer.write(Bit::new(40, 4i64)).unwrap();
        writer.commit().unwrap();

        // the old searcher still sees its snapshot; a fresh one sees the commit
        assert_eq!(before.count(&IndexQuery::All), 3);
        assert_eq!(index.searcher().count(&IndexQuery::All), 4);
    }

    #[test]
    fn test_validation_errors() {
        let bit = Bit::new(1, "oops").with_dimension("timestamp", 1i64);
        let errors = validate(&bit);
        assert_eq!(errors.len(), 2);

        let dir = TempDir::new().unwrap();
        let index = TimeSeriesIndex::open(dir.path().join("idx")).unwrap();
        let mut writer = index.writer();
        assert!(writer.write(bit).is_err());
        writer.commit().unwrap();
    }

    #[test]
    fn test_delete_all_removes_directory() {
        let dir = TempDir::new().unwrap();
        let index = populated(&dir);
        assert!(dir.path().join("idx").join(SEGMENT_FILE).exists());

        index.delete_all().unwrap();
        assert!(!dir.path().join("idx").exists());
        assert_eq!(index.searcher().count(&IndexQuery::All), 0);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("idx");
        {
            let index = TimeSeriesIndex::open(&path).unwrap();
            let mut writer = index.writer();
            for bit in sample_bits() {
                writer.write(bit).unwrap();
            }
            writer.commit().unwrap();
        }
        let index = TimeSeriesIndex::open(&path).unwrap();
        assert_eq!(index.searcher().count(&IndexQuery::All), 3);
    }
}
