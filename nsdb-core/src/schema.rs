//! Schema registry
//!
//! Schemas are inferred from incoming records, widened as new fields
//! appear, and persisted in a single file per namespace. A field's kind
//! and type never change once set.

use crate::types::{Bit, ValueType, TIMESTAMP_FIELD, VALUE_FIELD};
use crate::{NsdbError, Result};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Role and type of a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Dimension(ValueType),
    Tag(ValueType),
    Timestamp,
    Value(ValueType),
}

impl FieldKind {
    /// The value type carried by fields of this kind
    pub fn value_type(&self) -> ValueType {
        match self {
            FieldKind::Dimension(t) | FieldKind::Tag(t) | FieldKind::Value(t) => *t,
            FieldKind::Timestamp => ValueType::Int,
        }
    }

    /// Whether this field can appear in a GROUP BY
    pub fn is_tag(&self) -> bool {
        matches!(self, FieldKind::Tag(_))
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Dimension(t) => write!(f, "{} dimension", t),
            FieldKind::Tag(t) => write!(f, "{} tag", t),
            FieldKind::Timestamp => write!(f, "timestamp"),
            FieldKind::Value(t) => write!(f, "{} value", t),
        }
    }
}

/// Schema of a metric: the union of fields observed across its records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub metric: String,
    pub fields: BTreeMap<String, FieldKind>,
}

impl Schema {
    /// Infer a schema from a single record
    pub fn from_bit(metric: &str, bit: &Bit) -> Result<Self> {
        if !bit.value.is_numeric() {
            return Err(NsdbError::SchemaConflict {
                metric: metric.to_string(),
                conflicts: vec![format!(
                    "{}: expected a numeric value, got {}",
                    VALUE_FIELD,
                    bit.value.value_type()
                )],
            });
        }

        let mut fields = BTreeMap::new();
        fields.insert(TIMESTAMP_FIELD.to_string(), FieldKind::Timestamp);
        fields.insert(
            VALUE_FIELD.to_string(),
            FieldKind::Value(bit.value.value_type()),
        );
        for (name, value) in &bit.dimensions {
            fields.insert(name.clone(), FieldKind::Dimension(value.value_type()));
        }
        for (name, value) in &bit.tags {
            fields.insert(name.clone(), FieldKind::Tag(value.value_type()));
        }

        Ok(Self {
            metric: metric.to_string(),
            fields,
        })
    }

    /// Look up a field's kind
    pub fn field(&self, name: &str) -> Option<FieldKind> {
        self.fields.get(name).copied()
    }

    /// Every incompatibility between this schema and `other`: fields named
    /// by both whose kind or type differ.
    pub fn conflicts_with(&self, other: &Schema) -> Vec<String> {
        let mut conflicts = Vec::new();
        for (name, kind) in &other.fields {
            if let Some(existing) = self.fields.get(name) {
                if existing != kind {
                    conflicts.push(format!("{}: expected {}, got {}", name, existing, kind));
                }
            }
        }
        conflicts
    }

    /// Widen this schema with the fields of a compatible one
    fn union_with(&mut self, other: &Schema) {
        for (name, kind) in &other.fields {
            self.fields.entry(name.clone()).or_insert(*kind);
        }
    }
}

/// Per-(db, namespace) schema store, persisted one file per namespace
pub struct SchemaRegistry {
    base_path: PathBuf,
    namespaces: RwLock<HashMap<(String, String), HashMap<String, Schema>>>,
}

const SCHEMA_FILE: &str = "schemas.bin";

impl SchemaRegistry {
    /// Create a registry rooted at `<base_path>/schemas`
    pub fn open(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().join("schemas");
        fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            namespaces: RwLock::new(HashMap::new()),
        })
    }

    fn namespace_dir(&self, db: &str, namespace: &str) -> PathBuf {
        self.base_path.join(db).join(namespace)
    }

    fn ensure_loaded(&self, db: &str, namespace: &str) -> Result<()> {
        let key = (db.to_string(), namespace.to_string());
        if self.namespaces.read().contains_key(&key) {
            return Ok(());
        }

        let path = self.namespace_dir(db, namespace).join(SCHEMA_FILE);
        let metrics = if path.exists() {
            let schemas = read_schema_file(&path)?;
            debug!(db, namespace, count = schemas.len(), "loaded schemas");
            schemas
        } else {
            HashMap::new()
        };

        self.namespaces.write().entry(key).or_insert(metrics);
        Ok(())
    }

    fn persist(&self, db: &str, namespace: &str) -> Result<()> {
        let key = (db.to_string(), namespace.to_string());
        let namespaces = self.namespaces.read();
        let metrics = namespaces
            .get(&key)
            .ok_or_else(|| NsdbError::UnknownNamespace(namespace.to_string()))?;

        let dir = self.namespace_dir(db, namespace);
        fs::create_dir_all(&dir)?;
        write_schema_file(&dir.join(SCHEMA_FILE), metrics)
    }

    /// Get a metric's schema, if any
    pub fn get(&self, db: &str, namespace: &str, metric: &str) -> Result<Option<Schema>> {
        self.ensure_loaded(db, namespace)?;
        let key = (db.to_string(), namespace.to_string());
        Ok(self
            .namespaces
            .read()
            .get(&key)
            .and_then(|m| m.get(metric))
            .cloned())
    }

    /// List the metrics of a namespace
    pub fn metrics(&self, db: &str, namespace: &str) -> Result<Vec<String>> {
        self.ensure_loaded(db, namespace)?;
        let key = (db.to_string(), namespace.to_string());
        let mut metrics: Vec<String> = self
            .namespaces
            .read()
            .get(&key)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        metrics.sort();
        Ok(metrics)
    }

    /// Install or widen a metric's schema from an incoming record.
    ///
    /// Fails with `SchemaConflict` listing every incompatible field and
    /// leaves the stored schema unchanged.
    pub fn update_from_record(
        &self,
        db: &str,
        namespace: &str,
        metric: &str,
        bit: &Bit,
    ) -> Result<Schema> {
        let inferred = Schema::from_bit(metric, bit)?;
        self.merge(db, namespace, metric, inferred)
    }

    /// Replace a metric's schema, only if compatible with the stored one
    pub fn update(&self, db: &str, namespace: &str, metric: &str, schema: Schema) -> Result<Schema> {
        self.merge(db, namespace, metric, schema)
    }

    fn merge(&self, db: &str, namespace: &str, metric: &str, incoming: Schema) -> Result<Schema> {
        self.ensure_loaded(db, namespace)?;
        let key = (db.to_string(), namespace.to_string());

        let merged = {
            let mut namespaces = self.namespaces.write();
            let metrics = namespaces.entry(key).or_default();

            match metrics.get_mut(metric) {
                Some(existing) => {
                    let conflicts = existing.conflicts_with(&incoming);
                    if !conflicts.is_empty() {
                        return Err(NsdbError::SchemaConflict {
                            metric: metric.to_string(),
                            conflicts,
                        });
                    }
                    existing.union_with(&incoming);
                    existing.clone()
                }
                None => {
                    info!(db, namespace, metric, "installing schema");
                    metrics.insert(metric.to_string(), incoming.clone());
                    incoming
                }
            }
        };

        self.persist(db, namespace)?;
        Ok(merged)
    }

    /// Remove a metric's schema
    pub fn delete(&self, db: &str, namespace: &str, metric: &str) -> Result<()> {
        self.ensure_loaded(db, namespace)?;
        let key = (db.to_string(), namespace.to_string());
        let removed = self
            .namespaces
            .write()
            .get_mut(&key)
            .and_then(|m| m.remove(metric));
        if removed.is_some() {
            self.persist(db, namespace)?;
        }
        Ok(())
    }

    /// Remove every schema of a namespace, including its persisted file
    pub fn delete_all(&self, db: &str, namespace: &str) -> Result<()> {
        let key = (db.to_string(), namespace.to_string());
        self.namespaces.write().remove(&key);
        let dir = self.namespace_dir(db, namespace);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        info!(db, namespace, "deleted namespace schemas");
        Ok(())
    }
}

/// File layout: 4-byte payload length, bincode payload, CRC32 of the payload
fn write_schema_file(path: &Path, metrics: &HashMap<String, Schema>) -> Result<()> {
    let payload =
        bincode::serialize(metrics).map_err(|e| NsdbError::InvalidFormat(e.to_string()))?;

    let mut buf = BytesMut::with_capacity(payload.len() + 8);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);
    buf.put_u32_le(crc32fast::hash(&payload));

    fs::write(path, &buf)?;
    Ok(())
}

fn read_schema_file(path: &Path) -> Result<HashMap<String, Schema>> {
    let data = fs::read(path)?;
    if data.len() < 8 {
        return Err(NsdbError::InvalidFormat("schema file too short".into()));
    }

    let mut cursor = std::io::Cursor::new(data.as_slice());
    let len = cursor.get_u32_le() as usize;
    if data.len() < 8 + len {
        warn!(path = %path.display(), "truncated schema file");
        return Err(NsdbError::InvalidFormat("truncated schema file".into()));
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
    use crate::types::NsdbValue;
    use tempfile::TempDir;

    fn bit_named(name: NsdbValue) -> Bit {
        let mut bit = Bit::new(100, 1i64);
        bit.dimensions.insert("name".to_string(), name);
        bit
    }

    #[test]
    fn test_infer_and_widen() {
        let dir = TempDir::new().unwrap();
        let registry = SchemaRegistry::open(dir.path()).unwrap();

        let first = Bit::new(1, 1i64).with_dimension("name", "A");
        let schema = registry
            .update_from_record("db", "ns", "people", &first)
            .unwrap();
        assert_eq!(
            schema.field("name"),
            Some(FieldKind::Dimension(ValueType::String))
        );
        assert_eq!(schema.field("timestamp"), Some(FieldKind::Timestamp));
        assert_eq!(schema.field("value"), Some(FieldKind::Value(ValueType::Int)));

        // a record with a new field widens the schema
        let second = Bit::new(2, 2i64).with_dimension("name", "B").with_tag("city", "rome");
        let schema = registry
            .update_from_record("db", "ns", "people", &second)
            .unwrap();
        assert_eq!(schema.field("city"), Some(FieldKind::Tag(ValueType::String)));
        assert_eq!(
            schema.field("name"),
            Some(FieldKind::Dimension(ValueType::String))
        );
    }

    #[test]
    fn test_order_independence() {
        let dir = TempDir::new().unwrap();

        let a = Bit::new(1, 1i64).with_dimension("name", "A");
        let b = Bit::new(2, 2i64).with_tag("city", "rome");

        let r1 = SchemaRegistry::open(dir.path().join("one")).unwrap();
        r1.update_from_record("db", "ns", "m", &a).unwrap();
        let s1 = r1.update_from_record("db", "ns", "m", &b).unwrap();

        let r2 = SchemaRegistry::open(dir.path().join("two")).unwrap();
        r2.update_from_record("db", "ns", "m", &b).unwrap();
        let s2 = r2.update_from_record("db", "ns", "m", &a).unwrap();

        assert_eq!(s1, s2);
    }

    #[test]
    fn test_conflict_leaves_schema_unchanged() {
        let dir = TempDir::new().unwrap();
        let registry = SchemaRegistry::open(dir.path()).unwrap();

        registry
            .update_from_record("db", "ns", "people", &bit_named("A".into()))
            .unwrap();
        let before = registry.get("db", "ns", "people").unwrap().unwrap();

        let err = registry
            .update_from_record("db", "ns", "people", &bit_named(NsdbValue::Int(42)))
            .unwrap_err();
        match err {
            NsdbError::SchemaConflict { metric, conflicts } => {
                assert_eq!(metric, "people");
                assert_eq!(conflicts.len(), 1);
                assert!(conflicts[0].contains("name"));
                assert!(conflicts[0].contains("VARCHAR"));
            }
            other => panic!("expected SchemaConflict, got {:?}", other),
        }

        let after = registry.get("db", "ns", "people").unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let registry = SchemaRegistry::open(dir.path()).unwrap();
            registry
                .update_from_record("db", "ns", "people", &bit_named("A".into()))
                .unwrap();
        }
        let registry = SchemaRegistry::open(dir.path()).unwrap();
        let schema = registry.get("db", "ns", "people").unwrap().unwrap();
        assert_eq!(
            schema.field("name"),
            Some(FieldKind::Dimension(ValueType::String))
        );
        assert_eq!(registry.metrics("db", "ns").unwrap(), vec!["people"]);
    }

    #[test]
    fn test_update_replaces_only_if_compatible() {
        let dir = TempDir::new().unwrap();
        let registry = SchemaRegistry::open(dir.path()).unwrap();

        registry
            .update_from_record("db", "ns", "m", &bit_named("A".into()))
            .unwrap();

        // a compatible schema carrying a new field widens the stored one
        let wider = Schema::from_bit(
            "m",
            &Bit::new(1, 1i64)
                .with_dimension("name", "B")
                .with_tag("city", "rome"),
        )
        .unwrap();
        let merged = registry.update("db", "ns", "m", wider).unwrap();
        assert!(merged.field("city").is_some());

        // an incompatible one is rejected
        let incompatible =
            Schema::from_bit("m", &Bit::new(1, 1i64).with_dimension("name", 42i64)).unwrap();
        assert!(registry.update("db", "ns", "m", incompatible).is_err());
    }

    #[test]
    fn test_delete_and_delete_all() {
        let dir = TempDir::new().unwrap();
        let registry = SchemaRegistry::open(dir.path()).unwrap();

        registry
            .update_from_record("db", "ns", "a", &bit_named("A".into()))
            .unwrap();
        registry
            .update_from_record("db", "ns", "b", &bit_named("B".into()))
            .unwrap();

        registry.delete("db", "ns", "a").unwrap();
        assert!(registry.get("db", "ns", "a").unwrap().is_none());
        assert!(registry.get("db", "ns", "b").unwrap().is_some());

        registry.delete_all("db", "ns").unwrap();
        assert!(registry.get("db", "ns", "b").unwrap().is_none());
    }
}
