//! Entity database and register reconciliation
//!
//! One lock guards the poller list and the derived index. Every public
//! operation takes it exactly once; internal helpers work on the locked
//! [`Inner`] so reconciliation of one poll cycle is atomic.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::types::{IndexEntry, PollerEntities};
use crate::diagnostics::ErrorReporter;

/// Context attached to a poll result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollMeta {
    /// First register address of the read; enables address-derived matching
    pub base_address: Option<u32>,
    /// Grouped hex of the raw request frame
    pub request: Option<String>,
    /// Grouped hex of the raw response frame
    pub response: Option<String>,
}

impl PollMeta {
    pub fn with_base_address(base_address: u32) -> Self {
        Self {
            base_address: Some(base_address),
            ..Default::default()
        }
    }

    fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("request".to_string(), self.request.clone().into());
        map.insert("response".to_string(), self.response.clone().into());
        if let Some(base) = self.base_address {
            map.insert("base_address".to_string(), base.into());
        }
        map
    }
}

/// Same entity id declared more than once
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateId {
    pub mbid: String,
    /// Poller whose declaration was shadowed
    pub shadowed_poller: String,
    /// Poller that owns the id in the index
    pub winning_poller: String,
}

/// Outcome of loading or validating an entity configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub pollers: usize,
    pub entities: usize,
    pub generated_ids: usize,
    pub duplicates: Vec<DuplicateId>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.duplicates.is_empty()
    }
}

#[derive(Default)]
struct Inner {
    pollers: Vec<PollerEntities>,
    /// entity id -> (poller position, entity position)
    index: HashMap<String, (usize, usize)>,
}

/// Assign missing ids and build a fresh index
fn prepare(mut pollers: Vec<PollerEntities>) -> (Inner, LoadReport) {
    let mut report = LoadReport {
        pollers: pollers.len(),
        ..Default::default()
    };
    let mut index: HashMap<String, (usize, usize)> = HashMap::new();

    for (pi, poller) in pollers.iter_mut().enumerate() {
        if poller.id.trim().is_empty() {
            poller.id = format!("poller-{}", pi + 1);
            report.generated_ids += 1;
        }
        for (ei, entity) in poller.things.iter_mut().enumerate() {
            if entity.mbid.trim().is_empty() {
                entity.mbid = format!("{}#{}", poller.id, ei);
                report.generated_ids += 1;
            }
            report.entities += 1;
        }
    }

    for (pi, poller) in pollers.iter().enumerate() {
        for (ei, entity) in poller.things.iter().enumerate() {
            if let Some((prev_pi, _)) = index.insert(entity.mbid.clone(), (pi, ei)) {
                report.duplicates.push(DuplicateId {
                    mbid: entity.mbid.clone(),
                    shadowed_poller: pollers[prev_pi].id.clone(),
                    winning_poller: poller.id.clone(),
                });
            }
        }
    }

    (Inner { pollers, index }, report)
}

/// Check a configuration without loading it
pub fn validate_pollers(pollers: &[PollerEntities]) -> LoadReport {
    prepare(pollers.to_vec()).1
}

impl Inner {
    fn update_locked(
        &mut self,
        mbid: &str,
        value: Value,
        meta: Option<&Map<String, Value>>,
        reporter: &ErrorReporter,
    ) -> bool {
        let Some(&(pi, ei)) = self.index.get(mbid) else {
            let context = meta.map(|m| Value::Object(m.clone()));
            reporter.report_missing(mbid, context.as_ref());
            return false;
        };

        let entity = &mut self.pollers[pi].things[ei];
        entity.value = value;
        entity.updated_at = Some(Utc::now());
        if let Some(meta) = meta {
            for (k, v) in meta {
                entity.meta.insert(k.clone(), v.clone());
            }
        }
        true
    }

    fn owner_of(&self, mbid: &str) -> Option<&str> {
        self.index
            .get(mbid)
            .map(|&(pi, _)| self.pollers[pi].id.as_str())
    }
}

pub struct EntityDatabase {
    inner: Mutex<Inner>,
    reporter: Arc<ErrorReporter>,
}

impl EntityDatabase {
    pub fn new(reporter: Arc<ErrorReporter>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            reporter,
        }
    }

    /// Replace all pollers and rebuild the index from scratch
    ///
    /// Duplicate ids keep the last declaration; each one is listed in the report.
    pub fn load(&self, pollers: Vec<PollerEntities>) -> LoadReport {
        let (fresh, report) = prepare(pollers);
        for dup in &report.duplicates {
            warn!(
                "Duplicate entity id {}: {} shadows {}",
                dup.mbid, dup.winning_poller, dup.shadowed_poller
            );
        }

        *self.inner.lock() = fresh;
        info!(
            "Entity index built: {} pollers, {} entities",
            report.pollers, report.entities
        );
        report
    }

    pub fn get_by_entity_id(&self, mbid: &str) -> Option<IndexEntry> {
        let inner = self.inner.lock();
        let &(pi, ei) = inner.index.get(mbid)?;
        let poller = &inner.pollers[pi];
        Some(IndexEntry {
            poller_id: poller.id.clone(),
            entity: poller.things[ei].clone(),
        })
    }

    /// Set value and timestamp, merge metadata
    ///
    /// A miss goes to the error reporter and returns `false`.
    pub fn update_by_entity_id(
        &self,
        mbid: &str,
        value: Value,
        meta: Option<&Map<String, Value>>,
    ) -> bool {
        self.inner
            .lock()
            .update_locked(mbid, value, meta, &self.reporter)
    }

    /// Map a poll result onto entities, returning how many were updated
    ///
    /// Pass 1 uses each entity's `register_index` within `poller_id`. Pass 2
    /// treats `base_address + offset` as an entity id, skipping ids pass 1 already
    /// updated. When `poller_id` is known, pass 2 leaves entities of other
    /// pollers alone.
    pub fn reconcile(&self, poller_id: &str, values: &[u16], meta: &PollMeta) -> usize {
        let meta_map = meta.to_map();
        let mut inner = self.inner.lock();
        let mut updated = 0;
        let mut updated_ids: HashSet<String> = HashSet::new();

        let poller_pos = inner.pollers.iter().position(|p| p.id == poller_id);

        if let Some(pi) = poller_pos {
            let targets: Vec<(String, usize)> = inner.pollers[pi]
                .things
                .iter()
                .filter_map(|e| e.register_index().map(|ri| (e.mbid.clone(), ri)))
                .collect();

            for (mbid, ri) in targets {
                let Some(&raw) = values.get(ri) else {
                    debug!("{}: register_index {} out of range for {}", poller_id, ri, mbid);
                    continue;
                };
                if inner.update_locked(&mbid, Value::from(raw), Some(&meta_map), &self.reporter) {
                    updated += 1;
                    updated_ids.insert(mbid);
                }
            }
        }

        if let Some(base) = meta.base_address {
            for (offset, &raw) in values.iter().enumerate() {
                let mbid = (u64::from(base) + offset as u64).to_string();
                if updated_ids.contains(&mbid) {
                    continue;
                }
                if poller_pos.is_some() {
                    if let Some(owner) = inner.owner_of(&mbid) {
                        if owner != poller_id {
                            debug!("{}: address {} belongs to {}, skipped", poller_id, mbid, owner);
                            continue;
                        }
                    }
                }
                if inner.update_locked(&mbid, Value::from(raw), Some(&meta_map), &self.reporter) {
                    updated += 1;
                    updated_ids.insert(mbid);
                }
            }
        }

        updated
    }

    pub fn list_pollers(&self) -> Vec<PollerEntities> {
        self.inner.lock().pollers.clone()
    }

    /// Entity id -> owning poller and entity copy
    pub fn entity_index_snapshot(&self) -> BTreeMap<String, IndexEntry> {
        let inner = self.inner.lock();
        inner
            .index
            .iter()
            .map(|(mbid, &(pi, ei))| {
                let poller = &inner.pollers[pi];
                (
                    mbid.clone(),
                    IndexEntry {
                        poller_id: poller.id.clone(),
                        entity: poller.things[ei].clone(),
                    },
                )
            })
            .collect()
    }

    pub fn entity_count(&self) -> usize {
        self.inner.lock().index.len()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::entity::types::Entity;
    use std::time::Duration;

    fn database(dir: &tempfile::TempDir) -> EntityDatabase {
        let reporter = ErrorReporter::new(dir.path().join("error.log"), Duration::from_secs(60));
        EntityDatabase::new(Arc::new(reporter))
    }

    fn error_lines(dir: &tempfile::TempDir) -> Vec<String> {
        std::fs::read_to_string(dir.path().join("error.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_reconcile_by_register_index() {
        let dir = tempfile::tempdir().unwrap();
        let db = database(&dir);
        db.load(vec![PollerEntities::new(
            "p1",
            vec![
                Entity::new("a").with_register_index(0),
                Entity::new("b").with_register_index(1),
            ],
        )]);

        let updated = db.reconcile("p1", &[10, 20], &PollMeta::default());
        assert_eq!(updated, 2);
        assert_eq!(db.get_by_entity_id("a").unwrap().entity.value, Value::from(10));
        assert_eq!(db.get_by_entity_id("b").unwrap().entity.value, Value::from(20));
        assert!(db.get_by_entity_id("a").unwrap().entity.updated_at.is_some());
    }

    #[test]
    fn test_out_of_range_index_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let db = database(&dir);
        db.load(vec![PollerEntities::new(
            "p1",
            vec![
                Entity::new("a").with_register_index(0),
                Entity::new("far").with_register_index(9),
            ],
        )]);

        assert_eq!(db.reconcile("p1", &[5], &PollMeta::default()), 1);
        assert_eq!(db.get_by_entity_id("far").unwrap().entity.value, Value::Null);
    }

    #[test]
    fn test_address_fallback_and_meta_merge() {
        let dir = tempfile::tempdir().unwrap();
        let db = database(&dir);
        db.load(vec![PollerEntities::new(
            "p1",
            vec![Entity::new("40000"), Entity::new("40001")],
        )]);

        let meta = PollMeta {
            base_address: Some(40000),
            request: Some("0x00 0x01".to_string()),
            response: None,
        };
        assert_eq!(db.reconcile("p1", &[3, 4], &meta), 2);

        let entity = db.get_by_entity_id("40001").unwrap().entity;
        assert_eq!(entity.value, Value::from(4));
        assert_eq!(entity.meta["base_address"], Value::from(40000));
        assert_eq!(entity.meta["request"], Value::from("0x00 0x01"));
    }

    #[test]
    fn test_fallback_never_overrides_explicit_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let db = database(&dir);
        // "100" is mapped explicitly to position 1; position 0 would resolve to "100" by address
        db.load(vec![PollerEntities::new(
            "p1",
            vec![Entity::new("100").with_register_index(1)],
        )]);

        let updated = db.reconcile("p1", &[7, 8], &PollMeta::with_base_address(100));
        assert_eq!(updated, 1);
        assert_eq!(db.get_by_entity_id("100").unwrap().entity.value, Value::from(8));
    }

    #[test]
    fn test_fallback_reaches_entity_at_explicitly_mapped_position() {
        let dir = tempfile::tempdir().unwrap();
        let db = database(&dir);
        db.load(vec![PollerEntities::new(
            "p1",
            vec![Entity::new("a").with_register_index(0), Entity::new("100")],
        )]);

        let updated = db.reconcile("p1", &[7], &PollMeta::with_base_address(100));
        assert_eq!(updated, 2);
        assert_eq!(db.get_by_entity_id("a").unwrap().entity.value, Value::from(7));
        assert_eq!(db.get_by_entity_id("100").unwrap().entity.value, Value::from(7));
        assert!(error_lines(&dir).is_empty());
    }

    #[test]
    fn test_fallback_scoped_to_known_poller() {
        let dir = tempfile::tempdir().unwrap();
        let db = database(&dir);
        db.load(vec![
            PollerEntities::new("p1", vec![Entity::new("10")]),
            PollerEntities::new("p2", vec![Entity::new("11")]),
        ]);

        // p1 reads 10..=11 but "11" belongs to p2
        assert_eq!(db.reconcile("p1", &[1, 2], &PollMeta::with_base_address(10)), 1);
        assert_eq!(db.get_by_entity_id("11").unwrap().entity.value, Value::Null);

        // An unknown poller falls back to the global index
        assert_eq!(db.reconcile("ghost", &[1, 2], &PollMeta::with_base_address(10)), 2);
        assert!(error_lines(&dir).is_empty());
    }

    #[test]
    fn test_missing_id_reported_once_per_window() {
        let dir = tempfile::tempdir().unwrap();
        let db = database(&dir);
        db.load(vec![PollerEntities::new("p1", vec![])]);

        for _ in 0..5 {
            assert_eq!(db.reconcile("p1", &[1], &PollMeta::with_base_address(500)), 0);
        }
        let lines = error_lines(&dir);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("MBID_NOT_FOUND - 500"));
    }

    #[test]
    fn test_update_by_entity_id_miss_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let db = database(&dir);
        db.load(vec![PollerEntities::new("p1", vec![Entity::new("a")])]);

        assert!(db.update_by_entity_id("a", Value::from("on"), None));
        assert!(!db.update_by_entity_id("zzz", Value::from(1), None));
        assert_eq!(error_lines(&dir).len(), 1);
    }

    #[test]
    fn test_reload_leaves_no_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let db = database(&dir);
        db.load(vec![PollerEntities::new(
            "p1",
            vec![Entity::new("old-1"), Entity::new("old-2")],
        )]);
        db.load(vec![PollerEntities::new("p2", vec![Entity::new("new-1")])]);

        let index = db.entity_index_snapshot();
        assert_eq!(index.keys().collect::<Vec<_>>(), vec!["new-1"]);
        assert!(db.get_by_entity_id("old-1").is_none());
        assert_eq!(db.list_pollers().len(), 1);
    }

    #[test]
    fn test_load_assigns_ids_and_reports_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let db = database(&dir);
        let report = db.load(vec![
            PollerEntities::new("", vec![Entity::new(""), Entity::new("dup")]),
            PollerEntities::new("p2", vec![Entity::new("dup")]),
        ]);

        assert_eq!(report.pollers, 2);
        assert_eq!(report.entities, 3);
        assert_eq!(report.generated_ids, 2);
        assert_eq!(report.duplicates.len(), 1);
        assert_eq!(report.duplicates[0].winning_poller, "p2");
        assert_eq!(report.duplicates[0].shadowed_poller, "poller-1");

        assert!(db.get_by_entity_id("poller-1#0").is_some());
        assert_eq!(db.get_by_entity_id("dup").unwrap().poller_id, "p2");
        assert!(!report.is_clean());
    }
}
