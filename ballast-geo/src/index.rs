//! Geohash-bucketed index of live entity positions.
//!
//! Entities live in exactly one cell at the configured precision. Radius
//! queries scan the query point's cell, then rings of surrounding cells, and
//! stop as soon as the scanned block provably covers the radius. Past the
//! configured ring limit, near a pole, or when the block would wrap the whole
//! longitude range, the query falls back to a full scan.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use ballast_core::constants::{DEFAULT_GEOHASH_PRECISION, DEFAULT_MAX_SEARCH_RINGS};
use ballast_core::{system_clock, FieldPatch, GeoError, SharedClock, Timestamp};
use serde::{Deserialize, Serialize};

use crate::distance::{haversine_km, KM_PER_DEGREE};
use crate::geohash::{self, GeoBounds};

/// Great-circle distance to a meridian runs slightly shorter than the
/// parallel, so ring coverage is discounted by this factor.
const COVERAGE_MARGIN: f64 = 0.98;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SpatialConfig {
    /// Geohash length used for cells
    pub precision: usize,
    /// Rings scanned before falling back to a full scan
    pub max_search_rings: u32,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            precision: DEFAULT_GEOHASH_PRECISION,
            max_search_rings: DEFAULT_MAX_SEARCH_RINGS,
        }
    }
}

impl SpatialConfig {
    /// Load configuration from environment variables.
    ///
    /// - `BALLAST_SPATIAL_PRECISION`
    /// - `BALLAST_SPATIAL_MAX_RINGS`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            precision: std::env::var("BALLAST_SPATIAL_PRECISION")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.precision),
            max_search_rings: std::env::var("BALLAST_SPATIAL_MAX_RINGS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_search_rings),
        }
    }

    pub fn with_precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_max_search_rings(mut self, rings: u32) -> Self {
        self.max_search_rings = rings;
        self
    }

    pub fn validate(&self) -> Result<(), GeoError> {
        geohash::validate_precision(self.precision)
    }
}

// ============================================================================
// ENTRIES AND RESULTS
// ============================================================================

/// One tracked entity.
#[derive(Debug, Clone, Serialize)]
pub struct SpatialEntry {
    pub id: String,
    pub lat: f64,
    pub lng: f64,
    pub cell: String,
    pub metadata: FieldPatch,
    pub last_updated: Timestamp,
    #[serde(skip)]
    updated_at: Instant,
}

/// A query hit, ranked nearest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyEntity {
    pub id: String,
    pub distance_km: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpatialStats {
    pub name: String,
    pub entities: usize,
    pub cells: usize,
    pub precision: usize,
    pub queries: u64,
    pub full_scans: u64,
}

#[derive(Debug, Default)]
struct IndexInner {
    entries: HashMap<String, SpatialEntry>,
    cells: HashMap<String, HashSet<String>>,
}

impl IndexInner {
    fn detach(&mut self, cell: &str, id: &str) {
        if let Some(members) = self.cells.get_mut(cell) {
            members.remove(id);
            if members.is_empty() {
                self.cells.remove(cell);
            }
        }
    }

    fn remove(&mut self, id: &str) -> Option<SpatialEntry> {
        let entry = self.entries.remove(id)?;
        self.detach(&entry.cell, id);
        Some(entry)
    }
}

fn rank(hits: &mut [NearbyEntity]) {
    hits.sort_by(|a, b| {
        a.distance_km
            .total_cmp(&b.distance_km)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Distance from any point of the centre cell to anything outside the block
/// of `ring` rings around it, or `None` when the block touches a pole or
/// spans every longitude.
fn ring_coverage_km(origin: &GeoBounds, ring: u32) -> Option<f64> {
    let r = f64::from(ring);
    if (2.0 * r + 1.0) * origin.lng_span() >= 360.0 {
        return None;
    }
    let reach = origin.min_lat.abs().max(origin.max_lat.abs()) + r * origin.lat_span();
    if reach >= 90.0 {
        return None;
    }
    let height_km = origin.lat_span() * KM_PER_DEGREE;
    let width_km = origin.lng_span() * KM_PER_DEGREE * reach.to_radians().cos();
    Some(r * height_km.min(width_km) * COVERAGE_MARGIN)
}

// ============================================================================
// SPATIAL INDEX
// ============================================================================

pub struct SpatialIndex {
    name: String,
    config: SpatialConfig,
    clock: SharedClock,
    inner: RwLock<IndexInner>,
    queries: AtomicU64,
    full_scans: AtomicU64,
}

impl SpatialIndex {
    pub fn new(name: impl Into<String>, config: SpatialConfig) -> Result<Self, GeoError> {
        Self::with_clock(name, config, system_clock())
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: SpatialConfig,
        clock: SharedClock,
    ) -> Result<Self, GeoError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            clock,
            inner: RwLock::new(IndexInner::default()),
            queries: AtomicU64::new(0),
            full_scans: AtomicU64::new(0),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SpatialConfig {
        &self.config
    }

    /// Insert or move an entity. Returns the cell it now occupies.
    pub fn upsert(
        &self,
        id: impl Into<String>,
        lat: f64,
        lng: f64,
        metadata: FieldPatch,
    ) -> Result<String, GeoError> {
        let id = id.into();
        let cell = geohash::encode(lat, lng, self.config.precision)?;
        let entry = SpatialEntry {
            id: id.clone(),
            lat,
            lng,
            cell: cell.clone(),
            metadata,
            last_updated: self.clock.wall(),
            updated_at: self.clock.now(),
        };

        let mut inner = self.write();
        let previous_cell = inner.entries.get(&id).map(|prev| prev.cell.clone());
        if let Some(previous_cell) = previous_cell.filter(|prev| *prev != cell) {
            inner.detach(&previous_cell, &id);
        }
        inner
            .cells
            .entry(cell.clone())
            .or_default()
            .insert(id.clone());
        inner.entries.insert(id, entry);

        Ok(cell)
    }

    pub fn remove(&self, id: &str) -> Option<SpatialEntry> {
        self.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<SpatialEntry> {
        self.read().entries.get(id).cloned()
    }

    /// Number of tracked entities.
    pub fn size(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of non-empty cells.
    pub fn cell_count(&self) -> usize {
        self.read().cells.len()
    }

    /// Drop entities not updated within `max_age`. Returns how many went.
    pub fn prune_stale(&self, max_age: Duration) -> usize {
        let now = self.clock.now();
        let mut inner = self.write();
        let stale: Vec<String> = inner
            .entries
            .values()
            .filter(|entry| now.saturating_duration_since(entry.updated_at) > max_age)
            .map(|entry| entry.id.clone())
            .collect();
        for id in &stale {
            inner.remove(id);
        }

        if !stale.is_empty() {
            tracing::debug!(index = %self.name, pruned = stale.len(), "Pruned stale entities");
        }
        stale.len()
    }

    /// Every entity within `radius_km` of the point, nearest first.
    pub fn query_radius(
        &self,
        lat: f64,
        lng: f64,
        radius_km: f64,
    ) -> Result<Vec<NearbyEntity>, GeoError> {
        self.search(lat, lng, radius_km, None)
    }

    /// The `limit` nearest entities within `radius_km`, nearest first.
    pub fn nearest(
        &self,
        lat: f64,
        lng: f64,
        radius_km: f64,
        limit: usize,
    ) -> Result<Vec<NearbyEntity>, GeoError> {
        if limit == 0 {
            geohash::validate_coordinate(lat, lng)?;
            return Ok(Vec::new());
        }
        self.search(lat, lng, radius_km, Some(limit))
    }

    fn search(
        &self,
        lat: f64,
        lng: f64,
        radius_km: f64,
        limit: Option<usize>,
    ) -> Result<Vec<NearbyEntity>, GeoError> {
        let origin_cell = geohash::encode(lat, lng, self.config.precision)?;
        if !(radius_km >= 0.0 && radius_km.is_finite()) {
            return Err(GeoError::InvalidRadius { radius_km });
        }
        let origin = geohash::decode_bounds(&origin_cell)?;
        self.queries.fetch_add(1, Ordering::Relaxed);

        let inner = self.read();
        let mut visited: HashSet<String> = HashSet::new();
        let mut hits: Vec<NearbyEntity> = Vec::new();

        for ring in 0..=self.config.max_search_rings {
            let Some(coverage_km) = ring_coverage_km(&origin, ring) else {
                break;
            };

            for cell in geohash::ring_cells(&origin, self.config.precision, ring) {
                let Some(members) = inner.cells.get(&cell) else {
                    continue;
                };
                // Wide rings can wrap onto cells already scanned
                if !visited.insert(cell) {
                    continue;
                }
                for id in members {
                    if let Some(entry) = inner.entries.get(id) {
                        let distance_km = haversine_km(lat, lng, entry.lat, entry.lng);
                        if distance_km <= radius_km {
                            hits.push(NearbyEntity {
                                id: id.clone(),
                                distance_km,
                            });
                        }
                    }
                }
            }

            if let Some(limit) = limit {
                if hits.len() >= limit {
                    rank(&mut hits);
                    if hits[limit - 1].distance_km <= coverage_km {
                        hits.truncate(limit);
                        return Ok(hits);
                    }
                }
            }

            if coverage_km >= radius_km {
                rank(&mut hits);
                if let Some(limit) = limit {
                    hits.truncate(limit);
                }
                return Ok(hits);
            }
        }

        self.full_scans.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            index = %self.name,
            radius_km,
            entities = inner.entries.len(),
            "Radius query fell back to full scan"
        );

        let mut hits: Vec<NearbyEntity> = inner
            .entries
            .values()
            .filter_map(|entry| {
                let distance_km = haversine_km(lat, lng, entry.lat, entry.lng);
                (distance_km <= radius_km).then(|| NearbyEntity {
                    id: entry.id.clone(),
                    distance_km,
                })
            })
            .collect();
        rank(&mut hits);
        if let Some(limit) = limit {
            hits.truncate(limit);
        }
        Ok(hits)
    }

    pub fn stats(&self) -> SpatialStats {
        let inner = self.read();
        SpatialStats {
            name: self.name.clone(),
            entities: inner.entries.len(),
            cells: inner.cells.len(),
            precision: self.config.precision,
            queries: self.queries.load(Ordering::Relaxed),
            full_scans: self.full_scans.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for SpatialIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpatialIndex")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballast_core::ManualClock;
    use serde_json::json;

    fn index() -> SpatialIndex {
        SpatialIndex::new("suppliers", SpatialConfig::default()).unwrap()
    }

    fn ids(hits: &[NearbyEntity]) -> Vec<&str> {
        hits.iter().map(|h| h.id.as_str()).collect()
    }

    #[test]
    fn test_upsert_then_query_includes_self() {
        let index = index();
        index
            .upsert("s-1", 12.9716, 77.5946, FieldPatch::new().with("name", "Nandini"))
            .unwrap();

        let hits = index.query_radius(12.9716, 77.5946, 0.0).unwrap();
        assert_eq!(ids(&hits), vec!["s-1"]);
        assert_eq!(hits[0].distance_km, 0.0);

        let entry = index.get("s-1").unwrap();
        assert_eq!(entry.metadata.get("name"), Some(&json!("Nandini")));
    }

    #[test]
    fn test_moving_changes_cell_membership() {
        let index = index();
        let first = index.upsert("s-1", 12.9716, 77.5946, FieldPatch::new()).unwrap();
        let second = index.upsert("s-1", 13.0827, 80.2707, FieldPatch::new()).unwrap();

        assert_ne!(first, second);
        assert_eq!(index.size(), 1);
        assert_eq!(index.cell_count(), 1);
        assert!(index.query_radius(12.9716, 77.5946, 5.0).unwrap().is_empty());
        assert_eq!(ids(&index.query_radius(13.0827, 80.2707, 5.0).unwrap()), vec!["s-1"]);
    }

    #[test]
    fn test_results_ranked_by_distance() {
        let index = index();
        index.upsert("far", 12.9900, 77.5946, FieldPatch::new()).unwrap();
        index.upsert("near", 12.9720, 77.5946, FieldPatch::new()).unwrap();
        index.upsert("mid", 12.9800, 77.5946, FieldPatch::new()).unwrap();
        index.upsert("outside", 13.2000, 77.5946, FieldPatch::new()).unwrap();

        let hits = index.query_radius(12.9716, 77.5946, 3.0).unwrap();
        assert_eq!(ids(&hits), vec!["near", "mid", "far"]);
        assert!(hits.windows(2).all(|w| w[0].distance_km <= w[1].distance_km));
    }

    #[test]
    fn test_nearest_respects_limit() {
        let index = index();
        for i in 0..20 {
            index
                .upsert(format!("s-{i:02}"), 12.9716 + f64::from(i) * 0.001, 77.5946, FieldPatch::new())
                .unwrap();
        }

        let hits = index.nearest(12.9716, 77.5946, 10.0, 3).unwrap();
        assert_eq!(ids(&hits), vec!["s-00", "s-01", "s-02"]);
        assert!(index.nearest(12.9716, 77.5946, 10.0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_remove() {
        let index = index();
        index.upsert("s-1", 1.0, 1.0, FieldPatch::new()).unwrap();
        let removed = index.remove("s-1").unwrap();
        assert_eq!(removed.id, "s-1");
        assert!(index.is_empty());
        assert_eq!(index.cell_count(), 0);
        assert!(index.remove("s-1").is_none());
    }

    #[test]
    fn test_prune_stale() {
        let clock = ManualClock::shared();
        let index =
            SpatialIndex::with_clock("suppliers", SpatialConfig::default(), clock.clone()).unwrap();
        index.upsert("old", 1.0, 1.0, FieldPatch::new()).unwrap();
        clock.advance(Duration::from_secs(120));
        index.upsert("fresh", 1.0, 1.0, FieldPatch::new()).unwrap();

        assert_eq!(index.prune_stale(Duration::from_secs(60)), 1);
        assert!(index.get("old").is_none());
        assert!(index.get("fresh").is_some());
        assert_eq!(index.cell_count(), 1);
    }

    #[test]
    fn test_query_across_antimeridian() {
        let index = index();
        index.upsert("east", 0.0, 179.999, FieldPatch::new()).unwrap();

        let hits = index.query_radius(0.0, -179.999, 1.0).unwrap();
        assert_eq!(ids(&hits), vec!["east"]);
        assert_eq!(index.stats().full_scans, 0);
    }

    #[test]
    fn test_full_scan_beyond_ring_limit() {
        let index = index();
        index.upsert("city", 13.4, 77.5946, FieldPatch::new()).unwrap();

        let hits = index.query_radius(12.9716, 77.5946, 100.0).unwrap();
        assert_eq!(ids(&hits), vec!["city"]);
        assert_eq!(index.stats().full_scans, 1);
    }

    #[test]
    fn test_full_scan_near_pole() {
        let index = index();
        index.upsert("station", 89.999, 0.0, FieldPatch::new()).unwrap();
        index.upsert("other-side", 89.999, 180.0, FieldPatch::new()).unwrap();

        let hits = index.query_radius(89.999, 0.0, 1.0).unwrap();
        assert_eq!(ids(&hits), vec!["station", "other-side"]);
        assert_eq!(index.stats().full_scans, 1);
    }

    #[test]
    fn test_invalid_queries() {
        let index = index();
        assert!(matches!(
            index.query_radius(0.0, 0.0, -1.0),
            Err(GeoError::InvalidRadius { .. })
        ));
        assert!(matches!(
            index.query_radius(0.0, 0.0, f64::NAN),
            Err(GeoError::InvalidRadius { .. })
        ));
        assert!(matches!(
            index.upsert("x", 0.0, 200.0, FieldPatch::new()),
            Err(GeoError::InvalidCoordinate { .. })
        ));
        assert!(matches!(
            SpatialIndex::new("bad", SpatialConfig::default().with_precision(13)),
            Err(GeoError::InvalidPrecision { precision: 13 })
        ));
    }

    #[test]
    fn test_ring_coverage_grows_and_degenerates() {
        let origin = geohash::decode_bounds(&geohash::encode(12.97, 77.59, 6).unwrap()).unwrap();
        assert_eq!(ring_coverage_km(&origin, 0), Some(0.0));
        let one = ring_coverage_km(&origin, 1).unwrap();
        let two = ring_coverage_km(&origin, 2).unwrap();
        assert!(one > 0.5 && two > one);

        let polar = geohash::decode_bounds(&geohash::encode(89.9999, 0.0, 6).unwrap()).unwrap();
        assert_eq!(ring_coverage_km(&polar, 1), None);

        let coarse = geohash::decode_bounds("e").unwrap();
        assert_eq!(ring_coverage_km(&coarse, 4), None);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(128))]

            #[test]
            fn prop_upsert_then_query_includes_self(
                lat in -89.0f64..89.0,
                lng in -180.0f64..=180.0,
                radius in 0.0f64..25.0,
            ) {
                let index = index();
                index.upsert("me", lat, lng, FieldPatch::new()).unwrap();
                let hits = index.query_radius(lat, lng, radius).unwrap();
                prop_assert!(hits.iter().any(|h| h.id == "me"));
            }

            #[test]
            fn prop_moved_entity_leaves_old_radius(
                lat in -60.0f64..60.0,
                lng in -170.0f64..170.0,
                radius in 0.1f64..5.0,
                shift in 0.2f64..1.0,
            ) {
                let index = index();
                index.upsert("mover", lat, lng, FieldPatch::new()).unwrap();
                index.upsert("mover", lat + shift, lng, FieldPatch::new()).unwrap();

                let hits = index.query_radius(lat, lng, radius).unwrap();
                prop_assert!(hits.iter().all(|h| h.id != "mover"));
                prop_assert_eq!(index.size(), 1);
            }

            #[test]
            fn prop_ring_search_matches_full_scan(
                points in proptest::collection::vec((-1.0f64..1.0, -1.0f64..1.0), 1..40),
                radius in 0.0f64..3.0,
            ) {
                let index = index();
                for (i, (dlat, dlng)) in points.iter().enumerate() {
                    index
                        .upsert(format!("p{i}"), 40.0 + dlat * 0.02, -3.0 + dlng * 0.02, FieldPatch::new())
                        .unwrap();
                }

                let hits = index.query_radius(40.0, -3.0, radius).unwrap();
                let mut expected: Vec<String> = points
                    .iter()
                    .enumerate()
                    .filter(|(_, (dlat, dlng))| {
                        haversine_km(40.0, -3.0, 40.0 + dlat * 0.02, -3.0 + dlng * 0.02) <= radius
                    })
                    .map(|(i, _)| format!("p{i}"))
                    .collect();
                expected.sort();
                let mut got: Vec<String> = hits.into_iter().map(|h| h.id).collect();
                got.sort();
                prop_assert_eq!(got, expected);
            }

            #[test]
            fn prop_nearest_matches_ranked_full_scan(
                points in proptest::collection::vec((-1.0f64..1.0, -1.0f64..1.0), 1..60),
                radius in 0.0f64..3.0,
                limit in 1usize..12,
            ) {
                let index = index();
                let mut expected: Vec<NearbyEntity> = Vec::new();
                for (i, (dlat, dlng)) in points.iter().enumerate() {
                    let (lat, lng) = (40.0 + dlat * 0.02, -3.0 + dlng * 0.02);
                    index.upsert(format!("p{i}"), lat, lng, FieldPatch::new()).unwrap();
                    let distance_km = haversine_km(40.0, -3.0, lat, lng);
                    if distance_km <= radius {
                        expected.push(NearbyEntity { id: format!("p{i}"), distance_km });
                    }
                }
                rank(&mut expected);
                expected.truncate(limit);

                let got = index.nearest(40.0, -3.0, radius, limit).unwrap();
                prop_assert_eq!(got, expected);
            }
        }
    }
}
