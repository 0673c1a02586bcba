//! Constrained Voronoi regions for a single commune.
//!
//! Polygon boundaries are densified into seed points, the seeds are
//! triangulated with spade and each Voronoi cell is built from the
//! circumcentres around its seed. Cells are then dissolved per polygon and
//! clipped to the commune boundary.

use std::time::Instant;

use anyhow::Result;
use geo::{
    unary_union, Area, BooleanOps, BoundingRect, Buffer, Coord, Densify, Euclidean, LineString,
    MultiPolygon, Polygon, Translate,
};
use hashbrown::HashMap;
use serde::Serialize;
use spade::{DelaunayTriangulation, HasPosition, Point2, Triangulation};
use tracing::{debug, warn};

use super::overlaps::{
    find_duplicates, find_hidden_polygons, resolve_partial_overlaps, DEFAULT_MIN_OVERLAP_AREA,
};
use crate::error::ProcessError;
use crate::geometry::strip_holes;
use crate::models::CensusPolygon;

pub const DEFAULT_DENSIFY_DISTANCE: f64 = 10.0;

/// Sentinel distance as a multiple of the seed extent
const SENTINEL_FACTOR: f64 = 10.0;

/// Grid on which seed coordinates are compared, in CRS units
const SEED_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct VoronoiOptions {
    /// Maximum spacing between seeds along a polygon boundary
    pub densify_distance: f64,
    /// Outward buffer applied to the commune boundary
    pub boundary_buffer: f64,
    pub min_overlap_area: f64,
}

impl Default for VoronoiOptions {
    fn default() -> Self {
        Self {
            densify_distance: DEFAULT_DENSIFY_DISTANCE,
            boundary_buffer: 0.0,
            min_overlap_area: DEFAULT_MIN_OVERLAP_AREA,
        }
    }
}

/// Per-commune figures, one row of the run report
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommuneStats {
    pub commune_id: i64,
    pub commune: String,
    pub polygons: usize,
    pub seeds: usize,
    pub regions: usize,
    pub duplicates: usize,
    pub overlaps_fixed: usize,
    pub boundary_area: f64,
    pub region_area: f64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct CommuneTessellation {
    /// Input records with their Voronoi region as geometry
    pub records: Vec<CensusPolygon>,
    pub boundary: MultiPolygon<f64>,
    pub stats: CommuneStats,
}

/// A triangulation vertex: boundary sample of a polygon, or a sentinel
#[derive(Debug, Clone, Copy)]
pub struct Seed {
    pub position: Point2<f64>,
    pub owner: Option<usize>,
}

impl HasPosition for Seed {
    type Scalar = f64;

    fn position(&self) -> Point2<f64> {
        self.position
    }
}

#[derive(Debug)]
pub struct VoronoiProcessor {
    options: VoronoiOptions,
}

impl VoronoiProcessor {
    pub fn new(options: VoronoiOptions) -> Result<Self> {
        if options.densify_distance.is_nan() || options.densify_distance <= 0.0 {
            return Err(ProcessError::InvalidConfig(format!(
                "densify distance must be positive, got {}",
                options.densify_distance
            ))
            .into());
        }
        if options.boundary_buffer.is_nan() || options.boundary_buffer < 0.0 {
            return Err(ProcessError::InvalidConfig(format!(
                "boundary buffer must be non-negative, got {}",
                options.boundary_buffer
            ))
            .into());
        }
        Ok(Self { options })
    }

    pub fn options(&self) -> &VoronoiOptions {
        &self.options
    }

    /// Outline of the commune: union of its polygons without interior gaps
    pub fn commune_boundary<'a, I>(&self, geometries: I) -> MultiPolygon<f64>
    where
        I: IntoIterator<Item = &'a MultiPolygon<f64>>,
    {
        let union = strip_holes(&unary_union(geometries));
        if self.options.boundary_buffer > 0.0 {
            union.buffer(self.options.boundary_buffer)
        } else {
            union
        }
    }

    /// Tessellate one commune. Records must all belong to `commune_id`.
    pub fn process_commune(
        &self,
        commune_id: i64,
        records: &[CensusPolygon],
    ) -> Result<CommuneTessellation> {
        let started = Instant::now();
        let commune = records.first().map(|r| r.commune.clone()).unwrap_or_default();
        let mut stats = CommuneStats {
            commune_id,
            commune,
            polygons: records.len(),
            ..CommuneStats::default()
        };

        let boundary = self.commune_boundary(records.iter().map(|r| &r.geometry));
        stats.boundary_area = boundary.unsigned_area();

        let Some(extent) = boundary.bounding_rect() else {
            warn!("Commune {} has no polygon area, skipping", commune_id);
            return Ok(CommuneTessellation {
                records: Vec::new(),
                boundary,
                stats,
            });
        };

        let mut geometries: Vec<MultiPolygon<f64>> =
            records.iter().map(|r| r.geometry.clone()).collect();

        let hidden = find_hidden_polygons(&geometries);
        if !hidden.is_empty() {
            debug!("Commune {}: {} hidden polygons", commune_id, hidden.len());
        }
        let duplicates = find_duplicates(&geometries);
        for &d in &duplicates {
            warn!(
                "Commune {}: polygon {} duplicates another geometry and gets no region",
                commune_id, records[d].poly_id
            );
        }
        stats.duplicates = duplicates.len();
        stats.overlaps_fixed = resolve_partial_overlaps(&mut geometries, self.options.min_overlap_area);

        // Work near the origin to keep circumcentres precise
        let origin = extent.min();
        let local: Vec<Option<MultiPolygon<f64>>> = geometries
            .iter()
            .enumerate()
            .map(|(i, g)| (!duplicates.contains(&i)).then(|| g.translate(-origin.x, -origin.y)))
            .collect();
        let local_boundary = boundary.translate(-origin.x, -origin.y);

        let seeds = build_seeds(&local, self.options.densify_distance);
        stats.seeds = seeds.len();

        let margin = extent.width().max(extent.height()).max(1.0) + self.options.boundary_buffer;
        let cells = voronoi_cells(commune_id, seeds, margin)?;

        let mut by_owner: Vec<Vec<Polygon<f64>>> = vec![Vec::new(); records.len()];
        for (owner, cell) in cells {
            by_owner[owner].push(cell);
        }

        let mut output = Vec::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            if by_owner[i].is_empty() {
                if !duplicates.contains(&i) {
                    warn!(
                        "Commune {}: polygon {} received no seeds",
                        commune_id, record.poly_id
                    );
                }
                continue;
            }
            let dissolved = unary_union(by_owner[i].iter());
            let region = dissolved.intersection(&local_boundary);
            if region.unsigned_area() < super::overlaps::EMPTY_AREA {
                debug!("Commune {}: region of {} is empty", commune_id, record.poly_id);
                continue;
            }

            let mut tessellated = record.clone();
            tessellated.geometry = region.translate(origin.x, origin.y);
            stats.region_area += tessellated.geometry.unsigned_area();
            output.push(tessellated);
        }

        stats.regions = output.len();
        stats.elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(
            "Commune {}: {} regions from {} seeds in {} ms",
            commune_id, stats.regions, stats.seeds, stats.elapsed_ms
        );

        Ok(CommuneTessellation {
            records: output,
            boundary,
            stats,
        })
    }
}

/// Densify every ring and collect its vertices as seeds.
///
/// A coordinate on the boundary of several polygons is left out, unless
/// one of them would otherwise end up without any seed.
pub fn build_seeds(geometries: &[Option<MultiPolygon<f64>>], densify_distance: f64) -> Vec<Seed> {
    let mut claims: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
    let mut order: Vec<(Coord<f64>, (i64, i64))> = Vec::new();

    for (owner, geometry) in geometries.iter().enumerate() {
        let Some(geometry) = geometry else {
            continue;
        };
        for polygon in &geometry.0 {
            let dense = Euclidean.densify(polygon, densify_distance);
            for ring in std::iter::once(dense.exterior()).chain(dense.interiors()) {
                for coord in ring_vertices(ring) {
                    let key = seed_key(coord);
                    let owners = claims.entry(key).or_insert_with(|| {
                        order.push((coord, key));
                        Vec::new()
                    });
                    if !owners.contains(&owner) {
                        owners.push(owner);
                    }
                }
            }
        }
    }

    let mut exclusive = vec![0usize; geometries.len()];
    for owners in claims.values() {
        if let [owner] = owners.as_slice() {
            exclusive[*owner] += 1;
        }
    }

    let mut seeds = Vec::with_capacity(order.len());
    for (coord, key) in order {
        let owners = &claims[&key];
        let owner = match owners.as_slice() {
            [owner] => Some(*owner),
            contested => contested.iter().copied().find(|o| exclusive[*o] == 0),
        };
        if let Some(owner) = owner {
            seeds.push(Seed {
                position: Point2::new(coord.x, coord.y),
                owner: Some(owner),
            });
        }
    }

    seeds
}

/// Densified edges walked in opposite directions differ in the last bits,
/// so seeds are matched on a rounded grid
fn seed_key(coord: Coord<f64>) -> (i64, i64) {
    (
        (coord.x / SEED_TOLERANCE).round() as i64,
        (coord.y / SEED_TOLERANCE).round() as i64,
    )
}

/// Ring vertices without the closing repeat
fn ring_vertices(ring: &LineString<f64>) -> impl Iterator<Item = Coord<f64>> + '_ {
    let n = ring.0.len();
    let closed = n > 1 && ring.0[0] == ring.0[n - 1];
    ring.0.iter().take(if closed { n - 1 } else { n }).copied()
}

/// Voronoi cell of every owned seed, as `(owner, cell)` pairs.
///
/// Four sentinels placed `margin` beyond the seed envelope keep every
/// owned seed inside the convex hull so its cell is bounded.
pub fn voronoi_cells(commune_id: i64, mut seeds: Vec<Seed>, margin: f64) -> Result<Vec<(usize, Polygon<f64>)>> {
    if seeds.is_empty() {
        return Ok(Vec::new());
    }

    let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
    let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    for seed in &seeds {
        min_x = min_x.min(seed.position.x);
        min_y = min_y.min(seed.position.y);
        max_x = max_x.max(seed.position.x);
        max_y = max_y.max(seed.position.y);
    }
    let reach = SENTINEL_FACTOR * margin;
    for (x, y) in [
        (min_x - reach, min_y - reach),
        (max_x + reach, min_y - reach),
        (max_x + reach, max_y + reach),
        (min_x - reach, max_y + reach),
    ] {
        seeds.push(Seed {
            position: Point2::new(x, y),
            owner: None,
        });
    }

    let triangulation: DelaunayTriangulation<Seed> =
        DelaunayTriangulation::bulk_load(seeds).map_err(|e| ProcessError::Triangulation {
            commune_id,
            reason: e.to_string(),
        })?;

    let mut cells = Vec::new();
    for vertex in triangulation.vertices() {
        let Some(owner) = vertex.data().owner else {
            continue;
        };

        let mut ring: Vec<Coord<f64>> = Vec::new();
        let mut bounded = true;
        for edge in vertex.out_edges() {
            match edge.face().as_inner() {
                Some(face) => {
                    let c = face.circumcenter();
                    let coord = Coord { x: c.x, y: c.y };
                    if ring.last() != Some(&coord) {
                        ring.push(coord);
                    }
                }
                None => {
                    bounded = false;
                    break;
                }
            }
        }
        if ring.len() > 1 && ring.first() == ring.last() {
            ring.pop();
        }
        if !bounded || ring.len() < 3 {
            debug!("Commune {}: skipping degenerate cell of polygon {}", commune_id, owner);
            continue;
        }

        cells.push((owner, Polygon::new(LineString::from(ring), vec![])));
    }

    Ok(cells)
}
