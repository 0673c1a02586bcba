//! Overlap repair run on each commune before seeding.
//!
//! Voronoi regions must not overlap, so neither may the polygons that seed
//! them. Overlapping area is handed to the smaller polygon.

use geo::{Area, BooleanOps, Intersects, MultiPolygon};
use tracing::debug;

use crate::index::PolygonIndex;

/// Areas below this are treated as empty
pub const EMPTY_AREA: f64 = 1e-6;

pub const DEFAULT_MIN_OVERLAP_AREA: f64 = 1.0;

/// Same shape up to ring orientation and starting vertex
pub fn same_geometry(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> bool {
    if a == b {
        return true;
    }
    let (area_a, area_b) = (a.unsigned_area(), b.unsigned_area());
    if (area_a - area_b).abs() > EMPTY_AREA {
        return false;
    }
    a.difference(b).unsigned_area() < EMPTY_AREA && b.difference(a).unsigned_area() < EMPTY_AREA
}

/// Positions of polygons completely covered by a different polygon
pub fn find_hidden_polygons(geometries: &[MultiPolygon<f64>]) -> Vec<usize> {
    let index = PolygonIndex::build(geometries);
    let mut hidden = Vec::new();

    for (i, geometry) in geometries.iter().enumerate() {
        let covered = index.candidates_for(geometry).into_iter().any(|j| {
            let other = &geometries[j];
            i != j
                && geometry.intersects(other)
                && !same_geometry(geometry, other)
                && geometry.difference(other).unsigned_area() < EMPTY_AREA
        });
        if covered {
            hidden.push(i);
        }
    }

    hidden
}

/// Positions repeating the shape of an earlier polygon
pub fn find_duplicates(geometries: &[MultiPolygon<f64>]) -> Vec<usize> {
    let index = PolygonIndex::build(geometries);
    geometries
        .iter()
        .enumerate()
        .filter(|(i, geometry)| {
            index
                .candidates_for(geometry)
                .into_iter()
                .any(|j| j < *i && same_geometry(geometry, &geometries[j]))
        })
        .map(|(i, _)| i)
        .collect()
}

/// Remove partial overlaps in place, returning how many pairs were fixed.
///
/// Pairs are found on the input geometries; each overlap is then cut out of
/// whichever polygon of the pair is currently larger. Identical geometries
/// are left alone.
pub fn resolve_partial_overlaps(geometries: &mut [MultiPolygon<f64>], min_overlap_area: f64) -> usize {
    let index = PolygonIndex::build(geometries.iter());
    let mut pairs = Vec::new();

    for (i, geometry) in geometries.iter().enumerate() {
        for j in index.candidates_for(geometry) {
            if i >= j {
                continue;
            }
            let other = &geometries[j];
            let overlap = geometry.intersection(other);
            if overlap.unsigned_area() >= min_overlap_area && !same_geometry(geometry, other) {
                pairs.push((i, j, overlap));
            }
        }
    }

    for (i, j, overlap) in &pairs {
        let (i, j) = (*i, *j);
        let target = if geometries[i].unsigned_area() < geometries[j].unsigned_area() {
            j
        } else {
            i
        };
        debug!(
            "Overlap of {:.1} between {} and {}, trimming {}",
            overlap.unsigned_area(),
            i,
            j,
            target
        );
        geometries[target] = geometries[target].difference(overlap);
    }

    pairs.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    fn square(x0: f64, y0: f64, size: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: x0, y: y0),
            (x: x0 + size, y: y0),
            (x: x0 + size, y: y0 + size),
            (x: x0, y: y0 + size),
        ]])
    }

    #[test]
    fn test_overlap_goes_to_smaller_polygon() {
        // 20x20 and 10x10 squares overlapping on a 5x10 strip
        let mut geometries = vec![square(0.0, 0.0, 20.0), square(15.0, 0.0, 10.0)];
        let fixed = resolve_partial_overlaps(&mut geometries, DEFAULT_MIN_OVERLAP_AREA);

        assert_eq!(fixed, 1);
        assert!((geometries[0].unsigned_area() - 350.0).abs() < 1e-6);
        assert!((geometries[1].unsigned_area() - 100.0).abs() < 1e-6);
        assert!(geometries[0].intersection(&geometries[1]).unsigned_area() < EMPTY_AREA);
    }

    #[test]
    fn test_small_overlap_is_ignored() {
        let mut geometries = vec![square(0.0, 0.0, 10.0), square(9.95, 0.0, 10.0)];
        assert_eq!(resolve_partial_overlaps(&mut geometries, 1.0), 0);
        assert!((geometries[0].unsigned_area() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_hidden_polygon_cuts_a_hole() {
        let mut geometries = vec![square(0.0, 0.0, 20.0), square(5.0, 5.0, 4.0)];
        assert_eq!(find_hidden_polygons(&geometries), vec![1]);

        resolve_partial_overlaps(&mut geometries, 1.0);
        assert!((geometries[0].unsigned_area() - 384.0).abs() < 1e-6);
        assert!(find_hidden_polygons(&geometries).is_empty());
    }

    #[test]
    fn test_duplicates_are_kept_apart() {
        let mut geometries = vec![square(0.0, 0.0, 10.0), square(0.0, 0.0, 10.0), square(30.0, 0.0, 5.0)];
        assert_eq!(find_duplicates(&geometries), vec![1]);
        assert!(find_hidden_polygons(&geometries).is_empty());
        assert_eq!(resolve_partial_overlaps(&mut geometries, 1.0), 0);
    }
}
