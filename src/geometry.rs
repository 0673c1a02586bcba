//! Geometry helpers shared by the relabelling and tessellation stages.

use anyhow::Result;
use geo::{
    Area, BoundingRect, Coord, Geometry, Intersects, Line, LinesIter, MultiPolygon, Polygon,
    Relate,
};

use crate::error::ProcessError;

/// Perpendicular distance under which two boundary segments count as collinear.
pub const EDGE_TOLERANCE: f64 = 1e-6;

/// Normalise a decoded geometry into a MultiPolygon
pub fn to_multi_polygon(geometry: Geometry<f64>) -> Result<MultiPolygon<f64>> {
    match geometry {
        Geometry::Polygon(p) => Ok(MultiPolygon::new(vec![p])),
        Geometry::MultiPolygon(mp) => Ok(mp),
        Geometry::GeometryCollection(gc) => {
            let mut polygons = Vec::new();
            for g in gc.0 {
                polygons.extend(to_multi_polygon(g)?.0);
            }
            Ok(MultiPolygon::new(polygons))
        }
        other => Err(ProcessError::UnsupportedGeometry(geometry_name(&other).to_string()).into()),
    }
}

fn geometry_name(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}

/// Non-degenerate single parts, in their stored order
pub fn parts(geometry: &MultiPolygon<f64>) -> Vec<Polygon<f64>> {
    geometry
        .0
        .iter()
        .filter(|p| p.unsigned_area() > 0.0)
        .cloned()
        .collect()
}

/// The part with the greatest area
pub fn largest_part(geometry: &MultiPolygon<f64>) -> Option<Polygon<f64>> {
    geometry
        .0
        .iter()
        .filter(|p| p.unsigned_area() > 0.0)
        .max_by(|a, b| a.unsigned_area().total_cmp(&b.unsigned_area()))
        .cloned()
}

/// Drop interior rings of every part
pub fn strip_holes(geometry: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    MultiPolygon::new(
        geometry
            .0
            .iter()
            .map(|p| Polygon::new(p.exterior().clone(), vec![]))
            .collect(),
    )
}

/// DE-9IM touches: boundaries meet, interiors do not
pub fn touches(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> bool {
    if !bboxes_meet(a, b) {
        return false;
    }
    a.relate(b).is_touches()
}

fn bboxes_meet(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> bool {
    match (a.bounding_rect(), b.bounding_rect()) {
        (Some(ra), Some(rb)) => ra.intersects(&rb),
        _ => false,
    }
}

/// Length of boundary the two geometries have in common.
///
/// Only collinear overlaps count; boundaries that merely cross contribute
/// nothing, matching the length of the boundary/boundary intersection.
pub fn shared_boundary_length(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> f64 {
    if !bboxes_meet(a, b) {
        return 0.0;
    }

    let b_lines: Vec<Line<f64>> = b.lines_iter().collect();
    let mut total = 0.0;

    for la in a.lines_iter() {
        let la_rect = la.bounding_rect();
        for lb in &b_lines {
            if !la_rect.intersects(&lb.bounding_rect()) {
                continue;
            }
            total += collinear_overlap(&la, lb);
        }
    }

    total
}

fn collinear_overlap(a: &Line<f64>, b: &Line<f64>) -> f64 {
    let d = a.delta();
    let len = d.x.hypot(d.y);
    if len == 0.0 {
        return 0.0;
    }
    let u = Coord {
        x: d.x / len,
        y: d.y / len,
    };

    let offset = |c: Coord<f64>| Coord {
        x: c.x - a.start.x,
        y: c.y - a.start.y,
    };
    let cross = |v: Coord<f64>| u.x * v.y - u.y * v.x;
    let dot = |v: Coord<f64>| u.x * v.x + u.y * v.y;

    let (rs, re) = (offset(b.start), offset(b.end));
    if cross(rs).abs() > EDGE_TOLERANCE || cross(re).abs() > EDGE_TOLERANCE {
        return 0.0;
    }

    let (t0, t1) = (dot(rs), dot(re));
    let lo = t0.min(t1).max(0.0);
    let hi = t0.max(t1).min(len);
    (hi - lo).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{point, polygon, GeometryCollection};

    fn square(x0: f64, y0: f64, size: f64) -> Polygon<f64> {
        polygon![
            (x: x0, y: y0),
            (x: x0 + size, y: y0),
            (x: x0 + size, y: y0 + size),
            (x: x0, y: y0 + size),
        ]
    }

    fn multi(polys: Vec<Polygon<f64>>) -> MultiPolygon<f64> {
        MultiPolygon::new(polys)
    }

    #[test]
    fn test_to_multi_polygon() {
        let mp = to_multi_polygon(Geometry::Polygon(square(0.0, 0.0, 1.0))).unwrap();
        assert_eq!(mp.0.len(), 1);

        let gc = Geometry::GeometryCollection(GeometryCollection(vec![
            Geometry::Polygon(square(0.0, 0.0, 1.0)),
            Geometry::Polygon(square(5.0, 0.0, 1.0)),
        ]));
        assert_eq!(to_multi_polygon(gc).unwrap().0.len(), 2);

        let err = to_multi_polygon(Geometry::Point(point!(x: 1.0, y: 1.0))).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProcessError>(),
            Some(ProcessError::UnsupportedGeometry(name)) if name == "Point"
        ));
    }

    #[test]
    fn test_largest_part() {
        let mp = multi(vec![square(0.0, 0.0, 1.0), square(5.0, 0.0, 3.0), square(10.0, 0.0, 2.0)]);
        let largest = largest_part(&mp).unwrap();
        assert!((largest.unsigned_area() - 9.0).abs() < 1e-9);
        assert!(largest_part(&multi(vec![])).is_none());
    }

    #[test]
    fn test_shared_boundary_of_adjacent_squares() {
        let a = multi(vec![square(0.0, 0.0, 10.0)]);
        let b = multi(vec![square(10.0, 0.0, 10.0)]);
        assert!((shared_boundary_length(&a, &b) - 10.0).abs() < 1e-9);
        assert!(touches(&a, &b));
    }

    #[test]
    fn test_shared_boundary_partial_edge() {
        let a = multi(vec![square(0.0, 0.0, 10.0)]);
        // Offset upwards so only 6 units of the edge are shared
        let b = multi(vec![square(10.0, 4.0, 10.0)]);
        assert!((shared_boundary_length(&a, &b) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_corner_contact_shares_no_length() {
        let a = multi(vec![square(0.0, 0.0, 10.0)]);
        let b = multi(vec![square(10.0, 10.0, 10.0)]);
        assert_eq!(shared_boundary_length(&a, &b), 0.0);
        assert!(touches(&a, &b));
    }

    #[test]
    fn test_disjoint_and_overlapping() {
        let a = multi(vec![square(0.0, 0.0, 10.0)]);
        let far = multi(vec![square(50.0, 0.0, 10.0)]);
        assert!(!touches(&a, &far));
        assert_eq!(shared_boundary_length(&a, &far), 0.0);

        let overlapping = multi(vec![square(5.0, 0.0, 10.0)]);
        assert!(!touches(&a, &overlapping));
    }

    #[test]
    fn test_strip_holes() {
        let with_hole = Polygon::new(
            square(0.0, 0.0, 10.0).exterior().clone(),
            vec![square(2.0, 2.0, 2.0).exterior().clone()],
        );
        let stripped = strip_holes(&multi(vec![with_hole]));
        assert!(stripped.0[0].interiors().is_empty());
        assert!((stripped.unsigned_area() - 100.0).abs() < 1e-9);
    }
}
