//! Spatial index for fast candidate lookups among census polygons.

use geo::{BoundingRect, MultiPolygon, Rect};
use rstar::{RTree, RTreeObject, AABB};
use tracing::debug;

/// Envelope of one indexed geometry, pointing back at its position
#[derive(Clone, Debug)]
pub struct IndexedEnvelope {
    pub position: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

impl IndexedEnvelope {
    pub fn new(position: usize, rect: Rect<f64>) -> Self {
        Self {
            position,
            envelope: AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
        }
    }
}

/// R-tree over geometry envelopes. Positions refer to the slice the index
/// was built from.
pub struct PolygonIndex {
    tree: RTree<IndexedEnvelope>,
}

impl PolygonIndex {
    /// Build the index; empty geometries are left out
    pub fn build<'a, I>(geometries: I) -> Self
    where
        I: IntoIterator<Item = &'a MultiPolygon<f64>>,
    {
        let indexed: Vec<IndexedEnvelope> = geometries
            .into_iter()
            .enumerate()
            .filter_map(|(position, g)| {
                g.bounding_rect()
                    .map(|rect| IndexedEnvelope::new(position, rect))
            })
            .collect();

        let tree = RTree::bulk_load(indexed);
        debug!("Spatial index built with {} entries", tree.size());

        Self { tree }
    }

    /// Positions whose envelope intersects `rect`, in ascending order
    pub fn candidates(&self, rect: &Rect<f64>) -> Vec<usize> {
        let query = AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]);
        let mut found: Vec<usize> = self
            .tree
            .locate_in_envelope_intersecting(&query)
            .map(|entry| entry.position)
            .collect();
        found.sort_unstable();
        found
    }

    /// Candidates for a geometry, or nothing if it is empty
    pub fn candidates_for(&self, geometry: &MultiPolygon<f64>) -> Vec<usize> {
        match geometry.bounding_rect() {
            Some(rect) => self.candidates(&rect),
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{coord, polygon};

    fn square(x0: f64, size: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: x0, y: 0.0),
            (x: x0 + size, y: 0.0),
            (x: x0 + size, y: size),
            (x: x0, y: size),
        ]])
    }

    #[test]
    fn test_empty_index() {
        let index = PolygonIndex::build(Vec::<&MultiPolygon<f64>>::new());
        assert!(index.is_empty());
        let rect = Rect::new(coord! { x: 0.0, y: 0.0 }, coord! { x: 1.0, y: 1.0 });
        assert!(index.candidates(&rect).is_empty());
    }

    #[test]
    fn test_candidates_by_envelope() {
        let geometries = vec![square(0.0, 10.0), square(10.0, 10.0), square(100.0, 10.0), MultiPolygon::new(vec![])];
        let index = PolygonIndex::build(&geometries);
        assert_eq!(index.len(), 3);

        // Shares an edge with the second square, overlaps the first
        assert_eq!(index.candidates_for(&square(5.0, 5.0)), vec![0, 1]);
        assert_eq!(index.candidates_for(&square(100.0, 1.0)), vec![2]);
        assert!(index.candidates_for(&square(50.0, 1.0)).is_empty());
    }
}
