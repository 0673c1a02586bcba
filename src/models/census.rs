//! Census polygon records shared by every stage.

use std::collections::BTreeMap;

use geo::{Area, BoundingRect, MultiPolygon, Rect};
use serde::{Deserialize, Serialize};

/// Census geography the polygon was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZoneType {
    /// Manzana censal (urban block)
    Urban,
    /// Entidad rural (rural area)
    Rural,
}

impl ZoneType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneType::Urban => "Urban",
            ZoneType::Rural => "Rural",
        }
    }

    /// Parse the label written in the `zone_type` column.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "urban" | "urbano" => Some(ZoneType::Urban),
            "rural" => Some(ZoneType::Rural),
            _ => None,
        }
    }
}

impl std::fmt::Display for ZoneType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of a census polygon dataset.
#[derive(Debug, Clone)]
pub struct CensusPolygon {
    /// Commune CUT code (e.g. 13110)
    pub commune_id: i64,

    /// Commune name as published by the census
    pub commune: String,

    /// Polygon identifier (manzana/entidad code, possibly relabelled)
    pub poly_id: String,

    /// Identifier before relabelling
    pub orig_id: Option<String>,

    pub zone_type: Option<ZoneType>,

    /// Whether the record came from splitting a multipart geometry
    pub was_multipart: Option<bool>,

    /// Number of adjacent polygons absorbed while resolving multiparts
    pub comb_adj: Option<i64>,

    /// Numeric attributes by column name. NaN marks a missing value.
    pub values: BTreeMap<String, f64>,

    pub geometry: MultiPolygon<f64>,
}

impl CensusPolygon {
    /// Create a record with only the identifying fields set
    pub fn new(commune_id: i64, commune: &str, poly_id: &str, geometry: MultiPolygon<f64>) -> Self {
        Self {
            commune_id,
            commune: commune.to_string(),
            poly_id: poly_id.to_string(),
            orig_id: None,
            zone_type: None,
            was_multipart: None,
            comb_adj: None,
            values: BTreeMap::new(),
            geometry,
        }
    }

    /// Numeric value of a column, NaN when absent
    pub fn value(&self, column: &str) -> f64 {
        self.values.get(column).copied().unwrap_or(f64::NAN)
    }

    pub fn set_value(&mut self, column: &str, value: f64) {
        self.values.insert(column.to_string(), value);
    }

    pub fn area(&self) -> f64 {
        self.geometry.unsigned_area()
    }

    pub fn bbox(&self) -> Option<Rect<f64>> {
        self.geometry.bounding_rect()
    }

    pub fn is_empty(&self) -> bool {
        self.geometry.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    #[test]
    fn test_zone_type_parse() {
        assert_eq!(ZoneType::parse("Urban"), Some(ZoneType::Urban));
        assert_eq!(ZoneType::parse(" rural "), Some(ZoneType::Rural));
        assert_eq!(ZoneType::parse("mixed"), None);
        assert_eq!(ZoneType::Rural.to_string(), "Rural");
    }

    #[test]
    fn test_missing_value_is_nan() {
        let square = polygon![(x: 0.0, y: 0.0), (x: 2.0, y: 0.0), (x: 2.0, y: 2.0), (x: 0.0, y: 2.0)];
        let mut record = CensusPolygon::new(13110, "LA FLORIDA", "1", MultiPolygon::new(vec![square]));
        assert!(record.value("n_per").is_nan());
        record.set_value("n_per", 12.0);
        assert_eq!(record.value("n_per"), 12.0);
        assert!((record.area() - 4.0).abs() < 1e-9);
    }
}
