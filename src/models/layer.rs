//! A whole dataset: records plus the schema details needed to write them back.

use std::collections::BTreeMap;

use super::CensusPolygon;
use crate::crs::LayerCrs;

/// Ordered collection of census polygons sharing a CRS and numeric schema.
#[derive(Debug, Clone)]
pub struct PolygonLayer {
    pub crs: LayerCrs,

    /// Numeric columns in output order
    pub numeric_columns: Vec<String>,

    pub records: Vec<CensusPolygon>,
}

impl PolygonLayer {
    pub fn new(crs: LayerCrs, numeric_columns: Vec<String>, records: Vec<CensusPolygon>) -> Self {
        Self {
            crs,
            numeric_columns,
            records,
        }
    }

    /// Same CRS and schema, different records
    pub fn with_records(&self, records: Vec<CensusPolygon>) -> Self {
        Self {
            crs: self.crs.clone(),
            numeric_columns: self.numeric_columns.clone(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Distinct commune ids in ascending order
    pub fn communes(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.records.iter().map(|r| r.commune_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Split records by commune, keeping their relative order
    pub fn by_commune(&self) -> BTreeMap<i64, Vec<CensusPolygon>> {
        let mut groups: BTreeMap<i64, Vec<CensusPolygon>> = BTreeMap::new();
        for record in &self.records {
            groups
                .entry(record.commune_id)
                .or_default()
                .push(record.clone());
        }
        groups
    }

    /// Append a numeric column to the schema if it is not there yet
    pub fn ensure_numeric_column(&mut self, column: &str) {
        if !self.numeric_columns.iter().any(|c| c == column) {
            self.numeric_columns.push(column.to_string());
        }
    }
}
