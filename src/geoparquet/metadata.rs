//! The `geo` key-value metadata of a GeoParquet file.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crs::LayerCrs;

pub const GEO_METADATA_KEY: &str = "geo";
pub const GEOPARQUET_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoMetadata {
    pub version: String,
    pub primary_column: String,
    /// Column entries are kept raw so an absent `crs` can be told apart
    /// from an explicit `null`.
    pub columns: BTreeMap<String, Value>,
}

/// Typed view of one column entry
#[derive(Debug, Clone)]
pub struct GeoColumnMetadata {
    pub encoding: String,
    pub geometry_types: Vec<String>,
    pub crs: LayerCrs,
    pub bbox: Option<[f64; 4]>,
}

impl GeoMetadata {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("Failed to parse GeoParquet 'geo' metadata")
    }

    /// Entry of the primary geometry column
    pub fn primary(&self) -> Result<GeoColumnMetadata> {
        let entry = self.columns.get(&self.primary_column).with_context(|| {
            format!(
                "Primary geometry column '{}' missing from 'geo' metadata",
                self.primary_column
            )
        })?;

        let encoding = entry
            .get("encoding")
            .and_then(Value::as_str)
            .unwrap_or("WKB")
            .to_string();
        if !encoding.eq_ignore_ascii_case("WKB") {
            anyhow::bail!("Unsupported geometry encoding '{}', only WKB is read", encoding);
        }

        let geometry_types = entry
            .get("geometry_types")
            .and_then(Value::as_array)
            .map(|types| {
                types
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let bbox = entry.get("bbox").and_then(Value::as_array).and_then(|b| {
            let values: Vec<f64> = b.iter().filter_map(Value::as_f64).collect();
            match values.as_slice() {
                [a, b, c, d] => Some([*a, *b, *c, *d]),
                _ => None,
            }
        });

        Ok(GeoColumnMetadata {
            encoding,
            geometry_types,
            crs: LayerCrs::from_metadata(entry.get("crs"))?,
            bbox,
        })
    }

    /// Metadata for a single WKB column
    pub fn for_column(column: &str, column_meta: &GeoColumnMetadata) -> Self {
        let mut entry = serde_json::Map::new();
        entry.insert("encoding".to_string(), Value::from(column_meta.encoding.clone()));
        entry.insert(
            "geometry_types".to_string(),
            Value::from(column_meta.geometry_types.clone()),
        );
        entry.insert("crs".to_string(), column_meta.crs.to_metadata());
        if let Some(bbox) = column_meta.bbox {
            entry.insert("bbox".to_string(), Value::from(bbox.to_vec()));
        }

        let mut columns = BTreeMap::new();
        columns.insert(column.to_string(), Value::Object(entry));

        Self {
            version: GEOPARQUET_VERSION.to_string(),
            primary_column: column.to_string(),
            columns,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize GeoParquet metadata")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessError;

    #[test]
    fn test_parse_primary_column() {
        let raw = r#"{
            "version": "1.0.0",
            "primary_column": "geometry",
            "columns": {
                "geometry": {
                    "encoding": "WKB",
                    "geometry_types": ["Polygon", "MultiPolygon"],
                    "crs": {"type": "ProjectedCRS", "id": {"authority": "EPSG", "code": 32719}},
                    "bbox": [340000.0, 6280000.0, 360000.0, 6300000.0]
                }
            }
        }"#;
        let meta = GeoMetadata::parse(raw).unwrap();
        let primary = meta.primary().unwrap();
        assert_eq!(primary.geometry_types, vec!["Polygon", "MultiPolygon"]);
        assert_eq!(primary.crs.epsg(), Some(32719));
        assert_eq!(primary.bbox, Some([340000.0, 6280000.0, 360000.0, 6300000.0]));
    }

    #[test]
    fn test_absent_crs_means_crs84() {
        let raw = r#"{"version": "1.0.0", "primary_column": "geometry",
                      "columns": {"geometry": {"encoding": "WKB", "geometry_types": []}}}"#;
        let err = GeoMetadata::parse(raw).unwrap().primary().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProcessError>(),
            Some(ProcessError::UnsupportedCrs(_))
        ));
    }

    #[test]
    fn test_written_metadata_reads_back() {
        let column_meta = GeoColumnMetadata {
            encoding: "WKB".to_string(),
            geometry_types: vec!["Polygon".to_string()],
            crs: LayerCrs::Unknown,
            bbox: Some([0.0, 0.0, 1.0, 1.0]),
        };
        let json = GeoMetadata::for_column("geometry", &column_meta).to_json().unwrap();
        let primary = GeoMetadata::parse(&json).unwrap().primary().unwrap();
        assert_eq!(primary.crs, LayerCrs::Unknown);
        assert_eq!(primary.geometry_types, vec!["Polygon"]);
    }
}
