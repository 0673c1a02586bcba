//! GeoParquet input and output.
//!
//! Geometries are WKB-encoded in a binary column described by the `geo`
//! file metadata (GeoParquet 1.0). Attribute columns are mapped onto
//! [`CensusPolygon`](crate::models::CensusPolygon) fields through a
//! [`ColumnMapping`].

mod metadata;
mod reader;
mod writer;

pub use metadata::{GeoColumnMetadata, GeoMetadata};
pub use reader::read_layer;
pub use writer::write_layer;

/// Column holding the commune CUT code in processed outputs
pub const COMMUNE_ID: &str = "commune_id";
/// Column holding the commune name in processed outputs
pub const COMMUNE: &str = "commune";
pub const ORIG_ID: &str = "orig_id";
pub const ZONE_TYPE: &str = "zone_type";
pub const WAS_MULTIPART: &str = "was_multipart";
pub const COMB_ADJ: &str = "comb_adj";
pub const GEOMETRY: &str = "geometry";

/// Source column names for the identifying fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub poly_id: String,
    pub commune: String,
    pub commune_id: String,
}

impl ColumnMapping {
    /// Names used by the census cartography files (Cartografía censo 2024)
    pub fn raw_census() -> Self {
        Self {
            poly_id: "MANZENT".to_string(),
            commune: "COMUNA".to_string(),
            commune_id: "CUT".to_string(),
        }
    }

    /// Names written by this crate's own outputs
    pub fn processed(poly_id: &str) -> Self {
        Self {
            poly_id: poly_id.to_string(),
            commune: COMMUNE.to_string(),
            commune_id: COMMUNE_ID.to_string(),
        }
    }
}

/// Normalise an identifier the way the census codes are compared:
/// integers as integers, floats truncated, string ids without a `.0` tail.
pub fn normalize_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(stripped) = trimmed.strip_suffix(".0") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.to_string();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_id() {
        assert_eq!(normalize_id("13110011001001"), "13110011001001");
        assert_eq!(normalize_id(" 13110011001001.0 "), "13110011001001");
        assert_eq!(normalize_id("A12.0"), "A12.0");
    }

    #[test]
    fn test_raw_mapping() {
        let mapping = ColumnMapping::raw_census();
        assert_eq!(mapping.poly_id, "MANZENT");
        assert_eq!(ColumnMapping::processed("block_id").commune_id, COMMUNE_ID);
    }
}
