//! Coordinate reference system handling for GeoParquet layers.
//!
//! Distances (densification, shared boundaries, overlap areas) are metric,
//! so only projected CRSs are accepted. The PROJJSON is carried through
//! untouched to the outputs.

use serde_json::{json, Value};
use tracing::warn;

use crate::error::ProcessError;

/// CRS as declared in a GeoParquet `geo` column entry
#[derive(Debug, Clone, PartialEq)]
pub enum LayerCrs {
    /// The metadata declares `"crs": null`
    Unknown,
    /// PROJJSON object
    Projjson(Value),
}

impl LayerCrs {
    /// Interpret the `crs` member of a column entry. `None` means the key was
    /// absent, which GeoParquet defines as OGC:CRS84.
    pub fn from_metadata(raw: Option<&Value>) -> anyhow::Result<Self> {
        let crs = match raw {
            None => {
                return Err(ProcessError::UnsupportedCrs(
                    "no CRS declared (defaults to OGC:CRS84); project the data to a metric CRS"
                        .to_string(),
                )
                .into())
            }
            Some(Value::Null) => {
                warn!("Layer declares an unknown CRS; assuming projected metric coordinates");
                LayerCrs::Unknown
            }
            Some(Value::String(s)) => {
                // Some writers store PROJJSON as a string
                let parsed: Value = serde_json::from_str(s).map_err(|_| {
                    ProcessError::UnsupportedCrs(format!("unparseable CRS string: {}", s))
                })?;
                LayerCrs::Projjson(parsed)
            }
            Some(other) => LayerCrs::Projjson(other.clone()),
        };

        if crs.is_geographic() {
            return Err(ProcessError::UnsupportedCrs(format!(
                "geographic CRS {}; project the data to a metric CRS",
                crs.label()
            ))
            .into());
        }

        Ok(crs)
    }

    /// Minimal PROJJSON stub for a projected EPSG code
    pub fn epsg_projected(code: i64) -> Self {
        LayerCrs::Projjson(json!({
            "type": "ProjectedCRS",
            "id": { "authority": "EPSG", "code": code }
        }))
    }

    pub fn epsg(&self) -> Option<i64> {
        match self {
            LayerCrs::Unknown => None,
            LayerCrs::Projjson(value) => {
                let id = value.get("id")?;
                let authority = id.get("authority")?.as_str()?;
                if !authority.eq_ignore_ascii_case("EPSG") {
                    return None;
                }
                match id.get("code")? {
                    Value::Number(n) => n.as_i64(),
                    Value::String(s) => s.parse().ok(),
                    _ => None,
                }
            }
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            LayerCrs::Unknown => None,
            LayerCrs::Projjson(value) => value.get("name").and_then(Value::as_str),
        }
    }

    fn is_geographic(&self) -> bool {
        match self {
            LayerCrs::Unknown => false,
            LayerCrs::Projjson(value) => {
                let kind = value.get("type").and_then(Value::as_str).unwrap_or("");
                kind == "GeographicCRS"
                    || kind == "GeodeticCRS"
                    || matches!(self.epsg(), Some(4326) | Some(4674))
            }
        }
    }

    fn label(&self) -> String {
        match (self.name(), self.epsg()) {
            (_, Some(code)) => format!("EPSG:{}", code),
            (Some(name), None) => name.to_string(),
            (None, None) => "unnamed".to_string(),
        }
    }

    /// Value for the `crs` member when writing GeoParquet
    pub fn to_metadata(&self) -> Value {
        match self {
            LayerCrs::Unknown => Value::Null,
            LayerCrs::Projjson(value) => value.clone(),
        }
    }
}
