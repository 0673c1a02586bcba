//! Typed failures raised by the processing stages.
//!
//! Functions return `anyhow::Result`; these variants are what gets wrapped
//! so callers can `downcast_ref::<ProcessError>()` when they care.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("input data not found: {}", .0.display())]
    InputNotFound(PathBuf),

    #[error("column '{column}' not found in {source_name}")]
    MissingColumn { column: String, source_name: String },

    #[error("unsupported geometry type '{0}', expected Polygon or MultiPolygon")]
    UnsupportedGeometry(String),

    #[error("unsupported CRS: {0}")]
    UnsupportedCrs(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("triangulation failed for commune {commune_id}: {reason}")]
    Triangulation { commune_id: i64, reason: String },
}
