//! censo-voronoi - census polygon preparation for zone design
//!
//! This library provides the shared types and processing steps for the
//! `relabel`, `tessellate` and `downscale` binaries.

pub mod attributes;
pub mod config;
pub mod contiguity;
pub mod crs;
pub mod error;
pub mod geometry;
pub mod geoparquet;
pub mod gpkg;
pub mod index;
pub mod merge;
pub mod models;
pub mod multipart;
pub mod voronoi;

pub use error::ProcessError;
pub use models::{CensusPolygon, PolygonLayer, ZoneType};
