//! Core data models for the census polygon pipeline.

pub mod census;
pub mod layer;

pub use census::{CensusPolygon, ZoneType};
pub use layer::PolygonLayer;
