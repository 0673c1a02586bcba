//! Stage 2: per-commune constrained Voronoi tessellation.
//!
//! Each commune is repaired for overlaps, seeded from its polygon
//! boundaries and tessellated independently, so communes can be farmed out
//! to a worker pool.

pub mod overlaps;
mod parallel;
mod report;
mod tessellation;

pub use parallel::{merge_tessellations, ParallelVoronoiProcessor, DEFAULT_WORKERS};
pub use report::write_report;
pub use tessellation::{
    build_seeds, voronoi_cells, CommuneStats, CommuneTessellation, Seed, VoronoiOptions,
    VoronoiProcessor, DEFAULT_DENSIFY_DISTANCE,
};
