//! Stage 1, step 1: combine urban blocks and rural entities.
//!
//! Urban blocks lose any area covered by a rural entity so the two layers
//! do not overlap, then keep only their largest remaining part.

use std::path::{Path, PathBuf};

use anyhow::Result;
use geo::{unary_union, BooleanOps, MultiPolygon};
use tracing::{debug, info, warn};

use crate::error::ProcessError;
use crate::geometry::largest_part;
use crate::geoparquet::{read_layer, ColumnMapping};
use crate::index::PolygonIndex;
use crate::models::{CensusPolygon, PolygonLayer, ZoneType};

/// Communes of the south-eastern sector of the Metropolitan Region
pub const DEFAULT_COMMUNES: [i64; 7] = [13110, 13111, 13112, 13202, 13201, 13131, 13203];

pub const DEFAULT_NUMERIC_COLUMNS: [&str; 3] = ["n_per", "n_vp_ocupada", "prom_escolaridad18"];

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub communes: Vec<i64>,
    /// Name given to the polygon identifier column
    pub poly_id: String,
    pub numeric_columns: Vec<String>,
    /// Column used to drop unpopulated polygons
    pub population_column: String,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            communes: DEFAULT_COMMUNES.to_vec(),
            poly_id: "block_id".to_string(),
            numeric_columns: DEFAULT_NUMERIC_COLUMNS.iter().map(|c| c.to_string()).collect(),
            population_column: "n_per".to_string(),
        }
    }
}

/// Loads both census geographies and merges them into one layer
#[derive(Debug)]
pub struct UrbanRuralPolygonMerger {
    options: MergeOptions,
}

impl UrbanRuralPolygonMerger {
    pub fn new(options: MergeOptions) -> Result<Self> {
        if !options
            .numeric_columns
            .iter()
            .any(|c| c == &options.population_column)
        {
            return Err(ProcessError::InvalidConfig(format!(
                "population column '{}' is not among the numeric columns",
                options.population_column
            ))
            .into());
        }
        Ok(Self { options })
    }

    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    pub fn process(&self, urban_path: &Path, rural_path: &Path) -> Result<PolygonLayer> {
        for path in [urban_path, rural_path] {
            if !path.exists() {
                return Err(ProcessError::InputNotFound(absolute(path)).into());
            }
        }

        let urban = self.load(urban_path, ZoneType::Urban)?;
        let rural = self.load(rural_path, ZoneType::Rural)?;

        let crs = urban.crs.clone();
        if crs != rural.crs {
            warn!("Urban and rural inputs declare different CRSs; keeping the urban one");
        }

        let merged = self.merge(urban.records, rural.records);
        Ok(PolygonLayer::new(crs, self.options.numeric_columns.clone(), merged))
    }

    /// Subtract rural areas from urban blocks; urban rows come first
    pub fn merge(&self, urban: Vec<CensusPolygon>, rural: Vec<CensusPolygon>) -> Vec<CensusPolygon> {
        let rural_index = PolygonIndex::build(rural.iter().map(|r| &r.geometry));

        let mut merged = Vec::with_capacity(urban.len() + rural.len());
        let mut emptied = 0usize;
        let mut trimmed = 0usize;

        for mut block in urban {
            let candidates = rural_index.candidates_for(&block.geometry);
            if !candidates.is_empty() {
                let covering: MultiPolygon<f64> =
                    unary_union(candidates.iter().map(|&i| &rural[i].geometry));
                block.geometry = block.geometry.difference(&covering);
            }

            let Some(part) = largest_part(&block.geometry) else {
                debug!("Urban block {} is covered by rural entities", block.poly_id);
                emptied += 1;
                continue;
            };
            if block.geometry.0.len() > 1 {
                trimmed += 1;
            }
            block.geometry = MultiPolygon::new(vec![part]);
            merged.push(block);
        }

        if emptied > 0 {
            warn!("Dropped {} urban blocks left empty after removing rural areas", emptied);
        }
        info!(
            "Merged {} urban blocks ({} reduced to their largest part) with {} rural entities",
            merged.len(),
            trimmed,
            rural.len()
        );

        merged.extend(rural);
        merged
    }

    fn load(&self, path: &Path, zone_type: ZoneType) -> Result<PolygonLayer> {
        let mut layer = read_layer(
            path,
            &ColumnMapping::raw_census(),
            &self.options.numeric_columns,
        )?;

        let total = layer.len();
        let population = &self.options.population_column;
        layer.records.retain(|r| {
            let pop = r.value(population);
            self.options.communes.contains(&r.commune_id) && pop > 0.0
        });
        for record in &mut layer.records {
            record.zone_type = Some(zone_type);
        }

        info!(
            "{}: kept {} of {} polygons in {} communes",
            zone_type,
            layer.len(),
            total,
            self.options.communes.len()
        );
        Ok(layer)
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
