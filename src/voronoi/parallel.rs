//! Commune-level parallelism for the tessellation stage.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::info;

use super::tessellation::{CommuneTessellation, VoronoiProcessor};
use crate::error::ProcessError;
use crate::models::{CensusPolygon, PolygonLayer};

pub const DEFAULT_WORKERS: usize = 12;

const PROGRESS_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}) {msg}";

/// Runs [`VoronoiProcessor`] over every commune of a layer
#[derive(Debug)]
pub struct ParallelVoronoiProcessor {
    processor: VoronoiProcessor,
    workers: usize,
    show_progress: bool,
}

impl ParallelVoronoiProcessor {
    /// `workers <= 1` processes communes one after the other
    pub fn new(processor: VoronoiProcessor, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(ProcessError::InvalidConfig("workers must be at least 1".to_string()).into());
        }
        Ok(Self {
            processor,
            workers,
            show_progress: true,
        })
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Tessellate all communes, sorted by commune id.
    ///
    /// The first failing commune fails the run.
    pub fn process(&self, layer: &PolygonLayer) -> Result<Vec<CommuneTessellation>> {
        let communes: Vec<(i64, Vec<CensusPolygon>)> = layer.by_commune().into_iter().collect();
        info!(
            "Tessellating {} communes with {} worker(s)",
            communes.len(),
            self.workers
        );

        let pb = self.progress_bar(communes.len() as u64)?;
        let run = |(commune_id, records): &(i64, Vec<CensusPolygon>)| {
            let result = self
                .processor
                .process_commune(*commune_id, records)
                .with_context(|| format!("Failed to tessellate commune {}", commune_id));
            pb.inc(1);
            result
        };

        let mut results: Vec<CommuneTessellation> = if self.workers > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.workers)
                .build()
                .context("Failed to build worker pool")?;
            pool.install(|| communes.par_iter().map(run).collect::<Result<Vec<_>>>())?
        } else {
            communes.iter().map(run).collect::<Result<Vec<_>>>()?
        };

        pb.finish_with_message("Tessellation complete");

        results.sort_by_key(|t| t.stats.commune_id);
        Ok(results)
    }

    fn progress_bar(&self, len: u64) -> Result<ProgressBar> {
        if !self.show_progress {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(len);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(PROGRESS_TEMPLATE)?
                .progress_chars("#>-"),
        );
        Ok(pb)
    }
}

/// All regions of a run as one layer, in commune order
pub fn merge_tessellations(template: &PolygonLayer, results: &[CommuneTessellation]) -> PolygonLayer {
    let records = results
        .iter()
        .flat_map(|t| t.records.iter().cloned())
        .collect();
    template.with_records(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::LayerCrs;
    use crate::voronoi::VoronoiOptions;
    use geo::{polygon, MultiPolygon};

    fn block(commune_id: i64, id: &str, x0: f64) -> CensusPolygon {
        let p = polygon![(x: x0, y: 0.0), (x: x0 + 30.0, y: 0.0), (x: x0 + 30.0, y: 30.0), (x: x0, y: 30.0)];
        CensusPolygon::new(commune_id, "X", id, MultiPolygon::new(vec![p]))
    }

    fn layer() -> PolygonLayer {
        PolygonLayer::new(
            LayerCrs::Unknown,
            vec![],
            vec![
                block(13203, "c1", 0.0),
                block(13110, "a1", 1000.0),
                block(13203, "c2", 40.0),
                block(13110, "a2", 1040.0),
            ],
        )
    }

    fn runner(workers: usize) -> ParallelVoronoiProcessor {
        let processor = VoronoiProcessor::new(VoronoiOptions::default()).unwrap();
        ParallelVoronoiProcessor::new(processor, workers)
            .unwrap()
            .with_progress(false)
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let input = layer();
        let parallel = runner(4).process(&input).unwrap();
        let sequential = runner(1).process(&input).unwrap();

        let ids = |results: &[CommuneTessellation]| -> Vec<i64> {
            results.iter().map(|t| t.stats.commune_id).collect()
        };
        assert_eq!(ids(&parallel), vec![13110, 13203]);
        assert_eq!(ids(&parallel), ids(&sequential));

        for (p, s) in parallel.iter().zip(&sequential) {
            assert_eq!(p.records.len(), s.records.len());
            assert!((p.stats.region_area - s.stats.region_area).abs() < 1e-6);
        }

        let merged = merge_tessellations(&input, &parallel);
        let order: Vec<&str> = merged.records.iter().map(|r| r.poly_id.as_str()).collect();
        assert_eq!(order, vec!["a1", "a2", "c1", "c2"]);
    }

    #[test]
    fn test_progress_bar_shows_final_message() {
        assert!(PROGRESS_TEMPLATE.contains("{msg}"));
        let pb = runner(1).with_progress(true).progress_bar(2).unwrap();
        pb.finish_with_message("Tessellation complete");
        assert_eq!(pb.message(), "Tessellation complete");
    }

    #[test]
    fn test_zero_workers_rejected() {
        let processor = VoronoiProcessor::new(VoronoiOptions::default()).unwrap();
        assert!(ParallelVoronoiProcessor::new(processor, 0).is_err());
    }
}
