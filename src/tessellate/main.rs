//! Stage 2: constrained Voronoi tessellation of processed census polygons,
//! one GeoPackage layer per commune plus a merged layer.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use censo_voronoi::config::Config;
use censo_voronoi::geoparquet::{read_layer, ColumnMapping};
use censo_voronoi::gpkg::{commune_layer_name, GpkgWriter, ALL_COMMUNES_LAYER};
use censo_voronoi::merge::{DEFAULT_COMMUNES, DEFAULT_NUMERIC_COLUMNS};
use censo_voronoi::voronoi::{
    merge_tessellations, write_report, ParallelVoronoiProcessor, VoronoiOptions, VoronoiProcessor,
    DEFAULT_WORKERS,
};

#[derive(Parser, Debug)]
#[command(name = "tessellate")]
#[command(about = "Generate constrained Voronoi polygons per commune")]
struct Args {
    /// Processed polygons from the relabel stage, relative to the output directory
    #[arg(short, long, default_value = "processed_polygons.parquet")]
    input: PathBuf,

    /// GeoPackage to create, relative to the output directory
    #[arg(short, long, default_value = "voronoi_polygons.gpkg")]
    output: PathBuf,

    /// Name of the polygon identifier column
    #[arg(short, long, default_value = "block_id")]
    poly_id: String,

    /// Numeric columns to carry through
    #[arg(short, long, num_args = 1.., value_delimiter = ',')]
    num_cols: Option<Vec<String>>,

    /// Commune codes to tessellate
    #[arg(short = 'c', long, num_args = 1.., value_delimiter = ',')]
    communes: Option<Vec<i64>>,

    /// Number of worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Process communes one after the other
    #[arg(long)]
    sequential: bool,

    /// Maximum distance between seeds along polygon boundaries
    #[arg(long)]
    densify_distance: Option<f64>,

    /// Buffer applied to the commune boundary
    #[arg(long)]
    boundary_buffer: Option<f64>,

    /// Smallest overlap area that gets repaired
    #[arg(long)]
    min_overlap_area: Option<f64>,

    /// Optional CSV with per-commune statistics
    #[arg(long)]
    report: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log debug output
    #[arg(long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load_optional(args.config.as_deref())?;
    let section = &config.tessellate;

    let defaults = VoronoiOptions::default();
    let options = VoronoiOptions {
        densify_distance: args
            .densify_distance
            .or(section.densify_distance)
            .unwrap_or(defaults.densify_distance),
        boundary_buffer: args
            .boundary_buffer
            .or(section.boundary_buffer)
            .unwrap_or(defaults.boundary_buffer),
        min_overlap_area: args
            .min_overlap_area
            .or(section.min_overlap_area)
            .unwrap_or(defaults.min_overlap_area),
    };
    let workers = if args.sequential {
        1
    } else {
        args.workers.or(section.workers).unwrap_or(DEFAULT_WORKERS)
    };
    let communes = args
        .communes
        .clone()
        .or_else(|| section.communes.clone())
        .unwrap_or_else(|| DEFAULT_COMMUNES.to_vec());
    let numeric_columns = args
        .num_cols
        .clone()
        .unwrap_or_else(|| DEFAULT_NUMERIC_COLUMNS.iter().map(|c| c.to_string()).collect());

    let input_path = config.output_path(&args.input);
    let output_path = config.output_path(&args.output);

    info!("Voronoi tessellation");
    info!("Input: {}", input_path.display());
    info!("Output: {}", output_path.display());
    info!("{:?}", options);

    let runner = ParallelVoronoiProcessor::new(VoronoiProcessor::new(options)?, workers)?;

    let layer = read_layer(
        &input_path,
        &ColumnMapping::processed(&args.poly_id),
        &numeric_columns,
    )?;
    let selected: Vec<_> = layer
        .records
        .iter()
        .filter(|r| communes.contains(&r.commune_id))
        .cloned()
        .collect();
    let layer = layer.with_records(selected);

    let found = layer.communes();
    for commune in &communes {
        if !found.contains(commune) {
            warn!("Commune {} has no polygons in {}", commune, input_path.display());
        }
    }
    info!("{} polygons in {} communes", layer.len(), found.len());

    let results = runner.process(&layer)?;

    let mut writer = GpkgWriter::create(&output_path, &layer.crs)?;
    for result in &results {
        let name = commune_layer_name(result.stats.commune_id);
        writer
            .write_layer(&name, &layer.with_records(result.records.clone()), &args.poly_id)
            .with_context(|| format!("Failed to write layer {}", name))?;
        info!(
            "{}: {} regions ({} duplicates, {} overlaps fixed)",
            name, result.stats.regions, result.stats.duplicates, result.stats.overlaps_fixed
        );
    }

    let merged = merge_tessellations(&layer, &results);
    writer.write_layer(ALL_COMMUNES_LAYER, &merged, &args.poly_id)?;
    info!("Done: {} regions written to {}", merged.len(), output_path.display());

    if let Some(report) = &args.report {
        let report_path = config.output_path(report);
        write_report(&report_path, &results)?;
        info!("Report written to {}", report_path.display());
    }

    Ok(())
}
