//! Stage 1: merge urban blocks with rural entities and split multipart
//! polygons into single parts with their own identifiers.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use censo_voronoi::config::Config;
use censo_voronoi::contiguity::{ContiguityOptions, ContiguityResolver, DEFAULT_MIN_SHARED_LEN};
use censo_voronoi::geoparquet::write_layer;
use censo_voronoi::merge::{MergeOptions, UrbanRuralPolygonMerger};
use censo_voronoi::multipart::{MultipartPolygonRelabeller, RelabelOptions};

#[derive(Parser, Debug)]
#[command(name = "relabel")]
#[command(about = "Process Chilean census polygons into single-part polygons")]
struct Args {
    /// Urban census polygons (manzanas), relative to the input directory
    #[arg(short, long, default_value = "Cartografía_censo2024_R13_Manzanas.parquet")]
    urban: PathBuf,

    /// Rural census polygons (entidades), relative to the input directory
    #[arg(short, long, default_value = "Cartografía_censo2024_R13_Entidades.parquet")]
    rural: PathBuf,

    /// Name of the polygon identifier column
    #[arg(short, long)]
    poly_id: Option<String>,

    /// Commune codes to include
    #[arg(short = 'c', long, num_args = 1.., value_delimiter = ',')]
    communes: Option<Vec<i64>>,

    /// Numeric columns to carry through
    #[arg(short, long, num_args = 1.., value_delimiter = ',')]
    num_cols: Option<Vec<String>>,

    /// Numeric columns holding counts, split by area between parts
    #[arg(long, num_args = 1.., value_delimiter = ',')]
    count_cols: Option<Vec<String>>,

    /// Population column used to drop empty polygons
    #[arg(long, default_value = "n_per")]
    pop_col: String,

    /// Identifier length after padding
    #[arg(long)]
    id_length: Option<usize>,

    /// Output file with processed polygons, relative to the output directory
    #[arg(short, long, default_value = "processed_polygons.parquet")]
    output: PathBuf,

    /// Fold split parts back together with adjacent polygons
    #[arg(long)]
    resolve_contiguity: bool,

    /// Minimum shared boundary length for adjacency
    #[arg(long)]
    min_shared_len: Option<f64>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long)]
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
    let section = &config.relabel;

    let defaults = MergeOptions::default();
    let merge_options = MergeOptions {
        communes: args
            .communes
            .clone()
            .or_else(|| section.communes.clone())
            .unwrap_or(defaults.communes),
        poly_id: args
            .poly_id
            .clone()
            .or_else(|| section.poly_id.clone())
            .unwrap_or(defaults.poly_id),
        numeric_columns: args
            .num_cols
            .clone()
            .or_else(|| section.num_cols.clone())
            .unwrap_or(defaults.numeric_columns),
        population_column: args.pop_col.clone(),
    };

    let mut relabel_options = RelabelOptions::new(merge_options.numeric_columns.clone());
    if let Some(count_cols) = args.count_cols.clone().or_else(|| section.count_cols.clone()) {
        relabel_options.count_columns = count_cols;
    }
    if let Some(id_length) = args.id_length.or(section.id_length) {
        relabel_options.id_length = id_length;
    }

    let urban_path = config.input_path(&args.urban);
    let rural_path = config.input_path(&args.rural);
    let output_path = config.output_path(&args.output);

    info!("Census polygon relabelling");
    info!("Urban: {}", urban_path.display());
    info!("Rural: {}", rural_path.display());
    info!("Communes: {:?}", merge_options.communes);

    // Validate every option before touching the data
    let merger = UrbanRuralPolygonMerger::new(merge_options.clone())?;
    let relabeller = MultipartPolygonRelabeller::new(relabel_options.clone())?;
    let resolver = if args.resolve_contiguity {
        let mut options = ContiguityOptions::from_relabel(&relabel_options, &merge_options.population_column);
        options.min_shared_len = args
            .min_shared_len
            .or(section.min_shared_len)
            .unwrap_or(DEFAULT_MIN_SHARED_LEN);
        Some(ContiguityResolver::new(options)?)
    } else {
        None
    };

    let merged = merger.process(&urban_path, &rural_path)?;
    let mut processed = relabeller.relabel(&merged);

    if let Some(resolver) = resolver {
        let (resolved, stats) = resolver.resolve(&processed);
        info!(
            "Resolved {} of {} multipart groups by contiguity",
            stats.groups - stats.unresolved,
            stats.groups
        );
        processed = resolved;
    }

    write_layer(&output_path, &processed, &merge_options.poly_id)?;
    info!("Done: {} polygons written to {}", processed.len(), output_path.display());

    Ok(())
}
