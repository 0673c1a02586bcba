//! Add downscaled socioeconomic group shares and counts to processed
//! census polygons.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use censo_voronoi::attributes::{load_commune_socioeconomic, socioeconomic_downscaling, DEFAULT_ALPHA};
use censo_voronoi::config::Config;
use censo_voronoi::error::ProcessError;
use censo_voronoi::geoparquet::{read_layer, write_layer, ColumnMapping};
use censo_voronoi::merge::DEFAULT_NUMERIC_COLUMNS;

#[derive(Parser, Debug)]
#[command(name = "downscale")]
#[command(about = "Downscale commune socioeconomic shares to census polygons")]
struct Args {
    /// Processed polygons, relative to the output directory
    #[arg(short, long, default_value = "processed_polygons.parquet")]
    input: PathBuf,

    /// Socioeconomic group percentages per commune (Excel)
    #[arg(long)]
    se_data: Option<PathBuf>,

    /// Commune name to code lookup (Excel)
    #[arg(long)]
    aux_data: Option<PathBuf>,

    /// Output file, relative to the output directory
    #[arg(short, long, default_value = "processed_polygons_ses.parquet")]
    output: PathBuf,

    /// Name of the polygon identifier column
    #[arg(short, long, default_value = "block_id")]
    poly_id: String,

    /// Numeric columns to carry through
    #[arg(short, long, num_args = 1.., value_delimiter = ',')]
    num_cols: Option<Vec<String>>,

    /// Population column
    #[arg(long, default_value = "n_per")]
    pop_col: String,

    /// Mean years of schooling column
    #[arg(long, default_value = "prom_escolaridad18")]
    edu_col: String,

    /// Strength of the education adjustment
    #[arg(long)]
    alpha: Option<f64>,

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
    let section = &config.downscale;

    let se_data = args
        .se_data
        .clone()
        .or_else(|| section.se_data.clone())
        .ok_or_else(|| ProcessError::InvalidConfig("no socioeconomic workbook given (--se-data)".to_string()))?;
    let aux_data = args
        .aux_data
        .clone()
        .or_else(|| section.aux_data.clone())
        .ok_or_else(|| ProcessError::InvalidConfig("no commune lookup workbook given (--aux-data)".to_string()))?;
    let alpha = args.alpha.or(section.alpha).unwrap_or(DEFAULT_ALPHA);

    let mut numeric_columns = args
        .num_cols
        .clone()
        .unwrap_or_else(|| DEFAULT_NUMERIC_COLUMNS.iter().map(|c| c.to_string()).collect());
    for column in [&args.pop_col, &args.edu_col] {
        if !numeric_columns.contains(column) {
            numeric_columns.push(column.clone());
        }
    }

    let input_path = config.output_path(&args.input);
    let output_path = config.output_path(&args.output);
    let se_path = config.input_path(&se_data);
    let aux_path = config.input_path(&aux_data);

    info!("Socioeconomic downscaling (alpha = {})", alpha);

    let table = load_commune_socioeconomic(&se_path, &aux_path)?;
    info!("Loaded shares for {} communes", table.len());

    let layer = read_layer(
        &input_path,
        &ColumnMapping::processed(&args.poly_id),
        &numeric_columns,
    )?;
    let downscaled = socioeconomic_downscaling(&layer, &args.pop_col, &args.edu_col, alpha, &table)?;

    write_layer(&output_path, &downscaled, &args.poly_id)?;
    info!("Done: {} polygons written to {}", downscaled.len(), output_path.display());

    Ok(())
}
