//! Optional TOML configuration shared by the binaries.
//!
//! Every section and key may be omitted; explicit command line flags take
//! precedence over values read here.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub relabel: RelabelConfig,
    pub tessellate: TessellateConfig,
    pub downscale: DownscaleConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PathsConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("data/raw"),
            output_dir: PathBuf::from("data/processed"),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RelabelConfig {
    pub communes: Option<Vec<i64>>,
    pub poly_id: Option<String>,
    pub num_cols: Option<Vec<String>>,
    pub count_cols: Option<Vec<String>>,
    pub id_length: Option<usize>,
    pub min_shared_len: Option<f64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TessellateConfig {
    pub communes: Option<Vec<i64>>,
    pub workers: Option<usize>,
    pub densify_distance: Option<f64>,
    pub boundary_buffer: Option<f64>,
    pub min_overlap_area: Option<f64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DownscaleConfig {
    pub se_data: Option<PathBuf>,
    pub aux_data: Option<PathBuf>,
    pub alpha: Option<f64>,
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Load `path` if given, defaults otherwise
    pub fn load_optional(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Relative names are taken from the input directory
    pub fn input_path(&self, name: &Path) -> PathBuf {
        resolve(&self.paths.input_dir, name)
    }

    /// Relative names are placed in the output directory
    pub fn output_path(&self, name: &Path) -> PathBuf {
        resolve(&self.paths.output_dir, name)
    }
}

fn resolve(dir: &Path, name: &Path) -> PathBuf {
    if name.is_absolute() {
        name.to_path_buf()
    } else {
        dir.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.paths.input_dir, PathBuf::from("data/raw"));
        assert!(config.tessellate.workers.is_none());
    }

    #[test]
    fn test_partial_config() {
        let config: Config = toml::from_str(
            r#"
            [paths]
            output_dir = "/tmp/out"

            [tessellate]
            workers = 4
            densify_distance = 5.0
            "#,
        )
        .unwrap();
        assert_eq!(config.paths.input_dir, PathBuf::from("data/raw"));
        assert_eq!(config.tessellate.workers, Some(4));
        assert_eq!(
            config.output_path(Path::new("voronoi.gpkg")),
            PathBuf::from("/tmp/out/voronoi.gpkg")
        );
        assert_eq!(
            config.input_path(Path::new("/abs/urban.parquet")),
            PathBuf::from("/abs/urban.parquet")
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("censo.toml");
        fs::write(&path, "[relabel]\ncommunes = [13110, 13201]\nmin_shared_len = 2.5\n").unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.relabel.communes, Some(vec![13110, 13201]));
        assert_eq!(config.relabel.min_shared_len, Some(2.5));
        assert!(Config::load_from_file(dir.path().join("missing.toml")).is_err());
    }
}
