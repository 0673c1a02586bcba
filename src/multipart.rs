//! Stage 1, step 2: split multipart polygons into single parts.
//!
//! Each part becomes its own record with a derived identifier. Count
//! attributes are shared out by part area; averages are copied.

use anyhow::Result;
use geo::{Area, MultiPolygon};
use tracing::{debug, info};

use crate::error::ProcessError;
use crate::geometry::parts;
use crate::geoparquet::normalize_id;
use crate::models::{CensusPolygon, PolygonLayer};

pub const DEFAULT_ID_LENGTH: usize = 16;
pub const DEFAULT_COUNT_COLUMNS: [&str; 2] = ["n_per", "n_vp_ocupada"];

#[derive(Debug, Clone)]
pub struct RelabelOptions {
    /// Identifiers are right-padded with '0' to this length
    pub id_length: usize,
    pub numeric_columns: Vec<String>,
    /// Numeric columns holding totals rather than averages
    pub count_columns: Vec<String>,
}

impl RelabelOptions {
    /// Default count columns that are among `numeric_columns` are treated
    /// as counts
    pub fn new(numeric_columns: Vec<String>) -> Self {
        let count_columns = DEFAULT_COUNT_COLUMNS
            .iter()
            .filter(|c| numeric_columns.iter().any(|n| n == *c))
            .map(|c| c.to_string())
            .collect();
        Self {
            id_length: DEFAULT_ID_LENGTH,
            numeric_columns,
            count_columns,
        }
    }

    /// Numeric columns that are not counts
    pub fn average_columns(&self) -> Vec<String> {
        self.numeric_columns
            .iter()
            .filter(|c| !self.count_columns.contains(c))
            .cloned()
            .collect()
    }
}

#[derive(Debug)]
pub struct MultipartPolygonRelabeller {
    options: RelabelOptions,
}

impl MultipartPolygonRelabeller {
    pub fn new(options: RelabelOptions) -> Result<Self> {
        let missing: Vec<&str> = options
            .count_columns
            .iter()
            .filter(|c| !options.numeric_columns.contains(c))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(ProcessError::InvalidConfig(format!(
                "count columns must be a subset of the numeric columns, missing: {}",
                missing.join(", ")
            ))
            .into());
        }
        Ok(Self { options })
    }

    pub fn options(&self) -> &RelabelOptions {
        &self.options
    }

    /// Relabel a whole layer; single-part records come first, then the
    /// exploded parts in input order.
    pub fn relabel(&self, layer: &PolygonLayer) -> PolygonLayer {
        let mut singles = Vec::new();
        let mut exploded = Vec::new();
        let mut multipart = 0usize;

        for record in &layer.records {
            let mut record = record.clone();
            record.poly_id = normalize_id(&record.poly_id);
            record.orig_id = Some(record.poly_id.clone());

            let pieces = parts(&record.geometry);
            if pieces.len() <= 1 {
                record.was_multipart = Some(false);
                record.poly_id = pad_id(&record.poly_id, self.options.id_length);
                singles.push(record);
                continue;
            }

            multipart += 1;
            debug!("Splitting {} into {} parts", record.poly_id, pieces.len());

            let areas: Vec<f64> = pieces.iter().map(|p| p.unsigned_area()).collect();
            let shares: Vec<(String, Vec<f64>)> = self
                .options
                .count_columns
                .iter()
                .map(|c| (c.clone(), apportion(record.value(c), &areas)))
                .collect();

            for (k, piece) in pieces.into_iter().enumerate() {
                let mut part = record.clone();
                part.poly_id = pad_id(
                    &format!("{}{:02}", record.poly_id, k + 1),
                    self.options.id_length,
                );
                part.was_multipart = Some(true);
                part.geometry = MultiPolygon::new(vec![piece]);
                for (column, values) in &shares {
                    part.set_value(column, values[k]);
                }
                exploded.push(part);
            }
        }

        info!(
            "Relabelled {} polygons: {} single-part, {} multipart split into {} parts",
            layer.len(),
            singles.len(),
            multipart,
            exploded.len()
        );

        singles.extend(exploded);
        layer.with_records(singles)
    }
}

/// Right-pad with '0'; longer identifiers are left as they are
pub fn pad_id(id: &str, length: usize) -> String {
    let mut padded = id.to_string();
    while padded.chars().count() < length {
        padded.push('0');
    }
    padded
}

/// Split an integer total across parts in proportion to `weights`, using
/// largest-remainder rounding so the shares sum to the total.
///
/// A missing total stays missing on every part. Without usable weights the
/// parts share equally.
pub fn apportion(total: f64, weights: &[f64]) -> Vec<f64> {
    if weights.is_empty() {
        return Vec::new();
    }
    if !total.is_finite() {
        return vec![f64::NAN; weights.len()];
    }

    let total = total.round();
    let weight_sum: f64 = weights.iter().sum();
    let exact: Vec<f64> = if weight_sum > 0.0 {
        weights.iter().map(|w| total * w / weight_sum).collect()
    } else {
        vec![total / weights.len() as f64; weights.len()]
    };

    let mut shares: Vec<f64> = exact.iter().map(|v| v.floor()).collect();
    let leftover = (total - shares.iter().sum::<f64>()).round().max(0.0) as usize;

    let mut order: Vec<usize> = (0..exact.len()).collect();
    // Stable sort keeps input order among equal remainders
    order.sort_by(|&a, &b| {
        let ra = exact[a] - shares[a];
        let rb = exact[b] - shares[b];
        rb.total_cmp(&ra)
    });
    for &i in order.iter().take(leftover) {
        shares[i] += 1.0;
    }

    shares
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::LayerCrs;
    use geo::polygon;

    fn square(x0: f64, size: f64) -> geo::Polygon<f64> {
        polygon![(x: x0, y: 0.0), (x: x0 + size, y: 0.0), (x: x0 + size, y: size), (x: x0, y: size)]
    }

    fn columns() -> Vec<String> {
        vec!["n_per".to_string(), "n_vp_ocupada".to_string(), "prom_escolaridad18".to_string()]
    }

    fn record(id: &str, polys: Vec<geo::Polygon<f64>>, n_per: f64) -> CensusPolygon {
        let mut r = CensusPolygon::new(13110, "LA FLORIDA", id, MultiPolygon::new(polys));
        r.set_value("n_per", n_per);
        r.set_value("n_vp_ocupada", 3.0);
        r.set_value("prom_escolaridad18", 11.5);
        r
    }

    fn relabeller() -> MultipartPolygonRelabeller {
        MultipartPolygonRelabeller::new(RelabelOptions::new(columns())).unwrap()
    }

    #[test]
    fn test_apportion_sums_to_total() {
        assert_eq!(apportion(10.0, &[1.0, 1.0, 1.0]), vec![4.0, 3.0, 3.0]);
        assert_eq!(apportion(7.0, &[30.0, 10.0]), vec![5.0, 2.0]);
        assert_eq!(apportion(0.0, &[1.0, 2.0]), vec![0.0, 0.0]);
        assert!(apportion(f64::NAN, &[1.0, 2.0]).iter().all(|v| v.is_nan()));

        let shares = apportion(101.0, &[0.3, 0.3, 0.4]);
        assert_eq!(shares.iter().sum::<f64>(), 101.0);
    }

    #[test]
    fn test_multipart_is_exploded_with_suffixes() {
        let layer = PolygonLayer::new(
            LayerCrs::Unknown,
            columns(),
            vec![
                record("13110011001002", vec![square(0.0, 10.0), square(20.0, 20.0)], 50.0),
                record("13110011001001.0", vec![square(100.0, 10.0)], 8.0),
            ],
        );

        let out = relabeller().relabel(&layer);
        let ids: Vec<&str> = out.records.iter().map(|r| r.poly_id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["1311001100100100", "1311001100100201", "1311001100100202"]
        );

        let single = &out.records[0];
        assert_eq!(single.orig_id.as_deref(), Some("13110011001001"));
        assert_eq!(single.was_multipart, Some(false));

        let (first, second) = (&out.records[1], &out.records[2]);
        assert_eq!(first.orig_id.as_deref(), Some("13110011001002"));
        assert_eq!(first.was_multipart, Some(true));
        // Areas 100 and 400
        assert_eq!(first.value("n_per"), 10.0);
        assert_eq!(second.value("n_per"), 40.0);
        assert_eq!(first.value("n_vp_ocupada") + second.value("n_vp_ocupada"), 3.0);
        assert_eq!(first.value("prom_escolaridad18"), 11.5);
        assert_eq!(second.value("prom_escolaridad18"), 11.5);
    }

    #[test]
    fn test_pad_never_truncates() {
        assert_eq!(pad_id("1311", 8), "13110000");
        assert_eq!(pad_id("13110011001001002", 16), "13110011001001002");
    }

    #[test]
    fn test_count_columns_must_be_numeric() {
        let mut options = RelabelOptions::new(vec!["n_per".to_string()]);
        options.count_columns = vec!["n_per".to_string(), "n_hog".to_string()];
        let err = MultipartPolygonRelabeller::new(options).unwrap_err();
        match err.downcast_ref::<ProcessError>() {
            Some(ProcessError::InvalidConfig(msg)) => assert!(msg.contains("n_hog")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
