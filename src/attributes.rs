//! Socioeconomic attributes downscaled from commune to polygon level.
//!
//! Commune shares of the high (AB, C1a, C1b), middle (C2, C3) and low
//! (D, E) groups are nudged per polygon by its education percentile and
//! turned into population counts.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, DataType, Reader};
use hashbrown::HashMap;
use tracing::{info, warn};

use crate::error::ProcessError;
use crate::models::PolygonLayer;

/// Rows above the header in the socioeconomic workbook
const SE_HEADER_ROW: usize = 3;

const AUX_NAME_COLUMN: &str = "Nombre Comuna";
const AUX_CODE_COLUMN: &str = "Código Comuna 2018";

pub const DEFAULT_ALPHA: f64 = 0.2;

/// Columns added by [`socioeconomic_downscaling`], in output order
pub const DOWNSCALED_COLUMNS: [&str; 6] = [
    "adj_p_low",
    "adj_p_middle",
    "adj_p_high",
    "pop_low",
    "pop_middle",
    "pop_high",
];

/// Population shares of one commune; NaN when the commune has no data
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommuneShares {
    pub p_high: f64,
    pub p_middle: f64,
    pub p_low: f64,
}

impl CommuneShares {
    fn missing() -> Self {
        Self {
            p_high: f64::NAN,
            p_middle: f64::NAN,
            p_low: f64::NAN,
        }
    }
}

/// Shares keyed by commune CUT code
pub type SocioeconomicTable = BTreeMap<i64, CommuneShares>;

/// Upper-case and transliterate a commune name for joining
pub fn normalize_commune_name(name: &str) -> String {
    deunicode::deunicode(&name.trim().to_uppercase())
}

/// Load commune shares from the socioeconomic workbook and the commune
/// code lookup workbook
pub fn load_commune_socioeconomic(se_path: &Path, aux_path: &Path) -> Result<SocioeconomicTable> {
    info!(
        "Loading socioeconomic data from {} and {}",
        se_path.display(),
        aux_path.display()
    );

    let se_rows = read_first_sheet(se_path)?;
    let aux_rows = read_first_sheet(aux_path)?;

    let shares = parse_se_rows(&se_rows, &se_path.display().to_string())?;
    let codes = parse_aux_rows(&aux_rows, &aux_path.display().to_string())?;

    let table = join_shares(&codes, &shares);
    info!("Loaded socioeconomic shares for {} communes", table.len());
    Ok(table)
}

/// Rows of the first worksheet, padded so row 0 is the sheet's first row
fn read_first_sheet(path: &Path) -> Result<Vec<Vec<Data>>> {
    if !path.exists() {
        return Err(ProcessError::InputNotFound(path.to_path_buf()).into());
    }
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("Failed to open workbook {}", path.display()))?;
    let range = workbook
        .worksheet_range_at(0)
        .with_context(|| format!("Workbook {} has no worksheets", path.display()))?
        .with_context(|| format!("Failed to read first worksheet of {}", path.display()))?;

    let leading = range.start().map_or(0, |(row, _)| row as usize);
    let mut rows = vec![Vec::new(); leading];
    rows.extend(range.rows().map(|row| row.to_vec()));
    Ok(rows)
}

fn cell_text(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty => None,
        other => other.as_string().map(|s| s.trim().to_string()),
    }
}

fn cell_number(cell: Option<&Data>) -> f64 {
    cell.and_then(|c| c.as_f64()).unwrap_or(f64::NAN)
}

fn header_position(header: &[Option<String>], name: &str, source_name: &str) -> Result<usize> {
    header
        .iter()
        .position(|h| h.as_deref() == Some(name))
        .ok_or_else(|| {
            ProcessError::MissingColumn {
                column: name.to_string(),
                source_name: source_name.to_string(),
            }
            .into()
        })
}

/// Parse the socioeconomic sheet into shares keyed by normalised commune name.
///
/// The header sits below three title rows; the last column is a total and
/// is ignored; the first column holds the commune name.
pub fn parse_se_rows(rows: &[Vec<Data>], source_name: &str) -> Result<HashMap<String, CommuneShares>> {
    let header_row = rows.get(SE_HEADER_ROW).ok_or_else(|| ProcessError::MissingColumn {
        column: "header row".to_string(),
        source_name: source_name.to_string(),
    })?;
    let mut header: Vec<Option<String>> = header_row.iter().map(cell_text).collect();
    header.pop();

    let position = |name: &str| header_position(&header, name, source_name);
    let groups = ["AB", "C1a", "C1b", "C2", "C3", "D", "E"];
    let mut positions = HashMap::new();
    for group in groups {
        positions.insert(group, position(group)?);
    }

    let mut shares = HashMap::new();
    for row in rows.iter().skip(SE_HEADER_ROW + 1) {
        let Some(name) = row.first().and_then(cell_text) else {
            continue;
        };
        let pct = |group: &str| cell_number(row.get(positions[group]));
        shares.insert(
            normalize_commune_name(&name),
            CommuneShares {
                p_high: (pct("AB") + pct("C1a") + pct("C1b")) / 100.0,
                p_middle: (pct("C2") + pct("C3")) / 100.0,
                p_low: (pct("D") + pct("E")) / 100.0,
            },
        );
    }

    Ok(shares)
}

/// Parse the lookup sheet into `(normalised name, commune code)` pairs.
/// Rows without a code are dropped.
pub fn parse_aux_rows(rows: &[Vec<Data>], source_name: &str) -> Result<Vec<(String, i64)>> {
    let header: Vec<Option<String>> = rows
        .first()
        .map(|r| r.iter().map(cell_text).collect())
        .unwrap_or_default();
    let name_pos = header_position(&header, AUX_NAME_COLUMN, source_name)?;
    let code_pos = header_position(&header, AUX_CODE_COLUMN, source_name)?;

    Ok(rows
        .iter()
        .skip(1)
        .filter_map(|row| {
            let name = row.get(name_pos).and_then(cell_text)?;
            let code = cell_number(row.get(code_pos));
            code.is_finite()
                .then(|| (normalize_commune_name(&name), code.trunc() as i64))
        })
        .collect())
}

/// Left join of the code lookup with the shares
pub fn join_shares(
    codes: &[(String, i64)],
    shares: &HashMap<String, CommuneShares>,
) -> SocioeconomicTable {
    let mut table = SocioeconomicTable::new();
    for (name, code) in codes {
        let entry = shares.get(name).copied().unwrap_or_else(|| {
            warn!("No socioeconomic data for commune {} ({})", name, code);
            CommuneShares::missing()
        });
        table.insert(*code, entry);
    }
    table
}

/// Percentile rank of each value, ties sharing their average rank.
/// NaN inputs stay NaN and do not count.
pub fn percentile_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).filter(|&i| !values[i].is_nan()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let count = order.len() as f64;
    let mut ranks = vec![f64::NAN; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end + 1 < order.len() && values[order[end + 1]] == values[order[start]] {
            end += 1;
        }
        // 1-based ranks start+1 ..= end+1
        let average = (start + end + 2) as f64 / 2.0;
        for &i in &order[start..=end] {
            ranks[i] = average / count;
        }
        start = end + 1;
    }
    ranks
}

/// Add downscaled shares and population counts to every record.
///
/// The education percentile is taken over the whole layer.
pub fn socioeconomic_downscaling(
    layer: &PolygonLayer,
    pop_col: &str,
    edu_col: &str,
    alpha: f64,
    table: &SocioeconomicTable,
) -> Result<PolygonLayer> {
    for column in [pop_col, edu_col] {
        if !layer.numeric_columns.iter().any(|c| c == column) {
            return Err(ProcessError::MissingColumn {
                column: column.to_string(),
                source_name: "input layer".to_string(),
            }
            .into());
        }
    }

    let education: Vec<f64> = layer.records.iter().map(|r| r.value(edu_col)).collect();
    let percentiles = percentile_ranks(&education);

    let mut output = layer.clone();
    for column in DOWNSCALED_COLUMNS {
        output.ensure_numeric_column(column);
    }

    let mut without_data = 0usize;
    for (record, pctl) in output.records.iter_mut().zip(percentiles) {
        let shares = table
            .get(&record.commune_id)
            .copied()
            .unwrap_or_else(CommuneShares::missing);
        if shares.p_high.is_nan() {
            without_data += 1;
        }

        let d = (3.0 * (pctl - 0.5)).tanh();
        let high = (shares.p_high + alpha * d).max(0.0);
        let low = (shares.p_low - alpha * d).max(0.0);
        let middle = (1.0 - (shares.p_high + alpha * d) - (shares.p_low - alpha * d)).max(0.0);
        let total = high + low + middle;
        let (adj_low, adj_middle, adj_high) = (low / total, middle / total, high / total);

        let pop = record.value(pop_col);
        let pop_low = (pop * adj_low).round_ties_even();
        let pop_middle = (pop * adj_middle).round_ties_even();

        record.set_value("adj_p_low", adj_low);
        record.set_value("adj_p_middle", adj_middle);
        record.set_value("adj_p_high", adj_high);
        record.set_value("pop_low", pop_low);
        record.set_value("pop_middle", pop_middle);
        record.set_value("pop_high", pop - pop_low - pop_middle);
    }

    if without_data > 0 {
        warn!("{} polygons lack commune socioeconomic data", without_data);
    }
    info!("Downscaled socioeconomic groups for {} polygons", output.len());
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::LayerCrs;
    use crate::models::CensusPolygon;
    use geo::MultiPolygon;

    fn s(v: &str) -> Data {
        Data::String(v.to_string())
    }

    fn f(v: f64) -> Data {
        Data::Float(v)
    }

    fn se_rows() -> Vec<Vec<Data>> {
        vec![
            vec![s("GSE Chile")],
            vec![],
            vec![s("Porcentaje por comuna")],
            vec![s("Comuna"), s("AB"), s("C1a"), s("C1b"), s("C2"), s("C3"), s("D"), s("E"), s("Total")],
            vec![s("Peñalolén"), f(5.0), f(5.0), f(10.0), f(20.0), f(20.0), f(25.0), f(15.0), f(100.0)],
            vec![s("La Florida"), f(2.0), f(8.0), f(10.0), f(30.0), f(20.0), f(20.0), f(10.0), f(100.0)],
        ]
    }

    fn aux_rows() -> Vec<Vec<Data>> {
        vec![
            vec![s("Código Comuna 2018"), s("Nombre Comuna")],
            vec![f(13122.0), s("Peñalolén")],
            vec![Data::Int(13110), s("La Florida")],
            vec![f(13111.0), s("La Granja")],
            vec![Data::Empty, s("Sin código")],
        ]
    }

    #[test]
    fn test_normalize_commune_name() {
        assert_eq!(normalize_commune_name("Peñalolén"), "PENALOLEN");
        assert_eq!(normalize_commune_name(" Ñuñoa "), "NUNOA");
    }

    #[test]
    fn test_se_and_aux_join() {
        let shares = parse_se_rows(&se_rows(), "se.xlsx").unwrap();
        let codes = parse_aux_rows(&aux_rows(), "aux.xlsx").unwrap();
        assert_eq!(codes.len(), 3);

        let table = join_shares(&codes, &shares);
        let penalolen = table[&13122];
        assert!((penalolen.p_high - 0.20).abs() < 1e-12);
        assert!((penalolen.p_middle - 0.40).abs() < 1e-12);
        assert!((penalolen.p_low - 0.40).abs() < 1e-12);
        assert!((table[&13110].p_middle - 0.50).abs() < 1e-12);
        assert!(table[&13111].p_high.is_nan());
    }

    #[test]
    fn test_missing_group_column() {
        let mut rows = se_rows();
        rows[3][1] = s("A+B");
        let err = parse_se_rows(&rows, "se.xlsx").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProcessError>(),
            Some(ProcessError::MissingColumn { column, .. }) if column == "AB"
        ));
    }

    #[test]
    fn test_percentile_ranks_average_ties() {
        let ranks = percentile_ranks(&[10.0, 12.0, 10.0, f64::NAN, 14.0]);
        assert_eq!(ranks[0], 0.375);
        assert_eq!(ranks[2], 0.375);
        assert_eq!(ranks[1], 0.75);
        assert_eq!(ranks[4], 1.0);
        assert!(ranks[3].is_nan());
    }

    fn record(commune_id: i64, n_per: f64, edu: f64) -> CensusPolygon {
        let mut r = CensusPolygon::new(commune_id, "X", "1", MultiPolygon::new(vec![]));
        r.set_value("n_per", n_per);
        r.set_value("prom_escolaridad18", edu);
        r
    }

    #[test]
    fn test_downscaling_preserves_population() {
        let mut table = SocioeconomicTable::new();
        table.insert(
            13110,
            CommuneShares {
                p_high: 0.2,
                p_middle: 0.5,
                p_low: 0.3,
            },
        );
        let layer = PolygonLayer::new(
            LayerCrs::Unknown,
            vec!["n_per".to_string(), "prom_escolaridad18".to_string()],
            vec![
                record(13110, 101.0, 9.0),
                record(13110, 57.0, 11.0),
                record(13110, 80.0, 15.0),
                record(99999, 10.0, 12.0),
            ],
        );

        let out = socioeconomic_downscaling(&layer, "n_per", "prom_escolaridad18", DEFAULT_ALPHA, &table).unwrap();
        assert_eq!(&out.numeric_columns[2..], &DOWNSCALED_COLUMNS);

        for r in &out.records[..3] {
            let sum = r.value("adj_p_low") + r.value("adj_p_middle") + r.value("adj_p_high");
            assert!((sum - 1.0).abs() < 1e-12);
            let pops = r.value("pop_low") + r.value("pop_middle") + r.value("pop_high");
            assert_eq!(pops, r.value("n_per"));
            assert_eq!(r.value("pop_low").fract(), 0.0);
        }

        // Higher education shifts the mix towards the high group
        assert!(out.records[2].value("adj_p_high") > out.records[0].value("adj_p_high"));
        assert!(out.records[2].value("adj_p_low") < out.records[0].value("adj_p_low"));

        // Commune without data
        assert!(out.records[3].value("pop_low").is_nan());
    }

    #[test]
    fn test_downscaling_requires_columns() {
        let layer = PolygonLayer::new(LayerCrs::Unknown, vec!["n_per".to_string()], vec![]);
        assert!(socioeconomic_downscaling(&layer, "n_per", "prom_escolaridad18", 0.2, &SocioeconomicTable::new()).is_err());
    }
}
