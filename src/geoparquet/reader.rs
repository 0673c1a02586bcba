use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use arrow::array::{Array, ArrayRef, AsArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float64Type, Int64Type};
use arrow::record_batch::RecordBatch;
use geo::MultiPolygon;
use geozero::wkb::Wkb;
use geozero::ToGeo;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tracing::{debug, info, warn};

use super::metadata::{GeoMetadata, GEO_METADATA_KEY};
use super::{normalize_id, ColumnMapping, COMB_ADJ, GEOMETRY, ORIG_ID, WAS_MULTIPART, ZONE_TYPE};
use crate::crs::LayerCrs;
use crate::error::ProcessError;
use crate::geometry::to_multi_polygon;
use crate::models::{CensusPolygon, PolygonLayer, ZoneType};

/// Read a GeoParquet file into a [`PolygonLayer`].
///
/// `numeric_columns` must all be present; they are read as `f64` whatever
/// their stored numeric type. Rows with a null geometry are skipped.
pub fn read_layer(
    path: &Path,
    mapping: &ColumnMapping,
    numeric_columns: &[String],
) -> Result<PolygonLayer> {
    info!("Reading {}", path.display());

    if !path.exists() {
        return Err(ProcessError::InputNotFound(path.to_path_buf()).into());
    }

    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("Failed to read parquet metadata of {}", path.display()))?;

    let geo_raw = builder
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .and_then(|kvs| kvs.iter().find(|kv| kv.key == GEO_METADATA_KEY))
        .and_then(|kv| kv.value.clone());

    let (geometry_column, crs) = match geo_raw {
        Some(raw) => {
            let meta = GeoMetadata::parse(&raw)?;
            let primary = meta.primary()?;
            (meta.primary_column.clone(), primary.crs)
        }
        None => {
            warn!(
                "{} has no GeoParquet metadata; reading WKB from '{}' with unknown CRS",
                path.display(),
                GEOMETRY
            );
            (GEOMETRY.to_string(), LayerCrs::Unknown)
        }
    };

    let source_name = path.display().to_string();
    let schema = builder.schema().clone();
    let required = [
        mapping.poly_id.as_str(),
        mapping.commune.as_str(),
        mapping.commune_id.as_str(),
        geometry_column.as_str(),
    ];
    for column in required
        .into_iter()
        .chain(numeric_columns.iter().map(String::as_str))
    {
        if schema.field_with_name(column).is_err() {
            return Err(ProcessError::MissingColumn {
                column: column.to_string(),
                source_name: source_name.clone(),
            }
            .into());
        }
    }

    let has = |name: &str| schema.field_with_name(name).is_ok();
    let (has_orig, has_zone, has_multipart, has_comb) =
        (has(ORIG_ID), has(ZONE_TYPE), has(WAS_MULTIPART), has(COMB_ADJ));

    let reader = builder.build()?;
    let mut records = Vec::new();
    let mut skipped = 0usize;
    let mut row_offset = 0usize;

    for batch in reader {
        let batch = batch.with_context(|| format!("Failed to read batch from {}", source_name))?;
        let column = |name: &str| batch_column(&batch, name);

        let ids = id_values(column(&mapping.poly_id)?)?;
        let communes = string_values(column(&mapping.commune)?)?;
        let commune_ids = float_values(column(&mapping.commune_id)?)?;
        let geometries = geometry_values(column(&geometry_column)?, row_offset)?;

        let orig_ids = if has_orig {
            Some(id_values(column(ORIG_ID)?)?)
        } else {
            None
        };
        let zone_types = if has_zone {
            Some(string_values(column(ZONE_TYPE)?)?)
        } else {
            None
        };
        let multipart_flags = if has_multipart {
            Some(float_values(column(WAS_MULTIPART)?)?)
        } else {
            None
        };
        let comb_flags = if has_comb {
            Some(float_values(column(COMB_ADJ)?)?)
        } else {
            None
        };

        let mut numeric: Vec<(&String, Vec<f64>)> = Vec::with_capacity(numeric_columns.len());
        for name in numeric_columns {
            numeric.push((name, float_values(column(name)?)?));
        }

        for row in 0..batch.num_rows() {
            let Some(geometry) = geometries[row].clone() else {
                debug!("Skipping row {} with null geometry", row_offset + row);
                skipped += 1;
                continue;
            };

            let commune_id = commune_ids[row];
            if !commune_id.is_finite() {
                debug!("Skipping row {} without commune id", row_offset + row);
                skipped += 1;
                continue;
            }

            let mut values = BTreeMap::new();
            for (name, column_values) in &numeric {
                values.insert((*name).clone(), column_values[row]);
            }

            records.push(CensusPolygon {
                commune_id: commune_id.trunc() as i64,
                commune: communes[row].clone().unwrap_or_default(),
                poly_id: ids[row].clone().unwrap_or_default(),
                orig_id: orig_ids.as_ref().and_then(|v| v[row].clone()),
                zone_type: zone_types
                    .as_ref()
                    .and_then(|v| v[row].as_deref())
                    .and_then(ZoneType::parse),
                was_multipart: multipart_flags
                    .as_ref()
                    .map(|v| v[row])
                    .filter(|f| f.is_finite())
                    .map(|f| f != 0.0),
                comb_adj: comb_flags
                    .as_ref()
                    .map(|v| v[row])
                    .filter(|f| f.is_finite())
                    .map(|f| f as i64),
                values,
                geometry,
            });
        }

        row_offset += batch.num_rows();
    }

    if skipped > 0 {
        warn!("Skipped {} rows without geometry or commune", skipped);
    }
    info!("Read {} polygons from {}", records.len(), source_name);

    Ok(PolygonLayer::new(crs, numeric_columns.to_vec(), records))
}

fn batch_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .with_context(|| format!("Column '{}' missing from batch", name))
}

/// Identifier column as normalised strings
fn id_values(array: &ArrayRef) -> Result<Vec<Option<String>>> {
    match array.data_type() {
        DataType::Float16 | DataType::Float32 | DataType::Float64 => {
            let floats = float_values(array)?;
            Ok(floats
                .into_iter()
                .map(|f| f.is_finite().then(|| format!("{}", f.trunc() as i64)))
                .collect())
        }
        t if t.is_integer() => {
            let ints = cast(array.as_ref(), &DataType::Int64)?;
            Ok(ints
                .as_primitive::<Int64Type>()
                .iter()
                .map(|v| v.map(|i| i.to_string()))
                .collect())
        }
        _ => Ok(string_values(array)?
            .into_iter()
            .map(|v| v.map(|s| normalize_id(&s)))
            .collect()),
    }
}

fn string_values(array: &ArrayRef) -> Result<Vec<Option<String>>> {
    let strings = cast(array.as_ref(), &DataType::Utf8)
        .with_context(|| format!("Cannot read {} column as text", array.data_type()))?;
    Ok(strings
        .as_string::<i32>()
        .iter()
        .map(|v| v.map(str::to_string))
        .collect())
}

/// Numeric column as f64, nulls become NaN
fn float_values(array: &ArrayRef) -> Result<Vec<f64>> {
    let floats = cast(array.as_ref(), &DataType::Float64)
        .with_context(|| format!("Cannot read {} column as numbers", array.data_type()))?;
    Ok(floats
        .as_primitive::<Float64Type>()
        .iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect())
}

fn geometry_values(array: &ArrayRef, row_offset: usize) -> Result<Vec<Option<MultiPolygon<f64>>>> {
    let decode = |row: usize, bytes: Option<&[u8]>| -> Result<Option<MultiPolygon<f64>>> {
        match bytes {
            None => Ok(None),
            Some(bytes) => {
                let geometry = Wkb(bytes)
                    .to_geo()
                    .with_context(|| format!("Invalid WKB geometry in row {}", row_offset + row))?;
                Ok(Some(to_multi_polygon(geometry)?))
            }
        }
    };

    match array.data_type() {
        DataType::Binary => array
            .as_binary::<i32>()
            .iter()
            .enumerate()
            .map(|(row, bytes)| decode(row, bytes))
            .collect(),
        DataType::LargeBinary => array
            .as_binary::<i64>()
            .iter()
            .enumerate()
            .map(|(row, bytes)| decode(row, bytes))
            .collect(),
        other => anyhow::bail!("Geometry column has type {}, expected WKB binary", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::{BinaryArray, Float64Array, Int64Array, StringArray};
    use arrow::datatypes::{Field, Schema};
    use geo::{polygon, Geometry};
    use geozero::{CoordDimensions, ToWkb};
    use parquet::arrow::ArrowWriter;
    use parquet::file::properties::WriterProperties;
    use parquet::file::metadata::KeyValue;

    const UTM_19S: &str = r#"{"version":"1.0.0","primary_column":"geometry","columns":{"geometry":{"encoding":"WKB","geometry_types":["Polygon"],"crs":{"type":"ProjectedCRS","id":{"authority":"EPSG","code":32719}}}}}"#;

    fn wkb_square(x0: f64) -> Vec<u8> {
        let square = polygon![(x: x0, y: 0.0), (x: x0 + 10.0, y: 0.0), (x: x0 + 10.0, y: 10.0), (x: x0, y: 10.0)];
        Geometry::Polygon(square).to_wkb(CoordDimensions::xy()).unwrap()
    }

    /// A file shaped like the census cartography: float ids, text CUT codes
    fn write_raw_census(path: &Path) {
        let schema = Arc::new(Schema::new(vec![
            Field::new("MANZENT", DataType::Float64, true),
            Field::new("COMUNA", DataType::Utf8, true),
            Field::new("CUT", DataType::Utf8, true),
            Field::new("n_per", DataType::Int64, true),
            Field::new("geometry", DataType::Binary, true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Float64Array::from(vec![13110011001001.0, 13110011001002.0])),
                Arc::new(StringArray::from(vec![Some("LA FLORIDA"), Some("LA FLORIDA")])),
                Arc::new(StringArray::from(vec![Some("13110"), Some("13110")])),
                Arc::new(Int64Array::from(vec![Some(25), None])),
                Arc::new(BinaryArray::from_iter_values(vec![wkb_square(0.0), wkb_square(10.0)])),
            ],
        )
        .unwrap();

        let props = WriterProperties::builder()
            .set_key_value_metadata(Some(vec![KeyValue::new(
                GEO_METADATA_KEY.to_string(),
                UTM_19S.to_string(),
            )]))
            .build();
        let file = File::create(path).unwrap();
        let mut writer = ArrowWriter::try_new(file, schema, Some(props)).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_read_raw_census_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manzanas.parquet");
        write_raw_census(&path);

        let layer = read_layer(
            &path,
            &ColumnMapping::raw_census(),
            &["n_per".to_string()],
        )
        .unwrap();

        assert_eq!(layer.len(), 2);
        assert_eq!(layer.crs.epsg(), Some(32719));

        let first = &layer.records[0];
        assert_eq!(first.poly_id, "13110011001001");
        assert_eq!(first.commune_id, 13110);
        assert_eq!(first.commune, "LA FLORIDA");
        assert_eq!(first.value("n_per"), 25.0);
        assert!((first.area() - 100.0).abs() < 1e-9);
        assert!(first.orig_id.is_none());

        // Null population reads as NaN
        assert!(layer.records[1].value("n_per").is_nan());
    }

    #[test]
    fn test_missing_numeric_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manzanas.parquet");
        write_raw_census(&path);

        let err = read_layer(
            &path,
            &ColumnMapping::raw_census(),
            &["n_vp_ocupada".to_string()],
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProcessError>(),
            Some(ProcessError::MissingColumn { column, .. }) if column == "n_vp_ocupada"
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = read_layer(
            Path::new("/nonexistent/manzanas.parquet"),
            &ColumnMapping::raw_census(),
            &[],
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProcessError>(),
            Some(ProcessError::InputNotFound(_))
        ));
    }
}
