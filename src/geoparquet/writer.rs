use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{ArrayRef, BinaryArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use geo::{BoundingRect, Geometry};
use geozero::{CoordDimensions, ToWkb};
use parquet::arrow::ArrowWriter;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use tracing::info;

use super::metadata::{GeoColumnMetadata, GeoMetadata, GEO_METADATA_KEY};
use super::{COMB_ADJ, COMMUNE, COMMUNE_ID, GEOMETRY, ORIG_ID, WAS_MULTIPART, ZONE_TYPE};
use crate::models::{CensusPolygon, PolygonLayer};

/// Write a layer as a GeoParquet 1.0 file, replacing any existing file.
///
/// Single-part geometries are stored as `Polygon`, others as `MultiPolygon`.
pub fn write_layer(path: &Path, layer: &PolygonLayer, poly_id_column: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let records = &layer.records;
    let mut fields = Vec::new();
    let mut columns: Vec<ArrayRef> = Vec::new();

    fields.push(Field::new(COMMUNE_ID, DataType::Int64, true));
    columns.push(Arc::new(Int64Array::from(
        records.iter().map(|r| Some(r.commune_id)).collect::<Vec<_>>(),
    )));

    fields.push(Field::new(COMMUNE, DataType::Utf8, true));
    columns.push(Arc::new(StringArray::from(
        records.iter().map(|r| Some(r.commune.clone())).collect::<Vec<_>>(),
    )));

    if records.iter().any(|r| r.orig_id.is_some()) {
        fields.push(Field::new(ORIG_ID, DataType::Utf8, true));
        columns.push(Arc::new(StringArray::from(
            records.iter().map(|r| r.orig_id.clone()).collect::<Vec<_>>(),
        )));
    }

    fields.push(Field::new(poly_id_column, DataType::Utf8, true));
    columns.push(Arc::new(StringArray::from(
        records.iter().map(|r| Some(r.poly_id.clone())).collect::<Vec<_>>(),
    )));

    if records.iter().any(|r| r.zone_type.is_some()) {
        fields.push(Field::new(ZONE_TYPE, DataType::Utf8, true));
        columns.push(Arc::new(StringArray::from(
            records
                .iter()
                .map(|r| r.zone_type.map(|z| z.as_str().to_string()))
                .collect::<Vec<_>>(),
        )));
    }

    if records.iter().any(|r| r.was_multipart.is_some()) {
        fields.push(Field::new(WAS_MULTIPART, DataType::Int64, true));
        columns.push(Arc::new(Int64Array::from(
            records
                .iter()
                .map(|r| r.was_multipart.map(i64::from))
                .collect::<Vec<_>>(),
        )));
    }

    if records.iter().any(|r| r.comb_adj.is_some()) {
        fields.push(Field::new(COMB_ADJ, DataType::Int64, true));
        columns.push(Arc::new(Int64Array::from(
            records.iter().map(|r| r.comb_adj).collect::<Vec<_>>(),
        )));
    }

    let mut wkb = Vec::with_capacity(records.len());
    for record in records {
        wkb.push(encode_wkb(record)?);
    }
    fields.push(Field::new(GEOMETRY, DataType::Binary, false));
    columns.push(Arc::new(BinaryArray::from_iter_values(wkb)));

    for name in &layer.numeric_columns {
        fields.push(Field::new(name, DataType::Float64, true));
        columns.push(Arc::new(Float64Array::from(
            records
                .iter()
                .map(|r| Some(r.value(name)).filter(|v| !v.is_nan()))
                .collect::<Vec<_>>(),
        )));
    }

    let schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(schema.clone(), columns)
        .context("Failed to assemble output record batch")?;

    let column_meta = GeoColumnMetadata {
        encoding: "WKB".to_string(),
        geometry_types: geometry_types(records),
        crs: layer.crs.clone(),
        bbox: layer_bbox(records),
    };
    let geo_json = GeoMetadata::for_column(GEOMETRY, &column_meta).to_json()?;
    let props = WriterProperties::builder()
        .set_key_value_metadata(Some(vec![KeyValue::new(
            GEO_METADATA_KEY.to_string(),
            geo_json,
        )]))
        .build();

    let file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    writer
        .write(&batch)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    writer.close()?;

    info!("Wrote {} polygons to {}", records.len(), path.display());
    Ok(())
}

fn encode_wkb(record: &CensusPolygon) -> Result<Vec<u8>> {
    let geometry = match record.geometry.0.as_slice() {
        [single] => Geometry::Polygon(single.clone()),
        _ => Geometry::MultiPolygon(record.geometry.clone()),
    };
    geometry
        .to_wkb(CoordDimensions::xy())
        .with_context(|| format!("Failed to encode geometry of {}", record.poly_id))
}

fn geometry_types(records: &[CensusPolygon]) -> Vec<String> {
    let mut types = Vec::new();
    if records.iter().any(|r| r.geometry.0.len() == 1) {
        types.push("Polygon".to_string());
    }
    if records.iter().any(|r| r.geometry.0.len() != 1) {
        types.push("MultiPolygon".to_string());
    }
    types
}

fn layer_bbox(records: &[CensusPolygon]) -> Option<[f64; 4]> {
    records
        .iter()
        .filter_map(|r| r.geometry.bounding_rect())
        .fold(None, |acc: Option<[f64; 4]>, rect| {
            let (min, max) = (rect.min(), rect.max());
            Some(match acc {
                None => [min.x, min.y, max.x, max.y],
                Some([x0, y0, x1, y1]) => [x0.min(min.x), y0.min(min.y), x1.max(max.x), y1.max(max.y)],
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::LayerCrs;
    use crate::geoparquet::{read_layer, ColumnMapping};
    use crate::models::ZoneType;
    use geo::{polygon, MultiPolygon};

    fn block(id: &str, x0: f64, parts: usize) -> CensusPolygon {
        let polys = (0..parts)
            .map(|k| {
                let x = x0 + 20.0 * k as f64;
                polygon![(x: x, y: 0.0), (x: x + 10.0, y: 0.0), (x: x + 10.0, y: 10.0), (x: x, y: 10.0)]
            })
            .collect();
        let mut record = CensusPolygon::new(13201, "PUENTE ALTO", id, MultiPolygon::new(polys));
        record.orig_id = Some(id.to_string());
        record.zone_type = Some(ZoneType::Urban);
        record.was_multipart = Some(parts > 1);
        record
    }

    #[test]
    fn test_processed_layer_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("processed_polygons.parquet");

        let mut single = block("1320100000000100", 0.0, 1);
        single.set_value("n_per", 40.0);
        let mut multi = block("1320100000000200", 100.0, 2);
        multi.set_value("n_per", f64::NAN);

        let layer = PolygonLayer::new(
            LayerCrs::epsg_projected(32719),
            vec!["n_per".to_string()],
            vec![single, multi],
        );
        write_layer(&path, &layer, "block_id").unwrap();

        let read = read_layer(
            &path,
            &ColumnMapping::processed("block_id"),
            &["n_per".to_string()],
        )
        .unwrap();

        assert_eq!(read.len(), 2);
        assert_eq!(read.crs.epsg(), Some(32719));

        let first = &read.records[0];
        assert_eq!(first.poly_id, "1320100000000100");
        assert_eq!(first.commune_id, 13201);
        assert_eq!(first.zone_type, Some(ZoneType::Urban));
        assert_eq!(first.was_multipart, Some(false));
        assert_eq!(first.value("n_per"), 40.0);
        assert_eq!(first.comb_adj, None);

        let second = &read.records[1];
        assert_eq!(second.geometry.0.len(), 2);
        assert_eq!(second.was_multipart, Some(true));
        assert!(second.value("n_per").is_nan());
        assert!((second.area() - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_geometry_types_and_bbox() {
        let records = vec![block("a", 0.0, 1), block("b", 100.0, 2)];
        assert_eq!(geometry_types(&records), vec!["Polygon", "MultiPolygon"]);
        assert_eq!(layer_bbox(&records), Some([0.0, 0.0, 130.0, 10.0]));
        assert_eq!(layer_bbox(&[]), None);
    }
}
