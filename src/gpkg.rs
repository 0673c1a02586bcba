//! GeoPackage output for the tessellation stage.
//!
//! Tables are written directly through SQLite: the mandatory
//! `gpkg_spatial_ref_sys`, `gpkg_contents` and `gpkg_geometry_columns`
//! tables plus one feature table per layer with a `MULTIPOLYGON` column in
//! GeoPackage binary encoding.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use geo::{BoundingRect, Geometry, Rect};
use geozero::{CoordDimensions, ToWkb};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use tracing::{info, warn};

use crate::crs::LayerCrs;
use crate::error::ProcessError;
use crate::geoparquet::{COMB_ADJ, COMMUNE, COMMUNE_ID, ORIG_ID, WAS_MULTIPART, ZONE_TYPE};
use crate::models::{CensusPolygon, PolygonLayer};

/// "GPKG" as a big-endian integer
const APPLICATION_ID: i32 = 0x4750_4B47;
/// GeoPackage 1.4.0
const USER_VERSION: i32 = 10400;

pub const GEOMETRY_COLUMN: &str = "geom";

const WKT_UTM_19S: &str = r#"PROJCS["WGS 84 / UTM zone 19S",GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AUTHORITY["EPSG","4326"]],PROJECTION["Transverse_Mercator"],PARAMETER["latitude_of_origin",0],PARAMETER["central_meridian",-69],PARAMETER["scale_factor",0.9996],PARAMETER["false_easting",500000],PARAMETER["false_northing",10000000],UNIT["metre",1,AUTHORITY["EPSG","9001"]],AXIS["Easting",EAST],AXIS["Northing",NORTH],AUTHORITY["EPSG","32719"]]"#;

const WKT_WGS84: &str = r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AXIS["Latitude",NORTH],AXIS["Longitude",EAST],AUTHORITY["EPSG","4326"]]"#;

const CREATE_METADATA_TABLES: &str = "
CREATE TABLE gpkg_spatial_ref_sys (
    srs_name TEXT NOT NULL,
    srs_id INTEGER PRIMARY KEY,
    organization TEXT NOT NULL,
    organization_coordsys_id INTEGER NOT NULL,
    definition TEXT NOT NULL,
    description TEXT
);
CREATE TABLE gpkg_contents (
    table_name TEXT NOT NULL PRIMARY KEY,
    data_type TEXT NOT NULL,
    identifier TEXT UNIQUE,
    description TEXT DEFAULT '',
    last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    min_x DOUBLE,
    min_y DOUBLE,
    max_x DOUBLE,
    max_y DOUBLE,
    srs_id INTEGER,
    CONSTRAINT fk_gc_r_srs_id FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys(srs_id)
);
CREATE TABLE gpkg_geometry_columns (
    table_name TEXT NOT NULL,
    column_name TEXT NOT NULL,
    geometry_type_name TEXT NOT NULL,
    srs_id INTEGER NOT NULL,
    z TINYINT NOT NULL,
    m TINYINT NOT NULL,
    CONSTRAINT pk_geom_cols PRIMARY KEY (table_name, column_name),
    CONSTRAINT uk_gc_table_name UNIQUE (table_name),
    CONSTRAINT fk_gc_tn FOREIGN KEY (table_name) REFERENCES gpkg_contents(table_name),
    CONSTRAINT fk_gc_srs FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys (srs_id)
);
";

/// Spatial reference row of the package
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialRef {
    pub srs_id: i32,
    pub name: String,
    pub definition: String,
}

impl SpatialRef {
    /// Map a layer CRS onto a GeoPackage SRS. Without an EPSG code the
    /// undefined Cartesian SRS (-1) is used.
    pub fn from_crs(crs: &LayerCrs) -> Self {
        match crs.epsg().and_then(|code| i32::try_from(code).ok()) {
            Some(code) => Self {
                srs_id: code,
                name: crs
                    .name()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("EPSG:{}", code)),
                definition: match code {
                    32719 => WKT_UTM_19S.to_string(),
                    4326 => WKT_WGS84.to_string(),
                    _ => "undefined".to_string(),
                },
            },
            None => {
                if crs != &LayerCrs::Unknown {
                    warn!("CRS has no EPSG code; GeoPackage layers use the undefined SRS");
                }
                Self::undefined()
            }
        }
    }

    fn undefined() -> Self {
        Self {
            srs_id: -1,
            name: "Undefined cartesian SRS".to_string(),
            definition: "undefined".to_string(),
        }
    }
}

pub struct GpkgWriter {
    conn: Connection,
    path: PathBuf,
    srs: SpatialRef,
}

impl GpkgWriter {
    /// Create a new GeoPackage, replacing any file at `path`
    pub fn create(path: &Path, crs: &LayerCrs) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to replace {}", path.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to create GeoPackage {}", path.display()))?;
        conn.execute_batch(&format!(
            "PRAGMA application_id = {};\nPRAGMA user_version = {};\n{}",
            APPLICATION_ID, USER_VERSION, CREATE_METADATA_TABLES
        ))
        .context("Failed to initialise GeoPackage tables")?;

        let srs = SpatialRef::from_crs(crs);
        let insert_srs = "INSERT OR REPLACE INTO gpkg_spatial_ref_sys \
             (srs_name, srs_id, organization, organization_coordsys_id, definition, description) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)";
        conn.execute(
            insert_srs,
            params!["Undefined cartesian SRS", -1, "NONE", -1, "undefined", "undefined cartesian coordinate reference system"],
        )?;
        conn.execute(
            insert_srs,
            params!["Undefined geographic SRS", 0, "NONE", 0, "undefined", "undefined geographic coordinate reference system"],
        )?;
        conn.execute(
            insert_srs,
            params!["WGS 84 geodetic", 4326, "EPSG", 4326, WKT_WGS84, "longitude/latitude coordinates in decimal degrees on the WGS 84 spheroid"],
        )?;
        if !matches!(srs.srs_id, -1 | 0 | 4326) {
            conn.execute(
                insert_srs,
                params![srs.name, srs.srs_id, "EPSG", srs.srs_id, srs.definition, Option::<String>::None],
            )?;
        }

        info!("Created GeoPackage {} (srs_id {})", path.display(), srs.srs_id);
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            srs,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn srs(&self) -> &SpatialRef {
        &self.srs
    }

    /// Write a layer as a new feature table
    pub fn write_layer(&mut self, name: &str, layer: &PolygonLayer, poly_id_column: &str) -> Result<()> {
        if name.is_empty() {
            return Err(ProcessError::InvalidConfig("empty GeoPackage layer name".to_string()).into());
        }

        let records = &layer.records;
        let mut columns: Vec<(String, &str)> = vec![
            (COMMUNE_ID.to_string(), "INTEGER"),
            (COMMUNE.to_string(), "TEXT"),
        ];
        let has_orig = records.iter().any(|r| r.orig_id.is_some());
        let has_zone = records.iter().any(|r| r.zone_type.is_some());
        let has_multipart = records.iter().any(|r| r.was_multipart.is_some());
        let has_comb = records.iter().any(|r| r.comb_adj.is_some());
        if has_orig {
            columns.push((ORIG_ID.to_string(), "TEXT"));
        }
        columns.push((poly_id_column.to_string(), "TEXT"));
        if has_zone {
            columns.push((ZONE_TYPE.to_string(), "TEXT"));
        }
        if has_multipart {
            columns.push((WAS_MULTIPART.to_string(), "INTEGER"));
        }
        if has_comb {
            columns.push((COMB_ADJ.to_string(), "INTEGER"));
        }
        for numeric in &layer.numeric_columns {
            columns.push((numeric.clone(), "REAL"));
        }

        let definitions: Vec<String> = columns
            .iter()
            .map(|(column, kind)| format!("{} {}", quote_ident(column), kind))
            .collect();
        let create = format!(
            "CREATE TABLE {} (fid INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL, {} MULTIPOLYGON, {})",
            quote_ident(name),
            quote_ident(GEOMETRY_COLUMN),
            definitions.join(", ")
        );
        let insert = format!(
            "INSERT INTO {} ({}, {}) VALUES ({})",
            quote_ident(name),
            quote_ident(GEOMETRY_COLUMN),
            columns
                .iter()
                .map(|(column, _)| quote_ident(column))
                .collect::<Vec<_>>()
                .join(", "),
            (1..=columns.len() + 1)
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let extent = layer_extent(records);
        let srs_id = self.srs.srs_id;
        let tx = self.conn.transaction()?;
        tx.execute(&create, [])
            .with_context(|| format!("Failed to create layer {}", name))?;
        {
            let mut statement = tx.prepare(&insert)?;
            for record in records {
                let mut values = vec![Value::Blob(encode_gpkg(record, srs_id)?)];
                values.push(Value::Integer(record.commune_id));
                values.push(Value::Text(record.commune.clone()));
                if has_orig {
                    values.push(optional_text(record.orig_id.clone()));
                }
                values.push(Value::Text(record.poly_id.clone()));
                if has_zone {
                    values.push(optional_text(record.zone_type.map(|z| z.as_str().to_string())));
                }
                if has_multipart {
                    values.push(record.was_multipart.map_or(Value::Null, |m| Value::Integer(i64::from(m))));
                }
                if has_comb {
                    values.push(record.comb_adj.map_or(Value::Null, Value::Integer));
                }
                for numeric in &layer.numeric_columns {
                    let v = record.value(numeric);
                    values.push(if v.is_nan() { Value::Null } else { Value::Real(v) });
                }
                statement
                    .execute(params_from_iter(values))
                    .with_context(|| format!("Failed to insert {} into {}", record.poly_id, name))?;
            }
        }

        let (min_x, min_y, max_x, max_y) = match extent {
            Some(rect) => (
                Some(rect.min().x),
                Some(rect.min().y),
                Some(rect.max().x),
                Some(rect.max().y),
            ),
            None => (None, None, None, None),
        };
        tx.execute(
            "INSERT INTO gpkg_contents \
             (table_name, data_type, identifier, description, last_change, min_x, min_y, max_x, max_y, srs_id) \
             VALUES (?1, 'features', ?1, '', ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                name,
                Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
                min_x,
                min_y,
                max_x,
                max_y,
                srs_id
            ],
        )?;
        tx.execute(
            "INSERT INTO gpkg_geometry_columns \
             (table_name, column_name, geometry_type_name, srs_id, z, m) \
             VALUES (?1, ?2, 'MULTIPOLYGON', ?3, 0, 0)",
            params![name, GEOMETRY_COLUMN, srs_id],
        )?;
        tx.commit()
            .with_context(|| format!("Failed to commit layer {}", name))?;

        info!("Wrote layer {} with {} features", name, records.len());
        Ok(())
    }
}

/// Layer name used for a single commune
pub fn commune_layer_name(commune_id: i64) -> String {
    format!("commune_{}", commune_id)
}

pub const ALL_COMMUNES_LAYER: &str = "all_communes";

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn optional_text(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::Text)
}

fn encode_gpkg(record: &CensusPolygon, srs_id: i32) -> Result<Vec<u8>> {
    // GeoPackage envelope order is minx, maxx, miny, maxy
    let envelope = record
        .geometry
        .bounding_rect()
        .map(|r| vec![r.min().x, r.max().x, r.min().y, r.max().y])
        .unwrap_or_default();
    Geometry::MultiPolygon(record.geometry.clone())
        .to_gpkg_wkb(CoordDimensions::xy(), Some(srs_id), envelope)
        .with_context(|| format!("Failed to encode geometry of {}", record.poly_id))
}

fn layer_extent(records: &[CensusPolygon]) -> Option<Rect<f64>> {
    records
        .iter()
        .filter_map(|r| r.geometry.bounding_rect())
        .reduce(|a, b| {
            Rect::new(
                geo::coord! { x: a.min().x.min(b.min().x), y: a.min().y.min(b.min().y) },
                geo::coord! { x: a.max().x.max(b.max().x), y: a.max().y.max(b.max().y) },
            )
        })
}
