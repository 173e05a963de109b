//! SQLite backend: one database file hosts many mosaics.
//!
//! A shared `mosaicjson_metadata` table carries the document headers; each
//! mosaic owns a `"{name}" (quadkey, assets)` table with the tile index.

use std::path::Path;

use async_trait::async_trait;
use geojson::Feature;
use log::debug;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::backend::{
    apply_update_metadata, compute_update_partial, merge_assets, MosaicBackend,
};
use crate::cache::{self, CacheKey};
use crate::create::UpdateOptions;
use crate::errors::{MosaicError, MosaicResult};
use crate::model::MosaicJSON;

pub const BACKEND_NAME: &str = "SQLite";

const METADATA_TABLE: &str = "mosaicjson_metadata";
/// Schema revision stored in `PRAGMA user_version`.
const SCHEMA_VERSION: i64 = 3;

#[derive(Clone, Debug)]
pub struct SqliteBackend {
    uri: String,
    db_path: String,
    mosaic_name: String,
    pool: SqlitePool,
    mosaic: MosaicJSON,
}

/// `(db_path, mosaic_name)` parts of `sqlite:///path.db:mosaic`.
fn parse_sqlite_uri(uri: &str) -> MosaicResult<(String, String)> {
    let invalid = || MosaicError::InvalidPath {
        kind: BACKEND_NAME,
        path: uri.to_string(),
    };
    let path = uri.strip_prefix("sqlite:///").ok_or_else(invalid)?;
    let (db_path, name) = path.rsplit_once(':').ok_or_else(invalid)?;
    if db_path.is_empty() || !is_valid_mosaic_name(name) {
        return Err(invalid());
    }
    if name == METADATA_TABLE {
        return Err(MosaicError::validation(
            "mosaic_name",
            format!("`{METADATA_TABLE}` is a reserved table name"),
        ));
    }
    Ok((db_path.to_string(), name.to_string()))
}

fn is_valid_mosaic_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

impl SqliteBackend {
    pub async fn open(uri: &str, mosaic_def: Option<MosaicJSON>) -> MosaicResult<Self> {
        let (db_path, mosaic_name) = parse_sqlite_uri(uri)?;

        // reading expects the file to exist, writing may create it
        let write_initialized = mosaic_def.is_some();
        if !write_initialized && !Path::new(&db_path).exists() {
            return Err(MosaicError::MosaicNotFound(format!(
                "SQLite database not found at {db_path}"
            )));
        }

        debug!("opening SQLite database {db_path}");
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(write_initialized);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        let mut backend = Self {
            uri: uri.to_string(),
            db_path,
            mosaic_name,
            pool,
            mosaic: MosaicJSON::default(),
        };
        backend.mosaic = match mosaic_def {
            Some(mut mosaic) => {
                mosaic.validate()?;
                if mosaic.name.as_deref() != Some(&backend.mosaic_name) {
                    mosaic.name = Some(backend.mosaic_name.clone());
                }
                mosaic
            }
            None => backend.read_document().await?,
        };
        Ok(backend)
    }

    async fn read_document(&self) -> MosaicResult<MosaicJSON> {
        let key = CacheKey::new(BACKEND_NAME, self.uri.as_str());
        if let Some(cached) = cache::get(&key) {
            return Ok((*cached).clone());
        }

        let row = sqlx::query(&format!(
            "SELECT * FROM {METADATA_TABLE} WHERE name = ?"
        ))
        .bind(&self.mosaic_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|_| MosaicError::MosaicNotFound(self.uri.clone()))?
        .ok_or_else(|| MosaicError::MosaicNotFound(self.uri.clone()))?;

        let mosaic = MosaicJSON {
            mosaicjson: row.try_get("mosaicjson")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            version: row.try_get("version")?,
            attribution: row.try_get("attribution")?,
            minzoom: row.try_get::<i64, _>("minzoom")? as u8,
            maxzoom: row.try_get::<i64, _>("maxzoom")? as u8,
            quadkey_zoom: row
                .try_get::<Option<i64>, _>("quadkey_zoom")?
                .map(|z| z as u8),
            bounds: json_column(&row, "bounds")?
                .ok_or_else(|| MosaicError::validation("bounds", "missing in metadata table"))?,
            center: json_column(&row, "center")?,
            tiles: Default::default(),
            tilematrixset: json_column(&row, "tilematrixset")?,
            asset_type: row.try_get("asset_type")?,
            asset_prefix: row.try_get("asset_prefix")?,
            data_type: row.try_get("data_type")?,
            colormap: json_column(&row, "colormap")?,
            layers: json_column(&row, "layers")?,
        };
        mosaic.validate()?;
        cache::insert(key, std::sync::Arc::new(mosaic.clone()));
        Ok(mosaic)
    }

    async fn mosaic_exists(&self) -> MosaicResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(&self.mosaic_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(count == 1)
    }

    async fn check_schema_version(&self) -> MosaicResult<()> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;
        if version != SCHEMA_VERSION {
            return Err(MosaicError::Backend {
                backend: BACKEND_NAME,
                reason: format!(
                    "{} has schema version {version}, expected {SCHEMA_VERSION}",
                    self.db_path
                ),
            });
        }
        Ok(())
    }

    fn header_binds(&self) -> MosaicResult<[Option<String>; 16]> {
        let mosaic = &self.mosaic;
        Ok([
            Some(mosaic.mosaicjson.clone()),
            mosaic.name.clone(),
            mosaic.description.clone(),
            Some(mosaic.version.clone()),
            mosaic.attribution.clone(),
            Some(mosaic.minzoom.to_string()),
            Some(mosaic.maxzoom.to_string()),
            mosaic.quadkey_zoom.map(|z| z.to_string()),
            Some(serde_json::to_string(&mosaic.bounds)?),
            Some(serde_json::to_string(&mosaic.center())?),
            mosaic
                .tilematrixset
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            mosaic.asset_type.clone(),
            mosaic.asset_prefix.clone(),
            mosaic.data_type.clone(),
            mosaic
                .colormap
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            mosaic
                .layers
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        ])
    }

    /// Remove this mosaic (header row and tile table) from the database.
    pub async fn delete(&self) -> MosaicResult<()> {
        debug!("deleting mosaic {} from {}", self.mosaic_name, self.db_path);
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DELETE FROM {METADATA_TABLE} WHERE name = ?"))
            .bind(&self.mosaic_name)
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(r#"DROP TABLE IF EXISTS "{}""#, self.mosaic_name))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        cache::invalidate(&CacheKey::new(BACKEND_NAME, self.uri.as_str()));
        Ok(())
    }

    /// Names of the mosaics stored in a database file.
    pub async fn list_mosaics(db_path: &str) -> MosaicResult<Vec<String>> {
        if !Path::new(db_path).exists() {
            return Err(MosaicError::MosaicNotFound(format!(
                "SQLite database not found at {db_path}"
            )));
        }
        let pool = SqlitePoolOptions::new()
            .connect_with(SqliteConnectOptions::new().filename(db_path))
            .await?;
        let rows = sqlx::query(&format!("SELECT name FROM {METADATA_TABLE} ORDER BY name"))
            .fetch_all(&pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(Into::into))
            .collect()
    }
}

fn json_column<T: serde::de::DeserializeOwned>(
    row: &sqlx::sqlite::SqliteRow,
    column: &str,
) -> MosaicResult<Option<T>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|text| serde_json::from_str(&text).map_err(Into::into))
        .transpose()
}

#[async_trait]
impl MosaicBackend for SqliteBackend {
    fn input(&self) -> &str {
        &self.uri
    }

    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn mosaic_def(&self) -> &MosaicJSON {
        &self.mosaic
    }

    fn mosaic_def_mut(&mut self) -> &mut MosaicJSON {
        &mut self.mosaic
    }

    async fn quadkey_assets(&self, quadkey: &str) -> MosaicResult<Vec<String>> {
        let row = sqlx::query(&format!(
            r#"SELECT assets FROM "{}" WHERE quadkey = ?"#,
            self.mosaic_name
        ))
        .bind(quadkey)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let raw: String = row.try_get("assets")?;
                Ok(serde_json::from_str(&raw)?)
            }
            None => Ok(Vec::new()),
        }
    }

    async fn quadkeys(&self) -> MosaicResult<Vec<String>> {
        let rows = sqlx::query(&format!(
            r#"SELECT quadkey FROM "{}" ORDER BY quadkey"#,
            self.mosaic_name
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("quadkey").map_err(Into::into))
            .collect()
    }

    async fn write(&mut self, overwrite: bool) -> MosaicResult<()> {
        if self.mosaic_exists().await? {
            if !overwrite {
                return Err(MosaicError::MosaicExists(format!(
                    "`{}` already exists in {}",
                    self.mosaic_name, self.db_path
                )));
            }
            self.delete().await?;
        }

        debug!("writing mosaic {} to {}", self.mosaic_name, self.db_path);
        let header = self.header_binds()?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {METADATA_TABLE} (
                mosaicjson TEXT NOT NULL,
                name TEXT NOT NULL PRIMARY KEY,
                description TEXT,
                version TEXT NOT NULL,
                attribution TEXT,
                minzoom INTEGER NOT NULL,
                maxzoom INTEGER NOT NULL,
                quadkey_zoom INTEGER,
                bounds TEXT NOT NULL,
                center TEXT,
                tilematrixset TEXT,
                asset_type TEXT,
                asset_prefix TEXT,
                data_type TEXT,
                colormap TEXT,
                layers TEXT
            )"
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            r#"CREATE TABLE "{}" (
                quadkey TEXT NOT NULL PRIMARY KEY,
                assets TEXT NOT NULL
            )"#,
            self.mosaic_name
        ))
        .execute(&mut *tx)
        .await?;

        let insert_sql = format!(
            "INSERT OR REPLACE INTO {METADATA_TABLE} VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        let mut insert = sqlx::query(&insert_sql);
        for bind in header {
            insert = insert.bind(bind);
        }
        insert.execute(&mut *tx).await?;

        for (quadkey, assets) in &self.mosaic.tiles {
            sqlx::query(&format!(
                r#"INSERT INTO "{}" (quadkey, assets) VALUES (?, ?)"#,
                self.mosaic_name
            ))
            .bind(quadkey)
            .bind(serde_json::to_string(assets)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        cache::invalidate(&CacheKey::new(BACKEND_NAME, self.uri.as_str()));
        Ok(())
    }

    /// Index updates run in a single transaction against the stored tables.
    async fn update(&mut self, features: &[Feature], options: &UpdateOptions) -> MosaicResult<()> {
        self.check_schema_version().await?;
        let partial = compute_update_partial(&self.mosaic, features, options)?;

        let mut merged_rows = Vec::with_capacity(partial.tiles.len());
        for (quadkey, new_assets) in &partial.tiles {
            let old_assets = self.quadkey_assets(quadkey).await?;
            merged_rows.push((
                quadkey.clone(),
                merge_assets(new_assets, &old_assets, options.add_first),
            ));
        }
        apply_update_metadata(&mut self.mosaic, &partial);

        let header = self.header_binds()?;
        let mut tx = self.pool.begin().await?;
        let insert_sql = format!(
            "INSERT OR REPLACE INTO {METADATA_TABLE} VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        let mut insert = sqlx::query(&insert_sql);
        for bind in header {
            insert = insert.bind(bind);
        }
        insert.execute(&mut *tx).await?;

        for (quadkey, assets) in &merged_rows {
            sqlx::query(&format!(
                r#"INSERT OR REPLACE INTO "{}" (quadkey, assets) VALUES (?, ?)"#,
                self.mosaic_name
            ))
            .bind(quadkey)
            .bind(serde_json::to_string(assets)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        cache::invalidate(&CacheKey::new(BACKEND_NAME, self.uri.as_str()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_parsing() {
        let (db, name) = parse_sqlite_uri("sqlite:///mosaics.db:demo").unwrap();
        assert_eq!(db, "mosaics.db");
        assert_eq!(name, "demo");

        let (db, name) = parse_sqlite_uri("sqlite:////data/mosaics.db:demo-1.0").unwrap();
        assert_eq!(db, "/data/mosaics.db");
        assert_eq!(name, "demo-1.0");
    }

    #[test]
    fn invalid_uris_are_rejected() {
        assert!(parse_sqlite_uri("sqlite://mosaics.db:demo").is_err());
        assert!(parse_sqlite_uri("sqlite:///mosaics.db").is_err());
        assert!(parse_sqlite_uri("sqlite:///mosaics.db:bad name").is_err());
    }

    #[test]
    fn reserved_table_name_is_refused() {
        let err = parse_sqlite_uri(&format!("sqlite:///mosaics.db:{METADATA_TABLE}")).unwrap_err();
        assert!(matches!(
            err,
            MosaicError::Validation {
                field: "mosaic_name",
                ..
            }
        ));
    }
}
