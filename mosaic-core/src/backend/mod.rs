//! Storage backends behind one trait, dispatched on URI scheme.
//!
//! A backend owns a [`MosaicJSON`] document and knows how to read it from,
//! and usually write it back to, one kind of store. Query methods
//! (`assets_for_*`, `tile`, `point`, ...) are shared default implementations
//! working off the indexing-level quadkeys; stores holding tiles outside the
//! document (DynamoDB, SQLite) override only the per-quadkey fetch.

use std::collections::HashSet;

use async_trait::async_trait;
use geojson::Feature;
use mosaic_tile_utils::{Bounds, Crs, TileCoord, Tms};
use url::Url;

use crate::create::{self, MosaicOptions, UpdateOptions};
use crate::errors::{MosaicError, MosaicResult};
use crate::model::{MosaicInfo, MosaicJSON};
use crate::read::{
    mosaic_feature, mosaic_part, mosaic_point, mosaic_tile, PointValues, RasterReader, RasterTile,
    ReaderOptions,
};

pub mod dynamodb;
pub mod file;
pub mod http;
pub mod memory;
pub mod sqlite;
pub mod stac;
pub mod store;

pub use dynamodb::DynamoDbBackend;
pub use file::FileBackend;
pub use http::HttpBackend;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;
pub use stac::{StacBackend, StacOptions};
pub use store::ObjectStoreBackend;

/// The indexing-level quadkeys a `z/x/y` tile resolves to.
///
/// Above the indexing zoom this is the single ancestor cell; below it, the
/// block of descendant cells.
#[must_use]
pub fn find_quadkeys(tile: TileCoord, quadkey_zoom: u8) -> Vec<String> {
    if tile.z >= quadkey_zoom {
        vec![tile.ancestor_at(quadkey_zoom).quadkey()]
    } else {
        tile.children_at(quadkey_zoom)
            .iter()
            .map(TileCoord::quadkey)
            .collect()
    }
}

/// The storage contract shared by every backend.
#[async_trait]
pub trait MosaicBackend: Send + Sync + std::fmt::Debug {
    /// The URI this backend was opened with.
    fn input(&self) -> &str;

    fn backend_name(&self) -> &'static str;

    fn mosaic_def(&self) -> &MosaicJSON;

    fn mosaic_def_mut(&mut self) -> &mut MosaicJSON;

    /// Stored (un-prefixed) assets of one indexing-level quadkey.
    async fn quadkey_assets(&self, quadkey: &str) -> MosaicResult<Vec<String>> {
        Ok(self
            .mosaic_def()
            .tiles
            .get(quadkey)
            .cloned()
            .unwrap_or_default())
    }

    /// All indexing-level quadkeys present in the store.
    async fn quadkeys(&self) -> MosaicResult<Vec<String>> {
        Ok(self.mosaic_def().tiles.keys().cloned().collect())
    }

    /// Persist the document. `overwrite = false` fails when the target
    /// already holds a mosaic.
    async fn write(&mut self, overwrite: bool) -> MosaicResult<()>;

    /// Merge new footprints into the document and persist the change.
    async fn update(&mut self, features: &[Feature], options: &UpdateOptions) -> MosaicResult<()> {
        let partial = compute_update_partial(self.mosaic_def(), features, options)?;
        for (quadkey, new_assets) in &partial.tiles {
            let old_assets = self.quadkey_assets(quadkey).await?;
            let merged = merge_assets(new_assets, &old_assets, options.add_first);
            self.mosaic_def_mut().tiles.insert(quadkey.clone(), merged);
        }
        apply_update_metadata(self.mosaic_def_mut(), &partial);
        self.write(true).await
    }

    /// The tile matrix set the document is indexed in.
    ///
    /// Documents are validated when loaded, so descriptor resolution cannot
    /// fail here anymore.
    fn tms(&self) -> Tms {
        self.mosaic_def().tms().unwrap_or_default()
    }

    fn quadkey_zoom(&self) -> u8 {
        self.mosaic_def().quadkey_zoom()
    }

    fn minzoom(&self) -> u8 {
        self.mosaic_def().minzoom
    }

    fn maxzoom(&self) -> u8 {
        self.mosaic_def().maxzoom
    }

    /// Document bounds clipped to the TMS validity extent.
    fn get_geographic_bounds(&self, crs: Crs) -> Bounds {
        let tms = self.tms();
        let bounds = self.mosaic_def().bounds.intersection(&tms.bbox());
        match crs {
            Crs::Geographic => bounds,
            Crs::WebMercator => {
                let merc = Tms::web_mercator_quad();
                let (west, south) = merc.xy(bounds.west, bounds.south);
                let (east, north) = merc.xy(bounds.east, bounds.north);
                Bounds::new(west, south, east, north)
            }
        }
    }

    /// Content-addressable id of the document (without `tiles`).
    fn mosaicid(&self) -> String {
        self.mosaic_def().mosaicid()
    }

    async fn info(&self, with_quadkeys: bool) -> MosaicResult<MosaicInfo> {
        let mut info = MosaicInfo::new(self.mosaic_def(), false);
        if with_quadkeys {
            info.quadkeys = Some(self.quadkeys().await?);
        }
        Ok(info)
    }

    /// Ordered assets covering a tile expressed in the document TMS.
    async fn assets_for_tile(&self, x: u32, y: u32, z: u8) -> MosaicResult<Vec<String>> {
        let quadkeys = find_quadkeys(TileCoord::new(z, x, y), self.quadkey_zoom());
        self.assets_for_quadkeys(&quadkeys).await
    }

    /// Ordered assets covering a tile expressed in a foreign TMS.
    ///
    /// The foreign tile is converted to its geographic extent, then joined
    /// against the document's indexing cells.
    async fn assets_for_tile_in(&self, x: u32, y: u32, z: u8, tms: &Tms) -> MosaicResult<Vec<String>> {
        if *tms == self.tms() {
            return self.assets_for_tile(x, y, z).await;
        }
        let bounds = tms.bounds(&TileCoord::new(z, x, y));
        self.assets_for_bbox(&bounds).await
    }

    async fn assets_for_point(&self, lng: f64, lat: f64) -> MosaicResult<Vec<String>> {
        let tile = self.tms().tile(lng, lat, self.quadkey_zoom());
        self.assets_for_tile(tile.x, tile.y, tile.z).await
    }

    async fn assets_for_bbox(&self, bounds: &Bounds) -> MosaicResult<Vec<String>> {
        let quadkeys: Vec<String> = self
            .tms()
            .tiles_in_bounds(bounds, self.quadkey_zoom())
            .iter()
            .map(TileCoord::quadkey)
            .collect();
        self.assets_for_quadkeys(&quadkeys).await
    }

    /// Union of per-quadkey asset lists in document order, deduplicated
    /// preserving first occurrence, with `asset_prefix` applied.
    async fn assets_for_quadkeys(&self, quadkeys: &[String]) -> MosaicResult<Vec<String>> {
        let mut assets = Vec::new();
        for quadkey in quadkeys {
            assets.extend(self.quadkey_assets(quadkey).await?);
        }
        let mut seen = HashSet::with_capacity(assets.len());
        assets.retain(|asset| seen.insert(asset.clone()));
        Ok(self.mosaic_def().prefixed_assets(&assets))
    }

    /// Read and compose one tile through the injected raster reader.
    async fn tile(
        &self,
        reader: &dyn RasterReader,
        x: u32,
        y: u32,
        z: u8,
        options: &ReaderOptions,
    ) -> MosaicResult<(RasterTile, Vec<String>)> {
        let assets = self.assets_for_tile(x, y, z).await?;
        mosaic_tile(reader, &assets, TileCoord::new(z, x, y), options).await
    }

    /// Read per-asset values at a point through the injected raster reader.
    async fn point(
        &self,
        reader: &dyn RasterReader,
        lng: f64,
        lat: f64,
        options: &ReaderOptions,
    ) -> MosaicResult<Vec<PointValues>> {
        let assets = self.assets_for_point(lng, lat).await?;
        mosaic_point(reader, &assets, lng, lat, options).await
    }

    /// Read and compose an arbitrary bbox window.
    async fn part(
        &self,
        reader: &dyn RasterReader,
        bounds: &Bounds,
        width: u32,
        height: u32,
        options: &ReaderOptions,
    ) -> MosaicResult<(RasterTile, Vec<String>)> {
        let assets = self.assets_for_bbox(bounds).await?;
        mosaic_part(reader, &assets, *bounds, width, height, options).await
    }

    /// Read and compose a feature-shaped window.
    async fn feature(
        &self,
        reader: &dyn RasterReader,
        feature: &Feature,
        width: u32,
        height: u32,
        options: &ReaderOptions,
    ) -> MosaicResult<(RasterTile, Vec<String>)> {
        let bounds = feature_bounds(feature)?;
        let assets = self.assets_for_bbox(&bounds).await?;
        mosaic_feature(reader, &assets, feature, width, height, options).await
    }
}

fn feature_bounds(feature: &Feature) -> MosaicResult<Bounds> {
    use geo::BoundingRect;

    let geometry = feature
        .geometry
        .as_ref()
        .ok_or_else(|| MosaicError::validation("feature", "feature without geometry"))?;
    let geometry = geo_types::Geometry::<f64>::try_from(geometry)
        .map_err(|e| MosaicError::validation("feature", e.to_string()))?;
    let rect = geometry
        .bounding_rect()
        .ok_or_else(|| MosaicError::validation("feature", "feature without extent"))?;
    Ok(Bounds::new(
        rect.min().x,
        rect.min().y,
        rect.max().x,
        rect.max().y,
    ))
}

/// Build the partial mosaic an update merges in, using the target document's
/// zooms, TMS and asset prefix.
pub(crate) fn compute_update_partial(
    mosaic: &MosaicJSON,
    features: &[Feature],
    options: &UpdateOptions,
) -> MosaicResult<MosaicJSON> {
    let builder_options = MosaicOptions {
        quadkey_zoom: Some(mosaic.quadkey_zoom()),
        tms: mosaic.tms()?,
        accessor: options.accessor.clone(),
        asset_filter: options.asset_filter.clone(),
        min_tile_cover: options.min_tile_cover,
        tile_cover_sort: options.tile_cover_sort,
        max_items_per_tile: None,
        asset_prefix: mosaic.asset_prefix.clone(),
        data_type: None,
        quiet: options.quiet,
    };
    let mut partial =
        create::from_features(features, mosaic.minzoom, mosaic.maxzoom, &builder_options)?;
    if features.is_empty() {
        // an empty merge must not disturb the document bounds
        partial.bounds = mosaic.bounds;
    }
    Ok(partial)
}

pub(crate) fn merge_assets(
    new_assets: &[String],
    old_assets: &[String],
    add_first: bool,
) -> Vec<String> {
    if add_first {
        [new_assets, old_assets].concat()
    } else {
        [old_assets, new_assets].concat()
    }
}

/// Union bounds, recompute the center and bump the revision after a merge.
pub(crate) fn apply_update_metadata(mosaic: &mut MosaicJSON, partial: &MosaicJSON) {
    let bounds = mosaic.bounds.union(&partial.bounds);
    mosaic.bounds = bounds;
    let (lng, lat) = bounds.center();
    mosaic.center = Some((lng, lat, mosaic.minzoom));
    mosaic.increase_version();
}

/// Compression is keyed purely on the `.gz` suffix.
pub(crate) fn is_gzip_path(path: &str) -> bool {
    path.ends_with(".gz")
}

/// Parse (and validate) a stored document blob.
pub(crate) fn decode_document(bytes: &[u8], gzipped: bool) -> MosaicResult<MosaicJSON> {
    use std::io::Read;

    let mosaic: MosaicJSON = if gzipped {
        let mut decoder = flate2::read::GzDecoder::new(bytes);
        let mut body = Vec::new();
        decoder
            .read_to_end(&mut body)
            .map_err(|e| MosaicError::Io(e, "gzip blob".to_string()))?;
        serde_json::from_slice(&body)?
    } else {
        serde_json::from_slice(bytes)?
    };
    mosaic.validate()?;
    Ok(mosaic)
}

/// Serialize a document for storage.
pub(crate) fn encode_document(mosaic: &MosaicJSON, gzipped: bool) -> MosaicResult<Vec<u8>> {
    use std::io::Write;

    let body = serde_json::to_vec(mosaic)?;
    if !gzipped {
        return Ok(body);
    }
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(&body)
        .and_then(|()| encoder.finish())
        .map_err(|e| MosaicError::Io(e, "gzip blob".to_string()))
}

/// Open the backend a URI dispatches to, fetching the stored document.
pub async fn mosaic_backend(input: Option<&str>) -> MosaicResult<Box<dyn MosaicBackend>> {
    mosaic_backend_with(input, None, BackendOptions::default()).await
}

/// Open a backend write-initialized with an in-memory document: no fetch
/// happens, a later `write()` persists it.
pub async fn mosaic_backend_for_write(
    input: Option<&str>,
    mosaic_def: MosaicJSON,
) -> MosaicResult<Box<dyn MosaicBackend>> {
    mosaic_backend_with(input, Some(mosaic_def), BackendOptions::default()).await
}

/// Extra, backend-specific construction options.
#[derive(Clone, Debug, Default)]
pub struct BackendOptions {
    /// Required when opening `stac+` URIs.
    pub stac: Option<StacOptions>,
}

pub async fn mosaic_backend_with(
    input: Option<&str>,
    mosaic_def: Option<MosaicJSON>,
    options: BackendOptions,
) -> MosaicResult<Box<dyn MosaicBackend>> {
    let input = match input {
        None | Some("") | Some(":memory:") => {
            return Ok(Box::new(MemoryBackend::new(mosaic_def)?));
        }
        Some(uri) => uri,
    };

    if let Some(url) = input.strip_prefix("stac+") {
        if mosaic_def.is_some() {
            return Err(MosaicError::ReadOnlyBackend(stac::BACKEND_NAME));
        }
        let stac_options = options.stac.ok_or_else(|| {
            MosaicError::validation("stac", "stac+ URIs require `BackendOptions::stac`")
        })?;
        return Ok(Box::new(StacBackend::new(url, stac_options)?));
    }

    let scheme = Url::parse(input)
        .ok()
        .map(|url| url.scheme().to_string())
        .unwrap_or_default();
    match scheme.as_str() {
        "s3" => Ok(Box::new(
            ObjectStoreBackend::s3(input, mosaic_def).await?,
        )),
        "gs" => Ok(Box::new(
            ObjectStoreBackend::gcs(input, mosaic_def).await?,
        )),
        "az" => Ok(Box::new(
            ObjectStoreBackend::azure(input, mosaic_def).await?,
        )),
        "dynamodb" => Ok(Box::new(DynamoDbBackend::open(input, mosaic_def).await?)),
        "sqlite" => Ok(Box::new(SqliteBackend::open(input, mosaic_def).await?)),
        "http" | "https" => {
            if mosaic_def.is_some() {
                return Err(MosaicError::ReadOnlyBackend(http::BACKEND_NAME));
            }
            Ok(Box::new(HttpBackend::open(input).await?))
        }
        "file" | "" => {
            let path = input.strip_prefix("file://").unwrap_or(input);
            Ok(Box::new(FileBackend::open(path, mosaic_def).await?))
        }
        other => Err(MosaicError::UnsupportedScheme(other.to_string())),
    }
}
