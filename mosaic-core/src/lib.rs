#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

// Re-export the tile math the public API is expressed in
pub use mosaic_tile_utils as tile_utils;

pub mod backend;
pub mod cache;
pub mod cover;
pub mod create;
mod errors;
pub mod footprint;
mod model;
pub mod read;

pub use backend::{
    mosaic_backend, mosaic_backend_for_write, mosaic_backend_with, BackendOptions, DynamoDbBackend,
    FileBackend, HttpBackend, MemoryBackend, MosaicBackend, ObjectStoreBackend, SqliteBackend,
    StacBackend, StacOptions,
};
pub use create::{
    default_accessor, property_accessor, Accessor, AssetFilter, MosaicOptions, TileCandidates,
    UpdateOptions,
};
pub use errors::{MosaicError, MosaicResult};
pub use footprint::{FootprintSource, GeoTiffFootprints};
pub use model::{MosaicInfo, MosaicJSON, MOSAICJSON_V2, MOSAICJSON_V3};
pub use read::{PixelSelection, PointValues, RasterReader, RasterTile, ReaderOptions};

/// Worker-pool width for per-asset fan-out, from `MAX_THREADS` (default 10).
#[must_use]
pub fn max_threads() -> usize {
    std::env::var("MAX_THREADS")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|&threads| threads > 0)
        .unwrap_or(10)
}

impl MosaicJSON {
    /// Build a document from footprint features. See [`create::from_features`].
    pub fn from_features(
        features: &[geojson::Feature],
        minzoom: u8,
        maxzoom: u8,
        options: &MosaicOptions,
    ) -> MosaicResult<MosaicJSON> {
        create::from_features(features, minzoom, maxzoom, options)
    }

    /// Build a document by introspecting raster URIs. See [`create::from_urls`].
    pub async fn from_urls(
        urls: &[String],
        source: &dyn FootprintSource,
        minzoom: Option<u8>,
        maxzoom: Option<u8>,
        options: &MosaicOptions,
    ) -> MosaicResult<MosaicJSON> {
        create::from_urls(urls, source, minzoom, maxzoom, options).await
    }
}
