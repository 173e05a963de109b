//! Raster footprint extraction.
//!
//! [`FootprintSource`] is the capability the index builder consumes; the
//! bundled [`GeoTiffFootprints`] implementation introspects local GeoTIFF
//! files through their georeferencing tags without reading any pixels.

use std::fs::File;
use std::path::Path;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use geojson::{Feature, Geometry, JsonObject, Value as GeomValue};
use log::{debug, warn};
use mosaic_tile_utils::{Bounds, Tms};
use serde_json::json;
use tiff::decoder::Decoder;
use tiff::tags::Tag;

use crate::errors::{MosaicError, MosaicResult};
use crate::max_threads;

/// Yields a WGS-84 footprint feature for a raster URI.
///
/// The produced feature carries `path`, `bounds`, `minzoom`, `maxzoom` and
/// `datatype` properties, which is what the builder's zoom/data-type
/// derivation expects.
#[async_trait]
pub trait FootprintSource: Send + Sync {
    async fn footprint(&self, uri: &str) -> MosaicResult<Feature>;
}

/// Read footprints for many URIs with bounded concurrency.
///
/// Failures are logged and skipped; callers decide whether an empty result
/// is an error.
pub async fn get_footprints(
    urls: &[String],
    source: &dyn FootprintSource,
    quiet: bool,
) -> Vec<Feature> {
    let results = stream::iter(urls.iter().map(|url| async move {
        (url, source.footprint(url).await)
    }))
    .buffered(max_threads())
    .collect::<Vec<_>>()
    .await;

    let mut features = Vec::with_capacity(urls.len());
    for (url, result) in results {
        match result {
            Ok(feature) => {
                if !quiet {
                    debug!("footprint read for {url}");
                }
                features.push(feature);
            }
            Err(err) => warn!("skipping {url}: {err}"),
        }
    }
    features
}

/// GeoTIFF footprint introspection for local files.
///
/// Supports rasters georeferenced in EPSG:4326 or EPSG:3857; other CRSs are
/// rejected rather than silently misplaced.
#[derive(Debug, Default)]
pub struct GeoTiffFootprints {
    tms: Tms,
}

impl GeoTiffFootprints {
    #[must_use]
    pub fn new(tms: Tms) -> Self {
        Self { tms }
    }
}

#[async_trait]
impl FootprintSource for GeoTiffFootprints {
    async fn footprint(&self, uri: &str) -> MosaicResult<Feature> {
        let path = uri.to_string();
        let tms = self.tms.clone();
        tokio::task::spawn_blocking(move || read_geotiff_footprint(&path, &tms))
            .await
            .map_err(|e| MosaicError::Footprint {
                path: uri.to_string(),
                reason: e.to_string(),
            })?
    }
}

// geokey ids, per the GeoTIFF spec key directory
const GEOGRAPHIC_TYPE_GEOKEY: u64 = 2048;
const PROJECTED_CS_TYPE_GEOKEY: u64 = 3072;

fn read_geotiff_footprint(path: &str, tms: &Tms) -> MosaicResult<Feature> {
    let file = File::open(Path::new(path)).map_err(|e| MosaicError::Io(e, path.to_string()))?;
    let mut decoder = Decoder::new(file)?;
    let (width, height) = decoder.dimensions()?;

    let pixel_scale = decoder.get_tag_f64_vec(Tag::ModelPixelScaleTag)?;
    let tie_points = decoder.get_tag_f64_vec(Tag::ModelTiepointTag)?;
    if pixel_scale.len() < 2 || tie_points.len() < 6 {
        return Err(footprint_error(path, "incomplete georeferencing tags"));
    }
    let (scale_x, scale_y) = (pixel_scale[0], pixel_scale[1].abs());
    let origin_x = tie_points[3] - tie_points[0] * scale_x;
    let origin_y = tie_points[4] + tie_points[1] * scale_y;

    let epsg = read_epsg(&mut decoder)
        .ok_or_else(|| footprint_error(path, "no EPSG code in the geokey directory"))?;

    let native = Bounds::new(
        origin_x,
        origin_y - f64::from(height) * scale_y,
        origin_x + f64::from(width) * scale_x,
        origin_y,
    );
    let (bounds, resolution_m) = match epsg {
        4326 => {
            // degrees to mercator-comparable meters at the raster center
            let (_, lat) = native.center();
            let meters = scale_x.to_radians() * 6_378_137.0 * lat.to_radians().cos().max(0.01);
            (native, meters)
        }
        3857 => {
            let merc = Tms::web_mercator_quad();
            let (west, south) = merc.lnglat(native.west, native.south);
            let (east, north) = merc.lnglat(native.east, native.north);
            (Bounds::new(west, south, east, north), scale_x)
        }
        other => {
            return Err(footprint_error(
                path,
                format!("unsupported raster CRS EPSG:{other}"),
            ));
        }
    };

    let maxzoom = tms.zoom_for_resolution(resolution_m, 30);
    let extent_m = {
        let (x0, y0) = tms.xy(bounds.west, bounds.south);
        let (x1, y1) = tms.xy(bounds.east, bounds.north);
        (x1 - x0).abs().max((y1 - y0).abs())
    };
    let minzoom = tms.zoom_for_resolution(extent_m / 256.0, maxzoom);

    let datatype = detect_datatype(&mut decoder);

    let ring = vec![
        vec![bounds.west, bounds.north],
        vec![bounds.west, bounds.south],
        vec![bounds.east, bounds.south],
        vec![bounds.east, bounds.north],
        vec![bounds.west, bounds.north],
    ];
    let mut properties = JsonObject::new();
    properties.insert("path".to_string(), json!(path));
    properties.insert("bounds".to_string(), json!(<[f64; 4]>::from(bounds)));
    properties.insert("minzoom".to_string(), json!(minzoom));
    properties.insert("maxzoom".to_string(), json!(maxzoom));
    properties.insert("datatype".to_string(), json!(datatype));

    Ok(Feature {
        bbox: Some(<[f64; 4]>::from(bounds).to_vec()),
        geometry: Some(Geometry::new(GeomValue::Polygon(vec![ring]))),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    })
}

fn footprint_error(path: &str, reason: impl Into<String>) -> MosaicError {
    MosaicError::Footprint {
        path: path.to_string(),
        reason: reason.into(),
    }
}

/// Walk the geokey directory for the geographic or projected EPSG code.
fn read_epsg(decoder: &mut Decoder<File>) -> Option<u64> {
    let directory = decoder.get_tag_u64_vec(Tag::GeoKeyDirectoryTag).ok()?;
    if directory.len() < 4 {
        return None;
    }
    let mut geographic = None;
    let mut projected = None;
    for entry in directory[4..].chunks_exact(4) {
        let (key_id, location, value) = (entry[0], entry[1], entry[3]);
        if location != 0 {
            continue;
        }
        match key_id {
            GEOGRAPHIC_TYPE_GEOKEY => geographic = Some(value),
            PROJECTED_CS_TYPE_GEOKEY => projected = Some(value),
            _ => {}
        }
    }
    projected.or(geographic)
}

fn detect_datatype(decoder: &mut Decoder<File>) -> String {
    let sample_format = decoder
        .get_tag_u64_vec(Tag::SampleFormat)
        .ok()
        .and_then(|v| v.first().copied())
        .unwrap_or(1);
    let bits = decoder
        .get_tag_u64_vec(Tag::BitsPerSample)
        .ok()
        .and_then(|v| v.first().copied())
        .unwrap_or(8);
    match (sample_format, bits) {
        (3, 64) => "float64".to_string(),
        (3, _) => "float32".to_string(),
        (2, b) => format!("int{b}"),
        (_, b) => format!("uint{b}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticFootprints;

    #[async_trait]
    impl FootprintSource for StaticFootprints {
        async fn footprint(&self, uri: &str) -> MosaicResult<Feature> {
            if uri.starts_with("bad") {
                return Err(footprint_error(uri, "unreadable"));
            }
            let mut properties = JsonObject::new();
            properties.insert("path".to_string(), json!(uri));
            Ok(Feature {
                bbox: None,
                geometry: Some(Geometry::new(GeomValue::Point(vec![0.0, 0.0]))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            })
        }
    }

    #[tokio::test]
    async fn failed_footprints_are_skipped() {
        let urls = vec![
            "a.tif".to_string(),
            "bad.tif".to_string(),
            "b.tif".to_string(),
        ];
        let features = get_footprints(&urls, &StaticFootprints, true).await;
        assert_eq!(features.len(), 2);
        // supply order is preserved
        let paths: Vec<String> = features
            .iter()
            .map(|f| f.properties.as_ref().unwrap()["path"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(paths, vec!["a.tif", "b.tif"]);
    }
}
