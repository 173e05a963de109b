//! Quad-tree tile matrix sets.
//!
//! A [`Tms`] maps between geographic coordinates, projected (CRS) units and
//! tile indices of a `2^z x 2^z` pyramid. Two CRSs are supported: spherical
//! Web-Mercator (EPSG:3857, the `WebMercatorQuad` default) and plain
//! equirectangular grids over EPSG:4326. Anything else is rejected when the
//! descriptor is resolved.

use std::f64::consts::PI;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{Bounds, TileCoord};

const EARTH_RADIUS: f64 = 6_378_137.0;
const WEB_MERCATOR_EXTENT: f64 = PI * EARTH_RADIUS;
/// Latitude limit of the square Web-Mercator world.
pub const MAX_MERCATOR_LATITUDE: f64 = 85.051_128_779_806_59;
const TILE_SIZE: f64 = 256.0;

/// Errors raised while resolving a tile matrix set descriptor.
#[derive(Clone, Debug, PartialEq)]
pub enum TmsError {
    /// The CRS identifier names a projection this crate cannot evaluate.
    UnsupportedCrs(String),
    /// The descriptor carries a degenerate or non-finite extent.
    InvalidExtent([f64; 4]),
}

impl Display for TmsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TmsError::UnsupportedCrs(crs) => {
                write!(f, "unsupported tile matrix set CRS `{crs}`, expected EPSG:3857 or EPSG:4326")
            }
            TmsError::InvalidExtent(bbox) => {
                write!(f, "invalid tile matrix set extent {bbox:?}")
            }
        }
    }
}

impl std::error::Error for TmsError {}

/// Coordinate reference systems a [`Tms`] can evaluate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Crs {
    /// Spherical Web-Mercator, EPSG:3857.
    WebMercator,
    /// Equirectangular lng/lat degrees, EPSG:4326.
    Geographic,
}

impl Crs {
    /// Parse an EPSG code from the common identifier spellings:
    /// `EPSG:3857`, `urn:ogc:def:crs:EPSG::3857` or the OGC URI form.
    #[must_use]
    pub fn from_identifier(ident: &str) -> Option<Crs> {
        let code = ident
            .rsplit(|c| c == ':' || c == '/')
            .find(|part| !part.is_empty())?;
        match code.parse::<u32>().ok()? {
            3857 | 900_913 => Some(Crs::WebMercator),
            4326 => Some(Crs::Geographic),
            _ => None,
        }
    }

    #[must_use]
    pub fn epsg(&self) -> u32 {
        match self {
            Crs::WebMercator => 3857,
            Crs::Geographic => 4326,
        }
    }

    #[must_use]
    pub fn identifier(&self) -> String {
        format!("http://www.opengis.net/def/crs/EPSG/0/{}", self.epsg())
    }
}

/// The serializable shape of an embedded tile matrix set.
///
/// This is the subset of the OGC TileMatrixSet document the mosaic format
/// needs: an id, a CRS and the quad grid extent in CRS units.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TileMatrixSetDescriptor {
    pub id: String,
    pub crs: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
}

/// A quad-tree tile matrix set.
#[derive(Clone, Debug, PartialEq)]
pub struct Tms {
    id: String,
    crs: Crs,
    /// Grid extent in CRS units: `[left, bottom, right, top]`.
    extent: [f64; 4],
}

impl Default for Tms {
    fn default() -> Self {
        Self::web_mercator_quad()
    }
}

impl Tms {
    /// The default `WebMercatorQuad` tile matrix set.
    #[must_use]
    pub fn web_mercator_quad() -> Tms {
        Tms {
            id: "WebMercatorQuad".to_string(),
            crs: Crs::WebMercator,
            extent: [
                -WEB_MERCATOR_EXTENT,
                -WEB_MERCATOR_EXTENT,
                WEB_MERCATOR_EXTENT,
                WEB_MERCATOR_EXTENT,
            ],
        }
    }

    /// A quad grid over the full equirectangular world.
    ///
    /// Cells are 2:1 anisotropic but the quadkey addressing is unchanged.
    #[must_use]
    pub fn geographic_quad() -> Tms {
        Tms {
            id: "GeographicQuad".to_string(),
            crs: Crs::Geographic,
            extent: [-180.0, -90.0, 180.0, 90.0],
        }
    }

    /// Resolve an embedded descriptor into an evaluatable TMS.
    pub fn from_descriptor(descriptor: &TileMatrixSetDescriptor) -> Result<Tms, TmsError> {
        let crs = Crs::from_identifier(&descriptor.crs)
            .ok_or_else(|| TmsError::UnsupportedCrs(descriptor.crs.clone()))?;
        let extent = match descriptor.bbox {
            Some(bbox) => {
                if !bbox.iter().all(|v| v.is_finite()) || bbox[0] >= bbox[2] || bbox[1] >= bbox[3] {
                    return Err(TmsError::InvalidExtent(bbox));
                }
                bbox
            }
            None => match crs {
                Crs::WebMercator => Tms::web_mercator_quad().extent,
                Crs::Geographic => Tms::geographic_quad().extent,
            },
        };
        Ok(Tms {
            id: descriptor.id.clone(),
            crs,
            extent,
        })
    }

    #[must_use]
    pub fn descriptor(&self) -> TileMatrixSetDescriptor {
        TileMatrixSetDescriptor {
            id: self.id.clone(),
            crs: self.crs.identifier(),
            bbox: Some(self.extent),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn crs(&self) -> Crs {
        self.crs
    }

    /// Grid extent in CRS units: `[left, bottom, right, top]`.
    #[must_use]
    pub fn xy_bbox(&self) -> [f64; 4] {
        self.extent
    }

    /// Geographic validity extent.
    #[must_use]
    pub fn bbox(&self) -> Bounds {
        let (west, south) = self.lnglat(self.extent[0], self.extent[1]);
        let (east, north) = self.lnglat(self.extent[2], self.extent[3]);
        Bounds::new(west, south, east, north)
    }

    /// Number of tiles along each axis at a zoom level.
    #[must_use]
    pub fn matrix_dim(&self, zoom: u8) -> u32 {
        1u32 << zoom
    }

    /// Project geographic coordinates into CRS units.
    #[must_use]
    pub fn xy(&self, lng: f64, lat: f64) -> (f64, f64) {
        match self.crs {
            Crs::WebMercator => {
                let lat = lat.clamp(-MAX_MERCATOR_LATITUDE, MAX_MERCATOR_LATITUDE);
                (
                    EARTH_RADIUS * lng.to_radians(),
                    EARTH_RADIUS * (PI / 4.0 + lat.to_radians() / 2.0).tan().ln(),
                )
            }
            Crs::Geographic => (lng, lat),
        }
    }

    /// Inverse of [`Tms::xy`].
    #[must_use]
    pub fn lnglat(&self, x: f64, y: f64) -> (f64, f64) {
        match self.crs {
            Crs::WebMercator => (
                (x / EARTH_RADIUS).to_degrees(),
                (y / EARTH_RADIUS).sinh().atan().to_degrees(),
            ),
            Crs::Geographic => (x, y),
        }
    }

    /// Clamp geographic coordinates into the validity extent.
    #[must_use]
    pub fn truncate(&self, lng: f64, lat: f64) -> (f64, f64) {
        let bbox = self.bbox();
        (
            lng.clamp(bbox.west, bbox.east),
            lat.clamp(bbox.south, bbox.north),
        )
    }

    /// The tile containing a geographic point at the given zoom.
    #[must_use]
    pub fn tile(&self, lng: f64, lat: f64, zoom: u8) -> TileCoord {
        let (lng, lat) = self.truncate(lng, lat);
        let (x, y) = self.xy(lng, lat);
        let dim = f64::from(self.matrix_dim(zoom));
        let [left, bottom, right, top] = self.extent;
        let fx = (x - left) / (right - left);
        let fy = (top - y) / (top - bottom);
        let max_index = self.matrix_dim(zoom) - 1;
        TileCoord::new(
            zoom,
            ((fx * dim).floor() as u32).min(max_index),
            ((fy * dim).floor() as u32).min(max_index),
        )
    }

    /// Tile extent in CRS units: `[left, bottom, right, top]`.
    #[must_use]
    pub fn xy_bounds(&self, tile: &TileCoord) -> [f64; 4] {
        let dim = f64::from(self.matrix_dim(tile.z));
        let [left, bottom, right, top] = self.extent;
        let width = (right - left) / dim;
        let height = (top - bottom) / dim;
        let tile_left = left + f64::from(tile.x) * width;
        let tile_top = top - f64::from(tile.y) * height;
        [tile_left, tile_top - height, tile_left + width, tile_top]
    }

    /// Tile extent in geographic coordinates.
    #[must_use]
    pub fn bounds(&self, tile: &TileCoord) -> Bounds {
        let [left, bottom, right, top] = self.xy_bounds(tile);
        let (west, south) = self.lnglat(left, bottom);
        let (east, north) = self.lnglat(right, top);
        Bounds::new(west, south, east, north)
    }

    /// CRS units per pixel at a zoom level, assuming 256px tiles.
    #[must_use]
    pub fn resolution(&self, zoom: u8) -> f64 {
        (self.extent[2] - self.extent[0]) / (TILE_SIZE * f64::from(self.matrix_dim(zoom)))
    }

    /// The lowest zoom whose resolution is at least as fine as `resolution`.
    #[must_use]
    pub fn zoom_for_resolution(&self, resolution: f64, max_zoom: u8) -> u8 {
        for zoom in 0..=max_zoom {
            if self.resolution(zoom) <= resolution {
                return zoom;
            }
        }
        max_zoom
    }

    /// All tiles at `zoom` intersecting the geographic bounds.
    #[must_use]
    pub fn tiles_in_bounds(&self, bounds: &Bounds, zoom: u8) -> Vec<TileCoord> {
        let clipped = bounds.intersection(&self.bbox());
        if !clipped.is_valid() {
            return Vec::new();
        }
        let ul = self.tile(clipped.west, clipped.north, zoom);
        let lr = self.tile(clipped.east, clipped.south, zoom);
        let mut tiles = Vec::new();
        for y in ul.y..=lr.y {
            for x in ul.x..=lr.x {
                tiles.push(TileCoord::new(zoom, x, y));
            }
        }
        tiles
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn mercator_projection_round_trip() {
        let tms = Tms::web_mercator_quad();
        let (x, y) = tms.xy(180.0, 0.0);
        assert_relative_eq!(x, 20_037_508.342789244, epsilon = 1e-6);
        assert_relative_eq!(y, 0.0, epsilon = 1e-6);

        let (lng, lat) = tms.lnglat(1_000_000.0, 2_000_000.0);
        let (x2, y2) = tms.xy(lng, lat);
        assert_relative_eq!(x2, 1_000_000.0, epsilon = 1e-6);
        assert_relative_eq!(y2, 2_000_000.0, epsilon = 1e-6);
    }

    #[test]
    fn tile_lookup_matches_reference_values() {
        let tms = Tms::web_mercator_quad();
        // point on the prime meridian / equator lands in the SE quadrant
        assert_eq!(tms.tile(0.0, 0.0, 1), TileCoord::new(1, 1, 1));
        assert_eq!(tms.tile(-122.4194, 37.7749, 12), TileCoord::new(12, 655, 1583));
    }

    #[test]
    fn tile_bounds_cover_the_world_at_zoom_zero() {
        let tms = Tms::web_mercator_quad();
        let bounds = tms.bounds(&TileCoord::new(0, 0, 0));
        assert_relative_eq!(bounds.west, -180.0, epsilon = 1e-9);
        assert_relative_eq!(bounds.east, 180.0, epsilon = 1e-9);
        assert_relative_eq!(bounds.north, MAX_MERCATOR_LATITUDE, epsilon = 1e-9);
        assert_relative_eq!(bounds.south, -MAX_MERCATOR_LATITUDE, epsilon = 1e-9);
    }

    #[test]
    fn boundary_points_stay_in_range() {
        let tms = Tms::web_mercator_quad();
        let tile = tms.tile(180.0, -85.1, 3);
        assert_eq!(tile, TileCoord::new(3, 7, 7));
    }

    #[test]
    fn descriptor_round_trip() {
        let tms = Tms::web_mercator_quad();
        let descriptor = tms.descriptor();
        let back = Tms::from_descriptor(&descriptor).unwrap();
        assert_eq!(back, tms);
    }

    #[test]
    fn unknown_crs_is_rejected() {
        let descriptor = TileMatrixSetDescriptor {
            id: "EuropeanETRS89_LAEAQuad".to_string(),
            crs: "http://www.opengis.net/def/crs/EPSG/0/3035".to_string(),
            bbox: None,
        };
        assert_eq!(
            Tms::from_descriptor(&descriptor),
            Err(TmsError::UnsupportedCrs(descriptor.crs.clone()))
        );
    }

    #[test]
    fn geographic_quad_resolution_ladder() {
        let tms = Tms::geographic_quad();
        assert_relative_eq!(tms.resolution(0), 360.0 / 256.0);
        assert!(tms.zoom_for_resolution(tms.resolution(8), 30) == 8);
    }

    #[test]
    fn tiles_in_bounds_clips_to_validity_extent() {
        let tms = Tms::web_mercator_quad();
        let tiles = tms.tiles_in_bounds(&Bounds::new(-200.0, -100.0, 200.0, 100.0), 1);
        assert_eq!(tiles.len(), 4);
        let empty = tms.tiles_in_bounds(&Bounds::new(200.0, 91.0, 210.0, 95.0), 1);
        assert!(empty.is_empty());
    }
}
