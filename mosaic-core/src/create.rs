//! Index builder: GeoJSON footprints in, `quadkey -> [asset]` mapping out.

use std::collections::BTreeMap;
use std::sync::Arc;

use geo::BoundingRect;
use geo_types::Geometry;
use geojson::Feature;
use log::{info, warn};
use mosaic_tile_utils::{Bounds, TileCoord, Tms};

use crate::cover::{check_min_tile_cover, tile_cover, CoverOptions};
use crate::errors::{MosaicError, MosaicResult};
use crate::footprint::{get_footprints, FootprintSource};
use crate::model::MosaicJSON;

/// Resolves a feature to its asset identifier.
///
/// Returning `None` drops the feature from the index (with a warning).
pub type Accessor = Arc<dyn Fn(&Feature) -> Option<String> + Send + Sync>;

/// The default accessor: `feature.properties.path`.
#[must_use]
pub fn default_accessor() -> Accessor {
    property_accessor("path")
}

/// An accessor reading a named string property.
#[must_use]
pub fn property_accessor(key: impl Into<String>) -> Accessor {
    let key = key.into();
    Arc::new(move |feature: &Feature| {
        feature
            .properties
            .as_ref()
            .and_then(|props| props.get(&key))
            .and_then(|value| value.as_str())
            .map(ToString::to_string)
    })
}

/// The candidate features of one indexing cell, in supply order.
pub struct TileCandidates<'a> {
    pub tile: TileCoord,
    pub features: Vec<&'a Feature>,
    pub geometries: Vec<&'a Geometry<f64>>,
    /// Covered fraction of the cell per candidate, aligned with `features`.
    pub coverage: Vec<f64>,
}

/// Filters/sorts the candidates of one cell; returns indices into the
/// candidate list. Order of the returned indices is the stored asset order.
pub type AssetFilter = Arc<dyn Fn(&TileCandidates<'_>) -> Vec<usize> + Send + Sync>;

/// Recognized builder options.
#[derive(Clone)]
pub struct MosaicOptions {
    /// Indexing zoom; defaults to the mosaic `minzoom`.
    pub quadkey_zoom: Option<u8>,
    pub tms: Tms,
    pub accessor: Accessor,
    /// Replaces the default per-cell filter entirely when set.
    pub asset_filter: Option<AssetFilter>,
    pub min_tile_cover: Option<f64>,
    pub tile_cover_sort: bool,
    pub max_items_per_tile: Option<usize>,
    pub asset_prefix: Option<String>,
    pub data_type: Option<String>,
    pub quiet: bool,
}

impl Default for MosaicOptions {
    fn default() -> Self {
        MosaicOptions {
            quadkey_zoom: None,
            tms: Tms::web_mercator_quad(),
            accessor: default_accessor(),
            asset_filter: None,
            min_tile_cover: None,
            tile_cover_sort: false,
            max_items_per_tile: None,
            asset_prefix: None,
            data_type: None,
            quiet: true,
        }
    }
}

/// Recognized options of the backend `update` operation.
#[derive(Clone)]
pub struct UpdateOptions {
    /// Merge new assets ahead of the existing ones.
    pub add_first: bool,
    pub accessor: Accessor,
    pub asset_filter: Option<AssetFilter>,
    pub min_tile_cover: Option<f64>,
    pub tile_cover_sort: bool,
    pub quiet: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        UpdateOptions {
            add_first: true,
            accessor: default_accessor(),
            asset_filter: None,
            min_tile_cover: None,
            tile_cover_sort: false,
            quiet: true,
        }
    }
}

impl MosaicOptions {
    fn default_filter(&self, candidates: &TileCandidates<'_>) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..candidates.features.len()).collect();
        if let Some(min) = self.min_tile_cover {
            indices.retain(|&i| candidates.coverage[i] >= min);
        }
        if self.tile_cover_sort {
            indices.sort_by(|&a, &b| candidates.coverage[b].total_cmp(&candidates.coverage[a]));
        }
        if let Some(max) = self.max_items_per_tile {
            indices.truncate(max);
        }
        indices
    }
}

/// Build a mosaic document from footprint features.
///
/// Cells keep the order features were supplied in: the first feature
/// covering a cell takes first position in that cell's asset list.
pub fn from_features(
    features: &[Feature],
    minzoom: u8,
    maxzoom: u8,
    options: &MosaicOptions,
) -> MosaicResult<MosaicJSON> {
    check_min_tile_cover(options.min_tile_cover)?;
    let quadkey_zoom = options.quadkey_zoom.unwrap_or(minzoom);
    let tms = &options.tms;

    if !options.quiet {
        info!(
            "indexing {} features at quadkey zoom {quadkey_zoom}",
            features.len()
        );
    }

    let geometries: Vec<Geometry<f64>> = features
        .iter()
        .map(feature_geometry)
        .collect::<MosaicResult<_>>()?;

    // candidate lists per cell, in feature supply order
    let cover_options = CoverOptions::default();
    let mut cells: BTreeMap<TileCoord, Vec<(usize, f64)>> = BTreeMap::new();
    let mut bounds: Option<Bounds> = None;
    for (index, geometry) in geometries.iter().enumerate() {
        if let Some(rect) = geometry.bounding_rect() {
            let feature_bounds =
                Bounds::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y);
            bounds = Some(match bounds {
                Some(b) => b.union(&feature_bounds),
                None => feature_bounds,
            });
        }
        for covered in tile_cover(geometry, tms, quadkey_zoom, &cover_options)? {
            cells
                .entry(covered.tile)
                .or_default()
                .push((index, covered.coverage));
        }
    }

    let bounds = bounds
        .map(|b| b.intersection(&tms.bbox()))
        .filter(Bounds::is_valid)
        .unwrap_or_else(|| tms.bbox());

    let mut tiles: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (tile, candidates) in &cells {
        let tile_candidates = TileCandidates {
            tile: *tile,
            features: candidates.iter().map(|&(i, _)| &features[i]).collect(),
            geometries: candidates.iter().map(|&(i, _)| &geometries[i]).collect(),
            coverage: candidates.iter().map(|&(_, c)| c).collect(),
        };
        let selected = match &options.asset_filter {
            Some(filter) => filter(&tile_candidates),
            None => options.default_filter(&tile_candidates),
        };

        let mut assets = Vec::with_capacity(selected.len());
        for index in selected {
            match (options.accessor)(tile_candidates.features[index]) {
                Some(asset) => assets.push(asset),
                None => warn!("feature without an asset identifier skipped in {tile:#}"),
            }
        }
        if !assets.is_empty() {
            tiles.insert(tile.quadkey(), assets);
        }
    }

    let (lng, lat) = bounds.center();
    let mut mosaic = MosaicJSON {
        minzoom,
        maxzoom,
        quadkey_zoom: Some(quadkey_zoom),
        bounds,
        center: Some((lng, lat, minzoom)),
        tiles,
        tilematrixset: (tms != &Tms::web_mercator_quad()).then(|| tms.descriptor()),
        asset_prefix: options.asset_prefix.clone(),
        data_type: options.data_type.clone(),
        ..MosaicJSON::default()
    };
    if let Some(prefix) = mosaic.asset_prefix.clone() {
        for assets in mosaic.tiles.values_mut() {
            for asset in assets.iter_mut() {
                if let Some(stripped) = asset.strip_prefix(&prefix) {
                    *asset = stripped.to_string();
                }
            }
        }
    }
    mosaic.validate()?;
    Ok(mosaic)
}

/// Build a mosaic document by introspecting raster footprints.
///
/// Zoom levels default to the deepest values found in the footprints; mixed
/// zooms only warn, mixed data types are an error.
pub async fn from_urls(
    urls: &[String],
    source: &dyn FootprintSource,
    minzoom: Option<u8>,
    maxzoom: Option<u8>,
    options: &MosaicOptions,
) -> MosaicResult<MosaicJSON> {
    let features = get_footprints(urls, source, options.quiet).await;
    if features.is_empty() {
        return Err(MosaicError::validation(
            "urls",
            "no footprint could be read from the given urls",
        ));
    }

    let minzoom = match minzoom {
        Some(z) => z,
        None => zoom_consensus(&features, "minzoom")?,
    };
    let maxzoom = match maxzoom {
        Some(z) => z,
        None => zoom_consensus(&features, "maxzoom")?,
    };

    let mut data_types: Vec<String> = features
        .iter()
        .filter_map(|f| property_str(f, "datatype"))
        .collect();
    data_types.sort();
    data_types.dedup();
    if data_types.len() > 1 {
        return Err(MosaicError::MultipleDataTypes(data_types));
    }

    let mut options = options.clone();
    if options.data_type.is_none() {
        options.data_type = data_types.into_iter().next();
    }
    from_features(&features, minzoom, maxzoom, &options)
}

fn feature_geometry(feature: &Feature) -> MosaicResult<Geometry<f64>> {
    let geometry = feature
        .geometry
        .as_ref()
        .ok_or_else(|| MosaicError::validation("features", "feature without geometry"))?;
    Geometry::<f64>::try_from(geometry).map_err(|e| {
        MosaicError::validation("features", format!("unsupported feature geometry: {e}"))
    })
}

fn property_str(feature: &Feature, key: &str) -> Option<String> {
    feature
        .properties
        .as_ref()
        .and_then(|props| props.get(key))
        .and_then(|v| v.as_str())
        .map(ToString::to_string)
}

fn zoom_consensus(features: &[Feature], key: &'static str) -> MosaicResult<u8> {
    let zooms: Vec<u8> = features
        .iter()
        .filter_map(|f| {
            f.properties
                .as_ref()
                .and_then(|props| props.get(key))
                .and_then(|v| v.as_u64())
                .map(|z| z.min(30) as u8)
        })
        .collect();
    if zooms.is_empty() {
        return Err(MosaicError::validation(
            key,
            "not derivable from footprints, pass it explicitly",
        ));
    }
    let max = *zooms.iter().max().unwrap();
    if zooms.iter().any(|&z| z != max) {
        warn!("assets carry multiple {key} values, using {max}");
    }
    Ok(max)
}

#[cfg(test)]
mod tests {
    use geojson::JsonObject;
    use serde_json::json;

    use super::*;

    fn feature(id: &str, bounds: [f64; 4]) -> Feature {
        let ring = vec![
            vec![bounds[0], bounds[1]],
            vec![bounds[2], bounds[1]],
            vec![bounds[2], bounds[3]],
            vec![bounds[0], bounds[3]],
            vec![bounds[0], bounds[1]],
        ];
        let mut properties = JsonObject::new();
        properties.insert("path".to_string(), json!(id));
        Feature {
            bbox: None,
            geometry: Some(geojson::Geometry::new(geojson::Value::Polygon(vec![ring]))),
            id: None,
            properties: Some(properties),
            foreign_members: None,
        }
    }

    #[test]
    fn world_features_collapse_to_the_root_cell() {
        let features = vec![
            feature("1.tif", [-180.0, -85.0, 180.0, 85.0]),
            feature("2.tif", [-180.0, -85.0, 180.0, 85.0]),
        ];
        let options = MosaicOptions {
            quadkey_zoom: Some(0),
            ..MosaicOptions::default()
        };
        let mosaic = from_features(&features, 0, 8, &options).unwrap();
        assert_eq!(mosaic.tiles.len(), 1);
        assert_eq!(
            mosaic.tiles.get("0").unwrap(),
            &vec!["1.tif".to_string(), "2.tif".to_string()]
        );
    }

    #[test]
    fn first_supplied_feature_wins_first_position() {
        let features = vec![
            feature("top.tif", [-20.0, -20.0, 20.0, 20.0]),
            feature("bottom.tif", [-20.0, -20.0, 20.0, 20.0]),
        ];
        let mosaic = from_features(&features, 5, 9, &MosaicOptions::default()).unwrap();
        for assets in mosaic.tiles.values() {
            assert_eq!(assets, &vec!["top.tif".to_string(), "bottom.tif".to_string()]);
        }
    }

    #[test]
    fn custom_accessor_and_disjoint_features() {
        let mut inside = feature("ignored", [-1.0, -1.0, 1.0, 1.0]);
        inside
            .properties
            .as_mut()
            .unwrap()
            .insert("id".to_string(), json!("a"));
        let mut outside = feature("ignored", [100.0, 10.0, 110.0, 20.0]);
        outside
            .properties
            .as_mut()
            .unwrap()
            .insert("id".to_string(), json!("b"));

        let options = MosaicOptions {
            accessor: property_accessor("id"),
            quadkey_zoom: Some(7),
            ..MosaicOptions::default()
        };
        let mosaic = from_features(&[inside, outside], 7, 12, &options).unwrap();
        let quadkey = Tms::web_mercator_quad().tile(0.0, 0.0, 7).quadkey();
        // the cell at the origin only sees the first feature
        assert_eq!(mosaic.tiles.get(&quadkey).unwrap(), &vec!["a".to_string()]);
        assert!(mosaic.tiles.values().all(|assets| !assets.contains(&"ignored".to_string())));
        assert!(mosaic.tiles.values().any(|assets| assets.contains(&"b".to_string())));
    }

    #[test]
    fn min_tile_cover_above_one_fails_the_build() {
        let features = vec![feature("1.tif", [-10.0, -10.0, 10.0, 10.0])];
        let options = MosaicOptions {
            min_tile_cover: Some(2.0),
            ..MosaicOptions::default()
        };
        let err = from_features(&features, 3, 6, &options).unwrap_err();
        assert!(matches!(
            err,
            MosaicError::Validation {
                field: "min_tile_cover",
                ..
            }
        ));
    }

    #[test]
    fn max_items_per_tile_truncates() {
        let features: Vec<Feature> = (0..5)
            .map(|i| feature(&format!("{i}.tif"), [-20.0, -20.0, 20.0, 20.0]))
            .collect();
        let options = MosaicOptions {
            max_items_per_tile: Some(2),
            ..MosaicOptions::default()
        };
        let mosaic = from_features(&features, 4, 8, &options).unwrap();
        for assets in mosaic.tiles.values() {
            assert_eq!(assets, &vec!["0.tif".to_string(), "1.tif".to_string()]);
        }
    }

    #[test]
    fn custom_filter_controls_selection() {
        let features = vec![
            feature("a.tif", [-20.0, -20.0, 20.0, 20.0]),
            feature("b.tif", [-20.0, -20.0, 20.0, 20.0]),
        ];
        // keep only the last candidate of every cell
        let filter: AssetFilter = Arc::new(|candidates: &TileCandidates<'_>| {
            vec![candidates.features.len() - 1]
        });
        let options = MosaicOptions {
            asset_filter: Some(filter),
            ..MosaicOptions::default()
        };
        let mosaic = from_features(&features, 4, 8, &options).unwrap();
        for assets in mosaic.tiles.values() {
            assert_eq!(assets, &vec!["b.tif".to_string()]);
        }
    }

    #[test]
    fn asset_prefix_is_stripped_from_stored_tiles() {
        let features = vec![feature("s3://bucket/1.tif", [-10.0, -10.0, 10.0, 10.0])];
        let options = MosaicOptions {
            asset_prefix: Some("s3://bucket/".to_string()),
            quadkey_zoom: Some(0),
            ..MosaicOptions::default()
        };
        let mosaic = from_features(&features, 0, 4, &options).unwrap();
        assert_eq!(mosaic.tiles.get("0").unwrap(), &vec!["1.tif".to_string()]);
        assert_eq!(
            mosaic.prefixed_assets(mosaic.tiles.get("0").unwrap()),
            vec!["s3://bucket/1.tif".to_string()]
        );
    }

    #[test]
    fn bounds_are_the_clipped_union_of_footprints() {
        let features = vec![
            feature("1.tif", [-10.0, -10.0, 0.0, 0.0]),
            feature("2.tif", [0.0, 0.0, 20.0, 30.0]),
        ];
        let mosaic = from_features(&features, 2, 6, &MosaicOptions::default()).unwrap();
        assert_eq!(mosaic.bounds, Bounds::new(-10.0, -10.0, 20.0, 30.0));
        assert_eq!(mosaic.center(), (5.0, 10.0, 2));
    }
}
