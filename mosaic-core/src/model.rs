use std::collections::BTreeMap;

use geojson::{Feature, FeatureCollection, Geometry, JsonObject, Value as GeomValue};
use mosaic_tile_utils::{Bounds, TileCoord, TileMatrixSetDescriptor, Tms};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha224};

use crate::errors::{MosaicError, MosaicResult};

/// Spec revision carrying only the core fields.
pub const MOSAICJSON_V2: &str = "0.0.2";
/// Spec revision enabling `tilematrixset`, `asset_*`, `data_type`,
/// `colormap` and `layers`.
pub const MOSAICJSON_V3: &str = "0.0.3";

/// A MosaicJSON document: the mapping from quadkey tile cells to the ordered
/// list of assets covering them, plus the metadata needed to query it.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MosaicJSON {
    pub mosaicjson: String,
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    pub attribution: Option<String>,
    #[serde(default)]
    pub minzoom: u8,
    #[serde(default = "default_maxzoom")]
    pub maxzoom: u8,
    pub quadkey_zoom: Option<u8>,
    #[serde(default = "Bounds::world")]
    pub bounds: Bounds,
    pub center: Option<(f64, f64, u8)>,
    #[serde(default)]
    pub tiles: BTreeMap<String, Vec<String>>,
    pub tilematrixset: Option<TileMatrixSetDescriptor>,
    pub asset_type: Option<String>,
    pub asset_prefix: Option<String>,
    pub data_type: Option<String>,
    pub colormap: Option<BTreeMap<u16, [u8; 4]>>,
    pub layers: Option<BTreeMap<String, Value>>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_maxzoom() -> u8 {
    30
}

impl Default for MosaicJSON {
    fn default() -> Self {
        MosaicJSON {
            mosaicjson: MOSAICJSON_V3.to_string(),
            name: None,
            description: None,
            version: default_version(),
            attribution: None,
            minzoom: 0,
            maxzoom: default_maxzoom(),
            quadkey_zoom: None,
            bounds: Bounds::world(),
            center: None,
            tiles: BTreeMap::new(),
            tilematrixset: None,
            asset_type: None,
            asset_prefix: None,
            data_type: None,
            colormap: None,
            layers: None,
        }
    }
}

impl MosaicJSON {
    /// The indexing zoom: `quadkey_zoom` when present, `minzoom` otherwise.
    #[must_use]
    pub fn quadkey_zoom(&self) -> u8 {
        self.quadkey_zoom.unwrap_or(self.minzoom)
    }

    /// The tile matrix set the document is indexed in.
    pub fn tms(&self) -> MosaicResult<Tms> {
        match &self.tilematrixset {
            Some(descriptor) => Ok(Tms::from_descriptor(descriptor)?),
            None => Ok(Tms::web_mercator_quad()),
        }
    }

    /// `[lng, lat, minzoom]` center, derived from bounds unless overridden.
    #[must_use]
    pub fn center(&self) -> (f64, f64, u8) {
        self.center.unwrap_or_else(|| {
            let (lng, lat) = self.bounds.center();
            (lng, lat, self.minzoom)
        })
    }

    /// Enforce the document invariants, naming the offending field.
    pub fn validate(&self) -> MosaicResult<()> {
        if self.mosaicjson != MOSAICJSON_V2 && self.mosaicjson != MOSAICJSON_V3 {
            return Err(MosaicError::validation(
                "mosaicjson",
                format!("unrecognized spec version `{}`", self.mosaicjson),
            ));
        }
        if self.mosaicjson == MOSAICJSON_V2 && self.has_extended_fields() {
            return Err(MosaicError::validation(
                "mosaicjson",
                "tilematrixset/asset/data_type/colormap/layers fields require 0.0.3",
            ));
        }
        if self.minzoom > 30 || self.maxzoom > 30 {
            return Err(MosaicError::validation(
                "maxzoom",
                "zoom levels must be within [0, 30]",
            ));
        }
        if self.minzoom > self.maxzoom {
            return Err(MosaicError::validation(
                "minzoom",
                format!("minzoom {} > maxzoom {}", self.minzoom, self.maxzoom),
            ));
        }
        if let Some(qz) = self.quadkey_zoom {
            if qz > 30 {
                return Err(MosaicError::validation(
                    "quadkey_zoom",
                    "quadkey_zoom must be within [0, 30]",
                ));
            }
        }
        if !self.bounds.is_valid() {
            return Err(MosaicError::validation(
                "bounds",
                format!("invalid bounds {}", self.bounds),
            ));
        }
        parse_version(&self.version).ok_or_else(|| {
            MosaicError::validation(
                "version",
                format!("`{}` is not MAJOR.MINOR.PATCH", self.version),
            )
        })?;
        // resolvable TMS (rejects unsupported CRS descriptors)
        self.tms()?;

        let qz = self.quadkey_zoom();
        for (quadkey, assets) in &self.tiles {
            let valid_key = if qz == 0 {
                quadkey == "0"
            } else {
                quadkey.len() == qz as usize && TileCoord::from_quadkey(quadkey).is_some()
            };
            if !valid_key {
                return Err(MosaicError::validation(
                    "tiles",
                    format!("`{quadkey}` is not a quadkey at zoom {qz}"),
                ));
            }
            if assets.is_empty() {
                return Err(MosaicError::validation(
                    "tiles",
                    format!("empty asset list for quadkey `{quadkey}`"),
                ));
            }
        }
        Ok(())
    }

    fn has_extended_fields(&self) -> bool {
        self.tilematrixset.is_some()
            || self.asset_type.is_some()
            || self.asset_prefix.is_some()
            || self.data_type.is_some()
            || self.colormap.is_some()
            || self.layers.is_some()
    }

    /// Bump the PATCH digit of the document revision.
    ///
    /// An absent or unparseable revision resets to `1.0.0`.
    pub fn increase_version(&mut self) {
        self.version = match parse_version(&self.version) {
            Some(mut parts) => {
                *parts.last_mut().unwrap() += 1;
                parts
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(".")
            }
            None => default_version(),
        };
    }

    /// Deterministic SHA-224 digest of the document without its `tiles`.
    ///
    /// The digest is computed over the compact, sorted-key JSON encoding, so
    /// it is stable across serialization round-trips.
    #[must_use]
    pub fn mosaicid(&self) -> String {
        let mut value = serde_json::to_value(self).expect("document serializes");
        if let Value::Object(map) = &mut value {
            map.remove("tiles");
        }
        let body = serde_json::to_string(&value).expect("value serializes");
        let digest = Sha224::digest(body.as_bytes());
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// One feature per indexing-level quadkey, with the asset list under
    /// `properties.files`. Meant for visualisation and debugging.
    pub fn to_geojson(&self) -> MosaicResult<FeatureCollection> {
        let tms = self.tms()?;
        let features = self
            .tiles
            .iter()
            .map(|(quadkey, assets)| {
                let tile = TileCoord::from_quadkey(quadkey).unwrap_or_default();
                let b = tms.bounds(&tile);
                let ring = vec![
                    vec![b.west, b.south],
                    vec![b.west, b.north],
                    vec![b.east, b.north],
                    vec![b.east, b.south],
                    vec![b.west, b.south],
                ];
                let mut properties = JsonObject::new();
                properties.insert("quadkey".to_string(), Value::String(quadkey.clone()));
                properties.insert(
                    "files".to_string(),
                    serde_json::to_value(self.prefixed_assets(assets)).expect("assets serialize"),
                );
                Feature {
                    bbox: None,
                    geometry: Some(Geometry::new(GeomValue::Polygon(vec![ring]))),
                    id: None,
                    properties: Some(properties),
                    foreign_members: None,
                }
            })
            .collect();
        Ok(FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        })
    }

    /// Stored asset strings with `asset_prefix` applied.
    #[must_use]
    pub fn prefixed_assets(&self, assets: &[String]) -> Vec<String> {
        match &self.asset_prefix {
            Some(prefix) => assets.iter().map(|a| format!("{prefix}{a}")).collect(),
            None => assets.to_vec(),
        }
    }

    /// Strip `asset_prefix` from an incoming asset string, best-effort.
    #[must_use]
    pub fn unprefixed_asset(&self, asset: &str) -> String {
        match &self.asset_prefix {
            Some(prefix) => asset.strip_prefix(prefix.as_str()).unwrap_or(asset).to_string(),
            None => asset.to_string(),
        }
    }
}

fn parse_version(version: &str) -> Option<Vec<u64>> {
    let parts: Vec<u64> = version
        .split('.')
        .map(|p| p.parse().ok())
        .collect::<Option<_>>()?;
    (parts.len() == 3).then_some(parts)
}

/// Mosaic metadata summary returned by backends.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MosaicInfo {
    pub bounds: Bounds,
    pub center: (f64, f64, u8),
    pub minzoom: u8,
    pub maxzoom: u8,
    pub name: Option<String>,
    pub quadkeys: Option<Vec<String>>,
}

impl MosaicInfo {
    #[must_use]
    pub fn new(mosaic: &MosaicJSON, with_quadkeys: bool) -> MosaicInfo {
        MosaicInfo {
            bounds: mosaic.bounds,
            center: mosaic.center(),
            minzoom: mosaic.minzoom,
            maxzoom: mosaic.maxzoom,
            name: mosaic.name.clone(),
            quadkeys: with_quadkeys.then(|| mosaic.tiles.keys().cloned().collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MosaicJSON {
        MosaicJSON {
            name: Some("sample".to_string()),
            minzoom: 7,
            maxzoom: 9,
            bounds: Bounds::new(-10.0, -10.0, 10.0, 10.0),
            tiles: BTreeMap::from([(
                "0313102".to_string(),
                vec!["cog1.tif".to_string(), "cog2.tif".to_string()],
            )]),
            ..MosaicJSON::default()
        }
    }

    #[test]
    fn valid_document_passes() {
        sample().validate().unwrap();
    }

    #[test]
    fn center_is_derived_from_bounds() {
        let mosaic = sample();
        assert_eq!(mosaic.center(), (0.0, 0.0, 7));

        let mut overridden = sample();
        overridden.center = Some((1.0, 2.0, 8));
        assert_eq!(overridden.center(), (1.0, 2.0, 8));
    }

    #[test]
    fn quadkey_length_is_enforced() {
        let mut mosaic = sample();
        mosaic.tiles.insert("03".to_string(), vec!["a.tif".to_string()]);
        let err = mosaic.validate().unwrap_err();
        assert!(matches!(err, MosaicError::Validation { field: "tiles", .. }));
    }

    #[test]
    fn empty_asset_lists_are_rejected() {
        let mut mosaic = sample();
        mosaic.tiles.insert("0313102".to_string(), vec![]);
        assert!(mosaic.validate().is_err());
    }

    #[test]
    fn zoom_zero_uses_literal_zero_key() {
        let mut mosaic = sample();
        mosaic.minzoom = 0;
        mosaic.quadkey_zoom = Some(0);
        mosaic.tiles = BTreeMap::from([("0".to_string(), vec!["a.tif".to_string()])]);
        mosaic.validate().unwrap();
    }

    #[test]
    fn extended_fields_require_v3() {
        let mut mosaic = sample();
        mosaic.mosaicjson = MOSAICJSON_V2.to_string();
        mosaic.asset_prefix = Some("s3://bucket/".to_string());
        assert!(matches!(
            mosaic.validate().unwrap_err(),
            MosaicError::Validation { field: "mosaicjson", .. }
        ));
    }

    #[test]
    fn version_bump() {
        let mut mosaic = sample();
        mosaic.increase_version();
        assert_eq!(mosaic.version, "1.0.1");

        mosaic.version = "not-a-version".to_string();
        mosaic.increase_version();
        assert_eq!(mosaic.version, "1.0.0");
    }

    #[test]
    fn mosaicid_ignores_tiles_and_round_trips() {
        let mosaic = sample();
        let id = mosaic.mosaicid();
        assert_eq!(id.len(), 56);

        let mut with_more_tiles = mosaic.clone();
        with_more_tiles
            .tiles
            .insert("0313103".to_string(), vec!["cog3.tif".to_string()]);
        assert_eq!(with_more_tiles.mosaicid(), id);

        let json = serde_json::to_string(&mosaic).unwrap();
        let parsed: MosaicJSON = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, mosaic);
        assert_eq!(parsed.mosaicid(), id);
    }

    #[test]
    fn serialization_elides_absent_fields() {
        let json = serde_json::to_value(&sample()).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("description"));
        assert!(!obj.contains_key("tilematrixset"));
        assert!(obj.contains_key("tiles"));
    }

    #[test]
    fn asset_prefix_round_trip() {
        let mut mosaic = sample();
        mosaic.asset_prefix = Some("s3://bucket/".to_string());
        let stored = vec!["cog1.tif".to_string()];
        assert_eq!(mosaic.prefixed_assets(&stored), vec!["s3://bucket/cog1.tif"]);
        assert_eq!(mosaic.unprefixed_asset("s3://bucket/cog1.tif"), "cog1.tif");
        // best-effort: unprefixed input is stored verbatim
        assert_eq!(mosaic.unprefixed_asset("cog1.tif"), "cog1.tif");
    }

    #[test]
    fn to_geojson_emits_one_feature_per_cell() {
        let collection = sample().to_geojson().unwrap();
        assert_eq!(collection.features.len(), 1);
        let feature = &collection.features[0];
        let files = feature.properties.as_ref().unwrap().get("files").unwrap();
        assert_eq!(files.as_array().unwrap().len(), 2);
    }
}
