//! Dynamic STAC backend: no stored document, every `assets_for_*` call is a
//! paginated STAC-API item search over the query region.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use geojson::Feature;
use log::debug;
use mosaic_tile_utils::{Bounds, TileCoord, Tms};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::backend::MosaicBackend;
use crate::create::UpdateOptions;
use crate::errors::{MosaicError, MosaicResult};
use crate::model::MosaicJSON;

pub const BACKEND_NAME: &str = "STAC";

/// Search-body keys forwarded from the configured query.
const RECOGNIZED_QUERY_KEYS: [&str; 5] = ["collections", "datetime", "query", "fields", "sortby"];

static CLIENT: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_default()
});

/// Maps a search result item to an asset URI; `None` drops the item.
pub type StacAccessor = Arc<dyn Fn(&StacItem) -> Option<String> + Send + Sync>;

/// The default accessor: the item's `self` link.
#[must_use]
pub fn default_stac_accessor() -> StacAccessor {
    Arc::new(|item: &StacItem| {
        item.links
            .iter()
            .find(|link| link.rel == "self")
            .map(|link| link.href.clone())
    })
}

/// The subset of a STAC item the backend consumes.
#[derive(Clone, Debug, Deserialize)]
pub struct StacItem {
    pub id: String,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub links: Vec<StacLink>,
    #[serde(default)]
    pub assets: Map<String, Value>,
    #[serde(default)]
    pub properties: Value,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StacLink {
    pub rel: String,
    pub href: String,
}

#[derive(Debug, Deserialize)]
struct ItemCollection {
    #[serde(default)]
    features: Vec<StacItem>,
}

/// Recognized options of the STAC backend.
#[derive(Clone)]
pub struct StacOptions {
    pub minzoom: u8,
    pub maxzoom: u8,
    /// Extra search-body entries; only recognized keys are forwarded.
    pub query: Map<String, Value>,
    /// Hard cap on materialized items per query.
    pub max_items: Option<usize>,
    /// Page size (`limit`) for each search request.
    pub stac_query_limit: Option<usize>,
    /// Dotted path to the next-page URL in the response body, for APIs not
    /// exposing RFC-style `next` links.
    pub stac_next_link_key: Option<String>,
    pub accessor: StacAccessor,
    pub tms: Tms,
}

impl StacOptions {
    #[must_use]
    pub fn new(minzoom: u8, maxzoom: u8) -> Self {
        Self {
            minzoom,
            maxzoom,
            query: Map::new(),
            max_items: None,
            stac_query_limit: None,
            stac_next_link_key: None,
            accessor: default_stac_accessor(),
            tms: Tms::web_mercator_quad(),
        }
    }
}

impl std::fmt::Debug for StacOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StacOptions")
            .field("minzoom", &self.minzoom)
            .field("maxzoom", &self.maxzoom)
            .field("query", &self.query)
            .field("max_items", &self.max_items)
            .field("stac_query_limit", &self.stac_query_limit)
            .field("stac_next_link_key", &self.stac_next_link_key)
            .field("tms", &self.tms.id())
            .finish_non_exhaustive()
    }
}

pub struct StacBackend {
    url: String,
    options: StacOptions,
    /// Synthetic document keeping zoom/bounds/TMS accessors coherent.
    mosaic: MosaicJSON,
}

impl std::fmt::Debug for StacBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StacBackend {{ url: {} }}", self.url)
    }
}

impl StacBackend {
    pub fn new(url: &str, options: StacOptions) -> MosaicResult<Self> {
        let tms = options.tms.clone();
        let (lng, lat) = tms.bbox().center();
        let mosaic = MosaicJSON {
            minzoom: options.minzoom,
            maxzoom: options.maxzoom,
            quadkey_zoom: Some(options.minzoom),
            bounds: tms.bbox(),
            center: Some((lng, lat, options.minzoom)),
            tilematrixset: (tms != Tms::web_mercator_quad()).then(|| tms.descriptor()),
            ..MosaicJSON::default()
        };
        mosaic.validate()?;
        Ok(Self {
            url: url.to_string(),
            options,
            mosaic,
        })
    }

    fn search_body(&self, intersects: Value) -> Value {
        let mut body = Map::new();
        for key in RECOGNIZED_QUERY_KEYS {
            if let Some(value) = self.options.query.get(key) {
                body.insert(key.to_string(), value.clone());
            }
        }
        if let Some(limit) = self.options.stac_query_limit {
            body.insert("limit".to_string(), json!(limit));
        } else if let Some(limit) = self.options.query.get("limit") {
            body.insert("limit".to_string(), limit.clone());
        }
        body.insert("intersects".to_string(), intersects);
        Value::Object(body)
    }

    /// POST the search and follow pagination until exhaustion or the item
    /// cap is reached.
    async fn search(&self, intersects: Value) -> MosaicResult<Vec<StacItem>> {
        let body = self.search_body(intersects);
        let mut items: Vec<StacItem> = Vec::new();
        let mut next_url = self.url.clone();
        loop {
            debug!("STAC search page: {next_url}");
            let response = CLIENT
                .post(&next_url)
                .header("Accept", "application/geo+json")
                .json(&body)
                .send()
                .await?
                .error_for_status()?;
            let page: Value = response.json().await?;
            let collection: ItemCollection = serde_json::from_value(page.clone())?;
            if collection.features.is_empty() {
                break;
            }
            items.extend(collection.features);

            if let Some(max) = self.options.max_items {
                if items.len() >= max {
                    items.truncate(max);
                    break;
                }
            }
            match next_page_url(&page, self.options.stac_next_link_key.as_deref()) {
                Some(url) => next_url = url,
                None => break,
            }
        }
        Ok(items)
    }

    async fn assets_for_geometry(&self, intersects: Value) -> MosaicResult<Vec<String>> {
        let items = self.search(intersects).await?;
        let mut assets: Vec<String> = items
            .iter()
            .filter_map(|item| (self.options.accessor)(item))
            .collect();
        let mut seen = std::collections::HashSet::with_capacity(assets.len());
        assets.retain(|asset| seen.insert(asset.clone()));
        Ok(assets)
    }
}

/// Resolve the next page: a configured dotted key into the response body, or
/// the RFC-style `next` link.
fn next_page_url(page: &Value, next_link_key: Option<&str>) -> Option<String> {
    if let Some(key) = next_link_key {
        let mut cursor = page;
        for part in key.split('.') {
            cursor = cursor.get(part)?;
        }
        return cursor.as_str().map(ToString::to_string);
    }
    page.get("links")?
        .as_array()?
        .iter()
        .find(|link| link.get("rel").and_then(Value::as_str) == Some("next"))?
        .get("href")?
        .as_str()
        .map(ToString::to_string)
}

fn polygon_geometry(bounds: &Bounds) -> Value {
    json!({
        "type": "Polygon",
        "coordinates": [[
            [bounds.west, bounds.south],
            [bounds.west, bounds.north],
            [bounds.east, bounds.north],
            [bounds.east, bounds.south],
            [bounds.west, bounds.south],
        ]],
    })
}

#[async_trait]
impl MosaicBackend for StacBackend {
    fn input(&self) -> &str {
        &self.url
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

    async fn assets_for_tile(&self, x: u32, y: u32, z: u8) -> MosaicResult<Vec<String>> {
        let bounds = self.tms().bounds(&TileCoord::new(z, x, y));
        self.assets_for_geometry(polygon_geometry(&bounds)).await
    }

    async fn assets_for_point(&self, lng: f64, lat: f64) -> MosaicResult<Vec<String>> {
        self.assets_for_geometry(json!({
            "type": "Point",
            "coordinates": [lng, lat],
        }))
        .await
    }

    async fn assets_for_bbox(&self, bounds: &Bounds) -> MosaicResult<Vec<String>> {
        self.assets_for_geometry(polygon_geometry(bounds)).await
    }

    async fn write(&mut self, _overwrite: bool) -> MosaicResult<()> {
        Err(MosaicError::ReadOnlyBackend(BACKEND_NAME))
    }

    async fn update(&mut self, _features: &[Feature], _options: &UpdateOptions) -> MosaicResult<()> {
        Err(MosaicError::ReadOnlyBackend(BACKEND_NAME))
    }
}
