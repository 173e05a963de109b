//! Build an in-memory mosaic from two footprints and query it.
//!
//! ```sh
//! cargo run -p mosaic-core --example quadkey-index
//! ```

use geojson::{Feature, JsonObject};
use mosaic_core::{MemoryBackend, MosaicBackend, MosaicJSON, MosaicOptions};
use serde_json::json;

fn footprint(path: &str, bounds: [f64; 4]) -> Feature {
    let ring = vec![
        vec![bounds[0], bounds[1]],
        vec![bounds[2], bounds[1]],
        vec![bounds[2], bounds[3]],
        vec![bounds[0], bounds[3]],
        vec![bounds[0], bounds[1]],
    ];
    let mut properties = JsonObject::new();
    properties.insert("path".to_string(), json!(path));
    Feature {
        bbox: None,
        geometry: Some(geojson::Geometry::new(geojson::Value::Polygon(vec![ring]))),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mosaic = MosaicJSON::from_features(
        &[
            footprint("scene-a.tif", [-5.0, 45.0, 5.0, 50.0]),
            footprint("scene-b.tif", [0.0, 44.0, 12.0, 49.0]),
        ],
        7,
        12,
        &MosaicOptions::default(),
    )?;
    println!("mosaic id: {}", mosaic.mosaicid());
    println!("indexed cells: {}", mosaic.tiles.len());

    let backend = MemoryBackend::new(Some(mosaic))?;
    let assets = backend.assets_for_point(2.35, 48.86).await?;
    println!("assets over Paris: {assets:?}");
    Ok(())
}
