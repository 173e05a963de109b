//! Backend round-trips and the update protocol over file and memory stores.

use std::collections::BTreeMap;

use geojson::{Feature, JsonObject};
use mosaic_core::tile_utils::{Bounds, TileCoord};
use mosaic_core::{
    mosaic_backend, mosaic_backend_for_write, MemoryBackend, MosaicBackend, MosaicError,
    MosaicJSON, MosaicOptions, UpdateOptions,
};
use serde_json::json;

fn feature(path: &str, bounds: [f64; 4]) -> Feature {
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

fn sample_mosaic() -> MosaicJSON {
    MosaicJSON::from_features(
        &[
            feature("1.tif", [-10.0, -10.0, 10.0, 10.0]),
            feature("2.tif", [-10.0, -10.0, 10.0, 10.0]),
        ],
        0,
        8,
        &MosaicOptions {
            quadkey_zoom: Some(0),
            ..MosaicOptions::default()
        },
    )
    .unwrap()
}

#[tokio::test]
async fn file_backend_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("demo.json").display().to_string();

    let mosaic = sample_mosaic();
    let mut backend = mosaic_backend_for_write(Some(&path), mosaic.clone())
        .await
        .unwrap();
    backend.write(false).await.unwrap();

    let read_back = mosaic_backend(Some(&path)).await.unwrap();
    assert_eq!(read_back.mosaic_def(), &mosaic);
    assert_eq!(read_back.mosaicid(), mosaic.mosaicid());
    assert_eq!(
        read_back.assets_for_tile(0, 0, 0).await.unwrap(),
        vec!["1.tif".to_string(), "2.tif".to_string()]
    );
}

#[tokio::test]
async fn file_backend_refuses_silent_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("demo.json").display().to_string();

    let mut backend = mosaic_backend_for_write(Some(&path), sample_mosaic())
        .await
        .unwrap();
    backend.write(false).await.unwrap();

    let err = backend.write(false).await.unwrap_err();
    assert!(matches!(err, MosaicError::MosaicExists(_)));
    backend.write(true).await.unwrap();
}

#[tokio::test]
async fn gzipped_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("demo.json.gz").display().to_string();

    let mosaic = sample_mosaic();
    let mut backend = mosaic_backend_for_write(Some(&path), mosaic.clone())
        .await
        .unwrap();
    backend.write(false).await.unwrap();

    // the stored blob really is gzip
    let raw = std::fs::read(&path).unwrap();
    assert_eq!(&raw[..2], &[0x1f, 0x8b]);

    let read_back = mosaic_backend(Some(&path)).await.unwrap();
    assert_eq!(read_back.mosaic_def(), &mosaic);
}

#[tokio::test]
async fn missing_file_is_not_found() {
    let err = mosaic_backend(Some("/nonexistent/mosaic.json"))
        .await
        .unwrap_err();
    assert!(matches!(err, MosaicError::MosaicNotFound(_)));
}

#[tokio::test]
async fn update_merges_new_assets_first() {
    let mut backend = MemoryBackend::new(Some(sample_mosaic())).unwrap();
    let before_version = backend.mosaic_def().version.clone();

    backend
        .update(
            &[feature("new.tif", [-20.0, -20.0, 20.0, 20.0])],
            &UpdateOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(
        backend.mosaic_def().tiles.get("0").unwrap(),
        &vec![
            "new.tif".to_string(),
            "1.tif".to_string(),
            "2.tif".to_string()
        ]
    );
    assert_eq!(backend.mosaic_def().bounds, Bounds::new(-20.0, -20.0, 20.0, 20.0));
    assert!(backend.mosaic_def().version > before_version);
}

#[tokio::test]
async fn update_add_last_appends() {
    let mut backend = MemoryBackend::new(Some(sample_mosaic())).unwrap();
    backend
        .update(
            &[feature("new.tif", [-5.0, -5.0, 5.0, 5.0])],
            &UpdateOptions {
                add_first: false,
                ..UpdateOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        backend.mosaic_def().tiles.get("0").unwrap(),
        &vec![
            "1.tif".to_string(),
            "2.tif".to_string(),
            "new.tif".to_string()
        ]
    );
}

#[tokio::test]
async fn empty_update_only_bumps_the_version() {
    let mut backend = MemoryBackend::new(Some(sample_mosaic())).unwrap();
    let before = backend.mosaic_def().clone();

    backend.update(&[], &UpdateOptions::default()).await.unwrap();

    let after = backend.mosaic_def();
    assert_eq!(after.tiles, before.tiles);
    assert_eq!(after.bounds, before.bounds);
    assert_eq!(after.version, "1.0.1");
}

#[tokio::test]
async fn duplicate_assets_are_kept_on_update() {
    // merging an asset already present keeps both copies in the stored list
    let mut backend = MemoryBackend::new(Some(sample_mosaic())).unwrap();
    backend
        .update(
            &[feature("1.tif", [-10.0, -10.0, 10.0, 10.0])],
            &UpdateOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(
        backend.mosaic_def().tiles.get("0").unwrap(),
        &vec![
            "1.tif".to_string(),
            "1.tif".to_string(),
            "2.tif".to_string()
        ]
    );
    // lookups still deduplicate, preserving first occurrence
    assert_eq!(
        backend.assets_for_tile(0, 0, 0).await.unwrap(),
        vec!["1.tif".to_string(), "2.tif".to_string()]
    );
}

#[tokio::test]
async fn deeper_tiles_resolve_through_their_indexing_cell() {
    let mut doc = MosaicJSON {
        minzoom: 3,
        maxzoom: 9,
        quadkey_zoom: Some(4),
        bounds: Bounds::world(),
        ..MosaicJSON::default()
    };
    // the four zoom-4 children of tile (3, 1, 2), each with its own asset
    let children = TileCoord::new(3, 1, 2).children();
    let mut tiles = BTreeMap::new();
    for (i, child) in children.iter().enumerate() {
        tiles.insert(child.quadkey(), vec![format!("{i}.tif")]);
    }
    doc.tiles = tiles;
    let backend = MemoryBackend::new(Some(doc)).unwrap();

    // a query above the indexing zoom unions the children in order
    assert_eq!(
        backend.assets_for_tile(1, 2, 3).await.unwrap(),
        vec![
            "0.tif".to_string(),
            "1.tif".to_string(),
            "2.tif".to_string(),
            "3.tif".to_string()
        ]
    );

    // and a query below it resolves to the single ancestor
    let child = children[2];
    let grandchild = child.children()[0];
    assert_eq!(
        backend
            .assets_for_tile(grandchild.x, grandchild.y, grandchild.z)
            .await
            .unwrap(),
        vec!["2.tif".to_string()]
    );
}

#[tokio::test]
async fn asset_prefix_applies_on_lookup() {
    let mut mosaic = sample_mosaic();
    mosaic.asset_prefix = Some("s3://bucket/".to_string());
    let backend = MemoryBackend::new(Some(mosaic)).unwrap();
    assert_eq!(
        backend.assets_for_tile(0, 0, 0).await.unwrap(),
        vec![
            "s3://bucket/1.tif".to_string(),
            "s3://bucket/2.tif".to_string()
        ]
    );
}

#[tokio::test]
async fn bbox_lookup_unions_cells() {
    let mosaic = MosaicJSON::from_features(
        &[
            feature("west.tif", [-100.0, 10.0, -80.0, 30.0]),
            feature("east.tif", [80.0, 10.0, 100.0, 30.0]),
        ],
        2,
        8,
        &MosaicOptions::default(),
    )
    .unwrap();
    let backend = MemoryBackend::new(Some(mosaic)).unwrap();

    let both = backend
        .assets_for_bbox(&Bounds::new(-90.0, 15.0, 90.0, 25.0))
        .await
        .unwrap();
    assert!(both.contains(&"west.tif".to_string()));
    assert!(both.contains(&"east.tif".to_string()));

    let west_only = backend
        .assets_for_bbox(&Bounds::new(-95.0, 15.0, -85.0, 25.0))
        .await
        .unwrap();
    assert_eq!(west_only, vec!["west.tif".to_string()]);
}
