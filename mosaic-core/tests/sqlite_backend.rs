//! SQLite backend: schema creation, round-trips and in-place updates.

use geojson::{Feature, JsonObject};
use mosaic_core::tile_utils::Bounds;
use mosaic_core::{
    mosaic_backend, mosaic_backend_for_write, MosaicBackend, MosaicError, MosaicJSON,
    MosaicOptions, SqliteBackend, UpdateOptions,
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

fn db_uri(dir: &tempfile::TempDir, mosaic: &str) -> String {
    format!(
        "sqlite:///{}:{mosaic}",
        dir.path().join("mosaics.db").display()
    )
}

#[tokio::test]
async fn write_and_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let uri = db_uri(&dir, "demo");

    let mosaic = sample_mosaic();
    let mut backend = mosaic_backend_for_write(Some(&uri), mosaic.clone())
        .await
        .unwrap();
    backend.write(false).await.unwrap();

    let read_back = mosaic_backend(Some(&uri)).await.unwrap();
    // the stored header carries the table name; tiles live in their own table
    assert_eq!(read_back.mosaic_def().name.as_deref(), Some("demo"));
    assert_eq!(read_back.mosaic_def().bounds, mosaic.bounds);
    assert!(read_back.mosaic_def().tiles.is_empty());
    assert_eq!(
        read_back.assets_for_tile(0, 0, 0).await.unwrap(),
        vec!["1.tif".to_string(), "2.tif".to_string()]
    );
    assert_eq!(read_back.quadkeys().await.unwrap(), vec!["0".to_string()]);
}

#[tokio::test]
async fn existing_mosaic_requires_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let uri = db_uri(&dir, "demo");

    let mut backend = mosaic_backend_for_write(Some(&uri), sample_mosaic())
        .await
        .unwrap();
    backend.write(false).await.unwrap();

    let err = backend.write(false).await.unwrap_err();
    assert!(matches!(err, MosaicError::MosaicExists(_)));
    backend.write(true).await.unwrap();
}

#[tokio::test]
async fn one_database_hosts_many_mosaics() {
    let dir = tempfile::tempdir().unwrap();

    for name in ["alpha", "beta"] {
        let mut backend = mosaic_backend_for_write(Some(&db_uri(&dir, name)), sample_mosaic())
            .await
            .unwrap();
        backend.write(false).await.unwrap();
    }

    let names =
        SqliteBackend::list_mosaics(&dir.path().join("mosaics.db").display().to_string())
            .await
            .unwrap();
    assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);
}

#[tokio::test]
async fn update_runs_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let uri = db_uri(&dir, "demo");

    let mut backend = mosaic_backend_for_write(Some(&uri), sample_mosaic())
        .await
        .unwrap();
    backend.write(false).await.unwrap();

    let mut backend = mosaic_backend(Some(&uri)).await.unwrap();
    backend
        .update(
            &[feature("new.tif", [-20.0, -20.0, 20.0, 20.0])],
            &UpdateOptions::default(),
        )
        .await
        .unwrap();

    let read_back = mosaic_backend(Some(&uri)).await.unwrap();
    assert_eq!(
        read_back.assets_for_tile(0, 0, 0).await.unwrap(),
        vec![
            "new.tif".to_string(),
            "1.tif".to_string(),
            "2.tif".to_string()
        ]
    );
    assert_eq!(read_back.mosaic_def().version, "1.0.1");
    assert_eq!(
        read_back.mosaic_def().bounds,
        Bounds::new(-20.0, -20.0, 20.0, 20.0)
    );
}

#[tokio::test]
async fn missing_database_is_not_found() {
    let err = mosaic_backend(Some("sqlite:///nonexistent/mosaics.db:demo"))
        .await
        .unwrap_err();
    assert!(matches!(err, MosaicError::MosaicNotFound(_)));
}

#[tokio::test]
async fn missing_mosaic_in_existing_database_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = mosaic_backend_for_write(Some(&db_uri(&dir, "demo")), sample_mosaic())
        .await
        .unwrap();
    backend.write(false).await.unwrap();

    let err = mosaic_backend(Some(&db_uri(&dir, "other")))
        .await
        .unwrap_err();
    assert!(matches!(err, MosaicError::MosaicNotFound(_)));
}

#[tokio::test]
async fn delete_removes_the_mosaic() {
    let dir = tempfile::tempdir().unwrap();
    let uri = db_uri(&dir, "demo");
    let mut backend = SqliteBackend::open(&uri, Some(sample_mosaic())).await.unwrap();
    backend.write(false).await.unwrap();

    backend.delete().await.unwrap();
    let names =
        SqliteBackend::list_mosaics(&dir.path().join("mosaics.db").display().to_string())
            .await
            .unwrap();
    assert!(names.is_empty());
}
