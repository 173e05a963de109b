//! Object-store backends: S3, Google Cloud Storage and Azure Blob Storage.
//!
//! One blob holds one JSON (optionally gzipped) document; credential
//! discovery is delegated to the store builders' environment lookup.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path;
use object_store::ObjectStore;
use url::Url;

use crate::backend::{decode_document, encode_document, is_gzip_path, MosaicBackend};
use crate::cache::{self, CacheKey};
use crate::errors::{MosaicError, MosaicResult};
use crate::model::MosaicJSON;

#[derive(Clone)]
pub struct ObjectStoreBackend {
    uri: String,
    kind: &'static str,
    store: Arc<dyn ObjectStore>,
    location: Path,
    mosaic: MosaicJSON,
}

impl std::fmt::Debug for ObjectStoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectStoreBackend {{ kind: {}, uri: {} }}", self.kind, self.uri)
    }
}

/// `(container, key)` split of a `scheme://container/key` URI.
fn parse_blob_uri(uri: &str, kind: &'static str) -> MosaicResult<(String, String)> {
    let invalid = || MosaicError::InvalidPath {
        kind,
        path: uri.to_string(),
    };
    let url = Url::parse(uri).map_err(|_| invalid())?;
    let container = url.host_str().ok_or_else(invalid)?.to_string();
    let key = url.path().trim_start_matches('/').to_string();
    if key.is_empty() {
        return Err(invalid());
    }
    Ok((container, key))
}

impl ObjectStoreBackend {
    pub async fn s3(uri: &str, mosaic_def: Option<MosaicJSON>) -> MosaicResult<Self> {
        let (bucket, key) = parse_blob_uri(uri, "S3")?;
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()?;
        Self::open(uri, "S3", Arc::new(store), key, mosaic_def).await
    }

    pub async fn gcs(uri: &str, mosaic_def: Option<MosaicJSON>) -> MosaicResult<Self> {
        let (bucket, key) = parse_blob_uri(uri, "GCS")?;
        let store = GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(bucket)
            .build()?;
        Self::open(uri, "GCS", Arc::new(store), key, mosaic_def).await
    }

    pub async fn azure(uri: &str, mosaic_def: Option<MosaicJSON>) -> MosaicResult<Self> {
        let (container, key) = parse_blob_uri(uri, "AzureBlobStorage")?;
        let store = MicrosoftAzureBuilder::from_env()
            .with_container_name(container)
            .build()?;
        Self::open(uri, "AzureBlobStorage", Arc::new(store), key, mosaic_def).await
    }

    async fn open(
        uri: &str,
        kind: &'static str,
        store: Arc<dyn ObjectStore>,
        key: String,
        mosaic_def: Option<MosaicJSON>,
    ) -> MosaicResult<Self> {
        let location = Path::from(key);
        let mosaic = match mosaic_def {
            Some(mosaic) => {
                mosaic.validate()?;
                mosaic
            }
            None => Self::read_document(uri, kind, store.as_ref(), &location).await?,
        };
        Ok(Self {
            uri: uri.to_string(),
            kind,
            store,
            location,
            mosaic,
        })
    }

    async fn read_document(
        uri: &str,
        kind: &'static str,
        store: &dyn ObjectStore,
        location: &Path,
    ) -> MosaicResult<MosaicJSON> {
        let key = CacheKey::new(kind, uri);
        if let Some(cached) = cache::get(&key) {
            return Ok((*cached).clone());
        }

        debug!("fetching mosaic from {uri}");
        let bytes = store
            .get(location)
            .await
            .map_err(|e| not_found_or(e, uri))?
            .bytes()
            .await?;
        let mosaic = decode_document(&bytes, is_gzip_path(uri))?;
        cache::insert(key, Arc::new(mosaic.clone()));
        Ok(mosaic)
    }

    async fn blob_exists(&self) -> MosaicResult<bool> {
        match self.store.head(&self.location).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn not_found_or(error: object_store::Error, uri: &str) -> MosaicError {
    match error {
        object_store::Error::NotFound { .. } => MosaicError::MosaicNotFound(uri.to_string()),
        other => other.into(),
    }
}

#[async_trait]
impl MosaicBackend for ObjectStoreBackend {
    fn input(&self) -> &str {
        &self.uri
    }

    fn backend_name(&self) -> &'static str {
        self.kind
    }

    fn mosaic_def(&self) -> &MosaicJSON {
        &self.mosaic
    }

    fn mosaic_def_mut(&mut self) -> &mut MosaicJSON {
        &mut self.mosaic
    }

    async fn write(&mut self, overwrite: bool) -> MosaicResult<()> {
        if !overwrite && self.blob_exists().await? {
            return Err(MosaicError::MosaicExists(self.uri.clone()));
        }

        let body = encode_document(&self.mosaic, is_gzip_path(&self.uri))?;
        self.store
            .put(&self.location, Bytes::from(body).into())
            .await?;
        cache::invalidate(&CacheKey::new(self.kind, self.uri.as_str()));
        debug!("wrote mosaic to {}", self.uri);
        Ok(())
    }
}
