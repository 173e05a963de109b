//! Read-only HTTP(S) backend.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::Client;

use crate::backend::{decode_document, is_gzip_path, MosaicBackend};
use crate::cache::{self, CacheKey};
use crate::errors::{MosaicError, MosaicResult};
use crate::model::MosaicJSON;

pub const BACKEND_NAME: &str = "HTTP";

static CLIENT: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_default()
});

#[derive(Clone, Debug)]
pub struct HttpBackend {
    url: String,
    mosaic: MosaicJSON,
}

impl HttpBackend {
    pub async fn open(url: &str) -> MosaicResult<Self> {
        let mosaic = Self::read_document(url).await?;
        Ok(Self {
            url: url.to_string(),
            mosaic,
        })
    }

    async fn read_document(url: &str) -> MosaicResult<MosaicJSON> {
        let key = CacheKey::new(BACKEND_NAME, url);
        if let Some(cached) = cache::get(&key) {
            return Ok((*cached).clone());
        }

        debug!("fetching mosaic from {url}");
        let response = CLIENT.get(url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(MosaicError::MosaicNotFound(url.to_string()));
        }
        let response = response.error_for_status()?;
        let bytes = response.bytes().await?;
        // the transport may already have unzipped `.gz` payloads
        let gzipped = is_gzip_path(url) && bytes.starts_with(&[0x1f, 0x8b]);
        let mosaic = decode_document(&bytes, gzipped)?;
        cache::insert(key, std::sync::Arc::new(mosaic.clone()));
        Ok(mosaic)
    }
}

#[async_trait]
impl MosaicBackend for HttpBackend {
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

    async fn write(&mut self, _overwrite: bool) -> MosaicResult<()> {
        Err(MosaicError::ReadOnlyBackend(BACKEND_NAME))
    }

    async fn update(
        &mut self,
        _features: &[geojson::Feature],
        _options: &crate::create::UpdateOptions,
    ) -> MosaicResult<()> {
        Err(MosaicError::ReadOnlyBackend(BACKEND_NAME))
    }
}
