//! Local-file backend: one JSON (optionally gzipped) document per file.

use async_trait::async_trait;
use log::debug;

use crate::backend::{decode_document, encode_document, is_gzip_path, MosaicBackend};
use crate::cache::{self, CacheKey};
use crate::errors::{MosaicError, MosaicResult};
use crate::model::MosaicJSON;

pub const BACKEND_NAME: &str = "File";

#[derive(Clone, Debug)]
pub struct FileBackend {
    path: String,
    mosaic: MosaicJSON,
}

impl FileBackend {
    /// Open a file backend: write-initialized when `mosaic_def` is given,
    /// otherwise the document is read from disk.
    pub async fn open(path: &str, mosaic_def: Option<MosaicJSON>) -> MosaicResult<Self> {
        let mosaic = match mosaic_def {
            Some(mosaic) => {
                mosaic.validate()?;
                mosaic
            }
            None => Self::read_document(path).await?,
        };
        Ok(Self {
            path: path.to_string(),
            mosaic,
        })
    }

    async fn read_document(path: &str) -> MosaicResult<MosaicJSON> {
        let key = CacheKey::new(BACKEND_NAME, path);
        if let Some(cached) = cache::get(&key) {
            return Ok((*cached).clone());
        }

        debug!("reading mosaic from {path}");
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MosaicError::MosaicNotFound(path.to_string())
            } else {
                MosaicError::Io(e, path.to_string())
            }
        })?;
        let mosaic = decode_document(&bytes, is_gzip_path(path))?;
        cache::insert(key, std::sync::Arc::new(mosaic.clone()));
        Ok(mosaic)
    }
}

#[async_trait]
impl MosaicBackend for FileBackend {
    fn input(&self) -> &str {
        &self.path
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

    async fn write(&mut self, overwrite: bool) -> MosaicResult<()> {
        if !overwrite
            && tokio::fs::try_exists(&self.path)
                .await
                .map_err(|e| MosaicError::Io(e, self.path.clone()))?
        {
            return Err(MosaicError::MosaicExists(self.path.clone()));
        }

        let body = encode_document(&self.mosaic, is_gzip_path(&self.path))?;
        tokio::fs::write(&self.path, body)
            .await
            .map_err(|e| MosaicError::Io(e, self.path.clone()))?;
        cache::invalidate(&CacheKey::new(BACKEND_NAME, self.path.as_str()));
        debug!("wrote mosaic to {}", self.path);
        Ok(())
    }
}
