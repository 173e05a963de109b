//! The in-memory backend: a document holder with no persistence.

use async_trait::async_trait;

use crate::backend::MosaicBackend;
use crate::errors::{MosaicError, MosaicResult};
use crate::model::MosaicJSON;

pub const BACKEND_NAME: &str = "Memory";

#[derive(Clone, Debug)]
pub struct MemoryBackend {
    mosaic: MosaicJSON,
}

impl MemoryBackend {
    /// An in-memory backend always starts from a supplied document: there is
    /// nothing to fetch.
    pub fn new(mosaic_def: Option<MosaicJSON>) -> MosaicResult<Self> {
        let mosaic = mosaic_def
            .ok_or_else(|| MosaicError::MosaicNotFound(":memory:".to_string()))?;
        mosaic.validate()?;
        Ok(Self { mosaic })
    }
}

#[async_trait]
impl MosaicBackend for MemoryBackend {
    fn input(&self) -> &str {
        ":memory:"
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

    /// Nothing to persist; reports success so shared update flows work.
    async fn write(&mut self, _overwrite: bool) -> MosaicResult<()> {
        Ok(())
    }
}
