use mosaic_tile_utils::TmsError;

#[derive(thiserror::Error, Debug)]
pub enum MosaicError {
    #[error("Invalid `{field}` in mosaic document: {reason}")]
    Validation {
        field: &'static str,
        reason: String,
    },

    #[error("Mosaic not found: {0}")]
    MosaicNotFound(String),

    #[error("Mosaic already exists: {0}, use `overwrite = true` to replace it")]
    MosaicExists(String),

    #[error("No assets found for the requested area")]
    NoAssetFound,

    #[error("Point ({0}, {1}) is outside all asset bounds")]
    PointOutsideBounds(f64, f64),

    #[error("The {0} backend is read-only")]
    ReadOnlyBackend(&'static str),

    #[error("`{0}` is not a supported backend scheme")]
    UnsupportedScheme(String),

    #[error("Invalid {kind} path: {path}")]
    InvalidPath { kind: &'static str, path: String },

    #[error("Datasets in a mosaic must share one data type, found {0:?}")]
    MultipleDataTypes(Vec<String>),

    #[error("Unable to extract a footprint from {path}: {reason}")]
    Footprint { path: String, reason: String },

    #[error("Reading asset {asset} failed: {source}")]
    AssetRead {
        asset: String,
        #[source]
        source: Box<MosaicError>,
    },

    #[error("{backend} backend request failed: {reason}")]
    Backend {
        backend: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Tms(#[from] TmsError),

    #[error("IO error on {1}: {0}")]
    Io(std::io::Error, String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Tiff(#[from] tiff::TiffError),
}

impl MosaicError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> MosaicError {
        MosaicError::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Whether this error means "the asset had no data here" rather than a
    /// hard failure. Per-asset reads failing this way are skipped during
    /// composition instead of aborting the whole query.
    #[must_use]
    pub fn is_no_data(&self) -> bool {
        match self {
            MosaicError::NoAssetFound | MosaicError::PointOutsideBounds(..) => true,
            MosaicError::AssetRead { source, .. } => source.is_no_data(),
            _ => false,
        }
    }
}

pub type MosaicResult<T> = Result<T, MosaicError>;
