//! Pixel reads across a mosaic: fan a query out to the assets covering it
//! and compose the per-asset results with a pixel-selection policy.
//!
//! The raster reader itself is an external collaborator; this module only
//! drives it per asset and merges what comes back.

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::str::FromStr;

use async_trait::async_trait;
use futures::future::join_all;
use geojson::Feature;
use log::warn;
use mosaic_tile_utils::{Bounds, TileCoord};

use crate::errors::{MosaicError, MosaicResult};

/// A decoded raster window: band-major samples plus a validity mask.
#[derive(Clone, Debug, PartialEq)]
pub struct RasterTile {
    pub width: u32,
    pub height: u32,
    pub bands: u32,
    /// `bands * height * width` samples, band-major.
    pub data: Vec<f64>,
    /// `height * width` entries, `true` where the pixel holds data.
    pub mask: Vec<bool>,
}

impl RasterTile {
    /// An all-masked canvas.
    #[must_use]
    pub fn empty(bands: u32, width: u32, height: u32) -> RasterTile {
        let pixels = (width * height) as usize;
        RasterTile {
            width,
            height,
            bands,
            data: vec![0.0; bands as usize * pixels],
            mask: vec![false; pixels],
        }
    }

    #[must_use]
    pub fn pixel_count(&self) -> usize {
        (self.width * self.height) as usize
    }

    #[must_use]
    pub fn sample(&self, band: u32, pixel: usize) -> f64 {
        self.data[band as usize * self.pixel_count() + pixel]
    }

    fn set_sample(&mut self, band: u32, pixel: usize, value: f64) {
        let count = self.pixel_count();
        self.data[band as usize * count + pixel] = value;
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.mask.iter().all(|&m| m)
    }
}

/// How overlapping asset samples combine into one output pixel.
///
/// Ties (equal samples, equal luminance) resolve to the earlier asset in
/// list order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelSelection {
    #[default]
    First,
    Last,
    Highest,
    Lowest,
    Mean,
    Median,
    Stdev,
    Darkest,
    Brightest,
}

impl Display for PixelSelection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PixelSelection::First => "first",
            PixelSelection::Last => "last",
            PixelSelection::Highest => "highest",
            PixelSelection::Lowest => "lowest",
            PixelSelection::Mean => "mean",
            PixelSelection::Median => "median",
            PixelSelection::Stdev => "stdev",
            PixelSelection::Darkest => "darkest",
            PixelSelection::Brightest => "brightest",
        };
        f.write_str(name)
    }
}

impl FromStr for PixelSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "first" => Ok(PixelSelection::First),
            "last" => Ok(PixelSelection::Last),
            "highest" => Ok(PixelSelection::Highest),
            "lowest" => Ok(PixelSelection::Lowest),
            "mean" => Ok(PixelSelection::Mean),
            "median" => Ok(PixelSelection::Median),
            "stdev" => Ok(PixelSelection::Stdev),
            "darkest" => Ok(PixelSelection::Darkest),
            "brightest" => Ok(PixelSelection::Brightest),
            other => Err(format!("unknown pixel selection `{other}`")),
        }
    }
}

/// Options for the mosaic read operations.
#[derive(Clone, Debug)]
pub struct ReaderOptions {
    /// Concurrent per-asset reads. Defaults to `MAX_THREADS` (10).
    pub threads: usize,
    pub pixel_selection: PixelSelection,
    /// Read the asset list bottom-first.
    pub reverse: bool,
    pub tilesize: u32,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions {
            threads: crate::max_threads(),
            pixel_selection: PixelSelection::default(),
            reverse: false,
            tilesize: 256,
        }
    }
}

/// The raster-reading collaborator: fetches pixels for one asset URI.
#[async_trait]
pub trait RasterReader: Send + Sync {
    async fn tile(&self, asset: &str, tile: TileCoord, tilesize: u32) -> MosaicResult<RasterTile>;

    async fn point(&self, asset: &str, lng: f64, lat: f64) -> MosaicResult<Vec<f64>>;

    async fn part(
        &self,
        asset: &str,
        bounds: Bounds,
        width: u32,
        height: u32,
    ) -> MosaicResult<RasterTile>;

    async fn feature(
        &self,
        asset: &str,
        feature: &Feature,
        width: u32,
        height: u32,
    ) -> MosaicResult<RasterTile>;
}

/// Per-asset values returned by [`mosaic_point`].
#[derive(Clone, Debug, PartialEq)]
pub struct PointValues {
    pub asset: String,
    pub values: Vec<f64>,
}

/// Read one tile from every covering asset and compose the result.
pub async fn mosaic_tile(
    reader: &dyn RasterReader,
    assets: &[String],
    tile: TileCoord,
    options: &ReaderOptions,
) -> MosaicResult<(RasterTile, Vec<String>)> {
    compose(assets, options, |asset| async move {
        reader.tile(&asset, tile, options.tilesize).await
    })
    .await
}

/// Read a bbox window from every covering asset and compose the result.
pub async fn mosaic_part(
    reader: &dyn RasterReader,
    assets: &[String],
    bounds: Bounds,
    width: u32,
    height: u32,
    options: &ReaderOptions,
) -> MosaicResult<(RasterTile, Vec<String>)> {
    compose(assets, options, |asset| async move {
        reader.part(&asset, bounds, width, height).await
    })
    .await
}

/// Read a feature-shaped window from every covering asset and compose.
pub async fn mosaic_feature(
    reader: &dyn RasterReader,
    assets: &[String],
    feature: &Feature,
    width: u32,
    height: u32,
    options: &ReaderOptions,
) -> MosaicResult<(RasterTile, Vec<String>)> {
    compose(assets, options, |asset| async move {
        reader.feature(&asset, feature, width, height).await
    })
    .await
}

/// Read point values from every covering asset.
///
/// Assets for which the point falls outside the raster are omitted; when
/// every asset fails that way the whole query is outside bounds.
pub async fn mosaic_point(
    reader: &dyn RasterReader,
    assets: &[String],
    lng: f64,
    lat: f64,
    options: &ReaderOptions,
) -> MosaicResult<Vec<PointValues>> {
    if assets.is_empty() {
        return Err(MosaicError::NoAssetFound);
    }
    let ordered = ordered_assets(assets, options.reverse);

    let mut values = Vec::new();
    let mut skipped = 0usize;
    for chunk in ordered.chunks(options.threads.max(1)) {
        let reads = chunk.iter().map(|asset| async move {
            (asset.clone(), reader.point(asset, lng, lat).await)
        });
        for (asset, result) in join_all(reads).await {
            match result {
                Ok(samples) => values.push(PointValues {
                    asset,
                    values: samples,
                }),
                Err(err) if err.is_no_data() => skipped += 1,
                Err(err) => {
                    return Err(MosaicError::AssetRead {
                        asset,
                        source: Box::new(err),
                    });
                }
            }
        }
    }
    if values.is_empty() && skipped > 0 {
        return Err(MosaicError::PointOutsideBounds(lng, lat));
    }
    Ok(values)
}

fn ordered_assets(assets: &[String], reverse: bool) -> Vec<String> {
    if reverse {
        assets.iter().rev().cloned().collect()
    } else {
        assets.to_vec()
    }
}

async fn compose<F, Fut>(
    assets: &[String],
    options: &ReaderOptions,
    read: F,
) -> MosaicResult<(RasterTile, Vec<String>)>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = MosaicResult<RasterTile>>,
{
    if assets.is_empty() {
        return Err(MosaicError::NoAssetFound);
    }
    let ordered = ordered_assets(assets, options.reverse);

    // per-asset reads run `threads` at a time; with the `first` policy the
    // fan-out stops as soon as the canvas is full
    let mut contributions: Vec<(String, RasterTile)> = Vec::new();
    let mut dims: Option<(u32, u32, u32)> = None;
    'chunks: for chunk in ordered.chunks(options.threads.max(1)) {
        let reads = chunk
            .iter()
            .map(|asset| {
                let fut = read(asset.clone());
                async move { (asset.clone(), fut.await) }
            })
            .collect::<Vec<_>>();
        for (asset, result) in join_all(reads).await {
            match result {
                Ok(tile) => {
                    let tile_dims = (tile.bands, tile.width, tile.height);
                    match dims {
                        None => dims = Some(tile_dims),
                        Some(expected) if expected != tile_dims => {
                            warn!("asset {asset} returned mismatched dimensions, skipped");
                            continue;
                        }
                        Some(_) => {}
                    }
                    contributions.push((asset, tile));
                }
                Err(err) if err.is_no_data() => {}
                Err(err) => {
                    return Err(MosaicError::AssetRead {
                        asset,
                        source: Box::new(err),
                    });
                }
            }
        }
        if options.pixel_selection == PixelSelection::First {
            if let Some(first_complete) = first_policy_complete(&contributions) {
                if first_complete {
                    break 'chunks;
                }
            }
        }
    }

    if contributions.is_empty() {
        return Err(MosaicError::NoAssetFound);
    }
    Ok(select_pixels(&contributions, options.pixel_selection))
}

/// Whether the `first` composition is already saturated by the collected
/// contributions. `None` until at least one tile arrived.
fn first_policy_complete(contributions: &[(String, RasterTile)]) -> Option<bool> {
    let (_, first) = contributions.first()?;
    let mut filled = vec![false; first.pixel_count()];
    for (_, tile) in contributions {
        for (pixel, valid) in tile.mask.iter().enumerate() {
            if *valid {
                filled[pixel] = true;
            }
        }
    }
    Some(filled.iter().all(|&f| f))
}

fn select_pixels(
    contributions: &[(String, RasterTile)],
    selection: PixelSelection,
) -> (RasterTile, Vec<String>) {
    let (_, template) = &contributions[0];
    let (bands, width, height) = (template.bands, template.width, template.height);
    let mut canvas = RasterTile::empty(bands, width, height);
    let mut used = vec![false; contributions.len()];

    for pixel in 0..canvas.pixel_count() {
        // candidate indexes holding data for this pixel, in asset order
        let holders: Vec<usize> = contributions
            .iter()
            .enumerate()
            .filter(|(_, (_, tile))| tile.mask[pixel])
            .map(|(i, _)| i)
            .collect();
        if holders.is_empty() {
            continue;
        }
        canvas.mask[pixel] = true;

        match selection {
            PixelSelection::First => {
                let i = holders[0];
                used[i] = true;
                for band in 0..bands {
                    canvas.set_sample(band, pixel, contributions[i].1.sample(band, pixel));
                }
            }
            PixelSelection::Last => {
                let i = *holders.last().unwrap();
                used[i] = true;
                for band in 0..bands {
                    canvas.set_sample(band, pixel, contributions[i].1.sample(band, pixel));
                }
            }
            PixelSelection::Highest | PixelSelection::Lowest => {
                for band in 0..bands {
                    let mut best = holders[0];
                    for &i in &holders[1..] {
                        let value = contributions[i].1.sample(band, pixel);
                        let current = contributions[best].1.sample(band, pixel);
                        let better = if selection == PixelSelection::Highest {
                            value > current
                        } else {
                            value < current
                        };
                        if better {
                            best = i;
                        }
                    }
                    used[best] = true;
                    canvas.set_sample(band, pixel, contributions[best].1.sample(band, pixel));
                }
            }
            PixelSelection::Mean | PixelSelection::Median | PixelSelection::Stdev => {
                for &i in &holders {
                    used[i] = true;
                }
                for band in 0..bands {
                    let mut samples: Vec<f64> = holders
                        .iter()
                        .map(|&i| contributions[i].1.sample(band, pixel))
                        .collect();
                    let value = match selection {
                        PixelSelection::Mean => {
                            samples.iter().sum::<f64>() / samples.len() as f64
                        }
                        PixelSelection::Median => {
                            samples.sort_by(f64::total_cmp);
                            let mid = samples.len() / 2;
                            if samples.len() % 2 == 1 {
                                samples[mid]
                            } else {
                                (samples[mid - 1] + samples[mid]) / 2.0
                            }
                        }
                        PixelSelection::Stdev => {
                            let mean = samples.iter().sum::<f64>() / samples.len() as f64;
                            let variance = samples
                                .iter()
                                .map(|s| (s - mean).powi(2))
                                .sum::<f64>()
                                / samples.len() as f64;
                            variance.sqrt()
                        }
                        _ => unreachable!(),
                    };
                    canvas.set_sample(band, pixel, value);
                }
            }
            PixelSelection::Darkest | PixelSelection::Brightest => {
                // luminance across bands decides which asset supplies the pixel
                let mut best = holders[0];
                let mut best_luminance = luminance(&contributions[best].1, pixel);
                for &i in &holders[1..] {
                    let lum = luminance(&contributions[i].1, pixel);
                    let better = if selection == PixelSelection::Darkest {
                        lum < best_luminance
                    } else {
                        lum > best_luminance
                    };
                    if better {
                        best = i;
                        best_luminance = lum;
                    }
                }
                used[best] = true;
                for band in 0..bands {
                    canvas.set_sample(band, pixel, contributions[best].1.sample(band, pixel));
                }
            }
        }
    }

    let assets_used = contributions
        .iter()
        .zip(&used)
        .filter(|(_, &u)| u)
        .map(|((asset, _), _)| asset.clone())
        .collect();
    (canvas, assets_used)
}

fn luminance(tile: &RasterTile, pixel: usize) -> f64 {
    (0..tile.bands).map(|b| tile.sample(b, pixel)).sum::<f64>() / f64::from(tile.bands)
}
