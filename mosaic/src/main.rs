use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use geojson::{Feature, GeoJson};
use log::error;
use mosaic_core::footprint::get_footprints;
use mosaic_core::tile_utils::Tms;
use mosaic_core::{
    mosaic_backend, mosaic_backend_for_write, property_accessor, GeoTiffFootprints, MosaicError,
    MosaicJSON, MosaicOptions, MosaicResult, UpdateOptions,
};

#[derive(Parser, Debug)]
#[command(
    version,
    name = "mosaic",
    about = "Create, inspect and update MosaicJSON documents"
)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a mosaic definition from a list of raster files
    Create {
        /// Raster files to index
        #[arg(required = true)]
        files: Vec<String>,
        /// Write the document to this URI instead of stdout
        #[arg(short, long)]
        output: Option<String>,
        /// Overwrite the minimum zoom derived from the rasters
        #[arg(long)]
        minzoom: Option<u8>,
        /// Overwrite the maximum zoom derived from the rasters
        #[arg(long)]
        maxzoom: Option<u8>,
        /// Overwrite the quadkey zoom used for index keys
        #[arg(long)]
        quadkey_zoom: Option<u8>,
        /// Minimum tile-cover fraction to keep an asset in a cell
        #[arg(long)]
        min_tile_cover: Option<f64>,
        /// Sort assets per cell by covering fraction
        #[arg(long, default_value_t = false)]
        tile_cover_sort: bool,
        /// Concurrent footprint reads
        #[arg(long)]
        threads: Option<usize>,
        /// Tile matrix set: web-mercator (default) or geographic
        #[arg(long)]
        tms: Option<String>,
        /// Suppress non-error output
        #[arg(short, long, default_value_t = false)]
        quiet: bool,
    },
    /// Create a mosaic definition from GeoJSON features
    CreateFromFeatures {
        /// GeoJSON file holding the features ("-" for stdin)
        features: PathBuf,
        #[arg(short, long)]
        output: Option<String>,
        #[arg(long)]
        minzoom: u8,
        #[arg(long)]
        maxzoom: u8,
        /// Feature property holding the asset identifier
        #[arg(long)]
        property: String,
        #[arg(long)]
        quadkey_zoom: Option<u8>,
        #[arg(long)]
        min_tile_cover: Option<f64>,
        #[arg(long, default_value_t = false)]
        tile_cover_sort: bool,
        #[arg(short, long, default_value_t = false)]
        quiet: bool,
    },
    /// Print raster footprints as a GeoJSON feature collection
    Footprint {
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Print a mosaic's metadata
    Info {
        /// Mosaic URI
        input: String,
        /// Include the list of indexed quadkeys
        #[arg(long, default_value_t = false)]
        quadkeys: bool,
    },
    /// Print the indexed cells as a GeoJSON feature collection
    ToGeojson {
        /// Mosaic URI
        input: String,
    },
    /// Merge new raster files into an existing mosaic
    Update {
        /// Mosaic URI
        input: String,
        /// Raster files to merge in
        #[arg(required = true)]
        files: Vec<String>,
        /// Merge new assets ahead of existing ones (default)
        #[arg(long, conflicts_with = "add_last")]
        add_first: bool,
        /// Merge new assets after existing ones
        #[arg(long)]
        add_last: bool,
        #[arg(short, long, default_value_t = false)]
        quiet: bool,
    },
    /// Upload a mosaic definition file to a backend
    Upload {
        /// Mosaic JSON file to read ("-" for stdin)
        src: PathBuf,
        /// Destination URI
        dst: String,
        /// Replace an existing mosaic at the destination
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
}

fn parse_tms(name: Option<&str>) -> MosaicResult<Tms> {
    match name {
        None => Ok(Tms::web_mercator_quad()),
        Some(name) => match name.to_ascii_lowercase().as_str() {
            "webmercatorquad" | "web-mercator" => Ok(Tms::web_mercator_quad()),
            "geographicquad" | "geographic" => Ok(Tms::geographic_quad()),
            other => Err(MosaicError::Validation {
                field: "tms",
                reason: format!("unknown tile matrix set `{other}`"),
            }),
        },
    }
}

fn read_features(path: &PathBuf) -> MosaicResult<Vec<Feature>> {
    let io_err = |e| MosaicError::Io(e, path.display().to_string());
    let body = if path.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin()).map_err(io_err)?
    } else {
        std::fs::read_to_string(path).map_err(io_err)?
    };
    let geojson: GeoJson = body.parse().map_err(|e: geojson::Error| {
        MosaicError::Validation {
            field: "features",
            reason: e.to_string(),
        }
    })?;
    match geojson {
        GeoJson::FeatureCollection(fc) => Ok(fc.features),
        GeoJson::Feature(feature) => Ok(vec![feature]),
        GeoJson::Geometry(_) => Err(MosaicError::Validation {
            field: "features",
            reason: "expected a feature or feature collection".to_string(),
        }),
    }
}

async fn emit_or_write(
    mosaic: MosaicJSON,
    output: Option<String>,
    overwrite: bool,
) -> MosaicResult<()> {
    match output {
        Some(uri) => {
            let mut backend = mosaic_backend_for_write(Some(&uri), mosaic).await?;
            backend.write(overwrite).await
        }
        None => {
            println!("{}", serde_json::to_string(&mosaic)?);
            Ok(())
        }
    }
}

async fn main_int(args: Args) -> MosaicResult<()> {
    match args.command {
        Commands::Create {
            files,
            output,
            minzoom,
            maxzoom,
            quadkey_zoom,
            min_tile_cover,
            tile_cover_sort,
            threads,
            tms,
            quiet,
        } => {
            if let Some(threads) = threads {
                std::env::set_var("MAX_THREADS", threads.to_string());
            }
            let options = MosaicOptions {
                quadkey_zoom,
                tms: parse_tms(tms.as_deref())?,
                min_tile_cover,
                tile_cover_sort,
                quiet,
                ..MosaicOptions::default()
            };
            let source = GeoTiffFootprints::default();
            let mosaic =
                MosaicJSON::from_urls(&files, &source, minzoom, maxzoom, &options).await?;
            emit_or_write(mosaic, output, true).await
        }
        Commands::CreateFromFeatures {
            features,
            output,
            minzoom,
            maxzoom,
            property,
            quadkey_zoom,
            min_tile_cover,
            tile_cover_sort,
            quiet,
        } => {
            let features = read_features(&features)?;
            let options = MosaicOptions {
                quadkey_zoom,
                accessor: property_accessor(property),
                min_tile_cover,
                tile_cover_sort,
                quiet,
                ..MosaicOptions::default()
            };
            let mosaic = MosaicJSON::from_features(&features, minzoom, maxzoom, &options)?;
            emit_or_write(mosaic, output, true).await
        }
        Commands::Footprint { files } => {
            let source = GeoTiffFootprints::default();
            let features = get_footprints(&files, &source, true).await;
            let collection = geojson::FeatureCollection {
                bbox: None,
                features,
                foreign_members: None,
            };
            println!("{}", serde_json::to_string(&collection)?);
            Ok(())
        }
        Commands::Info { input, quadkeys } => {
            let backend = mosaic_backend(Some(&input)).await?;
            let info = backend.info(quadkeys).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
        Commands::ToGeojson { input } => {
            let backend = mosaic_backend(Some(&input)).await?;
            let collection = backend.mosaic_def().to_geojson()?;
            println!("{}", serde_json::to_string(&collection)?);
            Ok(())
        }
        Commands::Update {
            input,
            files,
            add_first: _,
            add_last,
            quiet,
        } => {
            let mut backend = mosaic_backend(Some(&input)).await?;
            let source = GeoTiffFootprints::default();
            let features = get_footprints(&files, &source, quiet).await;
            if features.is_empty() {
                return Err(MosaicError::Validation {
                    field: "urls",
                    reason: "no footprint could be read from the given files".to_string(),
                });
            }
            let options = UpdateOptions {
                add_first: !add_last,
                quiet,
                ..UpdateOptions::default()
            };
            backend.update(&features, &options).await
        }
        Commands::Upload { src, dst, overwrite } => {
            let io_err = |e| MosaicError::Io(e, src.display().to_string());
            let body = if src.as_os_str() == "-" {
                std::io::read_to_string(std::io::stdin()).map_err(io_err)?
            } else {
                std::fs::read_to_string(&src).map_err(io_err)?
            };
            let mosaic: MosaicJSON = serde_json::from_str(&body)?;
            let mut backend = mosaic_backend_for_write(Some(&dst), mosaic).await?;
            backend.write(overwrite).await
        }
    }
}

/// 0 OK, 1 user error, 2 I/O error, 3 not found, 4 already exists.
fn exit_code(error: &MosaicError) -> u8 {
    match error {
        MosaicError::MosaicNotFound(_) | MosaicError::NoAssetFound => 3,
        MosaicError::MosaicExists(_) => 4,
        MosaicError::Io(..)
        | MosaicError::Http(_)
        | MosaicError::ObjectStore(_)
        | MosaicError::Sqlx(_)
        | MosaicError::Backend { .. } => 2,
        _ => 1,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    match main_int(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::from(exit_code(&err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_create() {
        let args = Args::try_parse_from([
            "mosaic",
            "create",
            "a.tif",
            "b.tif",
            "--minzoom",
            "7",
            "--maxzoom",
            "12",
            "--min-tile-cover",
            "0.5",
            "--tile-cover-sort",
            "-o",
            "out.json.gz",
        ])
        .unwrap();
        match args.command {
            Commands::Create {
                files,
                output,
                minzoom,
                min_tile_cover,
                tile_cover_sort,
                ..
            } => {
                assert_eq!(files, vec!["a.tif".to_string(), "b.tif".to_string()]);
                assert_eq!(output.as_deref(), Some("out.json.gz"));
                assert_eq!(minzoom, Some(7));
                assert_eq!(min_tile_cover, Some(0.5));
                assert!(tile_cover_sort);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn cli_parses_update_add_last() {
        let args =
            Args::try_parse_from(["mosaic", "update", "m.json", "new.tif", "--add-last"]).unwrap();
        match args.command {
            Commands::Update { add_last, .. } => assert!(add_last),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn unknown_tms_is_a_user_error() {
        let err = parse_tms(Some("MartianQuad")).unwrap_err();
        assert_eq!(exit_code(&err), 1);
    }

    #[test]
    fn exit_codes_map_the_taxonomy() {
        assert_eq!(exit_code(&MosaicError::MosaicNotFound("x".into())), 3);
        assert_eq!(exit_code(&MosaicError::MosaicExists("x".into())), 4);
        assert_eq!(
            exit_code(&MosaicError::Backend {
                backend: "S3",
                reason: "denied".into()
            }),
            2
        );
    }
}
