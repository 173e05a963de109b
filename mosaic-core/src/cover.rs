//! Tile-cover kernel: which indexing-level cells does a footprint touch,
//! and how much of each cell does it cover.

use std::collections::BTreeMap;

use geo::{Area, BooleanOps, BoundingRect, Coord, Intersects, MapCoords, Translate};
use geo_types::{Geometry, MultiPolygon, Polygon, Rect};
use mosaic_tile_utils::{Bounds, TileCoord, Tms};

use crate::errors::{MosaicError, MosaicResult};

/// Nudge applied to footprint extrema so bounds sitting exactly on a tile
/// edge do not pull in the neighbouring row/column of cells.
const EXTREMA_EPSILON: f64 = 1.0e-10;

/// A cell touched by a footprint, with the covered fraction of its area.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CoveredTile {
    pub tile: TileCoord,
    /// Fraction of the cell area covered, in `[0, 1]`. Zero for degenerate
    /// (point/line) footprints, which carry no area.
    pub coverage: f64,
}

#[derive(Clone, Debug, Default)]
pub struct CoverOptions {
    /// Cells covered less than this fraction are dropped. Must be in `(0, 1]`.
    pub min_tile_cover: Option<f64>,
    /// Emit cells in descending-coverage order instead of row-major.
    pub tile_cover_sort: bool,
}

/// Reject thresholds outside `(0, 1]` before any work is done.
pub fn check_min_tile_cover(min_tile_cover: Option<f64>) -> MosaicResult<()> {
    if let Some(cover) = min_tile_cover {
        if !(cover > 0.0 && cover <= 1.0) {
            return Err(MosaicError::validation(
                "min_tile_cover",
                "must be <= 1 and > 0",
            ));
        }
    }
    Ok(())
}

/// Compute the indexing-level cells intersecting `geometry` (WGS-84) under
/// `tms`, with per-cell coverage fractions.
///
/// Cells a footprint merely touches on their boundary are not emitted; the
/// intersection must reach the cell interior.
pub fn tile_cover(
    geometry: &Geometry<f64>,
    tms: &Tms,
    zoom: u8,
    options: &CoverOptions,
) -> MosaicResult<Vec<CoveredTile>> {
    check_min_tile_cover(options.min_tile_cover)?;

    let mut cells: BTreeMap<(u32, u32), f64> = BTreeMap::new();
    for part in split_antimeridian(geometry) {
        cover_part(&part, tms, zoom, &mut cells);
    }

    let mut covered: Vec<CoveredTile> = cells
        .into_iter()
        .map(|((y, x), coverage)| CoveredTile {
            tile: TileCoord::new(zoom, x, y),
            coverage,
        })
        .filter(|c| match options.min_tile_cover {
            Some(min) => c.coverage >= min,
            None => true,
        })
        .collect();

    if options.tile_cover_sort {
        covered.sort_by(|a, b| b.coverage.total_cmp(&a.coverage));
    }
    Ok(covered)
}

fn cover_part(part: &Geometry<f64>, tms: &Tms, zoom: u8, cells: &mut BTreeMap<(u32, u32), f64>) {
    let Some(rect) = part.bounding_rect() else {
        return;
    };
    // degenerate extents (points, axis-aligned lines) keep their exact bbox
    let (west, east) = if rect.width() > 2.0 * EXTREMA_EPSILON {
        (rect.min().x + EXTREMA_EPSILON, rect.max().x - EXTREMA_EPSILON)
    } else {
        (rect.min().x, rect.max().x)
    };
    let (south, north) = if rect.height() > 2.0 * EXTREMA_EPSILON {
        (rect.min().y + EXTREMA_EPSILON, rect.max().y - EXTREMA_EPSILON)
    } else {
        (rect.min().y, rect.max().y)
    };
    let extrema = Bounds::new(west, south, east, north);
    let clipped = extrema.intersection(&tms.bbox());
    if !clipped.is_valid() {
        return;
    }

    let part_xy = part.map_coords(|Coord { x, y }| {
        let (px, py) = tms.xy(x, y);
        Coord { x: px, y: py }
    });
    let part_polygons = to_multi_polygon(&part_xy);

    let ul = tms.tile(clipped.west, clipped.north, zoom);
    let lr = tms.tile(clipped.east, clipped.south, zoom);
    for y in ul.y..=lr.y {
        for x in ul.x..=lr.x {
            let tile = TileCoord::new(zoom, x, y);
            let [left, bottom, right, top] = tms.xy_bounds(&tile);
            let cell = Rect::new(Coord { x: left, y: bottom }, Coord { x: right, y: top });

            let coverage = match &part_polygons {
                Some(polygons) => {
                    let cell_polygon = MultiPolygon::new(vec![cell.to_polygon()]);
                    let intersection = polygons.intersection(&cell_polygon);
                    intersection.unsigned_area() / cell.unsigned_area()
                }
                // degenerate input: count interior intersection, coverage 0
                None => {
                    if intersects_interior(&part_xy, &cell) {
                        0.0
                    } else {
                        continue;
                    }
                }
            };
            if part_polygons.is_some() && coverage <= 0.0 {
                continue;
            }
            let entry = cells.entry((y, x)).or_insert(0.0);
            *entry = entry.max(coverage);
        }
    }
}

/// Areal representation of the geometry, or `None` for point/line inputs.
fn to_multi_polygon(geometry: &Geometry<f64>) -> Option<MultiPolygon<f64>> {
    let polygons = match geometry {
        Geometry::Polygon(p) => MultiPolygon::new(vec![p.clone()]),
        Geometry::MultiPolygon(mp) => mp.clone(),
        Geometry::Rect(r) => MultiPolygon::new(vec![r.to_polygon()]),
        Geometry::GeometryCollection(gc) => MultiPolygon::new(
            gc.iter()
                .filter_map(to_multi_polygon)
                .flat_map(|mp| mp.0)
                .collect(),
        ),
        _ => return None,
    };
    (polygons.unsigned_area() > 0.0).then_some(polygons)
}

/// Boundary-exclusive intersection test for degenerate inputs: the geometry
/// must reach the (slightly shrunk) cell interior, a single boundary touch
/// does not count.
fn intersects_interior(geometry: &Geometry<f64>, cell: &Rect<f64>) -> bool {
    let shrink = (cell.width().min(cell.height())) * 1.0e-9;
    let interior = Rect::new(
        Coord {
            x: cell.min().x + shrink,
            y: cell.min().y + shrink,
        },
        Coord {
            x: cell.max().x - shrink,
            y: cell.max().y - shrink,
        },
    );
    geometry.intersects(&Geometry::Polygon(interior.to_polygon()))
}

/// Split a geometry crossing the ±180° line into in-range parts.
///
/// Handles the common 0..360-style encoding where coordinates run past
/// +180 (or below -180); parts are clipped to the world extent after
/// shifting by one revolution.
fn split_antimeridian(geometry: &Geometry<f64>) -> Vec<Geometry<f64>> {
    let Some(rect) = geometry.bounding_rect() else {
        return vec![geometry.clone()];
    };
    if rect.min().x >= -180.0 && rect.max().x <= 180.0 {
        return vec![geometry.clone()];
    }
    let Some(polygons) = to_multi_polygon(geometry) else {
        return vec![geometry.clone()];
    };

    let world = world_polygon();
    let mut parts = Vec::new();
    let in_range = polygons.intersection(&world);
    if in_range.unsigned_area() > 0.0 {
        parts.push(Geometry::MultiPolygon(in_range));
    }
    if rect.max().x > 180.0 {
        let shifted = polygons.translate(-360.0, 0.0).intersection(&world);
        if shifted.unsigned_area() > 0.0 {
            parts.push(Geometry::MultiPolygon(shifted));
        }
    }
    if rect.min().x < -180.0 {
        let shifted = polygons.translate(360.0, 0.0).intersection(&world);
        if shifted.unsigned_area() > 0.0 {
            parts.push(Geometry::MultiPolygon(shifted));
        }
    }
    parts
}

fn world_polygon() -> MultiPolygon<f64> {
    MultiPolygon::new(vec![Rect::new(
        Coord { x: -180.0, y: -90.0 },
        Coord { x: 180.0, y: 90.0 },
    )
    .to_polygon()])
}

/// Build a closed rectangular polygon from geographic bounds.
#[must_use]
pub fn bounds_polygon(bounds: &Bounds) -> Polygon<f64> {
    Rect::new(
        Coord {
            x: bounds.west,
            y: bounds.south,
        },
        Coord {
            x: bounds.east,
            y: bounds.north,
        },
    )
    .to_polygon()
}
