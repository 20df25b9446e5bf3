use std::fmt;

use model::{StackExtent, TileSize};

/// Location of a stack viewer: top-left corner in scaled stack pixels, the
/// section index and the (possibly fractional or negative) scale level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewState {
    pub xc: f64,
    pub yc: f64,
    pub z: u32,
    pub s: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportRequest {
    pub view: ViewState,
    pub view_width: f64,
    pub view_height: f64,
    pub efficiency_threshold: f64,
}

/// Tile indices visible in a viewport plus the pixel offset and scale used
/// to place them. `top`/`left` are the screen offsets of the first tile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportWindow {
    pub first_row: i64,
    pub first_col: i64,
    pub last_row: i64,
    pub last_col: i64,
    pub top: f64,
    pub left: f64,
    pub z: u32,
    pub zoom: u8,
    pub mag: f64,
    pub effective_tile_width: f64,
    pub effective_tile_height: f64,
}

impl ViewportWindow {
    pub fn is_empty(&self) -> bool {
        self.first_row > self.last_row || self.first_col > self.last_col
    }

    pub fn contains(&self, row: i64, col: i64) -> bool {
        row >= self.first_row && row <= self.last_row && col >= self.first_col && col <= self.last_col
    }

    pub fn row_count(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        (self.last_row - self.first_row + 1) as usize
    }

    pub fn col_count(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        (self.last_col - self.first_col + 1) as usize
    }

    /// Same section and source resolution: only the pixel offset differs.
    pub fn shares_tile_set_with(&self, other: &ViewportWindow) -> bool {
        self.z == other.z && self.zoom == other.zoom
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewportMapError {
    NonFiniteValue,
    InvalidViewport,
    InvalidThreshold,
    ZeroTileSize,
}

impl fmt::Display for ViewportMapError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewportMapError::NonFiniteValue => {
                write!(formatter, "viewport location and scale must be finite")
            }
            ViewportMapError::InvalidViewport => {
                write!(formatter, "viewport width and height must be positive")
            }
            ViewportMapError::InvalidThreshold => {
                write!(formatter, "efficiency threshold must lie in [0, 1]")
            }
            ViewportMapError::ZeroTileSize => {
                write!(formatter, "tile width and height must be at least 1")
            }
        }
    }
}

impl std::error::Error for ViewportMapError {}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileIndexMapper {
    extent: StackExtent,
    tile_size: TileSize,
}

impl TileIndexMapper {
    pub fn new(extent: StackExtent, tile_size: TileSize) -> Result<Self, ViewportMapError> {
        if tile_size.width == 0 || tile_size.height == 0 {
            return Err(ViewportMapError::ZeroTileSize);
        }
        Ok(Self { extent, tile_size })
    }

    pub fn extent(&self) -> StackExtent {
        self.extent
    }

    pub fn tile_size(&self) -> TileSize {
        self.tile_size
    }

    pub fn map(&self, request: &ViewportRequest) -> Result<ViewportWindow, ViewportMapError> {
        let ViewportRequest {
            view,
            view_width,
            view_height,
            efficiency_threshold,
        } = *request;
        require_finite(&[
            view.xc,
            view.yc,
            view.s,
            view_width,
            view_height,
            efficiency_threshold,
        ])?;
        if view_width <= 0.0 || view_height <= 0.0 {
            return Err(ViewportMapError::InvalidViewport);
        }
        if !(0.0..=1.0).contains(&efficiency_threshold) {
            return Err(ViewportMapError::InvalidThreshold);
        }

        let (zoom, mag) = select_zoom_level(view.s, self.extent.max_zoom);
        let effective_tile_width = self.tile_size.width as f64 * mag;
        let effective_tile_height = self.tile_size.height as f64 * mag;

        let horizontal = AxisSpan::compute(
            view.xc,
            effective_tile_width,
            view_width,
            efficiency_threshold,
            last_tile_index(self.extent.width_at_zoom(zoom), self.tile_size.width),
        );
        let vertical = AxisSpan::compute(
            view.yc,
            effective_tile_height,
            view_height,
            efficiency_threshold,
            last_tile_index(self.extent.height_at_zoom(zoom), self.tile_size.height),
        );

        Ok(ViewportWindow {
            first_row: vertical.first,
            first_col: horizontal.first,
            last_row: vertical.last,
            last_col: horizontal.last,
            top: vertical.offset,
            left: horizontal.offset,
            z: view.z,
            zoom,
            mag,
            effective_tile_width,
            effective_tile_height,
        })
    }
}

/// Picks the source resolution for scale `s`. Fractional and negative scales
/// use the next coarser integral level and magnify its tiles client side.
pub fn select_zoom_level(s: f64, max_zoom: u8) -> (u8, f64) {
    let integral = s.fract() == 0.0 && s >= 0.0;
    let candidate = if integral { s } else { s.ceil() };
    let zoom = candidate.clamp(0.0, max_zoom as f64);
    let mag = 2f64.powf(zoom - s);
    (zoom as u8, mag)
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct AxisSpan {
    first: i64,
    last: i64,
    offset: f64,
}

impl AxisSpan {
    fn compute(
        coordinate: f64,
        effective_tile: f64,
        view_size: f64,
        efficiency_threshold: f64,
        max_index: i64,
    ) -> Self {
        // Skipping margin tiles must never leave the viewport uncovered.
        let threshold = if (2.0 * efficiency_threshold + 1.0) * effective_tile > view_size {
            0.0
        } else {
            efficiency_threshold
        };

        let mut first = (coordinate / effective_tile).floor() as i64;
        let mut offset = -coordinate.rem_euclid(effective_tile);
        if threshold > 0.0 && (effective_tile + offset) / effective_tile < threshold {
            first += 1;
            offset += effective_tile;
        }

        // The trailing tile stays when its visible fraction reaches the threshold.
        let remaining = (view_size - offset) / effective_tile;
        let count = if threshold > 0.0 {
            (remaining - threshold).floor() + 1.0
        } else {
            remaining.ceil()
        };
        let last = (first + count as i64 - 1).min(max_index);
        Self {
            first,
            last,
            offset,
        }
    }
}

fn last_tile_index(extent_at_zoom: f64, tile_size: u32) -> i64 {
    ((extent_at_zoom - 1.0) / tile_size as f64).floor() as i64
}

fn require_finite(values: &[f64]) -> Result<(), ViewportMapError> {
    if values.iter().all(|value| value.is_finite()) {
        Ok(())
    } else {
        Err(ViewportMapError::NonFiniteValue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper(width: u32, height: u32, max_zoom: u8) -> TileIndexMapper {
        TileIndexMapper::new(
            StackExtent {
                width,
                height,
                max_zoom,
            },
            TileSize::square(256),
        )
        .expect("create mapper")
    }

    fn request(xc: f64, yc: f64, s: f64, view: f64, threshold: f64) -> ViewportRequest {
        ViewportRequest {
            view: ViewState { xc, yc, z: 0, s },
            view_width: view,
            view_height: view,
            efficiency_threshold: threshold,
        }
    }

    #[test]
    fn origin_viewport_covers_two_by_two_tiles() {
        let window = mapper(4096, 4096, 4)
            .map(&request(0.0, 0.0, 0.0, 512.0, 0.0))
            .expect("map viewport");

        assert_eq!((window.first_row, window.first_col), (0, 0));
        assert_eq!((window.last_row, window.last_col), (1, 1));
        assert_eq!((window.top, window.left), (0.0, 0.0));
        assert_eq!(window.zoom, 0);
        assert_eq!(window.mag, 1.0);
    }

    #[test]
    fn threshold_that_would_empty_the_viewport_is_ignored() {
        let mapper = mapper(4096, 4096, 4);
        let without = mapper
            .map(&request(0.0, 0.0, 0.0, 512.0, 0.0))
            .expect("map without threshold");
        let with = mapper
            .map(&request(0.0, 0.0, 0.0, 512.0, 1.0))
            .expect("map with threshold");
        assert_eq!(without, with);
    }

    #[test]
    fn negative_coordinates_use_floor_and_euclidean_offset() {
        let window = mapper(4096, 4096, 4)
            .map(&request(-10.0, 0.0, 0.0, 512.0, 0.0))
            .expect("map viewport");

        assert_eq!(window.first_col, -1);
        assert_eq!(window.left, -246.0);
        assert_eq!(window.last_col, 1);
    }

    #[test]
    fn trailing_tile_at_exact_threshold_is_kept() {
        let mapper = mapper(4096, 4096, 4);
        let window = mapper
            .map(&request(0.0, 0.0, 0.0, 1088.0, 0.25))
            .expect("map viewport");
        assert_eq!((window.first_col, window.last_col), (0, 4));

        let below = mapper
            .map(&request(0.0, 0.0, 0.0, 1087.0, 0.25))
            .expect("map viewport");
        assert_eq!(below.last_col, 3);
    }

    #[test]
    fn threshold_skips_barely_visible_margin_tiles() {
        let window = mapper(4096, 4096, 4)
            .map(&request(200.0, 0.0, 0.0, 1024.0, 0.25))
            .expect("map viewport");

        assert_eq!(window.first_col, 1);
        assert_eq!(window.left, 56.0);
        assert_eq!(window.last_col, 4);
    }

    #[test]
    fn fractional_scale_magnifies_next_coarser_level() {
        let window = mapper(4096, 4096, 4)
            .map(&request(0.0, 0.0, 0.5, 512.0, 0.0))
            .expect("map viewport");

        assert_eq!(window.zoom, 1);
        assert!((window.mag - 2f64.sqrt()).abs() < 1e-12);
        assert!((window.effective_tile_width - 256.0 * 2f64.sqrt()).abs() < 1e-9);
        assert_eq!(window.last_col, 1);
    }

    #[test]
    fn negative_scale_magnifies_full_resolution_tiles() {
        assert_eq!(select_zoom_level(-1.0, 4), (0, 2.0));
        assert_eq!(select_zoom_level(-0.5, 4).0, 0);
        assert_eq!(select_zoom_level(2.0, 4), (2, 1.0));
        assert_eq!(select_zoom_level(6.0, 4), (4, 0.25));
    }

    #[test]
    fn last_indices_are_clamped_to_stack_bounds() {
        let window = mapper(300, 700, 4)
            .map(&request(0.0, 0.0, 0.0, 2048.0, 0.0))
            .expect("map viewport");

        assert_eq!(window.last_col, 1);
        assert_eq!(window.last_row, 2);

        let coarse = mapper(300, 700, 4)
            .map(&request(0.0, 0.0, 1.0, 2048.0, 0.0))
            .expect("map viewport");
        assert_eq!(coarse.last_col, 0);
        assert_eq!(coarse.last_row, 1);
    }

    #[test]
    fn viewport_beyond_stack_is_empty() {
        let window = mapper(512, 512, 1)
            .map(&request(2048.0, 0.0, 0.0, 256.0, 0.0))
            .expect("map viewport");
        assert!(window.is_empty());
        assert_eq!(window.col_count(), 0);
    }

    #[test]
    fn map_rejects_invalid_inputs() {
        let mapper = mapper(512, 512, 1);
        assert_eq!(
            mapper.map(&request(f64::NAN, 0.0, 0.0, 512.0, 0.0)),
            Err(ViewportMapError::NonFiniteValue)
        );
        assert_eq!(
            mapper.map(&request(0.0, 0.0, 0.0, 0.0, 0.0)),
            Err(ViewportMapError::InvalidViewport)
        );
        assert_eq!(
            mapper.map(&request(0.0, 0.0, 0.0, 512.0, 1.5)),
            Err(ViewportMapError::InvalidThreshold)
        );
    }
}
