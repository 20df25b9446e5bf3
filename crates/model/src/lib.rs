use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use bitvec::prelude::{BitVec, Lsb0};

mod tile_source;

pub use tile_source::{TileSource, TileUrlScheme, UrlTileSource};

pub const DEFAULT_TILE_SIZE: u32 = 256;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TileSize {
    pub width: u32,
    pub height: u32,
}

impl TileSize {
    pub const fn square(size: u32) -> Self {
        Self {
            width: size,
            height: size,
        }
    }
}

impl Default for TileSize {
    fn default() -> Self {
        Self::square(DEFAULT_TILE_SIZE)
    }
}

/// Pixel extent of a stack at full resolution plus the coarsest zoom level
/// the tile source serves.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StackExtent {
    pub width: u32,
    pub height: u32,
    pub max_zoom: u8,
}

impl StackExtent {
    pub fn width_at_zoom(&self, zoom: u8) -> f64 {
        self.width as f64 / zoom_factor(zoom)
    }

    pub fn height_at_zoom(&self, zoom: u8) -> f64 {
        self.height as f64 / zoom_factor(zoom)
    }
}

pub fn zoom_factor(zoom: u8) -> f64 {
    2f64.powi(zoom as i32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackGeometryError {
    ZeroDimension,
    ZeroTileSize,
    SectionOutOfBounds { section: u32, depth: u32 },
}

impl fmt::Display for StackGeometryError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackGeometryError::ZeroDimension => {
                write!(formatter, "stack width, height and depth must be at least 1")
            }
            StackGeometryError::ZeroTileSize => {
                write!(formatter, "tile width and height must be at least 1")
            }
            StackGeometryError::SectionOutOfBounds { section, depth } => {
                write!(
                    formatter,
                    "section {section} is out of bounds for stack depth {depth}"
                )
            }
        }
    }
}

impl std::error::Error for StackGeometryError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackGeometry {
    extent: StackExtent,
    depth: u32,
    tile_size: TileSize,
    // broken_sections.len() == depth
    broken_sections: BitVec<usize, Lsb0>,
}

impl StackGeometry {
    pub fn new(
        extent: StackExtent,
        depth: u32,
        tile_size: TileSize,
    ) -> Result<Self, StackGeometryError> {
        if extent.width == 0 || extent.height == 0 || depth == 0 {
            return Err(StackGeometryError::ZeroDimension);
        }
        if tile_size.width == 0 || tile_size.height == 0 {
            return Err(StackGeometryError::ZeroTileSize);
        }
        Ok(Self {
            extent,
            depth,
            tile_size,
            broken_sections: BitVec::repeat(false, depth as usize),
        })
    }

    pub fn extent(&self) -> StackExtent {
        self.extent
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn tile_size(&self) -> TileSize {
        self.tile_size
    }

    pub fn mark_section_broken(&mut self, section: u32) -> Result<(), StackGeometryError> {
        if section >= self.depth {
            return Err(StackGeometryError::SectionOutOfBounds {
                section,
                depth: self.depth,
            });
        }
        self.broken_sections.set(section as usize, true);
        Ok(())
    }

    /// Sections outside the stack count as broken: there is nothing to show.
    pub fn is_section_broken(&self, section: u32) -> bool {
        self.broken_sections
            .get(section as usize)
            .map(|bit| *bit)
            .unwrap_or(true)
    }

    pub fn broken_section_count(&self) -> usize {
        self.broken_sections.count_ones()
    }
}

/// Opaque key naming the pixel content of one tile. Conceptually a URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileIdentifier(Arc<str>);

impl TileIdentifier {
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TileIdentifier {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl From<&str> for TileIdentifier {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TileIdentifier {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl Borrow<str> for TileIdentifier {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TileCoord {
    pub section: u32,
    pub col: u32,
    pub row: u32,
    pub zoom: u8,
}
