//! Messages between tile grids and the presenting surface.
//!
//! Grids describe where each visible tile texture lands on screen; the
//! surface owns the actual drawing.

use model::TileIdentifier;

slotmap::new_key_type! {
    /// Registration handle of one grid within a render context.
    pub struct GridHandle;
}

/// Screen placement of one tile texture, in viewport pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePlacement {
    pub identifier: TileIdentifier,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    /// Texture rows and columns are swapped relative to screen axes.
    pub transposed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerFrame {
    pub grid: GridHandle,
    pub opacity: f32,
    pub placements: Vec<TilePlacement>,
}

impl LayerFrame {
    pub fn empty(grid: GridHandle, opacity: f32) -> Self {
        Self {
            grid,
            opacity,
            placements: Vec::new(),
        }
    }
}

/// Layers in registration order, bottom first.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameComposition {
    pub frame_id: u64,
    pub layers: Vec<LayerFrame>,
}

impl FrameComposition {
    pub fn placement_count(&self) -> usize {
        self.layers.iter().map(|layer| layer.placements.len()).sum()
    }
}

/// Drawing backend driven by the render context.
pub trait TileSurface {
    fn present(&mut self, composition: &FrameComposition);

    /// Textures the cache evicted; the surface drops anything it holds for them.
    fn release_textures(&mut self, _identifiers: &[TileIdentifier]) {}
}
