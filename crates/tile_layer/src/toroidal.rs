use model::{TileCoord, TileIdentifier, TileSize, TileSource};
use render_protocol::TilePlacement;
use tiles::{TextureCache, TileFetcher};
use view::ViewportWindow;

/// One grid cell. Panning replaces a slot's content, never the slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileSlot {
    pub identifier: Option<TileIdentifier>,
    pub visible: bool,
    /// The slot holds a cache reference on `identifier`.
    pub bound: bool,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub transposed: bool,
}

impl TileSlot {
    pub fn is_drawable(&self) -> bool {
        self.visible && self.bound
    }

    pub fn placement(&self) -> Option<TilePlacement> {
        if !self.is_drawable() {
            return None;
        }
        let identifier = self.identifier.clone()?;
        Some(TilePlacement {
            identifier,
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            transposed: self.transposed,
        })
    }
}

/// Slots needed to cover a viewport with one tile of margin per axis.
pub fn grid_dimensions(view_width: u32, view_height: u32, tile_size: TileSize) -> (usize, usize) {
    if tile_size.width == 0 || tile_size.height == 0 {
        panic!("grid dimensions need a non-zero tile size");
    }
    let rows = (view_height / tile_size.height) as usize + 2;
    let cols = (view_width / tile_size.width) as usize + 2;
    (rows, cols)
}

/// Rounds a tile span to whole pixels. The size grows by one when rounding
/// would leave a gap before the next tile's rounded start.
pub fn snap_span(start: f64, extent: f64) -> (i32, u32) {
    let first = start.round();
    let next = (start + extent).round();
    let mut size = extent.round();
    if first + size < next {
        size += 1.0;
    }
    (first as i32, size.max(0.0) as u32)
}

/// `rows x cols` slots addressed through a rotating origin.
///
/// Storage slot `(r, c)` shows tile row
/// `first_row + (r - origin_row) mod rows` (columns likewise), so a pan only
/// moves the origin and rewrites the rows and columns that scrolled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToroidalTileGrid {
    rows: usize,
    cols: usize,
    origin_row: usize,
    origin_col: usize,
    slots: Vec<TileSlot>,
}

impl ToroidalTileGrid {
    pub fn new(rows: usize, cols: usize) -> Self {
        if rows == 0 || cols == 0 {
            panic!("toroidal grid needs at least one row and column");
        }
        let slot_count = rows
            .checked_mul(cols)
            .unwrap_or_else(|| panic!("toroidal grid slot count overflow"));
        Self {
            rows,
            cols,
            origin_row: 0,
            origin_col: 0,
            slots: vec![TileSlot::default(); slot_count],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn origin(&self) -> (usize, usize) {
        (self.origin_row, self.origin_col)
    }

    pub fn slot(&self, storage_row: usize, storage_col: usize) -> &TileSlot {
        &self.slots[storage_row * self.cols + storage_col]
    }

    pub fn slots(&self) -> &[TileSlot] {
        &self.slots
    }

    pub fn visible_slots(&self) -> impl Iterator<Item = &TileSlot> {
        self.slots.iter().filter(|slot| slot.visible)
    }

    pub fn placements(&self) -> Vec<TilePlacement> {
        self.slots.iter().filter_map(TileSlot::placement).collect()
    }

    /// Tile row and column shown by a storage slot for a window starting at
    /// `(first_row, first_col)`.
    pub fn tile_position(
        &self,
        storage_row: usize,
        storage_col: usize,
        first_row: i64,
        first_col: i64,
    ) -> (i64, i64) {
        let row_offset = (storage_row as i64 - self.origin_row as i64).rem_euclid(self.rows as i64);
        let col_offset = (storage_col as i64 - self.origin_col as i64).rem_euclid(self.cols as i64);
        (first_row + row_offset, first_col + col_offset)
    }

    pub fn shift_origin(&mut self, delta_rows: i64, delta_cols: i64) {
        self.origin_row = (self.origin_row as i64 + delta_rows).rem_euclid(self.rows as i64) as usize;
        self.origin_col = (self.origin_col as i64 + delta_cols).rem_euclid(self.cols as i64) as usize;
    }

    /// Points every slot at its tile for `window` and returns the visible
    /// identifiers that are not cached yet. Content changes take the new
    /// cache reference before releasing the old one. Slots outside the window
    /// are hidden but keep their content and reference.
    pub fn reconcile<F: TileFetcher>(
        &mut self,
        window: &ViewportWindow,
        source: &dyn TileSource,
        cache: &mut TextureCache<F>,
    ) -> Vec<TileIdentifier> {
        let transposed = source.transposes_tiles(window.zoom);
        let mut needed = Vec::new();
        for storage_row in 0..self.rows {
            for storage_col in 0..self.cols {
                let (row, col) =
                    self.tile_position(storage_row, storage_col, window.first_row, window.first_col);
                let index = storage_row * self.cols + storage_col;
                let slot = &mut self.slots[index];
                if row < 0 || col < 0 || !window.contains(row, col) {
                    slot.visible = false;
                    continue;
                }

                let identifier = source.tile_identifier(TileCoord {
                    section: window.z,
                    col: col as u32,
                    row: row as u32,
                    zoom: window.zoom,
                });
                assign_slot(slot, identifier, cache, &mut needed);

                let (x, width) = snap_span(
                    window.left + (col - window.first_col) as f64 * window.effective_tile_width,
                    window.effective_tile_width,
                );
                let (y, height) = snap_span(
                    window.top + (row - window.first_row) as f64 * window.effective_tile_height,
                    window.effective_tile_height,
                );
                slot.x = x;
                slot.y = y;
                slot.width = width;
                slot.height = height;
                slot.transposed = transposed;
                slot.visible = true;
            }
        }
        needed
    }

    /// Binds slots waiting on `identifier` now that it is cached. Returns how
    /// many visible slots became drawable.
    pub fn bind_identifier<F: TileFetcher>(
        &mut self,
        identifier: &TileIdentifier,
        cache: &mut TextureCache<F>,
    ) -> usize {
        let mut newly_drawable = 0;
        for slot in &mut self.slots {
            if slot.bound || slot.identifier.as_ref() != Some(identifier) {
                continue;
            }
            slot.bound = cache.inc(identifier);
            if slot.bound && slot.visible {
                newly_drawable += 1;
            }
        }
        newly_drawable
    }

    pub fn hide_all(&mut self) {
        for slot in &mut self.slots {
            slot.visible = false;
        }
    }

    /// Drops every slot's content and cache reference.
    pub fn release<F: TileFetcher>(&mut self, cache: &mut TextureCache<F>) {
        for slot in &mut self.slots {
            if let Some(identifier) = slot.identifier.take()
                && slot.bound
            {
                cache.dec(&identifier);
            }
            *slot = TileSlot::default();
        }
        self.origin_row = 0;
        self.origin_col = 0;
    }

    /// Moves every slot of `other` into the matching slot of this grid and
    /// leaves `other` empty. References held by `other` carry over before
    /// the replaced content is released.
    pub fn take_slots_from<F: TileFetcher>(
        &mut self,
        other: &mut ToroidalTileGrid,
        cache: &mut TextureCache<F>,
    ) {
        if (self.rows, self.cols) != (other.rows, other.cols) {
            panic!(
                "cannot move {}x{} slots into a {}x{} grid",
                other.rows, other.cols, self.rows, self.cols
            );
        }
        for (slot, incoming) in self.slots.iter_mut().zip(other.slots.iter_mut()) {
            let outgoing = std::mem::replace(slot, std::mem::take(incoming));
            if let Some(identifier) = outgoing.identifier
                && outgoing.bound
            {
                cache.dec(&identifier);
            }
        }
        self.origin_row = other.origin_row;
        self.origin_col = other.origin_col;
        other.origin_row = 0;
        other.origin_col = 0;
    }
}

fn assign_slot<F: TileFetcher>(
    slot: &mut TileSlot,
    identifier: TileIdentifier,
    cache: &mut TextureCache<F>,
    needed: &mut Vec<TileIdentifier>,
) {
    if slot.identifier.as_ref() == Some(&identifier) {
        if !slot.bound {
            slot.bound = cache.inc(&identifier);
        }
    } else {
        let bound = cache.inc(&identifier);
        if let Some(previous) = slot.identifier.take()
            && slot.bound
        {
            cache.dec(&previous);
        }
        slot.identifier = Some(identifier.clone());
        slot.bound = bound;
    }
    if !slot.bound {
        needed.push(identifier);
    }
}
