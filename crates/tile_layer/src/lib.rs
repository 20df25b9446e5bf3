//! Tile grids that follow a viewport over one stack.
//!
//! - `toroidal`: fixed slot grid whose origin rotates while panning.
//! - `buffered`: front grid plus a shadow grid filled off screen on zoom or
//!   section changes, swapped in once loaded or at a deadline.
//! - `layer`: [`TileLayer`] wiring a grid to a stack, a tile source and the
//!   shared texture cache.

mod buffered;
mod layer;
mod toroidal;

pub use buffered::{BufferedGrid, DEFAULT_SWAP_TIMEOUT, DrawOutcome, SettleOutcome};
pub use layer::{LayerConfig, LayerUpdate, RedrawStatus, RedrawTicket, TileLayer, TileLayerError};
pub use toroidal::{TileSlot, ToroidalTileGrid, grid_dimensions, snap_span};
