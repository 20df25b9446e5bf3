use std::fmt;

use model::TileIdentifier;
use render_protocol::{FrameComposition, GridHandle, LayerFrame, TileSurface};
use slotmap::SlotMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderContextError {
    UnknownGrid,
}

impl fmt::Display for RenderContextError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderContextError::UnknownGrid => {
                write!(formatter, "grid is not registered with this render context")
            }
        }
    }
}

impl std::error::Error for RenderContextError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented { frame_id: u64 },
    /// At least one visible grid has not reported since the last reset.
    Waiting,
}

#[derive(Debug)]
struct GridState {
    ready: bool,
    visible: bool,
    frame: Option<LayerFrame>,
}

/// Collects readiness from every grid drawn into one surface.
///
/// A draw cycle starts with [`RenderContext::reset_render_readiness`]; each
/// grid then reports its [`LayerFrame`] through [`RenderContext::grid_ready`].
/// The composed frame goes to the surface as soon as every visible grid is
/// ready. Grids that report again later (late tiles bound after a forced
/// swap) re-present with their updated placements.
pub struct RenderContext<S: TileSurface> {
    surface: S,
    grids: SlotMap<GridHandle, GridState>,
    order: Vec<GridHandle>,
    awaiting_frame: bool,
    next_frame_id: u64,
}

impl<S: TileSurface> RenderContext<S> {
    pub fn new(surface: S) -> Self {
        Self {
            surface,
            grids: SlotMap::with_key(),
            order: Vec::new(),
            awaiting_frame: false,
            next_frame_id: 0,
        }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn grid_count(&self) -> usize {
        self.order.len()
    }

    pub fn frames_presented(&self) -> u64 {
        self.next_frame_id
    }

    pub fn register_grid(&mut self) -> GridHandle {
        let handle = self.grids.insert(GridState {
            ready: false,
            visible: true,
            frame: None,
        });
        self.order.push(handle);
        handle
    }

    /// Returns the number of grids still registered. Zero means the owner
    /// can drop the context.
    pub fn unregister_grid(&mut self, handle: GridHandle) -> Result<usize, RenderContextError> {
        self.grids
            .remove(handle)
            .ok_or(RenderContextError::UnknownGrid)?;
        self.order.retain(|registered| *registered != handle);
        if self.awaiting_frame && !self.order.is_empty() {
            self.present_if_complete();
        }
        Ok(self.order.len())
    }

    pub fn reset_render_readiness(&mut self) {
        for state in self.grids.values_mut() {
            state.ready = false;
        }
        self.awaiting_frame = true;
    }

    pub fn is_grid_ready(&self, handle: GridHandle) -> Result<bool, RenderContextError> {
        self.grids
            .get(handle)
            .map(|state| state.ready)
            .ok_or(RenderContextError::UnknownGrid)
    }

    pub fn is_grid_visible(&self, handle: GridHandle) -> Result<bool, RenderContextError> {
        self.grids
            .get(handle)
            .map(|state| state.visible)
            .ok_or(RenderContextError::UnknownGrid)
    }

    pub fn set_grid_visible(
        &mut self,
        handle: GridHandle,
        visible: bool,
    ) -> Result<FrameStatus, RenderContextError> {
        let state = self
            .grids
            .get_mut(handle)
            .ok_or(RenderContextError::UnknownGrid)?;
        state.visible = visible;
        if !self.awaiting_frame {
            return Ok(FrameStatus::Waiting);
        }
        Ok(self.present_if_complete())
    }

    pub fn grid_ready(
        &mut self,
        handle: GridHandle,
        frame: LayerFrame,
    ) -> Result<FrameStatus, RenderContextError> {
        if frame.grid != handle {
            panic!("layer frame reported for a different grid handle");
        }
        let state = self
            .grids
            .get_mut(handle)
            .ok_or(RenderContextError::UnknownGrid)?;
        state.ready = true;
        state.frame = Some(frame);
        Ok(self.present_if_complete())
    }

    pub fn release_textures(&mut self, identifiers: &[TileIdentifier]) {
        if identifiers.is_empty() {
            return;
        }
        self.surface.release_textures(identifiers);
    }

    fn present_if_complete(&mut self) -> FrameStatus {
        let complete = self
            .grids
            .values()
            .all(|state| state.ready || !state.visible);
        if !complete {
            return FrameStatus::Waiting;
        }

        let layers = self
            .order
            .iter()
            .filter_map(|handle| self.grids.get(*handle))
            .filter(|state| state.visible)
            .filter_map(|state| state.frame.clone())
            .collect();
        let frame_id = self.next_frame_id;
        self.next_frame_id = self
            .next_frame_id
            .checked_add(1)
            .unwrap_or_else(|| panic!("frame id overflow"));
        let composition = FrameComposition { frame_id, layers };
        log::debug!(
            "presenting frame {frame_id} with {} placements",
            composition.placement_count()
        );
        self.surface.present(&composition);
        self.awaiting_frame = false;
        FrameStatus::Presented { frame_id }
    }
}

impl<S: TileSurface + fmt::Debug> fmt::Debug for RenderContext<S> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RenderContext")
            .field("surface", &self.surface)
            .field("grids", &self.order.len())
            .field("awaiting_frame", &self.awaiting_frame)
            .field("frames_presented", &self.next_frame_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use render_protocol::TilePlacement;

    #[derive(Debug, Default)]
    struct RecordingSurface {
        presented: Vec<FrameComposition>,
        released: Vec<TileIdentifier>,
    }

    impl TileSurface for RecordingSurface {
        fn present(&mut self, composition: &FrameComposition) {
            self.presented.push(composition.clone());
        }

        fn release_textures(&mut self, identifiers: &[TileIdentifier]) {
            self.released.extend_from_slice(identifiers);
        }
    }

    fn frame(grid: GridHandle, identifier: &str) -> LayerFrame {
        LayerFrame {
            grid,
            opacity: 1.0,
            placements: vec![TilePlacement {
                identifier: TileIdentifier::new(identifier),
                x: 0,
                y: 0,
                width: 256,
                height: 256,
                transposed: false,
            }],
        }
    }

    #[test]
    fn presents_only_after_every_visible_grid_reports() {
        let mut context = RenderContext::new(RecordingSurface::default());
        let first = context.register_grid();
        let second = context.register_grid();
        context.reset_render_readiness();

        let status = context
            .grid_ready(first, frame(first, "a"))
            .expect("first grid ready");
        assert_eq!(status, FrameStatus::Waiting);
        assert!(context.surface().presented.is_empty());

        let status = context
            .grid_ready(second, frame(second, "b"))
            .expect("second grid ready");
        assert_eq!(status, FrameStatus::Presented { frame_id: 0 });
        let presented = &context.surface().presented;
        assert_eq!(presented.len(), 1);
        assert_eq!(presented[0].layers.len(), 2);
        assert_eq!(presented[0].layers[0].grid, first);
        assert_eq!(presented[0].layers[1].grid, second);
    }

    #[test]
    fn hidden_grid_does_not_block_and_hiding_completes_frame() {
        let mut context = RenderContext::new(RecordingSurface::default());
        let first = context.register_grid();
        let second = context.register_grid();
        context.reset_render_readiness();
        context
            .grid_ready(first, frame(first, "a"))
            .expect("first grid ready");

        let status = context
            .set_grid_visible(second, false)
            .expect("hide second grid");
        assert_eq!(status, FrameStatus::Presented { frame_id: 0 });
        assert_eq!(context.surface().presented[0].layers.len(), 1);
    }

    #[test]
    fn late_report_re_presents_updated_frame() {
        let mut context = RenderContext::new(RecordingSurface::default());
        let grid = context.register_grid();
        context.reset_render_readiness();
        context.grid_ready(grid, frame(grid, "a")).expect("ready");
        let status = context.grid_ready(grid, frame(grid, "b")).expect("ready again");
        assert_eq!(status, FrameStatus::Presented { frame_id: 1 });
        assert_eq!(context.frames_presented(), 2);
    }

    #[test]
    fn reset_clears_readiness() {
        let mut context = RenderContext::new(RecordingSurface::default());
        let first = context.register_grid();
        let second = context.register_grid();
        context.reset_render_readiness();
        context.grid_ready(first, frame(first, "a")).expect("ready");
        context.grid_ready(second, frame(second, "b")).expect("ready");
        context.reset_render_readiness();
        assert!(!context.is_grid_ready(first).expect("known grid"));
        let status = context.grid_ready(first, frame(first, "c")).expect("ready");
        assert_eq!(status, FrameStatus::Waiting);
    }

    #[test]
    fn unregister_reports_remaining_and_rejects_unknown() {
        let mut context = RenderContext::new(RecordingSurface::default());
        let first = context.register_grid();
        let second = context.register_grid();
        assert_eq!(context.unregister_grid(first), Ok(1));
        assert_eq!(
            context.unregister_grid(first),
            Err(RenderContextError::UnknownGrid)
        );
        assert_eq!(context.unregister_grid(second), Ok(0));
        assert_eq!(
            context.grid_ready(second, frame(second, "a")),
            Err(RenderContextError::UnknownGrid)
        );
    }

    #[test]
    fn unregistering_the_blocking_grid_completes_frame() {
        let mut context = RenderContext::new(RecordingSurface::default());
        let first = context.register_grid();
        let second = context.register_grid();
        context.reset_render_readiness();
        context.grid_ready(first, frame(first, "a")).expect("ready");
        context.unregister_grid(second).expect("unregister");
        assert_eq!(context.surface().presented.len(), 1);
    }

    #[test]
    fn release_forwards_to_surface() {
        let mut context = RenderContext::new(RecordingSurface::default());
        context.release_textures(&[]);
        context.release_textures(&[TileIdentifier::new("gone")]);
        assert_eq!(
            context.surface().released,
            vec![TileIdentifier::new("gone")]
        );
    }
}
