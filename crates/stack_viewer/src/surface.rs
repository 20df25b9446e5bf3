use model::TileIdentifier;
use render_protocol::{FrameComposition, TileSurface};

/// Surface for headless runs: records what would have been drawn.
#[derive(Debug, Default)]
pub struct LoggingSurface {
    frames_presented: u64,
    last_frame: Option<FrameComposition>,
    released: u64,
}

impl LoggingSurface {
    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn last_frame(&self) -> Option<&FrameComposition> {
        self.last_frame.as_ref()
    }

    pub fn released_textures(&self) -> u64 {
        self.released
    }
}

impl TileSurface for LoggingSurface {
    fn present(&mut self, composition: &FrameComposition) {
        self.frames_presented += 1;
        log::info!(
            "frame {}: {} layers, {} tiles",
            composition.frame_id,
            composition.layers.len(),
            composition.placement_count()
        );
        self.last_frame = Some(composition.clone());
    }

    fn release_textures(&mut self, identifiers: &[TileIdentifier]) {
        self.released += identifiers.len() as u64;
        log::trace!("released {} evicted tile textures", identifiers.len());
    }
}
