use std::collections::HashSet;
use std::time::{Duration, Instant};

use model::{TileIdentifier, TileSource};
use tiles::{TextureCache, TileFetcher};
use view::ViewportWindow;

use crate::toroidal::ToroidalTileGrid;

pub const DEFAULT_SWAP_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawOutcome {
    /// Visible identifiers not cached yet; the caller requests them.
    pub needed: Vec<TileIdentifier>,
    pub buffering: bool,
    pub swapped: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettleOutcome {
    /// Visible front slots that became drawable.
    pub bound: usize,
    pub swapped: bool,
}

#[derive(Debug)]
struct ShadowBuffer {
    window: ViewportWindow,
    to_buffer: usize,
    waiting: HashSet<TileIdentifier>,
}

impl ShadowBuffer {
    fn buffered(&self) -> usize {
        self.to_buffer - self.waiting.len()
    }
}

/// Double-buffered toroidal grid.
///
/// Pans redraw the front grid in place. A change of section or zoom level
/// fills the back grid instead, holding cache references as tiles arrive,
/// and moves its slots to the front once every tile settled or the swap
/// deadline passed. Re-entering buffering keeps the first deadline. Both
/// grids are allocated together and only reallocated by `resize`.
#[derive(Debug)]
pub struct BufferedGrid {
    front: ToroidalTileGrid,
    back: ToroidalTileGrid,
    front_window: Option<ViewportWindow>,
    shadow: Option<ShadowBuffer>,
    deadline: Option<Instant>,
    swap_timeout: Duration,
}

impl BufferedGrid {
    pub fn new(rows: usize, cols: usize, swap_timeout: Duration) -> Self {
        Self {
            front: ToroidalTileGrid::new(rows, cols),
            back: ToroidalTileGrid::new(rows, cols),
            front_window: None,
            shadow: None,
            deadline: None,
            swap_timeout,
        }
    }

    pub fn front(&self) -> &ToroidalTileGrid {
        &self.front
    }

    pub fn front_window(&self) -> Option<&ViewportWindow> {
        self.front_window.as_ref()
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.front.rows(), self.front.cols())
    }

    pub fn is_buffering(&self) -> bool {
        self.shadow.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn swap_timeout(&self) -> Duration {
        self.swap_timeout
    }

    pub fn set_swap_timeout(&mut self, swap_timeout: Duration) {
        self.swap_timeout = swap_timeout;
    }

    /// `(buffered, to_buffer)` of the shadow side while buffering.
    pub fn buffer_progress(&self) -> Option<(usize, usize)> {
        self.shadow
            .as_ref()
            .map(|shadow| (shadow.buffered(), shadow.to_buffer))
    }

    /// A window needs the shadow side when it shows a different tile set
    /// than the front. The first draw goes straight to the front.
    pub fn needs_buffering(&self, window: &ViewportWindow) -> bool {
        self.front_window
            .as_ref()
            .is_some_and(|front| !front.shares_tile_set_with(window))
    }

    pub fn draw<F: TileFetcher>(
        &mut self,
        window: &ViewportWindow,
        source: &dyn TileSource,
        cache: &mut TextureCache<F>,
        now: Instant,
    ) -> DrawOutcome {
        if !self.needs_buffering(window) {
            self.abandon_buffer(cache);
            if let Some(front_window) = &self.front_window {
                self.front.shift_origin(
                    window.first_row - front_window.first_row,
                    window.first_col - front_window.first_col,
                );
            }
            let needed = self.front.reconcile(window, source, cache);
            self.front_window = Some(*window);
            return DrawOutcome {
                needed,
                buffering: false,
                swapped: false,
            };
        }

        if let Some(shadow) = &self.shadow {
            self.back.shift_origin(
                window.first_row - shadow.window.first_row,
                window.first_col - shadow.window.first_col,
            );
        }
        let needed = self.back.reconcile(window, source, cache);
        let waiting: HashSet<TileIdentifier> = needed.iter().cloned().collect();
        self.shadow = Some(ShadowBuffer {
            window: *window,
            to_buffer: waiting.len(),
            waiting,
        });

        if needed.is_empty() {
            self.swap(cache);
            return DrawOutcome {
                needed,
                buffering: false,
                swapped: true,
            };
        }
        let deadline = *self.deadline.get_or_insert(now + self.swap_timeout);
        log::debug!(
            "buffering {} tiles for section {} zoom {}, swap deadline in {:?}",
            needed.len(),
            window.z,
            window.zoom,
            deadline.saturating_duration_since(now)
        );
        DrawOutcome {
            needed,
            buffering: true,
            swapped: false,
        }
    }

    /// Records that `identifier` finished loading. Failed loads still count
    /// towards the buffer so a missing tile cannot hold the swap back.
    pub fn tile_settled<F: TileFetcher>(
        &mut self,
        identifier: &TileIdentifier,
        loaded: bool,
        cache: &mut TextureCache<F>,
    ) -> SettleOutcome {
        let mut outcome = SettleOutcome::default();
        if loaded {
            outcome.bound = self.front.bind_identifier(identifier, cache);
        }

        let Some(shadow) = self.shadow.as_mut() else {
            return outcome;
        };
        if loaded {
            self.back.bind_identifier(identifier, cache);
        }
        if shadow.waiting.remove(identifier) && shadow.waiting.is_empty() {
            self.swap(cache);
            outcome.swapped = true;
        }
        outcome
    }

    /// Forces the swap once the deadline passed, accepting a partial frame.
    pub fn tick<F: TileFetcher>(&mut self, now: Instant, cache: &mut TextureCache<F>) -> bool {
        let Some(deadline) = self.deadline else {
            return false;
        };
        if now < deadline || self.shadow.is_none() {
            return false;
        }
        if let Some((buffered, to_buffer)) = self.buffer_progress() {
            log::debug!("swap deadline passed with {buffered} of {to_buffer} tiles buffered");
        }
        self.swap(cache);
        true
    }

    /// Moves the back slots into the front slots. The back side already
    /// holds its references, so the old front content is released after.
    pub fn swap<F: TileFetcher>(&mut self, cache: &mut TextureCache<F>) {
        self.deadline = None;
        let Some(shadow) = self.shadow.take() else {
            return;
        };
        self.front.take_slots_from(&mut self.back, cache);
        self.front_window = Some(shadow.window);
    }

    pub fn abandon_buffer<F: TileFetcher>(&mut self, cache: &mut TextureCache<F>) {
        self.deadline = None;
        if self.shadow.take().is_some() {
            self.back.release(cache);
        }
    }

    pub fn hide_all(&mut self) {
        self.front.hide_all();
    }

    /// Releases everything and starts over with empty grids of the new shape.
    pub fn resize<F: TileFetcher>(&mut self, rows: usize, cols: usize, cache: &mut TextureCache<F>) {
        self.release(cache);
        self.front = ToroidalTileGrid::new(rows, cols);
        self.back = ToroidalTileGrid::new(rows, cols);
    }

    pub fn release<F: TileFetcher>(&mut self, cache: &mut TextureCache<F>) {
        self.abandon_buffer(cache);
        self.front.release(cache);
        self.front_window = None;
    }
}
