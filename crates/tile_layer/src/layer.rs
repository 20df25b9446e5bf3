use std::fmt;
use std::time::{Duration, Instant};

use model::{StackGeometry, StackGeometryError, TileCoord, TileIdentifier, TileSource};
use render_protocol::{GridHandle, LayerFrame};
use tiles::{CacheEvent, LoadOutcome, LoadRequestId, TextureCache, TileFetcher};
use view::{TileIndexMapper, ViewState, ViewportMapError, ViewportRequest, ViewportWindow};

use crate::buffered::{BufferedGrid, DEFAULT_SWAP_TIMEOUT};
use crate::toroidal::grid_dimensions;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerConfig {
    /// Minimum visible fraction of a margin tile before it is drawn.
    pub efficiency_threshold: f64,
    pub swap_timeout: Duration,
    pub opacity: f32,
    pub visible: bool,
    pub hide_if_section_broken: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            efficiency_threshold: 0.0,
            swap_timeout: DEFAULT_SWAP_TIMEOUT,
            opacity: 1.0,
            visible: true,
            hide_if_section_broken: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileLayerError {
    Mapping(ViewportMapError),
    /// `redraw` before the first `resize`.
    NotSized,
}

impl fmt::Display for TileLayerError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileLayerError::Mapping(error) => write!(formatter, "map viewport failed: {error}"),
            TileLayerError::NotSized => {
                write!(formatter, "tile layer has no viewport size yet")
            }
        }
    }
}

impl std::error::Error for TileLayerError {}

impl From<ViewportMapError> for TileLayerError {
    fn from(error: ViewportMapError) -> Self {
        TileLayerError::Mapping(error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RedrawTicket(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedrawStatus {
    pub ticket: RedrawTicket,
    /// Redraws that completed during this call, including `ticket` when it
    /// did not have to wait.
    pub completed: Vec<RedrawTicket>,
}

impl RedrawStatus {
    pub fn is_complete(&self) -> bool {
        self.completed.contains(&self.ticket)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerUpdate {
    /// Visible slots that became drawable.
    pub settled: usize,
    pub swapped: bool,
    pub completed_redraws: Vec<RedrawTicket>,
}

impl LayerUpdate {
    pub fn frame_changed(&self) -> bool {
        self.settled > 0 || self.swapped
    }

    pub fn merge(&mut self, other: LayerUpdate) {
        self.settled += other.settled;
        self.swapped |= other.swapped;
        self.completed_redraws.extend(other.completed_redraws);
    }
}

/// One stack drawn through a buffered tile grid.
///
/// Every redraw hands out a [`RedrawTicket`]. Non-blocking redraws complete
/// at once; blocking ones complete when their tiles settled (a swap for a
/// section or zoom change) or when the swap timeout passes. A newer redraw
/// cancels the older load request, and the older tickets complete together
/// with the newer one.
pub struct TileLayer {
    grid_handle: GridHandle,
    geometry: StackGeometry,
    source: Box<dyn TileSource>,
    mapper: TileIndexMapper,
    config: LayerConfig,
    grid: BufferedGrid,
    view_width: u32,
    view_height: u32,
    active_request: Option<LoadRequestId>,
    precache_request: Option<LoadRequestId>,
    pending: Vec<RedrawTicket>,
    completion_deadline: Option<Instant>,
    next_ticket: u64,
    hidden: bool,
}

impl TileLayer {
    pub fn new(
        grid_handle: GridHandle,
        geometry: StackGeometry,
        source: Box<dyn TileSource>,
        config: LayerConfig,
    ) -> Result<Self, TileLayerError> {
        let tile_size = source.tile_size();
        let mapper = TileIndexMapper::new(geometry.extent(), tile_size)?;
        let (rows, cols) = grid_dimensions(0, 0, tile_size);
        Ok(Self {
            grid_handle,
            geometry,
            source,
            mapper,
            config,
            grid: BufferedGrid::new(rows, cols, config.swap_timeout),
            view_width: 0,
            view_height: 0,
            active_request: None,
            precache_request: None,
            pending: Vec::new(),
            completion_deadline: None,
            next_ticket: 0,
            hidden: false,
        })
    }

    pub fn grid_handle(&self) -> GridHandle {
        self.grid_handle
    }

    pub fn geometry(&self) -> &StackGeometry {
        &self.geometry
    }

    pub fn mark_section_broken(&mut self, section: u32) -> Result<(), StackGeometryError> {
        self.geometry.mark_section_broken(section)
    }

    pub fn config(&self) -> LayerConfig {
        self.config
    }

    pub fn set_opacity(&mut self, opacity: f32) {
        self.config.opacity = opacity.clamp(0.0, 1.0);
    }

    /// Takes effect on the next redraw.
    pub fn set_visible(&mut self, visible: bool) {
        self.config.visible = visible;
    }

    pub fn set_swap_timeout(&mut self, swap_timeout: Duration) {
        self.config.swap_timeout = swap_timeout;
        self.grid.set_swap_timeout(swap_timeout);
    }

    pub fn grid(&self) -> &BufferedGrid {
        &self.grid
    }

    pub fn view_size(&self) -> (u32, u32) {
        (self.view_width, self.view_height)
    }

    /// No blocking redraw is waiting for tiles.
    pub fn is_frame_ready(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn active_request(&self) -> Option<LoadRequestId> {
        self.active_request
    }

    pub fn resize<F: TileFetcher>(
        &mut self,
        view_width: u32,
        view_height: u32,
        cache: &mut TextureCache<F>,
    ) {
        self.view_width = view_width;
        self.view_height = view_height;
        let (rows, cols) = grid_dimensions(view_width, view_height, self.mapper.tile_size());
        if (rows, cols) != self.grid.dimensions() {
            log::debug!("resizing tile grid to {rows}x{cols} for {view_width}x{view_height}");
            self.grid.resize(rows, cols, cache);
        }
    }

    pub fn redraw<F: TileFetcher>(
        &mut self,
        view: ViewState,
        cache: &mut TextureCache<F>,
        now: Instant,
        blocking: bool,
    ) -> Result<RedrawStatus, TileLayerError> {
        if self.view_width == 0 || self.view_height == 0 {
            return Err(TileLayerError::NotSized);
        }
        let hide = !self.config.visible
            || (self.config.hide_if_section_broken && self.geometry.is_section_broken(view.z));
        if hide {
            let ticket = self.issue_ticket();
            self.cancel_active(cache);
            self.grid.abandon_buffer(cache);
            self.grid.hide_all();
            self.hidden = true;
            return Ok(self.complete_now(ticket));
        }
        self.hidden = false;

        let window = self.map_view(view)?;
        let ticket = self.issue_ticket();
        self.ensure_capacity(&window, cache);
        let outcome = self.grid.draw(&window, self.source.as_ref(), cache, now);

        let load = if outcome.needed.is_empty() {
            LoadOutcome::Ready
        } else {
            cache.load(outcome.needed.iter().cloned())
        };
        self.cancel_active(cache);
        if let LoadOutcome::Pending(request) = load {
            self.active_request = Some(request);
        }

        if !outcome.buffering && self.active_request.is_none() {
            return Ok(self.complete_now(ticket));
        }
        if !blocking {
            return Ok(RedrawStatus {
                ticket,
                completed: vec![ticket],
            });
        }
        self.pending.push(ticket);
        let timeout = self.config.swap_timeout;
        self.completion_deadline.get_or_insert(now + timeout);
        Ok(RedrawStatus {
            ticket,
            completed: Vec::new(),
        })
    }

    pub fn handle_cache_event<F: TileFetcher>(
        &mut self,
        event: &CacheEvent,
        cache: &mut TextureCache<F>,
    ) -> LayerUpdate {
        let mut update = LayerUpdate::default();
        match event {
            CacheEvent::TileSettled {
                identifier, loaded, ..
            } => {
                let outcome = self.grid.tile_settled(identifier, *loaded, cache);
                update.settled = outcome.bound;
                update.swapped = outcome.swapped;
                if outcome.swapped {
                    update.completed_redraws = self.drain_pending();
                }
            }
            CacheEvent::RequestComplete { request } => {
                if self.precache_request == Some(*request) {
                    self.precache_request = None;
                }
                if self.active_request == Some(*request) {
                    self.active_request = None;
                    if !self.grid.is_buffering() {
                        update.completed_redraws = self.drain_pending();
                    }
                }
            }
        }
        update
    }

    pub fn tick<F: TileFetcher>(&mut self, now: Instant, cache: &mut TextureCache<F>) -> LayerUpdate {
        let mut update = LayerUpdate {
            swapped: self.grid.tick(now, cache),
            ..LayerUpdate::default()
        };
        let expired = self
            .completion_deadline
            .is_some_and(|deadline| now >= deadline);
        if update.swapped || expired {
            update.completed_redraws = self.drain_pending();
        }
        update
    }

    pub fn frame(&self) -> LayerFrame {
        if self.hidden {
            return LayerFrame::empty(self.grid_handle, self.config.opacity);
        }
        LayerFrame {
            grid: self.grid_handle,
            opacity: self.config.opacity,
            placements: self.grid.front().placements(),
        }
    }

    /// Identifiers covering `view` at the current viewport size.
    pub fn tiles_for_view(&self, view: ViewState) -> Result<Vec<TileIdentifier>, TileLayerError> {
        if self.view_width == 0 || self.view_height == 0 {
            return Err(TileLayerError::NotSized);
        }
        if self.config.hide_if_section_broken && self.geometry.is_section_broken(view.z) {
            return Ok(Vec::new());
        }
        let window = self.map_view(view)?;
        let mut identifiers = Vec::with_capacity(window.row_count() * window.col_count());
        for row in window.first_row.max(0)..=window.last_row {
            for col in window.first_col.max(0)..=window.last_col {
                identifiers.push(self.source.tile_identifier(TileCoord {
                    section: window.z,
                    col: col as u32,
                    row: row as u32,
                    zoom: window.zoom,
                }));
            }
        }
        Ok(identifiers)
    }

    /// Warms the cache for a list of locations. Replaces any earlier
    /// precache request.
    pub fn cache_views<F: TileFetcher>(
        &mut self,
        views: &[ViewState],
        cache: &mut TextureCache<F>,
    ) -> Result<LoadOutcome, TileLayerError> {
        let mut identifiers = Vec::new();
        for view in views {
            identifiers.extend(self.tiles_for_view(*view)?);
        }
        let outcome = cache.load(identifiers);
        self.cancel_precache(cache);
        if let LoadOutcome::Pending(request) = outcome {
            self.precache_request = Some(request);
        }
        Ok(outcome)
    }

    pub fn cancel_precache<F: TileFetcher>(&mut self, cache: &mut TextureCache<F>) -> bool {
        match self.precache_request.take() {
            Some(request) => cache.cancel(request),
            None => false,
        }
    }

    /// Drops every cache reference and outstanding request. Pending redraws
    /// are returned as completed.
    pub fn release<F: TileFetcher>(&mut self, cache: &mut TextureCache<F>) -> Vec<RedrawTicket> {
        self.cancel_active(cache);
        self.cancel_precache(cache);
        self.grid.release(cache);
        self.drain_pending()
    }

    fn map_view(&self, view: ViewState) -> Result<ViewportWindow, TileLayerError> {
        let window = self.mapper.map(&ViewportRequest {
            view,
            view_width: self.view_width as f64,
            view_height: self.view_height as f64,
            efficiency_threshold: self.config.efficiency_threshold,
        })?;
        Ok(window)
    }

    /// Scales beyond the coarsest zoom level shrink tiles below their
    /// nominal size, so the window can outgrow the grid.
    fn ensure_capacity<F: TileFetcher>(
        &mut self,
        window: &ViewportWindow,
        cache: &mut TextureCache<F>,
    ) {
        let (rows, cols) = self.grid.dimensions();
        let needed_rows = rows.max(window.row_count());
        let needed_cols = cols.max(window.col_count());
        if (needed_rows, needed_cols) != (rows, cols) {
            log::debug!("growing tile grid to {needed_rows}x{needed_cols}");
            self.grid.resize(needed_rows, needed_cols, cache);
        }
    }

    fn cancel_active<F: TileFetcher>(&mut self, cache: &mut TextureCache<F>) {
        if let Some(request) = self.active_request.take() {
            cache.cancel(request);
        }
    }

    fn issue_ticket(&mut self) -> RedrawTicket {
        let ticket = RedrawTicket(self.next_ticket);
        self.next_ticket = self
            .next_ticket
            .checked_add(1)
            .unwrap_or_else(|| panic!("redraw ticket overflow"));
        ticket
    }

    fn complete_now(&mut self, ticket: RedrawTicket) -> RedrawStatus {
        let mut completed = self.drain_pending();
        completed.push(ticket);
        RedrawStatus { ticket, completed }
    }

    fn drain_pending(&mut self) -> Vec<RedrawTicket> {
        self.completion_deadline = None;
        std::mem::take(&mut self.pending)
    }
}

impl fmt::Debug for TileLayer {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TileLayer")
            .field("grid_handle", &self.grid_handle)
            .field("config", &self.config)
            .field("view_size", &(self.view_width, self.view_height))
            .field("grid", &self.grid.dimensions())
            .field("buffering", &self.grid.is_buffering())
            .field("pending", &self.pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{StackExtent, TileSize, TileUrlScheme, UrlTileSource};
    use slotmap::SlotMap;
    use tiles::{ManualFetcher, TextureCacheConfig};

    type TestCache = TextureCache<ManualFetcher<()>>;

    fn cache() -> TestCache {
        TextureCache::new(
            TextureCacheConfig {
                unused_capacity: 256,
                max_concurrent_fetches: 256,
            },
            ManualFetcher::default(),
        )
        .expect("cache config")
    }

    fn layer(config: LayerConfig, cache: &mut TestCache) -> TileLayer {
        let mut handles = SlotMap::<GridHandle, ()>::with_key();
        let geometry = StackGeometry::new(
            StackExtent {
                width: 4096,
                height: 4096,
                max_zoom: 4,
            },
            10,
            TileSize::square(256),
        )
        .expect("geometry");
        let source = UrlTileSource::new(
            "file:///stack/",
            "jpg",
            TileUrlScheme::SectionZoomRowCol,
            TileSize::square(256),
        )
        .with_transposed_zoom_levels([2]);
        let mut layer = TileLayer::new(handles.insert(()), geometry, Box::new(source), config)
            .expect("create layer");
        layer.resize(512, 512, cache);
        layer
    }

    fn view(z: u32, s: f64) -> ViewState {
        ViewState {
            xc: 0.0,
            yc: 0.0,
            z,
            s,
        }
    }

    fn resolve_started(cache: &mut TestCache) {
        let started: Vec<_> = cache.fetcher().started().to_vec();
        for identifier in &started {
            if !cache.is_cached(identifier) {
                cache.fetcher_mut().resolve(identifier, ());
            }
        }
    }

    fn pump(layer: &mut TileLayer, cache: &mut TestCache) -> LayerUpdate {
        let mut update = LayerUpdate::default();
        for event in cache.pump() {
            update.merge(layer.handle_cache_event(&event, cache));
        }
        update
    }

    #[test]
    fn redraw_before_resize_is_rejected() {
        let mut handles = SlotMap::<GridHandle, ()>::with_key();
        let mut cache = cache();
        let geometry = StackGeometry::new(
            StackExtent {
                width: 1024,
                height: 1024,
                max_zoom: 2,
            },
            1,
            TileSize::square(256),
        )
        .expect("geometry");
        let source = UrlTileSource::new(
            "",
            "png",
            TileUrlScheme::SectionRowColZoom,
            TileSize::square(256),
        );
        let mut layer = TileLayer::new(
            handles.insert(()),
            geometry,
            Box::new(source),
            LayerConfig::default(),
        )
        .expect("create layer");
        let error = layer
            .redraw(view(0, 0.0), &mut cache, Instant::now(), true)
            .expect_err("unsized layer");
        assert_eq!(error, TileLayerError::NotSized);
    }

    #[test]
    fn non_blocking_redraw_completes_immediately() {
        let mut cache = cache();
        let mut layer = layer(LayerConfig::default(), &mut cache);
        let status = layer
            .redraw(view(0, 0.0), &mut cache, Instant::now(), false)
            .expect("redraw");
        assert!(status.is_complete());
        assert!(layer.is_frame_ready());
        assert_eq!(cache.dispatched_len(), 4);
    }

    #[test]
    fn blocking_first_draw_completes_when_request_completes() {
        let mut cache = cache();
        let mut layer = layer(LayerConfig::default(), &mut cache);
        let status = layer
            .redraw(view(0, 0.0), &mut cache, Instant::now(), true)
            .expect("redraw");
        assert!(!status.is_complete());
        assert!(!layer.is_frame_ready());

        resolve_started(&mut cache);
        let update = pump(&mut layer, &mut cache);
        assert_eq!(update.settled, 4);
        assert_eq!(update.completed_redraws, vec![status.ticket]);
        assert!(layer.is_frame_ready());
        assert_eq!(layer.frame().placements.len(), 4);
    }

    #[test]
    fn superseded_blocking_redraws_complete_once_at_swap() {
        let now = Instant::now();
        let mut cache = cache();
        let mut layer = layer(LayerConfig::default(), &mut cache);
        layer
            .redraw(view(0, 0.0), &mut cache, now, false)
            .expect("redraw");
        resolve_started(&mut cache);
        pump(&mut layer, &mut cache);

        let first = layer
            .redraw(view(1, 0.0), &mut cache, now, true)
            .expect("redraw section 1");
        let second = layer
            .redraw(view(2, 0.0), &mut cache, now, true)
            .expect("redraw section 2");
        assert!(first.completed.is_empty());
        assert!(second.completed.is_empty());

        resolve_started(&mut cache);
        let update = pump(&mut layer, &mut cache);
        assert!(update.swapped);
        assert_eq!(update.completed_redraws, vec![first.ticket, second.ticket]);
        let sections: Vec<_> = layer
            .frame()
            .placements
            .iter()
            .map(|placement| placement.identifier.as_str().starts_with("file:///stack/2/"))
            .collect();
        assert_eq!(sections, vec![true; 4]);

        let later = pump(&mut layer, &mut cache);
        assert!(later.completed_redraws.is_empty());
    }

    #[test]
    fn swap_timeout_completes_pending_redraw() {
        let now = Instant::now();
        let mut cache = cache();
        let mut layer = layer(LayerConfig::default(), &mut cache);
        layer
            .redraw(view(0, 0.0), &mut cache, now, false)
            .expect("redraw");
        resolve_started(&mut cache);
        pump(&mut layer, &mut cache);

        let status = layer
            .redraw(view(3, 0.0), &mut cache, now, true)
            .expect("redraw");
        let early = layer.tick(now + Duration::from_millis(100), &mut cache);
        assert!(early.completed_redraws.is_empty());
        let update = layer.tick(now + DEFAULT_SWAP_TIMEOUT, &mut cache);
        assert!(update.swapped);
        assert_eq!(update.completed_redraws, vec![status.ticket]);
        assert!(layer.frame().placements.is_empty());

        resolve_started(&mut cache);
        let late = pump(&mut layer, &mut cache);
        assert_eq!(late.settled, 4);
        assert!(late.completed_redraws.is_empty());
        assert_eq!(layer.frame().placements.len(), 4);
    }

    #[test]
    fn broken_section_hides_layer_and_is_ready() {
        let mut cache = cache();
        let mut layer = layer(
            LayerConfig {
                hide_if_section_broken: true,
                ..LayerConfig::default()
            },
            &mut cache,
        );
        layer.mark_section_broken(4).expect("mark broken");
        let status = layer
            .redraw(view(4, 0.0), &mut cache, Instant::now(), true)
            .expect("redraw");
        assert!(status.is_complete());
        assert!(layer.frame().placements.is_empty());
        assert_eq!(cache.fetcher().started().len(), 0);
        assert!(layer.tiles_for_view(view(4, 0.0)).expect("tiles").is_empty());
    }

    #[test]
    fn transposed_zoom_levels_mark_placements() {
        let mut cache = cache();
        let mut layer = layer(LayerConfig::default(), &mut cache);
        layer
            .redraw(view(0, 2.0), &mut cache, Instant::now(), false)
            .expect("redraw");
        resolve_started(&mut cache);
        pump(&mut layer, &mut cache);
        let frame = layer.frame();
        assert!(!frame.placements.is_empty());
        assert!(frame.placements.iter().all(|placement| placement.transposed));
    }

    #[test]
    fn precache_loads_every_view_and_can_be_cancelled() {
        let mut cache = cache();
        let mut layer = layer(LayerConfig::default(), &mut cache);
        let views = [view(5, 0.0), view(6, 0.0)];
        let tiles = layer.tiles_for_view(views[0]).expect("tiles");
        assert_eq!(tiles.len(), 4);

        let outcome = layer.cache_views(&views, &mut cache).expect("precache");
        assert!(matches!(outcome, LoadOutcome::Pending(_)));
        assert_eq!(cache.dispatched_len(), 8);
        assert!(layer.cancel_precache(&mut cache));
        assert!(!layer.cancel_precache(&mut cache));
        assert_eq!(cache.pending_request_count(), 0);
    }

    #[test]
    fn hidden_layer_draws_nothing() {
        let mut cache = cache();
        let mut layer = layer(LayerConfig::default(), &mut cache);
        layer.set_visible(false);
        let status = layer
            .redraw(view(0, 0.0), &mut cache, Instant::now(), true)
            .expect("redraw");
        assert!(status.is_complete());
        assert!(layer.frame().placements.is_empty());
    }

    #[test]
    fn release_drops_references_and_completes_pending() {
        let now = Instant::now();
        let mut cache = cache();
        let mut layer = layer(LayerConfig::default(), &mut cache);
        layer
            .redraw(view(0, 0.0), &mut cache, now, false)
            .expect("redraw");
        resolve_started(&mut cache);
        pump(&mut layer, &mut cache);
        let shown: Vec<_> = layer
            .frame()
            .placements
            .into_iter()
            .map(|placement| placement.identifier)
            .collect();
        let status = layer
            .redraw(view(1, 0.0), &mut cache, now, true)
            .expect("redraw");

        let completed = layer.release(&mut cache);
        assert_eq!(completed, vec![status.ticket]);
        assert_eq!(cache.pending_request_count(), 0);
        for identifier in &shown {
            assert_eq!(cache.refcount(identifier), Some(0));
        }
    }
}
