use std::fmt;
use std::time::Instant;

use model::{StackGeometry, TileSource};
use render_protocol::{GridHandle, LayerFrame, TileSurface};
use renderer::{FrameStatus, RenderContext};
use tile_layer::{LayerConfig, LayerUpdate, RedrawTicket, TileLayer, TileLayerError};
use tiles::{TextureCache, TileFetcher};
use view::ViewState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    UnknownLayer,
    Layer(TileLayerError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::UnknownLayer => write!(formatter, "layer is not part of this session"),
            SessionError::Layer(error) => write!(formatter, "tile layer failed: {error}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<TileLayerError> for SessionError {
    fn from(error: TileLayerError) -> Self {
        SessionError::Layer(error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    RedrawComplete {
        layer: GridHandle,
        ticket: RedrawTicket,
    },
    FramePresented {
        frame_id: u64,
    },
}

/// Cache, render context and layers of one viewer surface.
///
/// Everything here lives on one thread. Fetch workers only hand results
/// back through the cache's fetcher, which [`StackViewerSession::pump`]
/// drains.
pub struct StackViewerSession<F: TileFetcher, S: TileSurface> {
    cache: TextureCache<F>,
    context: RenderContext<S>,
    layers: Vec<TileLayer>,
    view: Option<ViewState>,
    view_size: Option<(u32, u32)>,
    outbox: Vec<SessionEvent>,
}

impl<F: TileFetcher, S: TileSurface> StackViewerSession<F, S> {
    pub fn new(cache: TextureCache<F>, surface: S) -> Self {
        Self {
            cache,
            context: RenderContext::new(surface),
            layers: Vec::new(),
            view: None,
            view_size: None,
            outbox: Vec::new(),
        }
    }

    pub fn cache(&self) -> &TextureCache<F> {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut TextureCache<F> {
        &mut self.cache
    }

    pub fn context(&self) -> &RenderContext<S> {
        &self.context
    }

    pub fn view(&self) -> Option<ViewState> {
        self.view
    }

    pub fn layers(&self) -> impl Iterator<Item = &TileLayer> {
        self.layers.iter()
    }

    pub fn layer_handles(&self) -> Vec<GridHandle> {
        self.layers.iter().map(TileLayer::grid_handle).collect()
    }

    pub fn layer(&self, handle: GridHandle) -> Option<&TileLayer> {
        self.layers
            .iter()
            .find(|layer| layer.grid_handle() == handle)
    }

    /// Every layer shows the current view or gave up waiting for it.
    pub fn is_view_complete(&self) -> bool {
        self.layers.iter().all(TileLayer::is_frame_ready)
    }

    pub fn add_layer(
        &mut self,
        geometry: StackGeometry,
        source: Box<dyn TileSource>,
        config: LayerConfig,
    ) -> Result<GridHandle, SessionError> {
        let handle = self.context.register_grid();
        let mut layer = match TileLayer::new(handle, geometry, source, config) {
            Ok(layer) => layer,
            Err(error) => {
                self.unregister(handle);
                return Err(error.into());
            }
        };
        if let Some((width, height)) = self.view_size {
            layer.resize(width, height, &mut self.cache);
        }
        self.set_context_visibility(handle, config.visible);
        log::debug!("added tile layer {handle:?}");
        self.layers.push(layer);
        Ok(handle)
    }

    pub fn remove_layer(&mut self, handle: GridHandle) -> Result<(), SessionError> {
        let index = self.layer_index(handle)?;
        let mut layer = self.layers.remove(index);
        for ticket in layer.release(&mut self.cache) {
            self.outbox
                .push(SessionEvent::RedrawComplete { layer: handle, ticket });
        }
        self.unregister(handle);
        self.forward_evictions();
        Ok(())
    }

    pub fn set_layer_visible(&mut self, handle: GridHandle, visible: bool) -> Result<(), SessionError> {
        let index = self.layer_index(handle)?;
        self.layers[index].set_visible(visible);
        self.set_context_visibility(handle, visible);
        Ok(())
    }

    pub fn set_layer_opacity(&mut self, handle: GridHandle, opacity: f32) -> Result<(), SessionError> {
        let index = self.layer_index(handle)?;
        self.layers[index].set_opacity(opacity);
        if self.layers[index].is_frame_ready() {
            self.report_ready(index);
        }
        Ok(())
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.view_size = Some((width, height));
        for layer in &mut self.layers {
            layer.resize(width, height, &mut self.cache);
        }
    }

    /// Redraws every layer at `view` and starts a new draw cycle. Returns
    /// each layer's ticket; completions arrive as [`SessionEvent`]s.
    ///
    /// A layer that fails to redraw contributes an empty frame, so the other
    /// layers still present; the first failure is returned after all layers
    /// were redrawn.
    pub fn set_view(
        &mut self,
        view: ViewState,
        now: Instant,
        blocking: bool,
    ) -> Result<Vec<(GridHandle, RedrawTicket)>, SessionError> {
        if self.view_size.is_none() && !self.layers.is_empty() {
            return Err(TileLayerError::NotSized.into());
        }
        self.view = Some(view);
        self.context.reset_render_readiness();
        let mut tickets = Vec::with_capacity(self.layers.len());
        let mut first_error = None;
        for index in 0..self.layers.len() {
            let layer = &mut self.layers[index];
            let handle = layer.grid_handle();
            let status = match layer.redraw(view, &mut self.cache, now, blocking) {
                Ok(status) => status,
                Err(error) => {
                    log::warn!("tile layer {handle:?} failed to redraw: {error}");
                    let opacity = layer.config().opacity;
                    self.report_frame(handle, LayerFrame::empty(handle, opacity));
                    first_error.get_or_insert(SessionError::from(error));
                    continue;
                }
            };
            tickets.push((handle, status.ticket));
            for ticket in status.completed {
                self.outbox
                    .push(SessionEvent::RedrawComplete { layer: handle, ticket });
            }
            if self.layers[index].is_frame_ready() {
                self.report_ready(index);
            }
        }
        self.forward_evictions();
        match first_error {
            Some(error) => Err(error),
            None => Ok(tickets),
        }
    }

    pub fn precache(&mut self, views: &[ViewState]) -> Result<(), SessionError> {
        for layer in &mut self.layers {
            layer.cache_views(views, &mut self.cache)?;
        }
        Ok(())
    }

    /// Applies finished fetches and expired swap deadlines, then returns
    /// every event since the previous call.
    pub fn pump(&mut self, now: Instant) -> Vec<SessionEvent> {
        for event in self.cache.pump() {
            for index in 0..self.layers.len() {
                let update = self.layers[index].handle_cache_event(&event, &mut self.cache);
                self.apply_update(index, update);
            }
        }
        for index in 0..self.layers.len() {
            let update = self.layers[index].tick(now, &mut self.cache);
            self.apply_update(index, update);
        }
        self.forward_evictions();
        std::mem::take(&mut self.outbox)
    }

    fn apply_update(&mut self, index: usize, update: LayerUpdate) {
        let handle = self.layers[index].grid_handle();
        let report = update.frame_changed() || !update.completed_redraws.is_empty();
        for ticket in update.completed_redraws {
            self.outbox
                .push(SessionEvent::RedrawComplete { layer: handle, ticket });
        }
        if report && self.layers[index].is_frame_ready() {
            self.report_ready(index);
        }
    }

    fn report_ready(&mut self, index: usize) {
        let layer = &self.layers[index];
        let (handle, frame) = (layer.grid_handle(), layer.frame());
        self.report_frame(handle, frame);
    }

    fn report_frame(&mut self, handle: GridHandle, frame: LayerFrame) {
        let status = self
            .context
            .grid_ready(handle, frame)
            .unwrap_or_else(|error| panic!("session layer missing from render context: {error}"));
        if let FrameStatus::Presented { frame_id } = status {
            self.outbox.push(SessionEvent::FramePresented { frame_id });
        }
    }

    fn set_context_visibility(&mut self, handle: GridHandle, visible: bool) {
        let status = self
            .context
            .set_grid_visible(handle, visible)
            .unwrap_or_else(|error| panic!("session layer missing from render context: {error}"));
        if let FrameStatus::Presented { frame_id } = status {
            self.outbox.push(SessionEvent::FramePresented { frame_id });
        }
    }

    fn unregister(&mut self, handle: GridHandle) {
        let remaining = self
            .context
            .unregister_grid(handle)
            .unwrap_or_else(|error| panic!("session layer missing from render context: {error}"));
        if remaining == 0 {
            log::debug!("render context has no grids left");
        }
    }

    fn forward_evictions(&mut self) {
        let evicted = self.cache.drain_evicted();
        self.context.release_textures(&evicted);
    }

    fn layer_index(&self, handle: GridHandle) -> Result<usize, SessionError> {
        self.layers
            .iter()
            .position(|layer| layer.grid_handle() == handle)
            .ok_or(SessionError::UnknownLayer)
    }
}

impl<F: TileFetcher, S: TileSurface> fmt::Debug for StackViewerSession<F, S> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("StackViewerSession")
            .field("cache", &self.cache)
            .field("layers", &self.layers)
            .field("view", &self.view)
            .field("view_size", &self.view_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::LoggingSurface;
    use model::{StackExtent, TileSize, TileUrlScheme, UrlTileSource};
    use std::time::Duration;
    use tiles::{ManualFetcher, TextureCacheConfig};

    type TestSession = StackViewerSession<ManualFetcher<()>, LoggingSurface>;

    fn session() -> TestSession {
        let cache = TextureCache::new(
            TextureCacheConfig {
                unused_capacity: 64,
                max_concurrent_fetches: 64,
            },
            ManualFetcher::default(),
        )
        .expect("cache config");
        let mut session = StackViewerSession::new(cache, LoggingSurface::default());
        session.resize(512, 512);
        session
    }

    fn add_layer(session: &mut TestSession, base_url: &str) -> GridHandle {
        let geometry = StackGeometry::new(
            StackExtent {
                width: 2048,
                height: 2048,
                max_zoom: 3,
            },
            8,
            TileSize::square(256),
        )
        .expect("geometry");
        let source = UrlTileSource::new(
            base_url,
            "png",
            TileUrlScheme::SectionRowColZoom,
            TileSize::square(256),
        );
        session
            .add_layer(geometry, Box::new(source), LayerConfig::default())
            .expect("add layer")
    }

    fn view(z: u32) -> ViewState {
        ViewState {
            xc: 0.0,
            yc: 0.0,
            z,
            s: 0.0,
        }
    }

    fn resolve_started(session: &mut TestSession) {
        let started: Vec<_> = session.cache().fetcher().started().to_vec();
        for identifier in &started {
            if !session.cache().is_cached(identifier) {
                session.cache_mut().fetcher_mut().resolve(identifier, ());
            }
        }
    }

    fn presented(events: &[SessionEvent]) -> usize {
        events
            .iter()
            .filter(|event| matches!(event, SessionEvent::FramePresented { .. }))
            .count()
    }

    #[test]
    fn blocking_view_presents_once_all_layers_loaded() {
        let mut session = session();
        let base = add_layer(&mut session, "base/");
        let overlay = add_layer(&mut session, "overlay/");
        let now = Instant::now();

        let tickets = session.set_view(view(0), now, true).expect("set view");
        assert_eq!(tickets.len(), 2);
        assert!(!session.is_view_complete());
        assert_eq!(presented(&session.pump(now)), 0);

        resolve_started(&mut session);
        let events = session.pump(now);
        assert!(session.is_view_complete());
        assert_eq!(presented(&events), 1);
        let completed: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::RedrawComplete { layer, .. } => Some(*layer),
                SessionEvent::FramePresented { .. } => None,
            })
            .collect();
        assert_eq!(completed, vec![base, overlay]);

        let frame = session
            .context()
            .surface()
            .last_frame()
            .expect("frame presented");
        assert_eq!(frame.layers.len(), 2);
        assert_eq!(frame.placement_count(), 8);
    }

    #[test]
    fn non_blocking_view_presents_immediately_and_again_as_tiles_arrive() {
        let mut session = session();
        add_layer(&mut session, "base/");
        let now = Instant::now();

        session.set_view(view(0), now, false).expect("set view");
        let events = session.pump(now);
        assert_eq!(presented(&events), 1);

        resolve_started(&mut session);
        let events = session.pump(now);
        assert!(presented(&events) >= 1);
        let frame = session
            .context()
            .surface()
            .last_frame()
            .expect("frame presented");
        assert_eq!(frame.placement_count(), 4);
    }

    #[test]
    fn swap_timeout_presents_partial_frame() {
        let mut session = session();
        add_layer(&mut session, "base/");
        let now = Instant::now();
        session.set_view(view(0), now, true).expect("set view");
        resolve_started(&mut session);
        session.pump(now);

        session.set_view(view(1), now, true).expect("set view");
        assert!(!session.is_view_complete());
        let events = session.pump(now + Duration::from_millis(3000));
        assert!(session.is_view_complete());
        assert_eq!(presented(&events), 1);
    }

    #[test]
    fn removing_last_layer_releases_references() {
        let mut session = session();
        let handle = add_layer(&mut session, "base/");
        let now = Instant::now();
        session.set_view(view(0), now, true).expect("set view");
        resolve_started(&mut session);
        session.pump(now);
        assert_eq!(session.cache().unused_len(), 0);

        session.remove_layer(handle).expect("remove layer");
        assert_eq!(session.cache().unused_len(), 4);
        assert_eq!(session.context().grid_count(), 0);
        assert_eq!(
            session.remove_layer(handle),
            Err(SessionError::UnknownLayer)
        );
    }

    #[test]
    fn view_before_resize_fails_without_starting_a_cycle() {
        let cache = TextureCache::new(TextureCacheConfig::default(), ManualFetcher::<()>::default())
            .expect("cache config");
        let mut session = StackViewerSession::new(cache, LoggingSurface::default());
        add_layer(&mut session, "base/");

        let error = session
            .set_view(view(0), Instant::now(), true)
            .expect_err("no viewport size");
        assert_eq!(error, SessionError::Layer(TileLayerError::NotSized));
        assert!(session.cache().fetcher().started().is_empty());
    }

    #[test]
    fn failing_layer_does_not_stop_the_others() {
        let mut session = session();
        let geometry = StackGeometry::new(
            StackExtent {
                width: 2048,
                height: 2048,
                max_zoom: 3,
            },
            8,
            TileSize::square(256),
        )
        .expect("geometry");
        let source = UrlTileSource::new(
            "broken/",
            "png",
            TileUrlScheme::SectionRowColZoom,
            TileSize::square(256),
        );
        let config = LayerConfig {
            efficiency_threshold: 1.5,
            ..LayerConfig::default()
        };
        session
            .add_layer(geometry, Box::new(source), config)
            .expect("add layer");
        add_layer(&mut session, "base/");
        let now = Instant::now();

        let error = session.set_view(view(0), now, true).expect_err("bad threshold");
        assert!(matches!(error, SessionError::Layer(TileLayerError::Mapping(_))));
        assert_eq!(session.cache().fetcher().started().len(), 4);

        resolve_started(&mut session);
        let events = session.pump(now);
        assert_eq!(presented(&events), 1);
        let frame = session
            .context()
            .surface()
            .last_frame()
            .expect("frame presented");
        assert_eq!(frame.placement_count(), 4);
    }

    #[test]
    fn hidden_layer_does_not_block_frame() {
        let mut session = session();
        add_layer(&mut session, "base/");
        let hidden = add_layer(&mut session, "overlay/");
        session
            .set_layer_visible(hidden, false)
            .expect("hide layer");
        let now = Instant::now();
        session.set_view(view(0), now, true).expect("set view");
        resolve_started(&mut session);
        let events = session.pump(now);
        assert_eq!(presented(&events), 1);
        let frame = session
            .context()
            .surface()
            .last_frame()
            .expect("frame presented");
        assert_eq!(frame.layers.len(), 1);
    }
}
