//! Viewer session wiring: one texture cache and render context shared by
//! every tile layer of a surface, plus the TOML config and JSONL view
//! scripts the headless binary replays.

mod config;
mod script;
mod session;
mod surface;

pub use config::{
    CacheSection, ConfigError, FetchSection, LayerSpec, ViewerConfig, ViewportConfig,
};
pub use script::{ScriptError, ViewLocation, ViewStep, read_view_script};
pub use session::{SessionError, SessionEvent, StackViewerSession};
pub use surface::LoggingSurface;
