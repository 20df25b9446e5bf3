use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use model::{StackExtent, StackGeometry, StackGeometryError, TileSize, TileUrlScheme, UrlTileSource};
use serde::Deserialize;
use tile_layer::LayerConfig;
use tiles::{
    DEFAULT_MAX_CONCURRENT_FETCHES, DEFAULT_UNUSED_CAPACITY, TextureCacheConfig,
    TextureCacheConfigError,
};

#[derive(Debug)]
pub enum ConfigError {
    Read { path: PathBuf, error: std::io::Error },
    Parse(toml::de::Error),
    NoLayers,
    EmptyViewport,
    ZeroFetchWorkers,
    Cache(TextureCacheConfigError),
    Layer { name: String, error: StackGeometryError },
    EfficiencyThreshold { name: String, threshold: f64 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, error } => {
                write!(formatter, "read config {} failed: {error}", path.display())
            }
            ConfigError::Parse(error) => write!(formatter, "parse config failed: {error}"),
            ConfigError::NoLayers => write!(formatter, "config declares no layers"),
            ConfigError::EmptyViewport => {
                write!(formatter, "viewport width and height must be positive")
            }
            ConfigError::ZeroFetchWorkers => {
                write!(formatter, "fetch.workers must be at least 1")
            }
            ConfigError::Cache(error) => write!(formatter, "cache section is invalid: {error}"),
            ConfigError::Layer { name, error } => {
                write!(formatter, "layer '{name}' is invalid: {error}")
            }
            ConfigError::EfficiencyThreshold { name, threshold } => write!(
                formatter,
                "layer '{name}' efficiency_threshold {threshold} must lie in [0, 1]"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ViewerConfig {
    pub viewport: ViewportConfig,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub fetch: FetchSection,
    pub layers: Vec<LayerSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ViewportConfig {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSection {
    pub unused_capacity: usize,
    pub max_concurrent_fetches: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            unused_capacity: DEFAULT_UNUSED_CAPACITY,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchSection {
    pub workers: usize,
    /// Directory relative tile paths resolve against.
    pub root: Option<PathBuf>,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            workers: 4,
            root: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerSpec {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub max_zoom: u8,
    #[serde(default = "default_tile_edge")]
    pub tile_width: u32,
    #[serde(default = "default_tile_edge")]
    pub tile_height: u32,
    pub base_url: String,
    #[serde(default = "default_extension")]
    pub extension: String,
    pub scheme: TileUrlScheme,
    #[serde(default = "default_opacity")]
    pub opacity: f32,
    #[serde(default)]
    pub efficiency_threshold: f64,
    #[serde(default = "default_swap_timeout_ms")]
    pub swap_timeout_ms: u64,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default)]
    pub hide_if_section_broken: bool,
    #[serde(default)]
    pub broken_sections: Vec<u32>,
    #[serde(default)]
    pub transposed_zoom_levels: Vec<u8>,
}

fn default_tile_edge() -> u32 {
    model::DEFAULT_TILE_SIZE
}

fn default_extension() -> String {
    "jpg".to_owned()
}

fn default_opacity() -> f32 {
    1.0
}

fn default_swap_timeout_ms() -> u64 {
    3000
}

fn default_visible() -> bool {
    true
}

impl ViewerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|error| ConfigError::Read {
            path: path.to_path_buf(),
            error,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ViewerConfig = toml::from_str(text).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.layers.is_empty() {
            return Err(ConfigError::NoLayers);
        }
        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(ConfigError::EmptyViewport);
        }
        if self.fetch.workers == 0 {
            return Err(ConfigError::ZeroFetchWorkers);
        }
        if self.cache.unused_capacity == 0 {
            return Err(ConfigError::Cache(TextureCacheConfigError::ZeroUnusedCapacity));
        }
        if self.cache.max_concurrent_fetches == 0 {
            return Err(ConfigError::Cache(TextureCacheConfigError::ZeroConcurrency));
        }
        for layer in &self.layers {
            layer.geometry()?;
            if !(0.0..=1.0).contains(&layer.efficiency_threshold) {
                return Err(ConfigError::EfficiencyThreshold {
                    name: layer.name.clone(),
                    threshold: layer.efficiency_threshold,
                });
            }
        }
        Ok(())
    }

    pub fn cache_config(&self) -> TextureCacheConfig {
        TextureCacheConfig {
            unused_capacity: self.cache.unused_capacity,
            max_concurrent_fetches: self.cache.max_concurrent_fetches,
        }
    }
}

impl LayerSpec {
    pub fn tile_size(&self) -> TileSize {
        TileSize {
            width: self.tile_width,
            height: self.tile_height,
        }
    }

    pub fn geometry(&self) -> Result<StackGeometry, ConfigError> {
        let layer_error = |error| ConfigError::Layer {
            name: self.name.clone(),
            error,
        };
        let mut geometry = StackGeometry::new(
            StackExtent {
                width: self.width,
                height: self.height,
                max_zoom: self.max_zoom,
            },
            self.depth,
            self.tile_size(),
        )
        .map_err(layer_error)?;
        for section in &self.broken_sections {
            geometry
                .mark_section_broken(*section)
                .map_err(layer_error)?;
        }
        Ok(geometry)
    }

    pub fn source(&self) -> UrlTileSource {
        UrlTileSource::new(
            self.base_url.clone(),
            self.extension.clone(),
            self.scheme,
            self.tile_size(),
        )
        .with_transposed_zoom_levels(self.transposed_zoom_levels.iter().copied())
    }

    pub fn layer_config(&self) -> LayerConfig {
        LayerConfig {
            efficiency_threshold: self.efficiency_threshold,
            swap_timeout: Duration::from_millis(self.swap_timeout_ms),
            opacity: self.opacity,
            visible: self.visible,
            hide_if_section_broken: self.hide_if_section_broken,
        }
    }
}
