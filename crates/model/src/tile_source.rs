use std::collections::BTreeSet;

use serde::Deserialize;

use crate::{TileCoord, TileIdentifier, TileSize};

/// Maps a tile coordinate to the identifier of its pixel content.
///
/// Implementations must be deterministic: the same coordinate always yields
/// the same identifier, and the content behind an identifier never changes.
pub trait TileSource {
    fn tile_identifier(&self, coord: TileCoord) -> TileIdentifier;

    fn tile_size(&self) -> TileSize;

    fn transposes_tiles(&self, _zoom: u8) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileUrlScheme {
    /// `{base}{section}/{row}_{col}_{zoom}.{ext}`
    SectionRowColZoom,
    /// `{base}{section}/{zoom}/{row}_{col}.{ext}`
    SectionZoomRowCol,
    /// `{base}{zoom}/{section}/{row}/{col}.{ext}`
    ZoomSectionRowCol,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTileSource {
    base_url: String,
    extension: String,
    scheme: TileUrlScheme,
    tile_size: TileSize,
    transposed_zoom_levels: BTreeSet<u8>,
}

impl UrlTileSource {
    pub fn new(
        base_url: impl Into<String>,
        extension: impl Into<String>,
        scheme: TileUrlScheme,
        tile_size: TileSize,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            extension: extension.into(),
            scheme,
            tile_size,
            transposed_zoom_levels: BTreeSet::new(),
        }
    }

    pub fn with_transposed_zoom_levels(mut self, levels: impl IntoIterator<Item = u8>) -> Self {
        self.transposed_zoom_levels.extend(levels);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl TileSource for UrlTileSource {
    fn tile_identifier(&self, coord: TileCoord) -> TileIdentifier {
        let TileCoord {
            section,
            col,
            row,
            zoom,
        } = coord;
        let base = &self.base_url;
        let ext = &self.extension;
        let url = match self.scheme {
            TileUrlScheme::SectionRowColZoom => {
                format!("{base}{section}/{row}_{col}_{zoom}.{ext}")
            }
            TileUrlScheme::SectionZoomRowCol => {
                format!("{base}{section}/{zoom}/{row}_{col}.{ext}")
            }
            TileUrlScheme::ZoomSectionRowCol => {
                format!("{base}{zoom}/{section}/{row}/{col}.{ext}")
            }
        };
        TileIdentifier::from(url)
    }

    fn tile_size(&self) -> TileSize {
        self.tile_size
    }

    fn transposes_tiles(&self, zoom: u8) -> bool {
        self.transposed_zoom_levels.contains(&zoom)
    }
}
