use crate::fetch::FetchError;

/// Tile pixels decoded to tightly packed RGBA8 rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTile {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl DecodedTile {
    pub fn byte_len(&self) -> usize {
        self.rgba.len()
    }

    pub fn bytes_per_row(&self) -> u32 {
        self.width * 4
    }
}

pub fn decode_tile(bytes: &[u8]) -> Result<DecodedTile, FetchError> {
    let image = image::load_from_memory(bytes).map_err(|error| FetchError::Decode {
        message: error.to_string(),
    })?;
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    Ok(DecodedTile {
        width,
        height,
        rgba: rgba.into_raw(),
    })
}
