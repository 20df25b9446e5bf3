use std::fmt;
use std::time::Duration;

use model::TileIdentifier;
use tiles::{
    DecodedTile, FetchCompletion, FetchError, FetcherCreateError, ThreadedFetcher, TileFetcher,
    TileLoader,
};

pub const TILE_TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;

/// One tile's texture on the device. The texture is destroyed on drop, which
/// is how cache eviction releases GPU memory.
#[derive(Debug)]
pub struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

impl GpuTexture {
    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Drop for GpuTexture {
    fn drop(&mut self) {
        self.texture.destroy();
    }
}

#[derive(Debug, Clone)]
pub struct GpuTileUploader {
    device: wgpu::Device,
    queue: wgpu::Queue,
}

impl GpuTileUploader {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self { device, queue }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn upload(
        &self,
        identifier: &TileIdentifier,
        tile: &DecodedTile,
    ) -> Result<GpuTexture, FetchError> {
        if tile.width == 0 || tile.height == 0 {
            return Err(FetchError::Upload {
                message: format!("tile {identifier} has zero size"),
            });
        }
        let max_dimension = self.device.limits().max_texture_dimension_2d;
        if tile.width > max_dimension || tile.height > max_dimension {
            return Err(FetchError::Upload {
                message: format!(
                    "tile {identifier} is {}x{}, device limit is {max_dimension}",
                    tile.width, tile.height
                ),
            });
        }
        let expected_len = u64::from(tile.bytes_per_row()) * u64::from(tile.height);
        if tile.byte_len() as u64 != expected_len {
            return Err(FetchError::Upload {
                message: format!(
                    "tile {identifier} carries {} bytes, expected {expected_len}",
                    tile.byte_len()
                ),
            });
        }

        let size = wgpu::Extent3d {
            width: tile.width,
            height: tile.height,
            depth_or_array_layers: 1,
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("renderer.tile_texture"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TILE_TEXTURE_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &tile.rgba,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(tile.bytes_per_row()),
                rows_per_image: Some(tile.height),
            },
            size,
        );
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(GpuTexture {
            texture,
            view,
            width: tile.width,
            height: tile.height,
        })
    }
}

/// Decodes on worker threads and uploads to the device when completions are
/// polled, so all wgpu calls stay on the cache's owning thread.
pub struct GpuTextureFetcher<L: TileLoader<Output = DecodedTile>> {
    inner: ThreadedFetcher<L>,
    uploader: GpuTileUploader,
}

impl<L: TileLoader<Output = DecodedTile>> GpuTextureFetcher<L> {
    pub fn new(
        loader: L,
        worker_count: usize,
        uploader: GpuTileUploader,
    ) -> Result<Self, FetcherCreateError> {
        Ok(Self {
            inner: ThreadedFetcher::new(loader, worker_count)?,
            uploader,
        })
    }

    pub fn uploader(&self) -> &GpuTileUploader {
        &self.uploader
    }

    pub fn wait_for_completions(&mut self, timeout: Duration) -> bool {
        self.inner.wait_for_completions(timeout)
    }

    fn upload_all(
        &self,
        completions: Vec<FetchCompletion<DecodedTile>>,
    ) -> Vec<FetchCompletion<GpuTexture>> {
        completions
            .into_iter()
            .map(|completion| {
                let FetchCompletion { identifier, result } = completion;
                let result = result.and_then(|tile| self.uploader.upload(&identifier, &tile));
                FetchCompletion { identifier, result }
            })
            .collect()
    }
}

impl<L: TileLoader<Output = DecodedTile>> TileFetcher for GpuTextureFetcher<L> {
    type Texture = GpuTexture;

    fn begin_fetch(&mut self, identifier: &TileIdentifier) {
        self.inner.begin_fetch(identifier);
    }

    fn poll_completions(&mut self) -> Vec<FetchCompletion<GpuTexture>> {
        let completions = self.inner.poll_completions();
        self.upload_all(completions)
    }
}

#[derive(Debug)]
pub enum HeadlessDeviceError {
    Adapter(wgpu::RequestAdapterError),
    Device(wgpu::RequestDeviceError),
}

impl fmt::Display for HeadlessDeviceError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeadlessDeviceError::Adapter(error) => {
                write!(formatter, "request wgpu adapter failed: {error}")
            }
            HeadlessDeviceError::Device(error) => {
                write!(formatter, "request wgpu device failed: {error}")
            }
        }
    }
}

impl std::error::Error for HeadlessDeviceError {}

/// Device without a surface, for offscreen upload and tests.
pub fn create_headless_device() -> Result<(wgpu::Device, wgpu::Queue), HeadlessDeviceError> {
    pollster::block_on(async {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::LowPower,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(HeadlessDeviceError::Adapter)?;
        let info = adapter.get_info();
        log::info!("headless wgpu adapter: {} ({:?})", info.name, info.backend);
        adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("renderer.headless_device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(HeadlessDeviceError::Device)
    })
}
