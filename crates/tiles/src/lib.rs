//! Shared tile texture cache.
//!
//! - `cache`: reference-counted [`TextureCache`] with deduplicated, bounded
//!   concurrency loading and FIFO eviction of unused textures.
//! - `unused_ring`: the eviction ring itself.
//! - `fetch`: the [`TileFetcher`] seam, a worker-thread fetcher and the
//!   filesystem loader.
//! - `decode`: PNG/JPEG decoding to RGBA8.

mod cache;
mod decode;
mod fetch;
mod unused_ring;

pub use cache::{
    CacheEvent, CacheStats, DEFAULT_MAX_CONCURRENT_FETCHES, DEFAULT_UNUSED_CAPACITY, LoadOutcome,
    LoadRequestId, TextureCache, TextureCacheConfig, TextureCacheConfigError,
};
pub use decode::{DecodedTile, decode_tile};
#[cfg(any(test, feature = "test-helpers"))]
pub use fetch::ManualFetcher;
pub use fetch::{
    FetchCompletion, FetchError, FetcherCreateError, FileTileLoader, ThreadedFetcher, TileFetcher,
    TileLoader,
};
pub use unused_ring::UnusedRing;
