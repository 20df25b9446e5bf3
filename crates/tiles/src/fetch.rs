use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use model::TileIdentifier;

use crate::decode::{DecodedTile, decode_tile};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    Io { message: String },
    Decode { message: String },
    Upload { message: String },
    WorkerDisconnected,
}

impl fmt::Display for FetchError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Io { message } => write!(formatter, "tile read failed: {message}"),
            FetchError::Decode { message } => write!(formatter, "tile decode failed: {message}"),
            FetchError::Upload { message } => write!(formatter, "tile upload failed: {message}"),
            FetchError::WorkerDisconnected => {
                write!(formatter, "tile fetch workers are no longer running")
            }
        }
    }
}

impl std::error::Error for FetchError {}

#[derive(Debug)]
pub struct FetchCompletion<T> {
    pub identifier: TileIdentifier,
    pub result: Result<T, FetchError>,
}

/// Asynchronous tile transport used by the texture cache.
///
/// `begin_fetch` starts work and returns immediately. Results come back
/// through `poll_completions`, which the cache calls on its owning thread.
/// A started fetch always produces exactly one completion; there is no abort.
pub trait TileFetcher {
    type Texture;

    fn begin_fetch(&mut self, identifier: &TileIdentifier);

    fn poll_completions(&mut self) -> Vec<FetchCompletion<Self::Texture>>;
}

/// Blocking load of one tile, run on a fetch worker thread.
pub trait TileLoader: Send + Sync + 'static {
    type Output: Send + 'static;

    fn load(&self, identifier: &TileIdentifier) -> Result<Self::Output, FetchError>;
}

#[derive(Debug)]
pub enum FetcherCreateError {
    ZeroWorkers,
    Spawn(std::io::Error),
}

impl fmt::Display for FetcherCreateError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetcherCreateError::ZeroWorkers => {
                write!(formatter, "tile fetcher needs at least one worker")
            }
            FetcherCreateError::Spawn(error) => {
                write!(formatter, "spawn tile fetch worker failed: {error}")
            }
        }
    }
}

impl std::error::Error for FetcherCreateError {}

pub struct ThreadedFetcher<L: TileLoader> {
    job_sender: Option<Sender<TileIdentifier>>,
    completion_receiver: Receiver<FetchCompletion<L::Output>>,
    ready: Vec<FetchCompletion<L::Output>>,
    workers: Vec<JoinHandle<()>>,
}

impl<L: TileLoader> ThreadedFetcher<L> {
    pub fn new(loader: L, worker_count: usize) -> Result<Self, FetcherCreateError> {
        if worker_count == 0 {
            return Err(FetcherCreateError::ZeroWorkers);
        }
        let loader = Arc::new(loader);
        let (job_sender, job_receiver) = crossbeam_channel::unbounded::<TileIdentifier>();
        let (completion_sender, completion_receiver) = crossbeam_channel::unbounded();

        let mut workers = Vec::with_capacity(worker_count);
        for worker_index in 0..worker_count {
            let loader = Arc::clone(&loader);
            let job_receiver = job_receiver.clone();
            let completion_sender = completion_sender.clone();
            let worker = thread::Builder::new()
                .name(format!("tile-fetch-{worker_index}"))
                .spawn(move || {
                    for identifier in job_receiver.iter() {
                        let result = loader.load(&identifier);
                        let completion = FetchCompletion { identifier, result };
                        if completion_sender.send(completion).is_err() {
                            break;
                        }
                    }
                })
                .map_err(FetcherCreateError::Spawn)?;
            workers.push(worker);
        }

        Ok(Self {
            job_sender: Some(job_sender),
            completion_receiver,
            ready: Vec::new(),
            workers,
        })
    }

    /// Blocks until a completion is available or `timeout` elapses. Ready
    /// completions are kept for the next `poll_completions`.
    pub fn wait_for_completions(&mut self, timeout: Duration) -> bool {
        if !self.ready.is_empty() {
            return true;
        }
        match self.completion_receiver.recv_timeout(timeout) {
            Ok(completion) => {
                self.ready.push(completion);
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

impl<L: TileLoader> TileFetcher for ThreadedFetcher<L> {
    type Texture = L::Output;

    fn begin_fetch(&mut self, identifier: &TileIdentifier) {
        let sent = self
            .job_sender
            .as_ref()
            .map(|sender| sender.send(identifier.clone()).is_ok())
            .unwrap_or(false);
        if !sent {
            log::warn!("tile fetch workers gone, failing fetch of {identifier}");
            self.ready.push(FetchCompletion {
                identifier: identifier.clone(),
                result: Err(FetchError::WorkerDisconnected),
            });
        }
    }

    fn poll_completions(&mut self) -> Vec<FetchCompletion<Self::Texture>> {
        let mut completions = std::mem::take(&mut self.ready);
        completions.extend(self.completion_receiver.try_iter());
        completions
    }
}

impl<L: TileLoader> Drop for ThreadedFetcher<L> {
    fn drop(&mut self) {
        self.job_sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::warn!("tile fetch worker panicked");
            }
        }
    }
}

/// Reads tiles from the local filesystem. Identifiers are paths, optionally
/// prefixed with `file://`, resolved against `root` when relative.
#[derive(Debug, Clone, Default)]
pub struct FileTileLoader {
    root: Option<PathBuf>,
}

impl FileTileLoader {
    pub fn new() -> Self {
        Self { root: None }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    pub fn path_for(&self, identifier: &TileIdentifier) -> PathBuf {
        let raw = identifier.as_str();
        let relative = PathBuf::from(raw.strip_prefix("file://").unwrap_or(raw));
        match &self.root {
            Some(root) if relative.is_relative() => root.join(relative),
            _ => relative,
        }
    }
}

impl TileLoader for FileTileLoader {
    type Output = DecodedTile;

    fn load(&self, identifier: &TileIdentifier) -> Result<DecodedTile, FetchError> {
        let path = self.path_for(identifier);
        let bytes = std::fs::read(&path).map_err(|error| FetchError::Io {
            message: format!("{}: {error}", path.display()),
        })?;
        decode_tile(&bytes)
    }
}

/// Fetcher whose completions are produced by hand, for tests that need to
/// control arrival order.
#[cfg(any(test, feature = "test-helpers"))]
#[derive(Debug)]
pub struct ManualFetcher<T> {
    started: Vec<TileIdentifier>,
    ready: std::collections::VecDeque<FetchCompletion<T>>,
}

#[cfg(any(test, feature = "test-helpers"))]
impl<T> Default for ManualFetcher<T> {
    fn default() -> Self {
        Self {
            started: Vec::new(),
            ready: std::collections::VecDeque::new(),
        }
    }
}

#[cfg(any(test, feature = "test-helpers"))]
impl<T> ManualFetcher<T> {
    pub fn started(&self) -> &[TileIdentifier] {
        &self.started
    }

    pub fn started_count(&self, identifier: &TileIdentifier) -> usize {
        self.started
            .iter()
            .filter(|started| *started == identifier)
            .count()
    }

    pub fn resolve(&mut self, identifier: &TileIdentifier, texture: T) {
        self.ready.push_back(FetchCompletion {
            identifier: identifier.clone(),
            result: Ok(texture),
        });
    }

    pub fn fail(&mut self, identifier: &TileIdentifier, error: FetchError) {
        self.ready.push_back(FetchCompletion {
            identifier: identifier.clone(),
            result: Err(error),
        });
    }
}

#[cfg(any(test, feature = "test-helpers"))]
impl<T> TileFetcher for ManualFetcher<T> {
    type Texture = T;

    fn begin_fetch(&mut self, identifier: &TileIdentifier) {
        self.started.push(identifier.clone());
    }

    fn poll_completions(&mut self) -> Vec<FetchCompletion<T>> {
        self.ready.drain(..).collect()
    }
}
