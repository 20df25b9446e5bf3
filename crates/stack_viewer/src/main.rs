use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use renderer::{GpuTextureFetcher, GpuTileUploader, create_headless_device};
use stack_viewer::{
    LoggingSurface, SessionEvent, StackViewerSession, ViewStep, ViewerConfig, read_view_script,
};
use tiles::{FileTileLoader, TextureCache, ThreadedFetcher, TileFetcher};
use view::ViewState;

const PUMP_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Parser)]
#[command(author, version, about = "Replay a view script against a tiled image stack")]
struct Arguments {
    /// Viewer configuration (TOML).
    #[arg(long, short = 'c', value_parser)]
    config: PathBuf,
    /// View script, one JSON step per line.
    #[arg(long, short = 's', value_parser)]
    script: PathBuf,
    /// Directory relative tile paths resolve against. Overrides `fetch.root`.
    #[arg(long, value_parser)]
    root: Option<PathBuf>,
    /// Upload tiles to a headless wgpu device instead of keeping them on the CPU.
    #[arg(long)]
    gpu: bool,
    /// Give up waiting for a blocking view after this many milliseconds.
    #[arg(long, default_value_t = 10_000)]
    step_timeout_ms: u64,
}

#[derive(Debug, Default)]
struct ReplaySummary {
    steps: usize,
    redraws_completed: usize,
    frames_presented: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let arguments = Arguments::parse();

    let config = ViewerConfig::load(&arguments.config)
        .with_context(|| format!("load config {}", arguments.config.display()))?;
    let script = File::open(&arguments.script)
        .with_context(|| format!("open view script {}", arguments.script.display()))?;
    let steps = read_view_script(&mut BufReader::new(script))
        .with_context(|| format!("read view script {}", arguments.script.display()))?;

    let loader = match arguments.root.as_ref().or(config.fetch.root.as_ref()) {
        Some(root) => FileTileLoader::with_root(root),
        None => FileTileLoader::new(),
    };
    let step_timeout = Duration::from_millis(arguments.step_timeout_ms);

    let summary = if arguments.gpu {
        let (device, queue) = create_headless_device().context("create headless wgpu device")?;
        let fetcher = GpuTextureFetcher::new(
            loader,
            config.fetch.workers,
            GpuTileUploader::new(device, queue),
        )
        .context("start tile fetch workers")?;
        replay(&config, fetcher, &steps, step_timeout, |fetcher, timeout| {
            fetcher.wait_for_completions(timeout)
        })?
    } else {
        let fetcher = ThreadedFetcher::new(loader, config.fetch.workers)
            .context("start tile fetch workers")?;
        replay(&config, fetcher, &steps, step_timeout, |fetcher, timeout| {
            fetcher.wait_for_completions(timeout)
        })?
    };

    log::info!(
        "replayed {} steps: {} redraws completed, {} frames presented",
        summary.steps,
        summary.redraws_completed,
        summary.frames_presented
    );
    Ok(())
}

fn replay<F: TileFetcher>(
    config: &ViewerConfig,
    fetcher: F,
    steps: &[ViewStep],
    step_timeout: Duration,
    wait: impl Fn(&mut F, Duration) -> bool,
) -> Result<ReplaySummary> {
    let cache =
        TextureCache::new(config.cache_config(), fetcher).context("create texture cache")?;
    let mut session = StackViewerSession::new(cache, LoggingSurface::default());
    session.resize(config.viewport.width, config.viewport.height);
    let mut handles = Vec::with_capacity(config.layers.len());
    for spec in &config.layers {
        let geometry = spec.geometry()?;
        let handle = session
            .add_layer(geometry, Box::new(spec.source()), spec.layer_config())
            .with_context(|| format!("add layer '{}'", spec.name))?;
        handles.push(handle);
    }

    let mut summary = ReplaySummary::default();
    for (index, step) in steps.iter().enumerate() {
        log::debug!("step {index}: {step:?}");
        match step {
            ViewStep::View { location, blocking } => {
                let view = ViewState::from(*location);
                session
                    .set_view(view, Instant::now(), *blocking)
                    .with_context(|| format!("apply view at step {index}"))?;
                let deadline = Instant::now() + step_timeout;
                while !session.is_view_complete() && Instant::now() < deadline {
                    wait(session.cache_mut().fetcher_mut(), PUMP_INTERVAL);
                    record(&mut summary, session.pump(Instant::now()));
                }
                if !session.is_view_complete() {
                    log::warn!("view at step {index} did not complete within {step_timeout:?}");
                }
            }
            ViewStep::Resize { width, height } => session.resize(*width, *height),
            ViewStep::Wait { millis } => {
                let until = Instant::now() + Duration::from_millis(*millis);
                while Instant::now() < until {
                    let remaining = until.saturating_duration_since(Instant::now());
                    wait(session.cache_mut().fetcher_mut(), remaining.min(PUMP_INTERVAL));
                    record(&mut summary, session.pump(Instant::now()));
                }
            }
            ViewStep::Precache { views } => {
                let views: Vec<ViewState> = views.iter().copied().map(ViewState::from).collect();
                session
                    .precache(&views)
                    .with_context(|| format!("precache at step {index}"))?;
            }
            ViewStep::SetOpacity { layer, opacity } => {
                let handle = handles
                    .get(*layer)
                    .copied()
                    .ok_or_else(|| anyhow::anyhow!("step {index} names unknown layer {layer}"))?;
                session.set_layer_opacity(handle, *opacity)?;
            }
        }
        record(&mut summary, session.pump(Instant::now()));
        summary.steps += 1;
    }

    let stats = session.cache().stats();
    log::info!(
        "cache: {} fetches, {} failed, {} evictions, {} cached",
        stats.fetches_started,
        stats.fetches_failed,
        stats.evictions,
        session.cache().cached_len()
    );
    summary.frames_presented = session.context().surface().frames_presented();
    Ok(summary)
}

fn record(summary: &mut ReplaySummary, events: Vec<SessionEvent>) {
    for event in events {
        match event {
            SessionEvent::RedrawComplete { .. } => summary.redraws_completed += 1,
            SessionEvent::FramePresented { frame_id } => {
                log::debug!("presented frame {frame_id}");
            }
        }
    }
}
