// SPDX-License-Identifier: MPL-2.0

//! Drives a video output on a calloop event loop, uploading into a texture
//! that only checksums what it receives.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use calloop::{
    EventLoop, LoopSignal,
    signals::{Signal, Signals},
};
use clap::Parser;
use eyre::WrapErr;
use tracing::{debug, info};
use vout_bridge::{
    BridgeConfig, CalloopScheduler, FrameView, Handoff, HandoffStats, TextureHandle,
    TextureRegistry, TextureSink, VideoOutput,
};

/// Uploads between two progress messages.
const PROGRESS_EVERY: u64 = 60;

type Output = VideoOutput<ChecksumSink, CalloopScheduler>;

#[derive(Debug, Parser)]
#[command(version, about = "Feed video frames through the bridge into a checksum texture")]
struct Cli {
    /// RON config file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Texture address, decimal or 0x-prefixed hex; overrides the config file
    #[arg(long)]
    texture: Option<String>,
    #[arg(long, default_value_t = 320)]
    width: u32,
    #[arg(long, default_value_t = 240)]
    height: u32,
    /// Rate of generated frames
    #[arg(long, default_value_t = 60)]
    fps: u32,
    /// Stop after producing this many frames
    #[arg(long)]
    frames: Option<u64>,
    /// Decode this file with GStreamer instead of generating frames
    #[cfg(feature = "gstreamer")]
    #[arg(long)]
    source: Option<PathBuf>,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    init_logging();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let mut event_loop: EventLoop<'static, ()> =
        EventLoop::try_new().wrap_err("failed to create event loop")?;
    let (scheduler, _tasks) = CalloopScheduler::register(&event_loop.handle())
        .wrap_err("failed to register frame task channel")?;

    let stop = Arc::new(AtomicBool::new(false));
    let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM])?;
    {
        let stop = Arc::clone(&stop);
        event_loop
            .handle()
            .insert_source(signals, move |event, _, _| {
                info!(signal = ?event.signal(), "Stopping");
                stop.store(true, Ordering::Release);
            })
            .map_err(|err| err.error)?;
    }

    let output = VideoOutput::open(&config, cli.width, cli.height, &ChecksumRegistry, scheduler)
        .wrap_err("failed to open video output")?;

    let producer = spawn_producer(output, cli, stop, event_loop.get_signal());
    event_loop.run(None::<Duration>, &mut (), |_| {})?;

    let stats = producer
        .join()
        .map_err(|_| eyre::eyre!("producer thread panicked"))??;
    info!(
        scheduled = stats.frames_scheduled,
        replaced = stats.frames_replaced,
        dropped = stats.frames_dropped,
        delivered = stats.frames_delivered,
        failed = stats.uploads_failed,
        "Video output closed"
    );

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).with_target(true).init();
}

fn load_config(cli: &Cli) -> eyre::Result<BridgeConfig> {
    let config = match &cli.config {
        Some(path) => BridgeConfig::load(path)
            .wrap_err_with(|| format!("failed to load {}", path.display()))?,
        None => BridgeConfig::default(),
    };

    Ok(match &cli.texture {
        Some(texture) => config.texture(texture.as_str()),
        None => config,
    })
}

/// Run the producer side on its own thread. The loop is stopped once the
/// output has shut down, whatever the outcome.
fn spawn_producer(
    output: Output,
    cli: Cli,
    stop: Arc<AtomicBool>,
    loop_signal: LoopSignal,
) -> thread::JoinHandle<eyre::Result<HandoffStats>> {
    thread::spawn(move || {
        #[cfg(feature = "gstreamer")]
        let result = match cli.source {
            Some(path) => decode::decode_frames(output, path, cli.frames, &stop),
            None => generate_frames(output, cli.fps, cli.frames, &stop),
        };
        #[cfg(not(feature = "gstreamer"))]
        let result = generate_frames(output, cli.fps, cli.frames, &stop);

        loop_signal.stop();
        loop_signal.wakeup();
        result
    })
}

fn generate_frames(
    mut output: Output,
    fps: u32,
    frames: Option<u64>,
    stop: &AtomicBool,
) -> eyre::Result<HandoffStats> {
    let format = *output.format();
    let mut frame = vec![0u8; format.frame_len()];
    let interval = Duration::from_secs_f64(1.0 / f64::from(fps.max(1)));

    let mut next = Instant::now();
    let mut index = 0u64;
    while !stop.load(Ordering::Acquire) && frames.is_none_or(|limit| index < limit) {
        fill_gradient(&mut frame, format.pitch as usize, index);
        if output.display(&frame)? == Handoff::Dropped {
            debug!(index, "Event loop busy, frame dropped");
        }
        index += 1;

        next += interval;
        if let Some(wait) = next.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }

    Ok(output.shutdown())
}

/// Diagonal BGR gradient scrolling with `index`.
fn fill_gradient(frame: &mut [u8], pitch: usize, index: u64) {
    let shift = index as usize;
    for (y, row) in frame.chunks_exact_mut(pitch).enumerate() {
        for (x, pixel) in row.chunks_exact_mut(3).enumerate() {
            pixel[0] = (x + shift) as u8;
            pixel[1] = (y + shift) as u8;
            pixel[2] = shift as u8;
        }
    }
}

#[cfg(feature = "gstreamer")]
mod decode {
    use std::{
        path::PathBuf,
        sync::{
            Arc, Mutex, PoisonError,
            atomic::{AtomicBool, AtomicU64, Ordering},
        },
        thread,
        time::Duration,
    };

    use tracing::{info, warn};
    use vout_bridge::{
        HandoffStats,
        source::{BusStatus, PipelineSource, SourceKind},
    };

    use super::Output;

    /// Decode `path` into the output until end of stream, `frames` frames or
    /// a stop request.
    pub fn decode_frames(
        output: Output,
        path: PathBuf,
        frames: Option<u64>,
        stop: &AtomicBool,
    ) -> eyre::Result<HandoffStats> {
        let format = *output.format();
        let output = Arc::new(Mutex::new(Some(output)));
        let produced = Arc::new(AtomicU64::new(0));

        let source = {
            let output = Arc::clone(&output);
            let produced = Arc::clone(&produced);
            PipelineSource::new(
                &SourceKind::File(path),
                format.width,
                format.height,
                Box::new(move |pixels, width, height| {
                    let mut guard = output.lock().unwrap_or_else(PoisonError::into_inner);
                    let Some(output) = guard.as_mut() else {
                        return;
                    };
                    match output.produce(pixels, width, height) {
                        Ok(_) => {
                            produced.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => warn!(error = %err, "Rejected decoded frame"),
                    }
                }),
            )?
        };
        source.play()?;

        let mut failed = false;
        while !stop.load(Ordering::Acquire)
            && frames.is_none_or(|limit| produced.load(Ordering::Relaxed) < limit)
        {
            match source.poll_bus() {
                BusStatus::Playing => thread::sleep(Duration::from_millis(20)),
                BusStatus::EndOfStream => {
                    info!("End of stream");
                    break;
                }
                BusStatus::Failed => {
                    failed = true;
                    break;
                }
            }
        }
        drop(source);

        let output = output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| eyre::eyre!("video output already closed"))?;
        let stats = output.shutdown();

        if failed {
            eyre::bail!("GStreamer pipeline failed");
        }
        Ok(stats)
    }
}

/// Texture that folds every upload into a running checksum.
#[derive(Debug)]
struct ChecksumSink {
    texture: TextureHandle,
    uploads: u64,
    checksum: u32,
}

impl TextureSink for ChecksumSink {
    fn upload(&mut self, frame: FrameView<'_>) -> eyre::Result<()> {
        let expected = frame.stride as usize * frame.height as usize;
        eyre::ensure!(
            frame.data.len() == expected,
            "{} bytes do not fill a {}x{} texture",
            frame.data.len(),
            frame.width,
            frame.height
        );

        self.checksum = frame
            .data
            .iter()
            .fold(self.checksum, |acc, byte| acc.rotate_left(5) ^ u32::from(*byte));
        self.uploads += 1;

        if self.uploads % PROGRESS_EVERY == 0 {
            info!(
                texture = %self.texture,
                uploads = self.uploads,
                checksum = format!("{:08x}", self.checksum),
                "Texture upload progress"
            );
        }
        Ok(())
    }
}

impl Drop for ChecksumSink {
    fn drop(&mut self) {
        debug!(texture = %self.texture, uploads = self.uploads, "Released texture");
    }
}

/// Hands out a fresh checksum texture for any address.
#[derive(Debug)]
struct ChecksumRegistry;

impl TextureRegistry for ChecksumRegistry {
    type Sink = ChecksumSink;

    fn acquire(&self, handle: TextureHandle) -> Option<ChecksumSink> {
        Some(ChecksumSink {
            texture: handle,
            uploads: 0,
            checksum: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_gradient_scrolls() {
        let mut frame = vec![0u8; 2 * 2 * 3];
        fill_gradient(&mut frame, 6, 1);
        assert_eq!(frame, [1, 1, 1, 2, 1, 1, 1, 2, 1, 2, 2, 1]);
    }

    #[test]
    fn test_cli_texture_overrides_default() {
        let cli = Cli::parse_from(["vout-bridge", "--texture", "0x10"]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.texture_handle().unwrap().get(), 16);
    }

    #[test]
    fn test_checksum_sink_rejects_short_frame() {
        let mut sink = ChecksumRegistry.acquire(TextureHandle::new(1).unwrap()).unwrap();
        let frame = FrameView {
            data: &[0; 5],
            width: 1,
            height: 2,
            bytes_per_pixel: 3,
            stride: 3,
            byte_order: vout_bridge::ByteOrder::Bgr,
        };
        assert!(sink.upload(frame).is_err());
        assert_eq!(sink.uploads, 0);
    }
}
