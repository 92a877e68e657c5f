// SPDX-License-Identifier: MPL-2.0

//! GStreamer pipeline that decodes video into packed BGR frames.
//!
//! Frames arrive on GStreamer's streaming thread, which then acts as the
//! producer side of the bridge.

use std::path::{Path, PathBuf};

use gstreamer::prelude::*;
use tracing::{debug, error, trace, warn};

use crate::format::{pack_rows, BYTES_PER_PIXEL};

/// Receives each decoded frame as tightly packed BGR rows.
pub type FrameCallback = Box<dyn FnMut(&[u8], u32, u32) + Send + 'static>;

/// Where decoded frames come from.
#[derive(Debug, Clone)]
pub enum SourceKind {
    /// `videotestsrc` pattern, endless.
    TestPattern,
    /// Any container and codec `decodebin` can handle.
    File(PathBuf),
}

/// Outcome of draining the pipeline bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStatus {
    Playing,
    EndOfStream,
    Failed,
}

#[derive(Debug)]
pub struct PipelineSource {
    pipeline: gstreamer::Pipeline,
}

impl PipelineSource {
    /// Build a paused pipeline scaling `source` to `width` x `height`.
    pub fn new(
        source: &SourceKind,
        width: u32,
        height: u32,
        on_frame: FrameCallback,
    ) -> eyre::Result<Self> {
        gstreamer::init()?;

        let pipeline_str = Self::pipeline_description(source, width, height);
        debug!(pipeline = %pipeline_str, "Creating GStreamer pipeline");

        let pipeline = gstreamer::parse::launch(&pipeline_str)?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| eyre::eyre!("Parsed element is not a pipeline"))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| eyre::eyre!("Failed to get appsink from pipeline"))?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| eyre::eyre!("Element 'sink' is not an AppSink"))?;

        Self::setup_appsink_callback(&appsink, on_frame);

        Ok(Self { pipeline })
    }

    fn pipeline_description(source: &SourceKind, width: u32, height: u32) -> String {
        let head = match source {
            SourceKind::TestPattern => String::from("videotestsrc is-live=true pattern=smpte"),
            SourceKind::File(path) => format!(
                "filesrc location=\"{}\" ! decodebin",
                escape_path(path)
            ),
        };

        format!(
            concat!(
                "{head} ! ",
                "videoconvert ! ",
                "videoscale ! ",
                "video/x-raw,format=BGR,width={width},height={height} ! ",
                "appsink name=sink sync=true max-buffers=1 drop=true"
            ),
            head = head,
            width = width,
            height = height,
        )
    }

    fn setup_appsink_callback(appsink: &gstreamer_app::AppSink, mut on_frame: FrameCallback) {
        let mut packed = Vec::new();
        appsink.set_callbacks(
            gstreamer_app::AppSinkCallbacks::builder()
                .new_sample(move |appsink| {
                    Self::handle_sample(appsink, &mut packed, &mut on_frame);
                    Ok(gstreamer::FlowSuccess::Ok)
                })
                .build(),
        );
    }

    fn handle_sample(
        appsink: &gstreamer_app::AppSink,
        packed: &mut Vec<u8>,
        on_frame: &mut FrameCallback,
    ) {
        let sample = match appsink.pull_sample() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = ?e, "Callback pull_sample failed");
                return;
            }
        };

        let (Some(buffer), Some(caps)) = (sample.buffer(), sample.caps()) else {
            return;
        };

        let Ok(video_info) = gstreamer_video::VideoInfo::from_caps(caps) else {
            return;
        };

        let width = video_info.width();
        let height = video_info.height();
        let Ok(stride) = usize::try_from(video_info.stride()[0]) else {
            warn!(stride = video_info.stride()[0], "Negative stride, skipping frame");
            return;
        };

        let Ok(map) = buffer.map_readable() else {
            trace!("Skipped frame: buffer map blocked");
            return;
        };

        let Some((row_bytes, frame_bytes)) = packed_size(width, height) else {
            warn!(width, height, "Frame too large, skipping");
            return;
        };
        packed.resize(frame_bytes, 0);
        if !pack_rows(map.as_slice(), stride, row_bytes, height as usize, packed) {
            error!(
                data_len = map.as_slice().len(),
                stride,
                width,
                height,
                "Buffer size mismatch"
            );
            return;
        }

        on_frame(&packed[..], width, height);
    }

    pub fn play(&self) -> eyre::Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| eyre::eyre!("Failed to start pipeline: {:?}", e))?;
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }

    /// Drain pending bus messages.
    pub fn poll_bus(&self) -> BusStatus {
        use gstreamer::MessageView;

        let Some(bus) = self.pipeline.bus() else {
            return BusStatus::Playing;
        };

        while let Some(msg) = bus.pop() {
            match msg.view() {
                MessageView::Eos(_) => return BusStatus::EndOfStream,
                MessageView::Error(err) => {
                    error!(
                        src = ?err.src().map(|s| s.path_string()),
                        error = %err.error(),
                        "GStreamer pipeline error"
                    );
                    return BusStatus::Failed;
                }
                MessageView::Warning(warn) => {
                    warn!(
                        src = ?warn.src().map(|s| s.path_string()),
                        error = %warn.error(),
                        "GStreamer pipeline warning"
                    );
                }
                _ => {}
            }
        }

        BusStatus::Playing
    }
}

impl Drop for PipelineSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Row and frame length of packed BGR, computed in `usize`.
fn packed_size(width: u32, height: u32) -> Option<(usize, usize)> {
    let row_bytes = (width as usize).checked_mul(BYTES_PER_PIXEL as usize)?;
    Some((row_bytes, row_bytes.checked_mul(height as usize)?))
}

fn escape_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_caps() {
        let description = PipelineSource::pipeline_description(&SourceKind::TestPattern, 320, 240);
        assert!(description.starts_with("videotestsrc"));
        assert!(description.contains("video/x-raw,format=BGR,width=320,height=240"));
        assert!(description.ends_with("appsink name=sink sync=true max-buffers=1 drop=true"));
    }

    #[test]
    fn test_packed_size_of_wide_rows() {
        assert_eq!(packed_size(4, 2), Some((12, 24)));
        #[cfg(target_pointer_width = "64")]
        assert_eq!(
            packed_size(1_431_655_766, 1),
            Some((4_294_967_298, 4_294_967_298))
        );
    }

    #[test]
    fn test_file_path_is_quoted() {
        let source = SourceKind::File(PathBuf::from("/tmp/a \"b\".mkv"));
        let description = PipelineSource::pipeline_description(&source, 2, 2);
        assert!(description.starts_with("filesrc location=\"/tmp/a \\\"b\\\".mkv\" ! decodebin"));
    }
}
