// SPDX-License-Identifier: MPL-2.0

//! Hands decoded video frames from a decoding thread to a single-threaded
//! event loop that copies them into a texture.
//!
//! A [`VideoOutput`] owns one frame buffer. The producer offers frames with
//! [`VideoOutput::produce`], which never waits: each frame is scheduled onto
//! the loop, replaces a frame whose task has not started, or is dropped while
//! the loop is busy copying. [`VideoOutput::shutdown`] blocks until the loop
//! has let go of the buffer and only then releases it.

mod error;
pub mod event_loop;
pub mod format;
mod handoff;
mod output;
mod sink;
mod slot;

#[cfg(feature = "gstreamer")]
pub mod source;

pub use error::BridgeError;
pub use event_loop::{CalloopScheduler, EventLoopAdapter, Task, TaskToken};
pub use format::{ByteOrder, OutputFormat};
pub use handoff::{
    Handoff, HandoffController, HandoffProbe, HandoffState, HandoffStats,
};
pub use output::VideoOutput;
pub use sink::{FrameView, TextureRegistry, TextureSink};
pub use slot::FrameSlot;
pub use vout_bridge_config::{BridgeConfig, ConfigError, TextureHandle};
