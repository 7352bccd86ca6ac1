//! Buffered PCM output pipeline for a networked speaker.
//!
//! Remote publishers deliver raw PCM chunks over a messaging link. The
//! [`StreamController`](controller::StreamController) copies each chunk into a
//! bounded command queue; a dedicated playback worker drains the queue into a
//! DMA-paced [`AudioSink`](audio_output::AudioSink), and a telemetry worker
//! reports the queue depth back so publishers can pace themselves.

pub mod audio_output;
pub mod config;
pub mod controller;
pub mod format;
pub mod playback;
pub mod queue;
pub mod telemetry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

pub use audio_output::{AudioSink, SinkError, SinkKind};
pub use controller::{StreamController, StreamError, StreamSettings};
pub use format::{AudioFormat, FormatError, PinConfig};
pub use queue::{Command, CommandQueue};
pub use transport::{LinkState, Publisher, Scope, Subscriber};
