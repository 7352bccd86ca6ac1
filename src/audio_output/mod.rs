use std::str::FromStr;

use thiserror::Error;

use crate::format::AudioFormat;

pub mod null_output;
pub mod speaker_output;

pub use null_output::NullAudioOutput;
pub use speaker_output::SpeakerAudioOutput;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("audio sink used before configure()")]
    NotConfigured,
    #[error("audio sink already configured")]
    AlreadyConfigured,
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("no default output device")]
    NoDevice,
    #[error("audio device error: {0}")]
    Device(String),
    #[error("audio output thread terminated")]
    Terminated,
}

/// Hardware digital-audio output with DMA-paced consumption.
///
/// Implementations accept mono little-endian PCM in the configured format.
/// `write` blocks until every byte has been accepted into the DMA buffers,
/// so a slow sink pushes backpressure upstream instead of dropping audio.
pub trait AudioSink: Send {
    /// Installs the driver for `format`. Called once before any write.
    fn configure(&mut self, format: &AudioFormat) -> Result<(), SinkError>;

    /// Blocks until all of `pcm` is queued for output, returning the byte count.
    fn write(&mut self, pcm: &[u8]) -> Result<usize, SinkError>;

    /// Silences everything buffered but not yet played.
    fn flush(&mut self) -> Result<(), SinkError>;
}

impl<S: AudioSink + ?Sized> AudioSink for Box<S> {
    fn configure(&mut self, format: &AudioFormat) -> Result<(), SinkError> {
        (**self).configure(format)
    }

    fn write(&mut self, pcm: &[u8]) -> Result<usize, SinkError> {
        (**self).write(pcm)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }
}

/// Output backend selected through configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    /// Host default output device via cpal.
    Speaker,
    /// Discards audio at the real-time byte rate.
    Null,
}

impl FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "SPEAKER" => Ok(Self::Speaker),
            "NULL" | "NONE" | "" => Ok(Self::Null),
            other => Err(format!(
                "invalid audio sink '{other}', use SPEAKER or NULL"
            )),
        }
    }
}

pub fn create_sink(kind: SinkKind) -> Box<dyn AudioSink> {
    match kind {
        SinkKind::Speaker => Box::new(SpeakerAudioOutput::new()),
        SinkKind::Null => Box::new(NullAudioOutput::new()),
    }
}
