use std::time::Duration;

use thiserror::Error;

/// Largest number of frames a single DMA descriptor can carry.
pub const MAX_DMA_FRAMES: u32 = 1024;

pub const DEFAULT_PIN_CLK: u8 = 12;
pub const DEFAULT_PIN_DATA: u8 = 13;
pub const DEFAULT_PIN_LRC: u8 = 14;
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;
pub const DEFAULT_BITS_PER_SAMPLE: u16 = 16;
pub const DEFAULT_DMA_CHUNK_MS: u32 = 10;
pub const DEFAULT_DMA_CHUNK_COUNT: u32 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("sample rate must be positive")]
    ZeroSampleRate,
    #[error("unsupported bits per sample: {0} (expected 8, 16, 24 or 32)")]
    UnsupportedBits(u16),
    #[error("DMA chunk duration must be positive")]
    ZeroChunkDuration,
    #[error("DMA chunk count {0} out of range (2..=128)")]
    ChunkCount(u32),
    #[error("DMA chunk of {frames} frames exceeds the {max} frame descriptor limit")]
    ChunkTooLong { frames: u32, max: u32 },
    #[error("DMA chunk rounds down to zero bytes")]
    EmptyChunk,
}

/// Output pin assignment of the digital audio peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinConfig {
    pub clock: u8,
    pub data: u8,
    pub word_select: u8,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            clock: DEFAULT_PIN_CLK,
            data: DEFAULT_PIN_DATA,
            word_select: DEFAULT_PIN_LRC,
        }
    }
}

/// Mono PCM output format plus DMA buffering parameters.
///
/// The DMA chunk size is derived once in [`AudioFormat::new`] and stored; nothing
/// recomputes it while a stream is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    pins: PinConfig,
    sample_rate: u32,
    bits_per_sample: u16,
    dma_chunk_ms: u32,
    dma_chunk_count: u32,
    chunk_bytes: usize,
}

impl AudioFormat {
    pub fn new(
        pins: PinConfig,
        sample_rate: u32,
        bits_per_sample: u16,
        dma_chunk_ms: u32,
        dma_chunk_count: u32,
    ) -> Result<Self, FormatError> {
        if sample_rate == 0 {
            return Err(FormatError::ZeroSampleRate);
        }
        if !matches!(bits_per_sample, 8 | 16 | 24 | 32) {
            return Err(FormatError::UnsupportedBits(bits_per_sample));
        }
        if dma_chunk_ms == 0 {
            return Err(FormatError::ZeroChunkDuration);
        }
        if !(2..=128).contains(&dma_chunk_count) {
            return Err(FormatError::ChunkCount(dma_chunk_count));
        }

        let frames = u64::from(sample_rate) * u64::from(dma_chunk_ms) / 1000;
        if frames > u64::from(MAX_DMA_FRAMES) {
            return Err(FormatError::ChunkTooLong {
                frames: frames.min(u64::from(u32::MAX)) as u32,
                max: MAX_DMA_FRAMES,
            });
        }

        let chunk_bytes = u64::from(sample_rate)
            * u64::from(dma_chunk_ms)
            * u64::from(bits_per_sample / 8)
            / 1000;
        if chunk_bytes == 0 {
            return Err(FormatError::EmptyChunk);
        }

        Ok(Self {
            pins,
            sample_rate,
            bits_per_sample,
            dma_chunk_ms,
            dma_chunk_count,
            chunk_bytes: chunk_bytes as usize,
        })
    }

    pub fn pins(&self) -> PinConfig {
        self.pins
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn bits_per_sample(&self) -> u16 {
        self.bits_per_sample
    }

    pub fn bytes_per_sample(&self) -> usize {
        usize::from(self.bits_per_sample / 8)
    }

    /// Always mono.
    pub fn channels(&self) -> u16 {
        1
    }

    pub fn dma_chunk_ms(&self) -> u32 {
        self.dma_chunk_ms
    }

    pub fn dma_chunk_count(&self) -> u32 {
        self.dma_chunk_count
    }

    /// Bytes carried by one DMA chunk.
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    pub fn chunk_frames(&self) -> usize {
        self.chunk_bytes / self.bytes_per_sample()
    }

    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.bytes_per_sample()
    }

    /// Total bytes the DMA ring holds before a write has to wait.
    pub fn dma_capacity_bytes(&self) -> usize {
        self.chunk_bytes * self.dma_chunk_count as usize
    }

    /// Audio duration buffered by a full DMA ring.
    pub fn dma_latency(&self) -> Duration {
        Duration::from_millis(u64::from(self.dma_chunk_ms) * u64::from(self.dma_chunk_count))
    }

    /// Playback duration of `bytes` of PCM in this format.
    pub fn duration_of(&self, bytes: usize) -> Duration {
        Duration::from_secs_f64(bytes as f64 / self.bytes_per_second() as f64)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            pins: PinConfig::default(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            bits_per_sample: DEFAULT_BITS_PER_SAMPLE,
            dma_chunk_ms: DEFAULT_DMA_CHUNK_MS,
            dma_chunk_count: DEFAULT_DMA_CHUNK_COUNT,
            chunk_bytes: 882,
        }
    }
}
