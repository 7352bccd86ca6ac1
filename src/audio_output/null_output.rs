use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::{AudioSink, SinkError};
use crate::format::AudioFormat;

/// Software model of the DMA ring: bytes enter on write and leave at the
/// configured byte rate.
struct DmaModel {
    capacity: usize,
    bytes_per_second: usize,
    chunk_period: Duration,
    level: usize,
    last_drain: Instant,
}

impl DmaModel {
    fn drain(&mut self) {
        let now = Instant::now();
        if self.level == 0 {
            self.last_drain = now;
            return;
        }

        let elapsed = now.duration_since(self.last_drain);
        let drained = (elapsed.as_secs_f64() * self.bytes_per_second as f64) as usize;
        if drained == 0 {
            return;
        }

        if drained >= self.level {
            self.level = 0;
            self.last_drain = now;
        } else {
            self.level -= drained;
            self.last_drain +=
                Duration::from_secs_f64(drained as f64 / self.bytes_per_second as f64);
        }
    }
}

/// Sink for devices without audio hardware. Audio is discarded, but writes are
/// paced exactly like a DMA-driven peripheral so upstream flow control behaves
/// the same.
pub struct NullAudioOutput {
    dma: Option<DmaModel>,
}

impl NullAudioOutput {
    pub fn new() -> Self {
        Self { dma: None }
    }

    /// Bytes currently held by the simulated DMA ring.
    pub fn buffered(&mut self) -> usize {
        match self.dma.as_mut() {
            Some(dma) => {
                dma.drain();
                dma.level
            }
            None => 0,
        }
    }
}

impl Default for NullAudioOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for NullAudioOutput {
    fn configure(&mut self, format: &AudioFormat) -> Result<(), SinkError> {
        if self.dma.is_some() {
            return Err(SinkError::AlreadyConfigured);
        }
        info!(
            "[NullOutput] Simulating {} x {} byte DMA buffers at {} B/s.",
            format.dma_chunk_count(),
            format.chunk_bytes(),
            format.bytes_per_second()
        );
        self.dma = Some(DmaModel {
            capacity: format.dma_capacity_bytes(),
            bytes_per_second: format.bytes_per_second(),
            chunk_period: Duration::from_millis(u64::from(format.dma_chunk_ms())),
            level: 0,
            last_drain: Instant::now(),
        });
        Ok(())
    }

    fn write(&mut self, pcm: &[u8]) -> Result<usize, SinkError> {
        let dma = self.dma.as_mut().ok_or(SinkError::NotConfigured)?;

        let mut remaining = pcm.len();
        while remaining > 0 {
            dma.drain();
            let room = dma.capacity - dma.level;
            if room == 0 {
                thread::sleep(dma.chunk_period);
                continue;
            }
            let accepted = room.min(remaining);
            dma.level += accepted;
            remaining -= accepted;
        }

        debug!("[NullOutput] Accepted {} bytes.", pcm.len());
        Ok(pcm.len())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        let dma = self.dma.as_mut().ok_or(SinkError::NotConfigured)?;
        dma.level = 0;
        dma.last_drain = Instant::now();
        Ok(())
    }
}
