use cpal::{
    FromSample, SampleFormat, SampleRate, SizedSample, StreamConfig, SupportedStreamConfig,
    SupportedStreamConfigRange,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::mpsc as StdMpsc;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tracing::{debug, error, info};

use super::{AudioSink, SinkError};
use crate::format::AudioFormat;

/// Byte ring standing in for the peripheral's DMA buffers.
struct DmaRing {
    bytes: VecDeque<u8>,
    capacity: usize,
}

impl DmaRing {
    /// Next mono sample as i16, or silence when the ring underruns.
    fn next_sample(&mut self, bytes_per_sample: usize) -> i16 {
        if self.bytes.len() < bytes_per_sample {
            return 0;
        }
        match bytes_per_sample {
            1 => {
                let byte = self.bytes.pop_front().unwrap_or(128);
                (i16::from(byte) - 128) << 8
            }
            _ => {
                let lo = self.bytes.pop_front().unwrap_or(0);
                let hi = self.bytes.pop_front().unwrap_or(0);
                i16::from_le_bytes([lo, hi])
            }
        }
    }
}

/// Ring shared between the writer and the device callback.
struct Shared {
    ring: Mutex<DmaRing>,
    room: Condvar,
    fault: AtomicBool,
}

impl Shared {
    fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(DmaRing {
                bytes: VecDeque::with_capacity(capacity),
                capacity,
            }),
            room: Condvar::new(),
            fault: AtomicBool::new(false),
        }
    }

    /// Copies all of `pcm` into the ring, waiting for the device to make room.
    fn fill(&self, pcm: &[u8]) -> Result<(), SinkError> {
        let mut offset = 0;
        let mut ring = self.ring.lock();
        while offset < pcm.len() {
            if self.fault.load(Ordering::Acquire) {
                return Err(SinkError::Device(
                    "output stream reported an error".to_string(),
                ));
            }
            let room = ring.capacity.saturating_sub(ring.bytes.len());
            if room == 0 {
                self.room.wait(&mut ring);
                continue;
            }
            let end = (offset + room).min(pcm.len());
            ring.bytes.extend(&pcm[offset..end]);
            offset = end;
        }
        Ok(())
    }

    /// Drops everything not yet played and wakes blocked writers.
    fn clear(&self) {
        self.ring.lock().bytes.clear();
        self.room.notify_all();
    }

    /// Marks the device dead; blocked and future writers fail.
    fn fail(&self) {
        let _ring = self.ring.lock();
        self.fault.store(true, Ordering::Release);
        self.room.notify_all();
    }

    /// Device side: plays one buffer's worth of frames out of the ring.
    fn render<T>(&self, data: &mut [T], channels: usize, bytes_per_sample: usize)
    where
        T: SizedSample + FromSample<i16>,
    {
        let mut ring = self.ring.lock();
        for frame in data.chunks_mut(channels.max(1)) {
            let sample = T::from_sample(ring.next_sample(bytes_per_sample));
            for out in frame.iter_mut() {
                *out = sample;
            }
        }
        drop(ring);
        self.room.notify_all();
    }
}

/// Plays PCM through the host's default output device.
///
/// cpal streams are not `Send` on every platform, so a dedicated thread owns the
/// stream for the lifetime of the sink. Writers block on a condition variable
/// until the audio callback has consumed enough of the ring.
pub struct SpeakerAudioOutput {
    shared: Arc<Shared>,
    bytes_per_sample: usize,
    // Dropping the sender releases the device thread.
    thread_stop_sender: Option<StdMpsc::Sender<()>>,
    thread_join_handle: Option<std::thread::JoinHandle<()>>,
}

impl SpeakerAudioOutput {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new(0)),
            bytes_per_sample: 0,
            thread_stop_sender: None,
            thread_join_handle: None,
        }
    }
}

impl Default for SpeakerAudioOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SpeakerAudioOutput {
    fn drop(&mut self) {
        if self.thread_join_handle.is_some() {
            info!("Dropping SpeakerAudioOutput, ensuring cpal thread is stopped.");
            self.thread_stop_sender.take();
            if let Some(handle) = self.thread_join_handle.take() {
                if let Err(e) = handle.join() {
                    error!("Error joining cpal speaker output thread on drop: {:?}", e);
                }
            }
        }
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    shared: Arc<Shared>,
    bytes_per_sample: usize,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<i16>,
{
    let channels = usize::from(config.channels);
    let err_shared = shared.clone();

    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            shared.render(data, channels, bytes_per_sample);
        },
        move |err| {
            error!("[cpal-speaker-thread] Audio output error: {}", err);
            err_shared.fail();
        },
        None,
    )
}

/// Picks an i16 or f32 config whose rate range covers `sample_rate`,
/// preferring the fewest channels and then i16.
fn pick_output_config(
    configs: impl Iterator<Item = SupportedStreamConfigRange>,
    sample_rate: u32,
) -> Result<SupportedStreamConfig, SinkError> {
    let rate = SampleRate(sample_rate);
    configs
        .filter(|c| matches!(c.sample_format(), SampleFormat::I16 | SampleFormat::F32))
        .filter(|c| c.min_sample_rate() <= rate && rate <= c.max_sample_rate())
        .min_by_key(|c| (c.channels(), c.sample_format() != SampleFormat::I16))
        .map(|c| c.with_sample_rate(rate))
        .ok_or_else(|| {
            SinkError::UnsupportedFormat(format!(
                "no i16/f32 output config plays {sample_rate} Hz"
            ))
        })
}

fn open_stream(
    sample_rate: u32,
    shared: Arc<Shared>,
    bytes_per_sample: usize,
) -> Result<cpal::Stream, SinkError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(SinkError::NoDevice)?;
    info!(
        "[cpal-speaker-thread] Using output device: {}",
        device.name().unwrap_or_default()
    );

    let configs = device
        .supported_output_configs()
        .map_err(|e| SinkError::Device(e.to_string()))?;
    let supported = pick_output_config(configs, sample_rate)?;
    let config: StreamConfig = supported.config();
    info!(
        "[cpal-speaker-thread] Selected output config: {:?}, Format: {:?}",
        config,
        supported.sample_format()
    );

    let stream = match supported.sample_format() {
        SampleFormat::I16 => build_stream::<i16>(&device, &config, shared, bytes_per_sample),
        SampleFormat::F32 => build_stream::<f32>(&device, &config, shared, bytes_per_sample),
        other => {
            return Err(SinkError::UnsupportedFormat(format!(
                "device sample format {other:?}"
            )));
        }
    }
    .map_err(|e| SinkError::Device(e.to_string()))?;

    stream
        .play()
        .map_err(|e| SinkError::Device(e.to_string()))?;
    Ok(stream)
}

impl AudioSink for SpeakerAudioOutput {
    fn configure(&mut self, format: &AudioFormat) -> Result<(), SinkError> {
        if self.thread_join_handle.is_some() {
            return Err(SinkError::AlreadyConfigured);
        }
        if !matches!(format.bits_per_sample(), 8 | 16) {
            return Err(SinkError::UnsupportedFormat(format!(
                "{} bits per sample (speaker output plays 8 or 16 bit)",
                format.bits_per_sample()
            )));
        }

        let pins = format.pins();
        debug!(
            "[SpeakerOutput] Pins clk={} data={} ws={} have no meaning on host audio.",
            pins.clock, pins.data, pins.word_select
        );

        self.shared = Arc::new(Shared::new(format.dma_capacity_bytes()));
        self.bytes_per_sample = format.bytes_per_sample();

        let (ready_tx, ready_rx) = StdMpsc::channel::<Result<(), SinkError>>();
        let (stop_tx, stop_rx) = StdMpsc::channel::<()>();
        let shared = self.shared.clone();
        let sample_rate = format.sample_rate();
        let bytes_per_sample = self.bytes_per_sample;

        let join_handle = std::thread::Builder::new()
            .name("cpal-speaker-output-thread".into())
            .spawn(move || {
                let stream = match open_stream(sample_rate, shared, bytes_per_sample) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                info!("[cpal-speaker-thread] Speaker stream playing.");
                let _ = ready_tx.send(Ok(()));

                // Park until the sink is dropped.
                let _ = stop_rx.recv();
                info!("[cpal-speaker-thread] Stopping speaker stream playback.");
                drop(stream);
            })
            .map_err(|e| SinkError::Device(format!("failed to spawn cpal thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.thread_stop_sender = Some(stop_tx);
                self.thread_join_handle = Some(join_handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = join_handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = join_handle.join();
                Err(SinkError::Terminated)
            }
        }
    }

    fn write(&mut self, pcm: &[u8]) -> Result<usize, SinkError> {
        if self.thread_join_handle.is_none() {
            return Err(SinkError::NotConfigured);
        }
        self.shared.fill(pcm)?;
        Ok(pcm.len())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        if self.thread_join_handle.is_none() {
            return Err(SinkError::NotConfigured);
        }
        self.shared.clear();
        Ok(())
    }
}
