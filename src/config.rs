use anyhow::{Context, Result, anyhow};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::audio_output::SinkKind;
use crate::controller::StreamSettings;
use crate::format::{
    AudioFormat, DEFAULT_BITS_PER_SAMPLE, DEFAULT_DMA_CHUNK_COUNT, DEFAULT_DMA_CHUNK_MS,
    DEFAULT_PIN_CLK, DEFAULT_PIN_DATA, DEFAULT_PIN_LRC, DEFAULT_SAMPLE_RATE, PinConfig,
};
use crate::queue::DEFAULT_QUEUE_CAPACITY;

pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:7000";
const DEFAULT_UPDATE_MS: u64 = 100;

pub struct Config {
    pub format: AudioFormat,
    pub settings: StreamSettings,
    pub sink: SinkKind,
    pub listen_address: String,
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("{}", e))
            .with_context(|| format!("Invalid {}: '{}'", key, raw)),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let pins = PinConfig {
            clock: parse_or(&lookup, "STREAMY_PIN_CLK", DEFAULT_PIN_CLK)?,
            data: parse_or(&lookup, "STREAMY_PIN_DATA", DEFAULT_PIN_DATA)?,
            word_select: parse_or(&lookup, "STREAMY_PIN_LRC", DEFAULT_PIN_LRC)?,
        };
        let sample_rate = parse_or(&lookup, "STREAMY_SAMPLE_RATE", DEFAULT_SAMPLE_RATE)?;
        let bit_rate = parse_or(&lookup, "STREAMY_BIT_RATE", DEFAULT_BITS_PER_SAMPLE)?;
        let dma_chunk_ms = parse_or(&lookup, "STREAMY_DMA_CHUNK_MS", DEFAULT_DMA_CHUNK_MS)?;
        let dma_chunks = parse_or(&lookup, "STREAMY_DMA_CHUNKS", DEFAULT_DMA_CHUNK_COUNT)?;

        let format = AudioFormat::new(pins, sample_rate, bit_rate, dma_chunk_ms, dma_chunks)
            .context("Invalid audio output configuration")?;

        let queue_capacity = parse_or(&lookup, "STREAMY_QUEUE_LENGTH", DEFAULT_QUEUE_CAPACITY)?;
        if queue_capacity == 0 {
            return Err(anyhow!("STREAMY_QUEUE_LENGTH must be at least 1."));
        }
        let update_ms = parse_or(&lookup, "STREAMY_UPDATE_MS", DEFAULT_UPDATE_MS)?;
        if update_ms == 0 {
            return Err(anyhow!("STREAMY_UPDATE_MS must be at least 1."));
        }
        let push_timeout = match lookup("STREAMY_PUSH_TIMEOUT_MS") {
            Some(raw) if !raw.trim().is_empty() => Some(Duration::from_millis(
                raw.trim()
                    .parse::<u64>()
                    .with_context(|| format!("Invalid STREAMY_PUSH_TIMEOUT_MS: '{}'", raw))?,
            )),
            _ => None,
        };
        let namespace = lookup("STREAMY_NAMESPACE").unwrap_or_default();

        let sink = lookup("STREAMY_SINK")
            .unwrap_or_else(|| "SPEAKER".to_string())
            .parse::<SinkKind>()
            .map_err(|e| anyhow!(e))?;
        let listen_address =
            lookup("STREAMY_LISTEN_ADDRESS").unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_string());

        if sample_rate != DEFAULT_SAMPLE_RATE {
            tracing::warn!(
                "STREAMY_SAMPLE_RATE is set to {}. Remote publishers must encode at the same rate; nothing is resampled.",
                sample_rate
            );
        }
        if update_ms > 1000 {
            tracing::warn!(
                "STREAMY_UPDATE_MS is {} ms. Publishers pacing on queue depth will react slowly.",
                update_ms
            );
        }

        Ok(Self {
            format,
            settings: StreamSettings {
                queue_capacity,
                update_interval: Duration::from_millis(update_ms),
                push_timeout,
                namespace,
            },
            sink,
            listen_address,
        })
    }
}
