//! Public façade of the audio pipeline.
//!
//! The messaging layer talks to [`StreamController`] only: `online` registers the
//! control topics, `handle` routes inbound messages, and `write`/`stop` feed the
//! command queue drained by the playback worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::audio_output::{AudioSink, SinkError};
use crate::format::AudioFormat;
use crate::playback::{PlaybackStats, PlaybackWorker};
use crate::queue::{Command, CommandQueue, DEFAULT_QUEUE_CAPACITY, QueueError};
use crate::telemetry::{DEFAULT_UPDATE_INTERVAL, QUEUE_TOPIC, TelemetryWorker};
use crate::transport::{LinkState, Publisher, Scope, Subscriber};

pub const WRITE_TOPIC: &str = "write";
pub const STOP_TOPIC: &str = "stop";

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("audio sink initialization failed: {0}")]
    Sink(#[from] SinkError),
    #[error("failed to spawn {worker} worker: {source}")]
    Spawn {
        worker: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("command queue full for {0:?}, command dropped")]
    QueueFull(Duration),
    #[error("playback halted after a fatal audio sink error")]
    Halted,
    #[error("stream controller shut down")]
    Closed,
}

/// Runtime knobs of the pipeline besides the audio format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    pub queue_capacity: usize,
    pub update_interval: Duration,
    /// Bound on how long a producer may wait for queue space. `None` waits forever.
    pub push_timeout: Option<Duration>,
    /// Prefix of the control and depth topics; empty means bare `write` / `stop` / `queue`.
    pub namespace: String,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            push_timeout: None,
            namespace: String::new(),
        }
    }
}

type Handler = fn(&StreamController, &[u8]) -> Result<(), StreamError>;

fn topic_in(namespace: &str, name: &str) -> String {
    let namespace = namespace.trim_end_matches('/');
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    }
}

pub struct StreamController {
    format: AudioFormat,
    settings: StreamSettings,
    queue: Mutex<Option<CommandQueue>>,
    routes: HashMap<String, Handler>,
    topics: Vec<String>,
    queue_topic: String,
    stats: Arc<PlaybackStats>,
    halted: Arc<AtomicBool>,
    // Dropping this sender wakes the telemetry worker and ends it.
    telemetry_stop: Mutex<Option<crossbeam_channel::Sender<()>>>,
    playback_handle: Mutex<Option<JoinHandle<()>>>,
    telemetry_handle: Mutex<Option<JoinHandle<()>>>,
}

impl StreamController {
    /// Configures and silences the sink, then starts the playback and telemetry
    /// workers. A sink that cannot be configured is fatal for the device.
    pub fn init<S>(
        format: AudioFormat,
        settings: StreamSettings,
        mut sink: S,
        publisher: Arc<dyn Publisher>,
        link: LinkState,
    ) -> Result<Self, StreamError>
    where
        S: AudioSink + 'static,
    {
        info!(
            "[Stream] Initializing {} Hz / {} bit mono output, {} x {} byte DMA chunks, queue of {}.",
            format.sample_rate(),
            format.bits_per_sample(),
            format.dma_chunk_count(),
            format.chunk_bytes(),
            settings.queue_capacity
        );

        sink.configure(&format)?;
        let (queue, commands) = CommandQueue::bounded(settings.queue_capacity);
        sink.flush()?;

        let stats = Arc::new(PlaybackStats::default());
        let halted = Arc::new(AtomicBool::new(false));
        let (telemetry_stop, telemetry_shutdown) = crossbeam_channel::bounded(1);

        let playback_handle = PlaybackWorker::new(sink, commands, stats.clone(), halted.clone())
            .spawn()
            .map_err(|source| StreamError::Spawn {
                worker: "playback",
                source,
            })?;

        let queue_topic = topic_in(&settings.namespace, QUEUE_TOPIC);
        let telemetry_handle = TelemetryWorker::new(
            queue_topic.clone(),
            queue.depth_probe(),
            publisher,
            link,
            halted.clone(),
            settings.update_interval,
            telemetry_shutdown,
        )
        .spawn()
        .map_err(|source| StreamError::Spawn {
            worker: "telemetry",
            source,
        })?;

        let write_topic = topic_in(&settings.namespace, WRITE_TOPIC);
        let stop_topic = topic_in(&settings.namespace, STOP_TOPIC);
        let mut routes: HashMap<String, Handler> = HashMap::new();
        routes.insert(write_topic.clone(), |controller, payload| {
            controller.write(payload)
        });
        routes.insert(stop_topic.clone(), |controller, _| controller.stop());

        Ok(Self {
            format,
            settings,
            queue: Mutex::new(Some(queue)),
            routes,
            topics: vec![write_topic, stop_topic],
            queue_topic,
            stats,
            halted,
            telemetry_stop: Mutex::new(Some(telemetry_stop)),
            playback_handle: Mutex::new(Some(playback_handle)),
            telemetry_handle: Mutex::new(Some(telemetry_handle)),
        })
    }

    /// Copies `pcm` and queues it for playback. Blocks while the queue is full.
    pub fn write(&self, pcm: &[u8]) -> Result<(), StreamError> {
        self.enqueue(Command::Write(pcm.to_vec()))
    }

    /// Queues a flush of the sink's pending output. The flush happens when the
    /// playback worker reaches the command, not here.
    pub fn stop(&self) -> Result<(), StreamError> {
        self.enqueue(Command::Stop)
    }

    fn enqueue(&self, command: Command) -> Result<(), StreamError> {
        if self.halted() {
            return Err(StreamError::Halted);
        }
        let queue = self.queue.lock().clone().ok_or(StreamError::Closed)?;

        let pushed = match self.settings.push_timeout {
            Some(timeout) => queue.push_timeout(command, timeout),
            None => queue.push(command),
        };
        match pushed {
            Ok(()) => Ok(()),
            Err(QueueError::Timeout { command, timeout }) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("[Stream] Dropping {:?} after waiting {:?}.", command, timeout);
                Err(StreamError::QueueFull(timeout))
            }
            Err(QueueError::Closed(command)) => {
                debug!("[Stream] Queue closed, {:?} discarded.", command);
                if self.halted() {
                    Err(StreamError::Halted)
                } else {
                    Err(StreamError::Closed)
                }
            }
        }
    }

    /// Called when the messaging layer comes online: registers the control topics.
    pub fn online(&self, subscriber: &dyn Subscriber) {
        for topic in &self.topics {
            match subscriber.subscribe(topic, Scope::Local) {
                Ok(()) => debug!("[Stream] Subscribed to '{}'.", topic),
                Err(e) => warn!("[Stream] Failed to subscribe to '{}': {}", topic, e),
            }
        }
    }

    /// Routes an inbound message. Only local-scope messages on the control topics
    /// are acted on; everything else is ignored.
    pub fn handle(&self, topic: &str, payload: &[u8], scope: Scope) {
        if scope != Scope::Local {
            trace!("[Stream] Ignoring {:?} message on '{}'.", scope, topic);
            return;
        }
        let Some(handler) = self.routes.get(topic) else {
            trace!("[Stream] Ignoring message on unknown topic '{}'.", topic);
            return;
        };

        match handler(self, payload) {
            Ok(()) => {}
            Err(e @ StreamError::QueueFull(_)) => {
                warn!("[Stream] '{}' ({} bytes): {}", topic, payload.len(), e)
            }
            Err(e) => error!("[Stream] Failed to queue '{}': {}", topic, e),
        }
    }

    /// Control topics this controller answers to, write first.
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Topic the queue depth is published on.
    pub fn queue_topic(&self) -> &str {
        &self.queue_topic
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn stats(&self) -> &PlaybackStats {
        &self.stats
    }

    /// Commands queued but not yet taken by the playback worker.
    pub fn depth(&self) -> usize {
        self.queue.lock().as_ref().map_or(0, CommandQueue::depth)
    }

    pub fn capacity(&self) -> usize {
        self.settings.queue_capacity.max(1)
    }

    /// True once the playback worker has failed and stopped.
    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Stops telemetry, closes the queue and waits for the playback worker to
    /// play out everything already queued.
    pub fn shutdown(&self) {
        self.telemetry_stop.lock().take();
        if let Some(handle) = self.telemetry_handle.lock().take() {
            if handle.join().is_err() {
                error!("[Stream] Telemetry worker panicked.");
            }
        }

        if self.queue.lock().take().is_some() {
            info!("[Stream] Command queue closed, draining playback...");
        }
        if let Some(handle) = self.playback_handle.lock().take() {
            if handle.join().is_err() {
                error!("[Stream] Playback worker panicked.");
            }
            info!("[Stream] Playback worker stopped.");
        }
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        self.shutdown();
    }
}
