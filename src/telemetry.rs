use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::queue::QueueDepth;
use crate::transport::{LinkState, Publisher, Scope};

/// Name of the depth topic, relative to the controller's namespace.
pub const QUEUE_TOPIC: &str = "queue";
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(100);

/// Periodically reports the command queue depth so the remote publisher can
/// pace itself. Advisory only: a missed or failed sample is never retried.
pub struct TelemetryWorker {
    topic: String,
    depth: QueueDepth,
    publisher: Arc<dyn Publisher>,
    link: LinkState,
    halted: Arc<AtomicBool>,
    interval: Duration,
    shutdown: Receiver<()>,
}

impl TelemetryWorker {
    pub fn new(
        topic: impl Into<String>,
        depth: QueueDepth,
        publisher: Arc<dyn Publisher>,
        link: LinkState,
        halted: Arc<AtomicBool>,
        interval: Duration,
        shutdown: Receiver<()>,
    ) -> Self {
        Self {
            topic: topic.into(),
            depth,
            publisher,
            link,
            halted,
            interval,
            shutdown,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("streamy-telemetry".into())
            .spawn(move || self.run())
    }

    pub fn run(self) {
        info!(
            "[Telemetry] Reporting queue depth on '{}' every {:?} while connected.",
            self.topic, self.interval
        );
        // Sleeps one interval per sample; dropping the shutdown sender wakes it early.
        loop {
            match self.shutdown.recv_timeout(self.interval) {
                Err(RecvTimeoutError::Timeout) => self.sample(),
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("[Telemetry] Worker finished.");
    }

    /// Publishes one depth sample if the link is up and playback is alive.
    /// Once playback has halted nothing drains the queue, so its depth means nothing.
    pub fn sample(&self) {
        if !self.link.is_connected() || self.halted.load(Ordering::Acquire) {
            return;
        }
        let depth = self.depth.get() as i64;
        if let Err(e) = self.publisher.publish(&self.topic, depth, Scope::Local, false) {
            warn!("[Telemetry] Failed to publish queue depth {}: {}", depth, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Command, CommandQueue};
    use crate::testing::{Published, RecordingBroker};
    use std::time::Instant;

    fn worker(broker: &RecordingBroker, queue: &CommandQueue, link: &LinkState) -> TelemetryWorker {
        worker_halted_by(broker, queue, link, Arc::new(AtomicBool::new(false)))
    }

    fn worker_halted_by(
        broker: &RecordingBroker,
        queue: &CommandQueue,
        link: &LinkState,
        halted: Arc<AtomicBool>,
    ) -> TelemetryWorker {
        let (_stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        TelemetryWorker::new(
            QUEUE_TOPIC,
            queue.depth_probe(),
            Arc::new(broker.clone()),
            link.clone(),
            halted,
            Duration::from_millis(10),
            stop_rx,
        )
    }

    #[test]
    fn silent_while_disconnected() {
        let broker = RecordingBroker::new();
        let (queue, _rx) = CommandQueue::bounded(4);
        let link = LinkState::new();

        worker(&broker, &queue, &link).sample();
        assert!(broker.published().is_empty());
    }

    #[test]
    fn publishes_current_depth_when_connected() {
        let broker = RecordingBroker::new();
        let (queue, _rx) = CommandQueue::bounded(4);
        let link = LinkState::new();
        link.set_connected(true);
        queue.push(Command::Stop).unwrap();
        queue.push(Command::Write(vec![0; 2])).unwrap();

        worker(&broker, &queue, &link).sample();
        assert_eq!(
            broker.published(),
            vec![Published {
                topic: QUEUE_TOPIC.to_string(),
                value: 2,
                scope: Scope::Local,
                retain: false,
            }]
        );
    }

    #[test]
    fn silent_once_playback_halted() {
        let broker = RecordingBroker::new();
        let (queue, _rx) = CommandQueue::bounded(4);
        let link = LinkState::new();
        link.set_connected(true);
        queue.push(Command::Write(vec![0; 2])).unwrap();
        let halted = Arc::new(AtomicBool::new(false));
        let worker = worker_halted_by(&broker, &queue, &link, halted.clone());

        worker.sample();
        halted.store(true, Ordering::Release);
        worker.sample();
        worker.sample();

        let samples = broker.published();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 1);
    }

    #[test]
    fn publishes_on_configured_topic() {
        let broker = RecordingBroker::new();
        let (queue, _rx) = CommandQueue::bounded(4);
        let link = LinkState::new();
        link.set_connected(true);
        let (_stop_tx, stop_rx) = crossbeam_channel::bounded(1);

        TelemetryWorker::new(
            "kitchen/queue",
            queue.depth_probe(),
            Arc::new(broker.clone()),
            link,
            Arc::new(AtomicBool::new(false)),
            Duration::from_millis(10),
            stop_rx,
        )
        .sample();
        assert_eq!(broker.published()[0].topic, "kitchen/queue");
    }

    #[test]
    fn publish_failure_is_not_fatal() {
        let broker = RecordingBroker::new();
        let (queue, _rx) = CommandQueue::bounded(4);
        let link = LinkState::new();
        link.set_connected(true);
        let worker = worker(&broker, &queue, &link);

        broker.fail_publishes(true);
        worker.sample();
        broker.fail_publishes(false);
        worker.sample();
        assert_eq!(broker.published().len(), 1);
    }

    #[test]
    fn samples_every_interval_until_shutdown() {
        let broker = RecordingBroker::new();
        let (queue, _rx) = CommandQueue::bounded(4);
        let link = LinkState::new();
        link.set_connected(true);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);

        let handle = TelemetryWorker::new(
            QUEUE_TOPIC,
            queue.depth_probe(),
            Arc::new(broker.clone()),
            link,
            Arc::new(AtomicBool::new(false)),
            Duration::from_millis(5),
            stop_rx,
        )
        .spawn()
        .unwrap();

        std::thread::sleep(Duration::from_millis(60));
        drop(stop_tx);
        handle.join().unwrap();

        let samples = broker.published();
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|p| p.value == 0));
    }

    #[test]
    fn shutdown_interrupts_long_interval() {
        let broker = RecordingBroker::new();
        let (queue, _rx) = CommandQueue::bounded(4);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);

        let handle = TelemetryWorker::new(
            QUEUE_TOPIC,
            queue.depth_probe(),
            Arc::new(broker.clone()),
            LinkState::new(),
            Arc::new(AtomicBool::new(false)),
            Duration::from_secs(60),
            stop_rx,
        )
        .spawn()
        .unwrap();

        let started = Instant::now();
        stop_tx.send(()).unwrap();
        handle.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
