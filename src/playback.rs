//! The only writer of audio to the sink.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use tracing::{debug, error, info};

use crate::audio_output::{AudioSink, SinkError};
use crate::queue::{Command, CommandReceiver};

/// Counters updated by the playback worker.
#[derive(Debug, Default)]
pub struct PlaybackStats {
    pub writes: AtomicU64,
    pub bytes: AtomicU64,
    pub stops: AtomicU64,
    /// Commands dropped by producers after a push timeout.
    pub dropped: AtomicU64,
}

impl PlaybackStats {
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn stops(&self) -> u64 {
        self.stops.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct PlaybackWorker<S> {
    sink: S,
    commands: CommandReceiver,
    stats: Arc<PlaybackStats>,
    halted: Arc<AtomicBool>,
}

impl<S: AudioSink + 'static> PlaybackWorker<S> {
    pub fn new(
        sink: S,
        commands: CommandReceiver,
        stats: Arc<PlaybackStats>,
        halted: Arc<AtomicBool>,
    ) -> Self {
        Self {
            sink,
            commands,
            stats,
            halted,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("streamy-playback".into())
            .spawn(move || self.run())
    }

    /// Drains the queue into the sink until every producer is gone.
    ///
    /// A sink failure is fatal: the sink is silenced, the halted flag is raised
    /// and the worker exits, which closes the queue for all producers.
    pub fn run(mut self) {
        info!("[Playback] Worker started. Waiting for commands...");

        match self.drain() {
            Ok(()) => info!(
                "[Playback] Command queue closed. {} writes ({} bytes), {} stops.",
                self.stats.writes(),
                self.stats.bytes(),
                self.stats.stops()
            ),
            Err(e) => {
                error!("[Playback] Fatal audio sink error: {}. Halting playback.", e);
                self.halted.store(true, Ordering::Release);
                if let Err(e) = self.sink.flush() {
                    error!("[Playback] Could not silence sink after failure: {}", e);
                }
            }
        }
    }

    fn drain(&mut self) -> Result<(), SinkError> {
        while let Some(command) = self.commands.pop() {
            match command {
                Command::Stop => {
                    debug!("[Playback] Stop received, zeroing DMA buffers.");
                    self.sink.flush()?;
                    self.stats.stops.fetch_add(1, Ordering::Relaxed);
                }
                Command::Write(pcm) => {
                    let written = self.sink.write(&pcm)?;
                    debug!(
                        "[Playback] Wrote {} bytes, {} commands waiting.",
                        written,
                        self.commands.depth()
                    );
                    self.stats.writes.fetch_add(1, Ordering::Relaxed);
                    self.stats.bytes.fetch_add(written as u64, Ordering::Relaxed);
                    // `pcm` is released here, after the sink accepted it.
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::AudioFormat;
    use crate::queue::CommandQueue;
    use crate::testing::{RecordingSink, SinkEvent};

    fn run_worker(mut sink: RecordingSink, commands: Vec<Command>) -> (Arc<PlaybackStats>, bool) {
        sink.configure(&AudioFormat::default()).unwrap();
        let (queue, rx) = CommandQueue::bounded(commands.len().max(1));
        for command in commands {
            queue.push(command).unwrap();
        }
        drop(queue);

        let stats = Arc::new(PlaybackStats::default());
        let halted = Arc::new(AtomicBool::new(false));
        PlaybackWorker::new(sink, rx, stats.clone(), halted.clone()).run();
        (stats, halted.load(Ordering::Acquire))
    }

    #[test]
    fn writes_in_order_and_flushes_on_stop() {
        let sink = RecordingSink::new();
        let (stats, halted) = run_worker(
            sink.clone(),
            vec![
                Command::Write(b"aaaa".to_vec()),
                Command::Stop,
                Command::Write(b"bbbb".to_vec()),
            ],
        );

        assert!(!halted);
        assert_eq!(
            sink.events(),
            vec![
                SinkEvent::Write(b"aaaa".to_vec()),
                SinkEvent::Flush,
                SinkEvent::Write(b"bbbb".to_vec()),
            ]
        );
        assert_eq!(stats.writes(), 2);
        assert_eq!(stats.bytes(), 8);
        assert_eq!(stats.stops(), 1);
    }

    #[test]
    fn stop_without_audio_just_flushes() {
        let sink = RecordingSink::new();
        let (_, halted) = run_worker(sink.clone(), vec![Command::Stop, Command::Stop]);
        assert!(!halted);
        assert_eq!(sink.events(), vec![SinkEvent::Flush, SinkEvent::Flush]);
    }

    #[test]
    fn sink_failure_halts_worker() {
        let sink = RecordingSink::new();
        sink.fail_writes_after(1);
        let (stats, halted) = run_worker(
            sink.clone(),
            vec![
                Command::Write(vec![1; 4]),
                Command::Write(vec![2; 4]),
                Command::Write(vec![3; 4]),
            ],
        );

        assert!(halted);
        assert_eq!(stats.writes(), 1);
        // The failed write is followed by a best-effort silence, nothing else plays.
        assert_eq!(
            sink.events(),
            vec![SinkEvent::Write(vec![1; 4]), SinkEvent::Flush]
        );
    }
}
