//! Bounded FIFO of playback commands.
//!
//! A full queue blocks producers. That is the device's flow control: a bursty
//! publisher is throttled to the rate at which the playback worker drains chunks
//! into the sink.

use std::fmt;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvError, SendError, SendTimeoutError, Sender};
use thiserror::Error;

pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// One unit of work for the playback worker. The PCM buffer is owned by
/// whichever side currently holds the command.
#[derive(Clone, PartialEq, Eq)]
pub enum Command {
    Write(Vec<u8>),
    Stop,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write(pcm) => write!(f, "Write({} bytes)", pcm.len()),
            Self::Stop => f.write_str("Stop"),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("command queue full, push timed out after {timeout:?}")]
    Timeout { command: Command, timeout: Duration },
    #[error("command queue closed")]
    Closed(Command),
}

/// Producer half. Cloneable; every clone pushes into the same FIFO.
#[derive(Clone)]
pub struct CommandQueue {
    tx: Sender<Command>,
    capacity: usize,
}

/// Consumer half, owned by the playback worker.
pub struct CommandReceiver {
    rx: Receiver<Command>,
}

/// Read-only view of the queue depth for telemetry.
#[derive(Clone)]
pub struct QueueDepth {
    tx: Sender<Command>,
    capacity: usize,
}

impl CommandQueue {
    /// Creates a queue holding at most `capacity` commands (at least one).
    pub fn bounded(capacity: usize) -> (CommandQueue, CommandReceiver) {
        let capacity = capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (CommandQueue { tx, capacity }, CommandReceiver { rx })
    }

    /// Blocks until there is room, then enqueues.
    pub fn push(&self, command: Command) -> Result<(), QueueError> {
        self.tx
            .send(command)
            .map_err(|SendError(command)| QueueError::Closed(command))
    }

    /// Like [`push`](Self::push), but gives the command back after `timeout`.
    pub fn push_timeout(&self, command: Command, timeout: Duration) -> Result<(), QueueError> {
        self.tx.send_timeout(command, timeout).map_err(|e| match e {
            SendTimeoutError::Timeout(command) => QueueError::Timeout { command, timeout },
            SendTimeoutError::Disconnected(command) => QueueError::Closed(command),
        })
    }

    pub fn depth(&self) -> usize {
        self.tx.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn depth_probe(&self) -> QueueDepth {
        QueueDepth {
            tx: self.tx.clone(),
            capacity: self.capacity,
        }
    }
}

impl CommandReceiver {
    /// Blocks until a command arrives. `None` once every producer is gone and
    /// the queue has drained.
    pub fn pop(&self) -> Option<Command> {
        match self.rx.recv() {
            Ok(command) => Some(command),
            Err(RecvError) => None,
        }
    }

    pub fn depth(&self) -> usize {
        self.rx.len()
    }
}

impl QueueDepth {
    /// Commands pushed but not yet popped, always within `[0, capacity]`.
    pub fn get(&self) -> usize {
        self.tx.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn preserves_fifo_order() {
        let (queue, rx) = CommandQueue::bounded(4);
        queue.push(Command::Write(vec![1])).unwrap();
        queue.push(Command::Stop).unwrap();
        queue.push(Command::Write(vec![2])).unwrap();

        assert_eq!(rx.pop(), Some(Command::Write(vec![1])));
        assert_eq!(rx.pop(), Some(Command::Stop));
        assert_eq!(rx.pop(), Some(Command::Write(vec![2])));
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let (queue, _rx) = CommandQueue::bounded(0);
        assert_eq!(queue.capacity(), 1);
        queue.push(Command::Stop).unwrap();
        assert_eq!(queue.depth(), 1);
    }

    #[test]
    fn depth_tracks_unpopped_commands() {
        let (queue, rx) = CommandQueue::bounded(2);
        let probe = queue.depth_probe();
        assert_eq!(probe.get(), 0);

        queue.push(Command::Stop).unwrap();
        queue.push(Command::Stop).unwrap();
        assert_eq!(probe.get(), 2);
        assert_eq!(probe.capacity(), 2);

        rx.pop();
        assert_eq!(probe.get(), 1);
        assert_eq!(rx.depth(), 1);
    }

    #[test]
    fn push_timeout_returns_command_when_full() {
        let (queue, _rx) = CommandQueue::bounded(1);
        queue.push(Command::Stop).unwrap();

        let started = Instant::now();
        let err = queue
            .push_timeout(Command::Write(vec![9; 3]), Duration::from_millis(20))
            .unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(20));
        match err {
            QueueError::Timeout { command, .. } => assert_eq!(command, Command::Write(vec![9; 3])),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn push_blocks_until_a_slot_frees() {
        let (queue, rx) = CommandQueue::bounded(1);
        queue.push(Command::Write(vec![1])).unwrap();

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                queue.push(Command::Write(vec![2])).unwrap();
                Instant::now()
            })
        };

        thread::sleep(Duration::from_millis(50));
        let popped_at = Instant::now();
        assert_eq!(rx.pop(), Some(Command::Write(vec![1])));

        let unblocked_at = producer.join().unwrap();
        assert!(unblocked_at >= popped_at);
        assert_eq!(rx.pop(), Some(Command::Write(vec![2])));
    }

    #[test]
    fn closed_queue_rejects_push() {
        let (queue, rx) = CommandQueue::bounded(1);
        drop(rx);
        assert!(matches!(
            queue.push(Command::Stop),
            Err(QueueError::Closed(Command::Stop))
        ));
    }

    #[test]
    fn pop_ends_after_producers_drop() {
        let (queue, rx) = CommandQueue::bounded(2);
        queue.push(Command::Stop).unwrap();
        drop(queue);
        assert_eq!(rx.pop(), Some(Command::Stop));
        assert_eq!(rx.pop(), None);
    }
}
