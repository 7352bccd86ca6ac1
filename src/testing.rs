//! Recording doubles for the sink and the messaging layer.
//!
//! They capture what the pipeline does instead of touching hardware or a network,
//! and let tests hold the sink to simulate a DMA ring that has no room.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::audio_output::{AudioSink, SinkError};
use crate::format::AudioFormat;
use crate::transport::{Publisher, Scope, Subscriber, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Write(Vec<u8>),
    Flush,
}

#[derive(Default)]
struct SinkState {
    format: Option<AudioFormat>,
    events: Vec<SinkEvent>,
    held: bool,
    writes_entered: usize,
    writes_done: usize,
    fail_after: Option<usize>,
}

#[derive(Default)]
struct SinkInner {
    state: Mutex<SinkState>,
    changed: Condvar,
}

/// Sink that records every write and flush. Clones share the same record.
#[derive(Clone, Default)]
pub struct RecordingSink {
    inner: Arc<SinkInner>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.inner.state.lock().events.clone()
    }

    /// Concatenation of every byte written, flushes ignored.
    pub fn written_bytes(&self) -> Vec<u8> {
        self.inner.state.lock()
            .events
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Write(pcm) => Some(pcm.as_slice()),
                SinkEvent::Flush => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    pub fn format(&self) -> Option<AudioFormat> {
        self.inner.state.lock().format.clone()
    }

    /// Makes subsequent writes block until [`release`](Self::release).
    pub fn hold(&self) {
        self.inner.state.lock().held = true;
    }

    pub fn release(&self) {
        self.inner.state.lock().held = false;
        self.inner.changed.notify_all();
    }

    /// Writes after the first `count` successful ones fail with a device error.
    pub fn fail_writes_after(&self, count: usize) {
        self.inner.state.lock().fail_after = Some(count);
    }

    /// Waits until at least `count` writes have entered the sink, held or not.
    pub fn wait_for_writes_entered(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.writes_entered >= count)
    }

    /// Waits until at least `count` events have been recorded.
    pub fn wait_for_events(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.events.len() >= count)
    }

    fn wait_until(&self, timeout: Duration, done: impl Fn(&SinkState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !done(&state) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.inner.changed.wait_for(&mut state, deadline - now);
        }
        true
    }
}

impl AudioSink for RecordingSink {
    fn configure(&mut self, format: &AudioFormat) -> Result<(), SinkError> {
        let mut state = self.inner.state.lock();
        if state.format.is_some() {
            return Err(SinkError::AlreadyConfigured);
        }
        state.format = Some(format.clone());
        Ok(())
    }

    fn write(&mut self, pcm: &[u8]) -> Result<usize, SinkError> {
        let mut state = self.inner.state.lock();
        if state.format.is_none() {
            return Err(SinkError::NotConfigured);
        }
        state.writes_entered += 1;
        self.inner.changed.notify_all();

        while state.held {
            self.inner.changed.wait(&mut state);
        }

        if state.fail_after.is_some_and(|limit| state.writes_done >= limit) {
            return Err(SinkError::Device("injected write failure".to_string()));
        }

        state.events.push(SinkEvent::Write(pcm.to_vec()));
        state.writes_done += 1;
        self.inner.changed.notify_all();
        Ok(pcm.len())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        let mut state = self.inner.state.lock();
        if state.format.is_none() {
            return Err(SinkError::NotConfigured);
        }
        state.events.push(SinkEvent::Flush);
        self.inner.changed.notify_all();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub value: i64,
    pub scope: Scope,
    pub retain: bool,
}

#[derive(Default)]
struct BrokerState {
    published: Vec<Published>,
    subscriptions: Vec<(String, Scope)>,
    fail_publish: bool,
}

/// In-memory stand-in for the messaging layer.
#[derive(Clone, Default)]
pub struct RecordingBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl RecordingBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().published.clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, Scope)> {
        self.state.lock().subscriptions.clone()
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.state.lock().fail_publish = fail;
    }
}

impl Publisher for RecordingBroker {
    fn publish(
        &self,
        topic: &str,
        value: i64,
        scope: Scope,
        retain: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.fail_publish {
            return Err(TransportError::NotConnected);
        }
        state.published.push(Published {
            topic: topic.to_string(),
            value,
            scope,
            retain,
        });
        Ok(())
    }
}

impl Subscriber for RecordingBroker {
    fn subscribe(&self, topic: &str, scope: Scope) -> Result<(), TransportError> {
        self.state.lock()
            .subscriptions
            .push((topic.to_string(), scope));
        Ok(())
    }
}
