use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

use crate::controller::StreamController;

pub mod frame;
pub mod tcp;

/// Delivery scope of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Sent by the peer directly attached to this device.
    Local,
    /// Relayed from elsewhere in the network.
    Global,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("outbound buffer full, message dropped")]
    Backlogged,
    #[error("invalid topic '{0}'")]
    InvalidTopic(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Network connectivity as seen by the messaging layer.
///
/// Single writer (transport lifecycle), any number of readers. Readers may see a
/// stale value for a moment, which only delays telemetry.
#[derive(Debug, Clone, Default)]
pub struct LinkState(Arc<AtomicBool>);

impl LinkState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.0.store(connected, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Outbound half of the messaging layer.
pub trait Publisher: Send + Sync {
    /// Best-effort publish of an integer value. Must not block.
    fn publish(&self, topic: &str, value: i64, scope: Scope, retain: bool)
    -> Result<(), TransportError>;
}

/// Subscription registry of the messaging layer.
pub trait Subscriber {
    fn subscribe(&self, topic: &str, scope: Scope) -> Result<(), TransportError>;
}

/// A messaging transport that feeds control messages into a controller.
#[async_trait]
pub trait AsyncTransport: Send + Sync {
    /// Serves peers until [`shutdown`](Self::shutdown) is called or the transport fails.
    async fn run(&self, controller: Arc<StreamController>) -> Result<()>;

    /// Signals `run` to return.
    async fn shutdown(&self) -> Result<()>;
}
