use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, Sender, error::TrySendError};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::frame::{Frame, FrameCodec};
use super::{AsyncTransport, LinkState, Publisher, Scope, Subscriber, TransportError};
use crate::controller::StreamController;

/// Frames waiting to be written to the peer before publishes start failing.
const OUTBOUND_CAPACITY: usize = 32;

/// Topics the attached peer may deliver, with their scope.
#[derive(Default)]
pub struct Subscriptions(Mutex<HashSet<(String, Scope)>>);

impl Subscriptions {
    pub fn contains(&self, topic: &str, scope: Scope) -> bool {
        self.0.lock().contains(&(topic.to_string(), scope))
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

impl Subscriber for Subscriptions {
    fn subscribe(&self, topic: &str, scope: Scope) -> Result<(), TransportError> {
        if topic.is_empty() {
            return Err(TransportError::InvalidTopic(topic.to_string()));
        }
        self.0.lock().insert((topic.to_string(), scope));
        Ok(())
    }
}

/// Publishing handle that outlives individual connections.
#[derive(Clone, Default)]
pub struct TcpPublisher {
    outbound: Arc<Mutex<Option<Sender<Frame>>>>,
}

impl Publisher for TcpPublisher {
    fn publish(
        &self,
        topic: &str,
        value: i64,
        scope: Scope,
        retain: bool,
    ) -> Result<(), TransportError> {
        let guard = self.outbound.lock();
        let tx = guard.as_ref().ok_or(TransportError::NotConnected)?;
        if retain {
            trace!("[TCP] Retain requested for '{}', direct links do not retain.", topic);
        }
        tx.try_send(Frame::new(scope, topic, value.to_string()))
            .map_err(|e| match e {
                TrySendError::Full(_) => TransportError::Backlogged,
                TrySendError::Closed(_) => TransportError::NotConnected,
            })
    }
}

/// Control link over TCP. The device listens; one controlling peer is served at
/// a time and further peers wait in the accept backlog.
pub struct TcpTransport {
    listener: tokio::sync::Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    link: LinkState,
    subscriptions: Arc<Subscriptions>,
    publisher: TcpPublisher,
    cancel: CancellationToken,
}

impl TcpTransport {
    pub async fn bind(address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("Failed to bind TCP control listener to {}", address))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read TCP listener address")?;
        info!("[TCP] Listening for controllers on {}", local_addr);

        Ok(Self {
            listener: tokio::sync::Mutex::new(Some(listener)),
            local_addr,
            link: LinkState::new(),
            subscriptions: Arc::new(Subscriptions::default()),
            publisher: TcpPublisher::default(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connectivity cell driven by this transport.
    pub fn link(&self) -> LinkState {
        self.link.clone()
    }

    pub fn publisher(&self) -> Arc<dyn Publisher> {
        Arc::new(self.publisher.clone())
    }

    async fn serve_peer(&self, stream: TcpStream, peer: SocketAddr, controller: &Arc<StreamController>) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("[TCP] Could not disable Nagle for {}: {}", peer, e);
        }
        let (mut frame_sink, mut frames) = Framed::new(stream, FrameCodec).split();
        let (tx, mut rx) = mpsc::channel::<Frame>(OUTBOUND_CAPACITY);

        *self.publisher.outbound.lock() = Some(tx);
        self.link.set_connected(true);
        controller.online(self.subscriptions.as_ref());

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = frame_sink.send(frame).await {
                    warn!("[TCP] Failed to send frame to {}: {}", peer, e);
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("[TCP] Shutdown requested, closing connection to {}.", peer);
                    break;
                }
                next = frames.next() => match next {
                    Some(Ok(frame)) => {
                        if !self.subscriptions.contains(&frame.topic, frame.scope) {
                            trace!("[TCP] Dropping unsubscribed {:?} frame on '{}'.", frame.scope, frame.topic);
                            continue;
                        }
                        // Pushing may block on a full command queue; that stalls this
                        // reader, which is the backpressure the peer should feel.
                        let controller = controller.clone();
                        let Frame { scope, topic, payload } = frame;
                        if let Err(e) = tokio::task::spawn_blocking(move || {
                            controller.handle(&topic, &payload, scope)
                        })
                        .await
                        {
                            error!("[TCP] Message handler failed: {}", e);
                        }
                    }
                    Some(Err(e)) => {
                        warn!("[TCP] Malformed frame from {}: {}. Closing connection.", peer, e);
                        break;
                    }
                    None => {
                        info!("[TCP] Controller {} disconnected.", peer);
                        break;
                    }
                }
            }
        }

        self.link.set_connected(false);
        self.subscriptions.clear();
        self.publisher.outbound.lock().take();
        if let Err(e) = writer.await {
            error!("[TCP] Writer task for {} failed: {}", peer, e);
        }
    }
}

#[async_trait]
impl AsyncTransport for TcpTransport {
    async fn run(&self, controller: Arc<StreamController>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("TCP transport is already running"))?;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!("[TCP] Controller connected from {}", peer);
                        self.serve_peer(stream, peer, &controller).await;
                    }
                    Err(e) => {
                        warn!("[TCP] Failed to accept connection: {}", e);
                    }
                }
            }
        }
        info!("[TCP] Transport stopped.");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}
