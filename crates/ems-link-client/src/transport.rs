//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "JSON-RPC session client over WebSocket."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Physical connection handling.
//!
//! A [`Connector`] opens one duplex text link. The [`ConnectionManager`]
//! owns the current link, forwards its frames to the dispatch loop tagged
//! with a generation number and schedules reconnects after unexpected closes.
//! Events carrying an outdated generation are ignored by the manager.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use url::Url;

use crate::backoff::ReconnectPolicy;
use crate::error::{ClientError, Result};

/// Something read from an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One text frame.
    Frame(String),
    /// The link is gone; carries the close reason when the peer sent one.
    Closed(Option<String>),
}

/// An open duplex text link.
///
/// Dropping the outbound sender lets the writer close the connection
/// gracefully; background tasks attached with [`Link::with_task`] are aborted
/// when the link is torn down.
#[derive(Debug)]
pub struct Link {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    tasks: Vec<AbortHandle>,
}

impl Link {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            tasks: Vec::new(),
        }
    }

    /// Tie a background task's lifetime to the link.
    pub fn with_task(mut self, task: AbortHandle) -> Self {
        self.tasks.push(task);
        self
    }
}

/// Opens links to a URL.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<Link>;
}

/// [`Connector`] speaking WebSocket text frames via `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<Link> {
        let (stream, response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        debug!(url = %url, status = %response.status(), "websocket handshake complete");

        let (mut sink, mut source) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = sink.send(WsMessage::Text(text)).await {
                    warn!(error = %err, "websocket write failed");
                    return;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        if inbound_tx.send(TransportEvent::Frame(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if inbound_tx.send(TransportEvent::Frame(text)).is_err() {
                                return;
                            }
                        }
                        Err(_) => warn!("dropping non utf-8 binary frame"),
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        break frame.map(|frame| frame.reason.into_owned());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break Some(err.to_string()),
                    None => break None,
                }
            };
            let _ = inbound_tx.send(TransportEvent::Closed(reason));
        });

        Ok(Link::new(outbound, inbound).with_task(reader.abort_handle()))
    }
}

/// Connection lifecycle notifications consumed by the dispatch loop.
#[derive(Debug)]
pub enum LinkEvent {
    Opened { generation: u64, link: Link },
    Failed { generation: u64, error: ClientError },
    Frame { generation: u64, text: String },
    Closed { generation: u64, reason: Option<String> },
    ReconnectDue { generation: u64 },
}

/// Result of accepting an opened link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// The link belongs to a superseded attempt and was dropped.
    Stale,
    /// First link since `connect()`.
    First,
    /// Link re-established after a loss.
    Reconnected,
}

struct ActiveLink {
    outbound: mpsc::UnboundedSender<String>,
    tasks: Vec<AbortHandle>,
}

impl Drop for ActiveLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Owns the single physical connection of a session.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    rng: StdRng,
    events: mpsc::UnboundedSender<LinkEvent>,
    url: Option<Url>,
    generation: u64,
    attempt: u32,
    opened_once: bool,
    active: Option<ActiveLink>,
    background: Option<AbortHandle>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            connector,
            policy,
            rng: StdRng::from_entropy(),
            events,
            url: None,
            generation: 0,
            attempt: 0,
            opened_once: false,
            active: None,
            background: None,
        }
    }

    /// Seed the jitter RNG for deterministic testing.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Start connecting to `url`, superseding any previous link or pending
    /// reconnect.
    pub fn connect(&mut self, url: Url) {
        self.supersede();
        info!(url = %url, generation = self.generation, "connecting");
        self.url = Some(url);
        self.attempt = 0;
        self.opened_once = false;
        self.spawn_attempt();
    }

    /// Close the link and stop reconnecting.
    pub fn disconnect(&mut self) {
        self.supersede();
        self.url = None;
        self.attempt = 0;
        self.opened_once = false;
    }

    /// Write one text frame. Fails without panicking when no link is open.
    pub fn send(&self, text: String) -> Result<()> {
        let Some(active) = &self.active else {
            warn!("dropping outbound frame: connection is not open");
            return Err(ClientError::NotConnected);
        };
        active.outbound.send(text).map_err(|_| {
            warn!("dropping outbound frame: writer is gone");
            ClientError::ConnectionLost
        })
    }

    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    /// Adopt a freshly opened link.
    pub fn handle_opened(&mut self, generation: u64, link: Link) -> OpenOutcome {
        if !self.is_current(generation) || self.url.is_none() {
            debug!(generation, current = self.generation, "dropping stale link");
            return OpenOutcome::Stale;
        }
        self.background = None;

        let Link {
            outbound,
            mut inbound,
            mut tasks,
        } = link;
        let events = self.events.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                match event {
                    TransportEvent::Frame(text) => {
                        let _ = events.send(LinkEvent::Frame { generation, text });
                    }
                    TransportEvent::Closed(reason) => {
                        let _ = events.send(LinkEvent::Closed { generation, reason });
                        return;
                    }
                }
            }
            let _ = events.send(LinkEvent::Closed {
                generation,
                reason: None,
            });
        });
        tasks.push(pump.abort_handle());
        self.active = Some(ActiveLink { outbound, tasks });

        self.attempt = 0;
        if std::mem::replace(&mut self.opened_once, true) {
            OpenOutcome::Reconnected
        } else {
            OpenOutcome::First
        }
    }

    /// A connect attempt failed. Returns the delay until the next attempt.
    pub fn handle_failed(&mut self, generation: u64) -> Option<Duration> {
        if !self.is_current(generation) || self.url.is_none() {
            return None;
        }
        self.background = None;
        Some(self.schedule_reconnect())
    }

    /// The open link closed. Returns the delay until the next attempt.
    pub fn handle_closed(&mut self, generation: u64) -> Option<Duration> {
        if !self.is_current(generation) || self.url.is_none() {
            return None;
        }
        self.active = None;
        Some(self.schedule_reconnect())
    }

    /// The backoff timer fired. Returns whether an attempt was started.
    pub fn handle_reconnect_due(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) || self.url.is_none() || self.active.is_some() {
            return false;
        }
        self.spawn_attempt();
        true
    }

    fn supersede(&mut self) {
        self.generation += 1;
        if let Some(task) = self.background.take() {
            task.abort();
        }
        self.active = None;
    }

    fn spawn_attempt(&mut self) {
        let Some(url) = self.url.clone() else {
            return;
        };
        let connector = self.connector.clone();
        let events = self.events.clone();
        let generation = self.generation;
        let task = tokio::spawn(async move {
            let event = match connector.connect(&url).await {
                Ok(link) => LinkEvent::Opened { generation, link },
                Err(error) => LinkEvent::Failed { generation, error },
            };
            let _ = events.send(event);
        });
        self.background = Some(task.abort_handle());
    }

    fn schedule_reconnect(&mut self) -> Duration {
        self.supersede();
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.policy.backoff_delay(self.attempt, &mut self.rng);
        let events = self.events.clone();
        let generation = self.generation;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(LinkEvent::ReconnectDue { generation });
        });
        self.background = Some(timer.abort_handle());
        info!(attempt = self.attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        delay
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.background.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ems_link_msg::{decode, encode, Message};

    use super::*;

    /// Server side of an in-memory link.
    pub(crate) struct MemoryPeer {
        pub from_client: mpsc::UnboundedReceiver<String>,
        pub to_client: mpsc::UnboundedSender<TransportEvent>,
    }

    impl MemoryPeer {
        pub async fn recv(&mut self) -> Message {
            let text = self.from_client.recv().await.expect("client frame");
            decode(&text).expect("client sends valid frames")
        }

        pub fn send(&self, message: impl Into<Message>) {
            let _ = self
                .to_client
                .send(TransportEvent::Frame(encode(&message.into())));
        }

        pub fn send_raw(&self, text: &str) {
            let _ = self.to_client.send(TransportEvent::Frame(text.to_owned()));
        }

        pub fn close(&self) {
            let _ = self.to_client.send(TransportEvent::Closed(Some("test".into())));
        }
    }

    /// Connector handing the server side of every link to the test.
    pub(crate) struct MemoryConnector {
        peers: mpsc::UnboundedSender<MemoryPeer>,
        refusals: AtomicUsize,
    }

    impl MemoryConnector {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MemoryPeer>) {
            let (peers, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    peers,
                    refusals: AtomicUsize::new(0),
                }),
                rx,
            )
        }

        /// Fail the next `count` connect attempts.
        pub fn refuse(&self, count: usize) {
            self.refusals.store(count, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, _url: &Url) -> Result<Link> {
            if self
                .refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ClientError::Transport("connection refused".into()));
            }
            let (outbound, from_client) = mpsc::unbounded_channel();
            let (to_client, inbound) = mpsc::unbounded_channel();
            self.peers
                .send(MemoryPeer {
                    from_client,
                    to_client,
                })
                .map_err(|_| ClientError::Transport("no listener".into()))?;
            Ok(Link::new(outbound, inbound))
        }
    }
}
