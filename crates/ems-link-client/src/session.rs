//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "JSON-RPC session client over WebSocket."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Session handle and the dispatch loop behind it.
//!
//! All mutable state lives in one task. [`Session`] handles talk to it over
//! a command channel and receive replies over oneshot channels; connection
//! events and timers reach it over their own channels.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use ems_link_common::{ClientConfig, ConnectionMode};
use ems_link_logging::{link_debug, link_warn, log_session_event, LogContext, SessionEventOutcome};
use ems_link_msg::methods::{
    is_authentication_method, AUTHENTICATE_WITH_SESSION_ID, AUTHENTICATE_WITH_SESSION_ID_FAILED,
};
use ems_link_msg::{
    decode, encode, log_message, AuthenticateResponse, AuthenticateWithPassword,
    AuthenticateWithToken, ChannelAddress, EdgeMetadata, EdgeRpc, EdgeRpcResponse, Logout,
    Message, MessageDirection, Notification, Request, RpcError, RpcMethod, RpcMetricsExporter,
    SubscribeChannels,
};
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::backoff::ReconnectPolicy;
use crate::correlator::{Correlator, DuplicateId, PendingRequest};
use crate::device::DeviceProxy;
use crate::error::{ClientError, Result};
use crate::router::{Handler, HandlerId, NotificationRouter, RoutedNotification};
use crate::state::{AuthEvent, ConnectionState};
use crate::subscriptions::SubscriptionRegistry;
use crate::transport::{ConnectionManager, Connector, LinkEvent, OpenOutcome, WebSocketConnector};

/// Device id used for the single Edge reached in direct mode.
pub const DIRECT_EDGE_ID: &str = "0";

const COMMAND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 64;

/// Tunables of a [`Session`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub mode: ConnectionMode,
    pub request_timeout: Duration,
    pub authentication_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Coalescing window for `subscribeChannels`; zero sends immediately.
    pub subscription_debounce: Duration,
    pub metrics: Option<RpcMetricsExporter>,
}

impl SessionOptions {
    pub fn with_mode(mut self, mode: ConnectionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_metrics(mut self, metrics: RpcMetricsExporter) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for SessionOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            mode: config.endpoint.mode,
            request_timeout: config.timeouts.request,
            authentication_timeout: config.timeouts.authentication,
            reconnect: ReconnectPolicy::from(&config.reconnect),
            subscription_debounce: config.subscriptions.debounce,
            metrics: None,
        }
    }
}

/// Lifecycle notifications broadcast to every interested party.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Transport open; `reconnect` is set after a loss.
    Connected { reconnect: bool },
    /// A connect attempt failed; another one follows after `retry_in`.
    ConnectFailed { error: String, retry_in: Duration },
    /// The open transport dropped; reconnecting after `retry_in`.
    ConnectionLost {
        reason: Option<String>,
        retry_in: Duration,
    },
    /// Credentials are needed: no cached token, or the remote rejected it.
    AuthenticationRequired,
    /// Login confirmed.
    Authenticated { edges: Vec<EdgeMetadata> },
    /// `logout()` completed locally.
    LoggedOut,
    /// `disconnect()` completed.
    Disconnected,
}

/// Login material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Password {
        username: Option<String>,
        password: String,
    },
    Token(String),
}

impl Credentials {
    fn to_request(&self) -> std::result::Result<Request, serde_json::Error> {
        match self {
            Credentials::Password { username, password } => AuthenticateWithPassword {
                username: username.clone(),
                password: password.clone(),
            }
            .to_request(),
            Credentials::Token(token) => AuthenticateWithToken {
                token: token.clone(),
            }
            .to_request(),
        }
    }

    fn token(&self) -> Option<String> {
        match self {
            Credentials::Token(token) => Some(token.clone()),
            Credentials::Password { .. } => None,
        }
    }
}

/// Addressee of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    /// The peer itself (Edge in direct mode, backend otherwise).
    Session,
    /// One Edge; wrapped in `edgeRpc` in backend mode.
    Edge(String),
}

type Responder<T> = oneshot::Sender<Result<T>>;

enum Command {
    Connect {
        url: Url,
        reply: Responder<()>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Login {
        credentials: Credentials,
        reply: Responder<AuthenticateResponse>,
    },
    Logout {
        reply: Responder<()>,
    },
    Request {
        target: Target,
        request: Request,
        timeout: Option<Duration>,
        reply: Responder<JsonValue>,
    },
    Subscribe {
        edge: String,
        consumer: String,
        channels: Vec<ChannelAddress>,
    },
    Unsubscribe {
        edge: String,
        consumer: String,
    },
    On {
        method: String,
        device: Option<String>,
        handler: Handler,
        reply: oneshot::Sender<HandlerId>,
    },
    Off {
        id: HandlerId,
        reply: oneshot::Sender<bool>,
    },
    Devices {
        reply: oneshot::Sender<Vec<EdgeMetadata>>,
    },
    CachedToken {
        reply: oneshot::Sender<Option<String>>,
    },
    PendingCount {
        reply: oneshot::Sender<usize>,
    },
}

enum Timer {
    Expire { id: String },
    FlushSubscriptions { edge: String },
}

/// How a pending request is settled.
#[derive(Debug)]
enum Reply {
    Caller {
        sender: Responder<JsonValue>,
        unwrap_edge_rpc: bool,
    },
    Login {
        sender: Option<Responder<AuthenticateResponse>>,
        token: Option<String>,
    },
    Subscription {
        edge: String,
        wrapped: bool,
    },
    Logout {
        sender: Responder<()>,
    },
}

impl Reply {
    fn is_login(&self) -> bool {
        matches!(self, Reply::Login { .. })
    }
}

/// Cheaply cloneable handle to one logical connection.
///
/// The dispatch loop shuts down once every handle is dropped.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    options: Arc<SessionOptions>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("mode", &self.options.mode)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Spawn a session speaking WebSocket. Must be called within a tokio runtime.
    pub fn spawn(options: SessionOptions) -> Self {
        Self::with_connector(options, Arc::new(WebSocketConnector))
    }

    /// Spawn a session using a custom [`Connector`].
    pub fn with_connector(options: SessionOptions, connector: Arc<dyn Connector>) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let mut router = NotificationRouter::new();
        if options.mode == ConnectionMode::Direct {
            router.set_default_device(Some(DIRECT_EDGE_ID.to_owned()));
        }

        let dispatcher = Dispatcher {
            connection: ConnectionManager::new(connector, options.reconnect.clone(), link_tx),
            options: options.clone(),
            state: ConnectionState::Disconnected,
            state_tx,
            events: events.clone(),
            correlator: Correlator::new(),
            subscriptions: SubscriptionRegistry::new(),
            router,
            devices: BTreeMap::new(),
            token: None,
            connect_waiters: Vec::new(),
            flush_timers: HashMap::new(),
            timers: timer_tx,
        };
        tokio::spawn(dispatcher.run(command_rx, link_rx, timer_rx));

        Self {
            commands,
            state,
            events,
            options: Arc::new(options),
        }
    }

    pub fn mode(&self) -> ConnectionMode {
        self.options.mode
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver observing every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Subscribe to lifecycle events emitted from now on.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Wait until the session reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map_err(|_| ClientError::Closed)?;
        Ok(())
    }

    /// Open the connection. Resolves once the first attempt succeeds or fails;
    /// after a failure reconnect attempts continue in the background.
    pub async fn connect(&self, url: &str) -> Result<()> {
        let url = Url::parse(url).map_err(|err| ClientError::Transport(format!("invalid url {url}: {err}")))?;
        self.roundtrip(|reply| Command::Connect { url, reply }).await?
    }

    /// Close the connection and stop reconnecting.
    pub async fn disconnect(&self) -> Result<()> {
        self.roundtrip(|reply| Command::Disconnect { reply }).await
    }

    pub async fn login_with_password(
        &self,
        username: Option<&str>,
        password: &str,
    ) -> Result<AuthenticateResponse> {
        self.login(Credentials::Password {
            username: username.map(str::to_owned),
            password: password.to_owned(),
        })
        .await
    }

    pub async fn login_with_token(&self, token: &str) -> Result<AuthenticateResponse> {
        self.login(Credentials::Token(token.to_owned())).await
    }

    /// Send a login request. Allowed while connected, also when another
    /// login attempt is still in flight.
    pub async fn login(&self, credentials: Credentials) -> Result<AuthenticateResponse> {
        self.roundtrip(|reply| Command::Login { credentials, reply })
            .await?
    }

    /// End the session: clears the token, the device directory and all
    /// subscriptions. The transport stays open.
    pub async fn logout(&self) -> Result<()> {
        self.roundtrip(|reply| Command::Logout { reply }).await?
    }

    /// Send a raw request to the peer itself.
    pub async fn request(&self, method: impl Into<String>, params: JsonValue) -> Result<JsonValue> {
        self.request_to(Target::Session, Request::new(method, params), None)
            .await
    }

    /// Send a typed request to the peer itself.
    pub async fn call<M: RpcMethod>(&self, method: &M) -> Result<M::Response> {
        let value = self
            .request_to(Target::Session, method.to_request()?, None)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub(crate) async fn request_to(
        &self,
        target: Target,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<JsonValue> {
        self.roundtrip(|reply| Command::Request {
            target,
            request,
            timeout,
            reply,
        })
        .await?
    }

    /// Replace `consumer`'s channel interest on `edge`.
    pub async fn subscribe(
        &self,
        edge: &str,
        consumer: &str,
        channels: impl IntoIterator<Item = ChannelAddress>,
    ) -> Result<()> {
        self.send(Command::Subscribe {
            edge: edge.to_owned(),
            consumer: consumer.to_owned(),
            channels: channels.into_iter().collect(),
        })
        .await
    }

    /// Drop `consumer`'s channel interest on `edge`.
    pub async fn unsubscribe(&self, edge: &str, consumer: &str) -> Result<()> {
        self.send(Command::Unsubscribe {
            edge: edge.to_owned(),
            consumer: consumer.to_owned(),
        })
        .await
    }

    /// Register a notification handler, optionally restricted to one device.
    /// Handlers run on the dispatch loop and must not block.
    pub async fn on<F>(&self, method: &str, device: Option<&str>, handler: F) -> Result<HandlerId>
    where
        F: FnMut(&RoutedNotification) -> anyhow::Result<()> + Send + 'static,
    {
        let handler: Handler = Box::new(handler);
        self.roundtrip(|reply| Command::On {
            method: method.to_owned(),
            device: device.map(str::to_owned),
            handler,
            reply,
        })
        .await
    }

    /// Remove a handler. Returns whether it was registered.
    pub async fn off(&self, id: HandlerId) -> Result<bool> {
        self.roundtrip(|reply| Command::Off { id, reply }).await
    }

    /// Edges known from the last authentication.
    pub async fn devices(&self) -> Result<Vec<EdgeMetadata>> {
        self.roundtrip(|reply| Command::Devices { reply }).await
    }

    pub async fn device(&self, id: &str) -> Result<Option<EdgeMetadata>> {
        Ok(self.devices().await?.into_iter().find(|edge| edge.id == id))
    }

    pub async fn cached_token(&self) -> Result<Option<String>> {
        self.roundtrip(|reply| Command::CachedToken { reply }).await
    }

    /// Number of requests awaiting a response.
    pub async fn pending_count(&self) -> Result<usize> {
        self.roundtrip(|reply| Command::PendingCount { reply }).await
    }

    /// Per-device façade. In direct mode use [`DIRECT_EDGE_ID`].
    pub fn edge(&self, id: impl Into<String>) -> DeviceProxy {
        DeviceProxy::new(self.clone(), id)
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::Closed)
    }

    async fn roundtrip<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(build(reply)).await?;
        response.await.map_err(|_| ClientError::Closed)
    }
}

struct Dispatcher {
    options: SessionOptions,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    connection: ConnectionManager,
    correlator: Correlator<Reply>,
    subscriptions: SubscriptionRegistry,
    router: NotificationRouter,
    devices: BTreeMap<String, EdgeMetadata>,
    token: Option<String>,
    connect_waiters: Vec<Responder<()>>,
    flush_timers: HashMap<String, AbortHandle>,
    timers: mpsc::UnboundedSender<Timer>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut links: mpsc::UnboundedReceiver<LinkEvent>,
        mut timers: mpsc::UnboundedReceiver<Timer>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = links.recv() => self.handle_link(event),
                Some(timer) = timers.recv() => self.handle_timer(timer),
            }
        }
        debug!("all session handles dropped; shutting down dispatch loop");
        self.connection.disconnect();
        self.fail_all(ClientError::Closed);
        self.cancel_flush_timers();
    }

    fn context(&self) -> LogContext<'static> {
        LogContext::new().with_mode(self.options.mode.as_str())
    }

    fn metrics(&self) -> Option<&RpcMetricsExporter> {
        self.options.metrics.as_ref()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn transition(&mut self, event: AuthEvent) {
        let next = self.state.apply(event);
        if next != self.state {
            debug!(from = %self.state, to = %next, event = ?event, "session state change");
            self.state = next;
            self.state_tx.send_replace(next);
        }
    }

    // ---- commands -------------------------------------------------------

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { url, reply } => {
                self.fail_all(ClientError::ConnectionLost);
                self.cancel_flush_timers();
                self.subscriptions.reset_sent();
                self.transition(AuthEvent::Connect);
                self.connection.connect(url);
                self.connect_waiters.push(reply);
            }
            Command::Disconnect { reply } => {
                self.connection.disconnect();
                self.fail_all(ClientError::ConnectionLost);
                self.cancel_flush_timers();
                self.subscriptions.reset_sent();
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(ClientError::Transport("disconnected".into())));
                }
                self.transition(AuthEvent::Disconnect);
                log_session_event(
                    Some(&self.context()),
                    "session.disconnect",
                    "connection closed on request",
                    SessionEventOutcome::Success,
                );
                self.emit(SessionEvent::Disconnected);
                let _ = reply.send(());
            }
            Command::Login { credentials, reply } => self.start_login(credentials, Some(reply)),
            Command::Logout { reply } => self.logout(reply),
            Command::Request {
                target,
                request,
                timeout,
                reply,
            } => self.request(target, request, timeout, reply),
            Command::Subscribe {
                edge,
                consumer,
                channels,
            } => {
                if self.subscriptions.subscribe(&edge, &consumer, channels).is_some() {
                    self.schedule_flush(edge);
                }
            }
            Command::Unsubscribe { edge, consumer } => {
                if self.subscriptions.unsubscribe(&edge, &consumer).is_some() {
                    self.schedule_flush(edge);
                }
            }
            Command::On {
                method,
                device,
                handler,
                reply,
            } => {
                let _ = reply.send(self.router.on(method, device, handler));
            }
            Command::Off { id, reply } => {
                let _ = reply.send(self.router.off(id));
            }
            Command::Devices { reply } => {
                let _ = reply.send(self.devices.values().cloned().collect());
            }
            Command::CachedToken { reply } => {
                let _ = reply.send(self.token.clone());
            }
            Command::PendingCount { reply } => {
                let _ = reply.send(self.correlator.len());
            }
        }
    }

    fn request(
        &mut self,
        target: Target,
        request: Request,
        timeout: Option<Duration>,
        reply: Responder<JsonValue>,
    ) {
        if is_authentication_method(&request.method) {
            let _ = reply.send(Err(ClientError::Protocol(format!(
                "`{}` must be sent through login",
                request.method
            ))));
            return;
        }
        let (outbound, unwrap_edge_rpc) = match target {
            Target::Edge(edge) if self.options.mode.is_backend() => {
                match EdgeRpc::new(edge, request).to_request() {
                    Ok(wrapped) => (wrapped, true),
                    Err(err) => {
                        let _ = reply.send(Err(err.into()));
                        return;
                    }
                }
            }
            Target::Edge(_) | Target::Session => (request, false),
        };
        if !self.state.permits(&outbound.method) {
            let error = if self.state.is_open() {
                ClientError::NotAuthenticated
            } else {
                ClientError::NotConnected
            };
            let _ = reply.send(Err(error));
            return;
        }
        let timeout = timeout.unwrap_or(self.options.request_timeout);
        self.issue(
            outbound,
            timeout,
            Reply::Caller {
                sender: reply,
                unwrap_edge_rpc,
            },
        );
    }

    fn start_login(&mut self, credentials: Credentials, sender: Option<Responder<AuthenticateResponse>>) {
        if !self.state.is_open() {
            if let Some(sender) = sender {
                let _ = sender.send(Err(ClientError::NotConnected));
            }
            return;
        }
        let request = match credentials.to_request() {
            Ok(request) => request,
            Err(err) => {
                if let Some(sender) = sender {
                    let _ = sender.send(Err(err.into()));
                }
                return;
            }
        };
        let reply = Reply::Login {
            sender,
            token: credentials.token(),
        };
        if self.issue(request, self.options.authentication_timeout, reply) {
            self.transition(AuthEvent::LoginStarted);
        }
    }

    fn logout(&mut self, reply: Responder<()>) {
        if self.state != ConnectionState::Authenticated {
            let _ = reply.send(Err(ClientError::NotAuthenticated));
            return;
        }
        let request = match Logout::default().to_request() {
            Ok(request) => request,
            Err(err) => {
                let _ = reply.send(Err(err.into()));
                return;
            }
        };
        self.issue(
            request,
            self.options.request_timeout,
            Reply::Logout { sender: reply },
        );
        self.token = None;
        self.devices.clear();
        self.subscriptions.clear();
        self.cancel_flush_timers();
        self.transition(AuthEvent::Logout);
        log_session_event(
            Some(&self.context()),
            "session.logout",
            "logged out",
            SessionEventOutcome::Success,
        );
        self.emit(SessionEvent::LoggedOut);
    }

    // ---- outbound -------------------------------------------------------

    /// Register, write and arm the timeout of one request. Settles `reply`
    /// with the failure and returns `false` when the frame cannot be written.
    fn issue(&mut self, request: Request, timeout: Duration, reply: Reply) -> bool {
        let id = request.id.clone();
        let method = request.method.clone();
        let message = Message::Request(request);
        let pending = PendingRequest::new(id.clone(), method.clone(), timeout, reply);
        if let Err(DuplicateId(rejected)) = self.correlator.register(pending) {
            self.fail_reply(
                rejected,
                ClientError::Protocol(format!("request id {id} already in flight")),
            );
            return false;
        }

        log_message(MessageDirection::Outbound, &message);
        if let Err(err) = self.connection.send(encode(&message)) {
            if let Some(pending) = self.correlator.resolve(&id) {
                self.fail_reply(pending, err);
            }
            return false;
        }
        if let Some(metrics) = self.metrics() {
            metrics.observe_request();
        }

        let timers = self.timers.clone();
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timers.send(Timer::Expire { id: timer_id });
        });
        self.correlator.arm(&id, timer.abort_handle());
        link_debug!(
            context = self.context().with_method(&method).with_request_id(&id),
            "request issued"
        );
        true
    }

    fn fail_reply(&mut self, pending: PendingRequest<Reply>, error: ClientError) {
        match pending.reply {
            Reply::Caller { sender, .. } => {
                let _ = sender.send(Err(error));
            }
            Reply::Login { sender, .. } => match sender {
                Some(sender) => {
                    let _ = sender.send(Err(error));
                }
                None => warn!(error = %error, "automatic token login did not complete"),
            },
            Reply::Subscription { edge, .. } => {
                warn!(edge = %edge, error = %error, "channel subscription not confirmed");
                self.subscriptions.mark_unknown(&edge);
            }
            Reply::Logout { sender } => {
                let _ = sender.send(Err(error));
            }
        }
    }

    fn fail_all(&mut self, error: ClientError) {
        for pending in self.correlator.drain() {
            self.fail_reply(pending, error.clone());
        }
    }

    // ---- subscriptions --------------------------------------------------

    fn schedule_flush(&mut self, edge: String) {
        if self.state != ConnectionState::Authenticated {
            return;
        }
        if self.options.subscription_debounce.is_zero() {
            self.flush_subscriptions(&edge);
            return;
        }
        if self.flush_timers.contains_key(&edge) {
            return;
        }
        let timers = self.timers.clone();
        let delay = self.options.subscription_debounce;
        let timer_edge = edge.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(Timer::FlushSubscriptions { edge: timer_edge });
        });
        self.flush_timers.insert(edge, timer.abort_handle());
    }

    fn flush_subscriptions(&mut self, edge: &str) {
        if self.state != ConnectionState::Authenticated {
            return;
        }
        let Some(channels) = self.subscriptions.pending_flush(edge) else {
            return;
        };
        let count = self.subscriptions.mark_sent(edge, channels.clone());
        let wrapped = self.options.mode.is_backend();
        let request = SubscribeChannels::new(count, channels)
            .to_request()
            .and_then(|inner| {
                if wrapped {
                    EdgeRpc::new(edge, inner).to_request()
                } else {
                    Ok(inner)
                }
            });
        match request {
            Ok(request) => {
                self.issue(
                    request,
                    self.options.request_timeout,
                    Reply::Subscription {
                        edge: edge.to_owned(),
                        wrapped,
                    },
                );
            }
            Err(err) => {
                warn!(edge, error = %err, "unable to encode channel subscription");
                self.subscriptions.mark_unknown(edge);
            }
        }
    }

    fn cancel_flush_timers(&mut self) {
        for (_, timer) in self.flush_timers.drain() {
            timer.abort();
        }
    }

    // ---- inbound --------------------------------------------------------

    fn handle_link(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened { generation, link } => {
                let outcome = self.connection.handle_opened(generation, link);
                if outcome == OpenOutcome::Stale {
                    return;
                }
                let reconnect = outcome == OpenOutcome::Reconnected;
                self.transition(AuthEvent::TransportOpened);
                if reconnect {
                    if let Some(metrics) = self.metrics() {
                        metrics.observe_reconnect();
                    }
                }
                log_session_event(
                    Some(&self.context()),
                    "session.connect",
                    if reconnect {
                        "connection re-established"
                    } else {
                        "connection established"
                    },
                    SessionEventOutcome::Success,
                );
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                self.emit(SessionEvent::Connected { reconnect });
                self.authenticate_automatically();
            }
            LinkEvent::Failed { generation, error } => {
                if let Some(retry_in) = self.connection.handle_failed(generation) {
                    warn!(error = %error, retry_in_ms = retry_in.as_millis() as u64, "connect attempt failed");
                    for waiter in self.connect_waiters.drain(..) {
                        let _ = waiter.send(Err(error.clone()));
                    }
                    self.emit(SessionEvent::ConnectFailed {
                        error: error.to_string(),
                        retry_in,
                    });
                }
            }
            LinkEvent::Frame { generation, text } => {
                if self.connection.is_current(generation) {
                    self.handle_frame(&text);
                }
            }
            LinkEvent::Closed { generation, reason } => {
                if let Some(retry_in) = self.connection.handle_closed(generation) {
                    self.fail_all(ClientError::ConnectionLost);
                    self.cancel_flush_timers();
                    self.subscriptions.reset_sent();
                    self.transition(AuthEvent::TransportLost);
                    log_session_event(
                        Some(&self.context()),
                        "session.connection_lost",
                        reason.as_deref().unwrap_or("connection closed"),
                        SessionEventOutcome::Degraded,
                    );
                    self.emit(SessionEvent::ConnectionLost { reason, retry_in });
                }
            }
            LinkEvent::ReconnectDue { generation } => {
                if self.connection.handle_reconnect_due(generation) {
                    self.transition(AuthEvent::Connect);
                }
            }
        }
    }

    fn handle_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Expire { id } => {
                let Some(pending) = self.correlator.expire(&id) else {
                    return;
                };
                if let Some(metrics) = self.metrics() {
                    metrics.observe_timeout();
                }
                link_warn!(
                    context = self.context().with_method(&pending.method).with_request_id(&id),
                    "request timed out after {:?}",
                    pending.timeout
                );
                let error = ClientError::Timeout {
                    method: pending.method.clone(),
                    timeout: pending.timeout,
                };
                self.fail_reply(pending, error);
            }
            Timer::FlushSubscriptions { edge } => {
                self.flush_timers.remove(&edge);
                self.flush_subscriptions(&edge);
            }
        }
    }

    fn handle_frame(&mut self, text: &str) {
        let message = match decode(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "dropping malformed frame");
                if let Some(metrics) = self.metrics() {
                    metrics.observe_dropped();
                }
                return;
            }
        };
        log_message(MessageDirection::Inbound, &message);
        match message {
            Message::Success(success) => self.handle_response(success.id, Ok(success.result)),
            Message::Error(error) => self.handle_response(error.id, Err(error.error)),
            Message::Notification(notification) => self.handle_notification(notification),
            Message::Request(request) => {
                debug!(method = %request.method, id = %request.id, "ignoring request from peer");
                if let Some(metrics) = self.metrics() {
                    metrics.observe_dropped();
                }
            }
        }
    }

    fn handle_response(&mut self, id: String, outcome: std::result::Result<JsonValue, RpcError>) {
        let Some(pending) = self.correlator.resolve(&id) else {
            debug!(id = %id, "response for unknown request id");
            if let Some(metrics) = self.metrics() {
                metrics.observe_dropped();
            }
            return;
        };
        if let Some(metrics) = self.metrics() {
            metrics.observe_response(pending.elapsed());
        }
        match pending.reply {
            Reply::Caller {
                sender,
                unwrap_edge_rpc,
            } => {
                let result = match outcome {
                    Ok(value) if unwrap_edge_rpc => unwrap_edge_rpc_result(value),
                    Ok(value) => Ok(value),
                    Err(error) => Err(ClientError::Application(error)),
                };
                let _ = sender.send(result);
            }
            Reply::Login { sender, token } => self.handle_login_response(sender, token, outcome),
            Reply::Subscription { edge, wrapped } => {
                let result = match outcome {
                    Ok(value) if wrapped => unwrap_edge_rpc_result(value).map(|_| ()),
                    Ok(_) => Ok(()),
                    Err(error) => Err(ClientError::Application(error)),
                };
                if let Err(err) = result {
                    warn!(edge = %edge, error = %err, "channel subscription rejected");
                    self.subscriptions.mark_unknown(&edge);
                }
            }
            Reply::Logout { sender } => {
                let _ = sender.send(outcome.map(|_| ()).map_err(ClientError::Application));
            }
        }
    }

    fn handle_login_response(
        &mut self,
        sender: Option<Responder<AuthenticateResponse>>,
        token: Option<String>,
        outcome: std::result::Result<JsonValue, RpcError>,
    ) {
        let result = match outcome {
            Ok(value) => serde_json::from_value::<AuthenticateResponse>(value)
                .map_err(|err| ClientError::Protocol(format!("invalid authentication result: {err}"))),
            Err(error) => Err(ClientError::AuthenticationRejected(error)),
        };

        match &result {
            Ok(response) => {
                self.token = Some(response.token.clone());
                self.store_devices(&response.edges);
                // Backend mode waits for the session notification.
                if self.options.mode == ConnectionMode::Direct {
                    let was = self.state;
                    self.transition(AuthEvent::LoginSucceeded);
                    if was != ConnectionState::Authenticated {
                        self.on_authenticated();
                    }
                }
            }
            Err(err) => {
                if token.is_some() && token == self.token {
                    self.token = None;
                }
                let other_attempt = self.correlator.any(|pending| pending.reply.is_login());
                if !other_attempt {
                    self.transition(AuthEvent::LoginFailed);
                }
                log_session_event(
                    Some(&self.context()),
                    "session.authenticate",
                    &err.to_string(),
                    SessionEventOutcome::Fault,
                );
                if self.state == ConnectionState::Connected {
                    self.emit(SessionEvent::AuthenticationRequired);
                }
            }
        }

        match sender {
            Some(sender) => {
                let _ = sender.send(result);
            }
            None => {
                if let Err(err) = result {
                    info!(error = %err, "cached token rejected; credentials required");
                }
            }
        }
    }

    fn handle_notification(&mut self, notification: Notification) {
        if let Some(metrics) = self.metrics() {
            metrics.observe_notification();
        }
        match notification.method.as_str() {
            AUTHENTICATE_WITH_SESSION_ID if self.options.mode.is_backend() => {
                self.handle_session_authenticated(&notification.params)
            }
            AUTHENTICATE_WITH_SESSION_ID_FAILED => self.handle_session_invalidated(),
            _ => {}
        }
        self.router.dispatch(notification);
    }

    fn handle_session_authenticated(&mut self, params: &JsonValue) {
        let response = match serde_json::from_value::<AuthenticateResponse>(params.clone()) {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "ignoring malformed session notification");
                return;
            }
        };
        self.token = Some(response.token.clone());
        self.store_devices(&response.edges);

        let was = self.state;
        self.transition(AuthEvent::LoginSucceeded);
        for pending in self.correlator.take_where(|pending| pending.reply.is_login()) {
            if let Reply::Login {
                sender: Some(sender),
                ..
            } = pending.reply
            {
                let _ = sender.send(Ok(response.clone()));
            }
        }
        if self.state == ConnectionState::Authenticated && was != ConnectionState::Authenticated {
            self.on_authenticated();
        }
    }

    fn handle_session_invalidated(&mut self) {
        self.token = None;
        self.devices.clear();
        // The remote forgets subscriptions together with the session.
        self.subscriptions.reset_sent();
        for pending in self.correlator.take_where(|pending| pending.reply.is_login()) {
            self.fail_reply(pending, ClientError::AuthenticationInvalidated);
        }
        self.cancel_flush_timers();
        self.transition(AuthEvent::SessionInvalidated);
        log_session_event(
            Some(&self.context()),
            "session.authenticate",
            "session invalidated by the remote",
            SessionEventOutcome::Fault,
        );
        self.emit(SessionEvent::AuthenticationRequired);
    }

    fn authenticate_automatically(&mut self) {
        match self.token.clone() {
            Some(token) => self.start_login(Credentials::Token(token), None),
            None => self.emit(SessionEvent::AuthenticationRequired),
        }
    }

    fn on_authenticated(&mut self) {
        let edges: Vec<EdgeMetadata> = self.devices.values().cloned().collect();
        log_session_event(
            Some(&self.context()),
            "session.authenticate",
            "authenticated",
            SessionEventOutcome::Success,
        );
        self.emit(SessionEvent::Authenticated { edges });
        self.cancel_flush_timers();
        for edge in self.subscriptions.active_devices() {
            self.flush_subscriptions(&edge);
        }
    }

    fn store_devices(&mut self, edges: &[EdgeMetadata]) {
        self.devices = edges
            .iter()
            .map(|edge| (edge.id.clone(), edge.clone()))
            .collect();
    }
}

/// Extract the inner result of an `edgeRpc` response.
fn unwrap_edge_rpc_result(value: JsonValue) -> Result<JsonValue> {
    let response: EdgeRpcResponse = serde_json::from_value(value)?;
    match Message::from_value(response.payload)? {
        Message::Success(success) => Ok(success.result),
        Message::Error(error) => Err(ClientError::Application(error.error)),
        other => Err(ClientError::Protocol(format!(
            "unexpected {} inside edgeRpc response",
            other.kind()
        ))),
    }
}
