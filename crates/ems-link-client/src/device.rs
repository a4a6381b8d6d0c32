//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "JSON-RPC session client over WebSocket."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::time::Duration;

use ems_link_msg::methods::CURRENT_DATA;
use ems_link_msg::{
    ChannelAddress, ComponentJsonApi, CreateComponentConfig, CurrentDataNotification,
    DeleteComponentConfig, EdgeMetadata, GetEdgeConfig, Property, Request, RpcMethod,
    SetChannelValue, SubscribeSystemLog, UpdateComponentConfig,
};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::router::HandlerId;
use crate::session::{Session, Target};
use crate::state::ConnectionState;
use crate::subscriptions::ChannelSet;

/// Handle to one Edge, identical in direct and backend mode.
///
/// Requests are wrapped in `edgeRpc` by the session when it talks to a
/// backend; callers always see the inner result.
#[derive(Debug, Clone)]
pub struct DeviceProxy {
    session: Session,
    edge_id: String,
}

impl DeviceProxy {
    pub(crate) fn new(session: Session, edge_id: impl Into<String>) -> Self {
        Self {
            session,
            edge_id: edge_id.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.edge_id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Send a request to this Edge. Fails with `NotAuthenticated` before login.
    pub async fn send_request(&self, method: impl Into<String>, params: JsonValue) -> Result<JsonValue> {
        self.send(Request::new(method, params), None).await
    }

    /// Like [`send_request`](Self::send_request) with a per-call timeout.
    pub async fn send_request_with_timeout(
        &self,
        method: impl Into<String>,
        params: JsonValue,
        timeout: Duration,
    ) -> Result<JsonValue> {
        self.send(Request::new(method, params), Some(timeout)).await
    }

    /// Wait for the session to be authenticated, then send.
    ///
    /// Waits across reconnects. Fails only when the session shuts down or
    /// the request itself fails.
    pub async fn send_request_when_ready(
        &self,
        method: impl Into<String>,
        params: JsonValue,
    ) -> Result<JsonValue> {
        self.session
            .wait_for_state(ConnectionState::Authenticated)
            .await?;
        self.send_request(method, params).await
    }

    /// Send a typed request to this Edge.
    pub async fn call<M: RpcMethod>(&self, method: &M) -> Result<M::Response> {
        let value = self.send(method.to_request()?, None).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn send(&self, request: Request, timeout: Option<Duration>) -> Result<JsonValue> {
        self.session
            .request_to(Target::Edge(self.edge_id.clone()), request, timeout)
            .await
    }

    /// Replace `consumer`'s channel interest on this Edge.
    pub async fn subscribe_channels(
        &self,
        consumer: &str,
        channels: impl IntoIterator<Item = ChannelAddress>,
    ) -> Result<()> {
        self.session.subscribe(&self.edge_id, consumer, channels).await
    }

    pub async fn unsubscribe_channels(&self, consumer: &str) -> Result<()> {
        self.session.unsubscribe(&self.edge_id, consumer).await
    }

    /// Subscribe `consumer` to `channels` and stream the matching values of
    /// every `currentData` push from this Edge.
    pub async fn watch_channels(
        &self,
        consumer: &str,
        channels: impl IntoIterator<Item = ChannelAddress>,
    ) -> Result<ChannelWatch> {
        let channels: ChannelSet = channels.into_iter().collect();
        let (sender, receiver) = mpsc::unbounded_channel();
        let filter = channels.clone();
        let handler = self
            .session
            .on(CURRENT_DATA, Some(&self.edge_id), move |routed| {
                let data = CurrentDataNotification::from_params(&routed.notification.params)?;
                let values: BTreeMap<ChannelAddress, JsonValue> = data
                    .0
                    .into_iter()
                    .filter(|(address, _)| filter.contains(address))
                    .collect();
                if !values.is_empty() {
                    // Receiver gone means the watch was dropped without close().
                    let _ = sender.send(CurrentDataNotification(values));
                }
                Ok(())
            })
            .await?;
        self.subscribe_channels(consumer, channels).await?;
        Ok(ChannelWatch {
            proxy: self.clone(),
            consumer: consumer.to_owned(),
            handler,
            receiver,
        })
    }

    /// Metadata from the last authentication, if this Edge was listed.
    pub async fn metadata(&self) -> Result<Option<EdgeMetadata>> {
        self.session.device(&self.edge_id).await
    }

    pub async fn get_edge_config(&self) -> Result<JsonValue> {
        self.call(&GetEdgeConfig {}).await
    }

    pub async fn create_component_config(
        &self,
        factory_pid: &str,
        properties: Vec<Property>,
    ) -> Result<JsonValue> {
        self.call(&CreateComponentConfig {
            factory_pid: factory_pid.to_owned(),
            properties,
        })
        .await
    }

    pub async fn update_component_config(
        &self,
        component_id: &str,
        properties: Vec<Property>,
    ) -> Result<JsonValue> {
        self.call(&UpdateComponentConfig {
            component_id: component_id.to_owned(),
            properties,
        })
        .await
    }

    pub async fn delete_component_config(&self, component_id: &str) -> Result<JsonValue> {
        self.call(&DeleteComponentConfig {
            component_id: component_id.to_owned(),
        })
        .await
    }

    /// Toggle `systemLog` pushes from this Edge.
    pub async fn subscribe_system_log(&self, subscribe: bool) -> Result<JsonValue> {
        self.call(&SubscribeSystemLog { subscribe }).await
    }

    /// Write a channel value on this Edge.
    pub async fn set_channel_value(&self, address: &ChannelAddress, value: JsonValue) -> Result<JsonValue> {
        self.call(&SetChannelValue::new(address, value)).await
    }

    /// Forward `request` to one component's JSON API.
    pub async fn component_json_api(&self, component_id: &str, request: Request) -> Result<JsonValue> {
        self.call(&ComponentJsonApi {
            component_id: component_id.to_owned(),
            payload: request,
        })
        .await
    }
}

/// Stream of channel values created by [`DeviceProxy::watch_channels`].
#[derive(Debug)]
pub struct ChannelWatch {
    proxy: DeviceProxy,
    consumer: String,
    handler: HandlerId,
    receiver: mpsc::UnboundedReceiver<CurrentDataNotification>,
}

impl ChannelWatch {
    /// Next batch of values. `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<CurrentDataNotification> {
        self.receiver.recv().await
    }

    /// Drop the handler and this consumer's channel interest.
    pub async fn close(self) -> Result<()> {
        match self.proxy.session.off(self.handler).await {
            Ok(_) | Err(ClientError::Closed) => {}
            Err(err) => return Err(err),
        }
        debug!(edge = %self.proxy.edge_id, consumer = %self.consumer, "channel watch closed");
        self.proxy.unsubscribe_channels(&self.consumer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;

    use crate::session::{SessionOptions, DIRECT_EDGE_ID};
    use crate::transport::memory::{MemoryConnector, MemoryPeer};
    use ems_link_common::ConnectionMode;
    use ems_link_msg::methods::AUTHENTICATE_WITH_SESSION_ID;
    use ems_link_msg::{Message, Notification, ResponseSuccess};
    use serde_json::json;

    fn request_of(message: Message) -> Request {
        match message {
            Message::Request(request) => request,
            other => panic!("expected request, got {other:?}"),
        }
    }

    fn options() -> SessionOptions {
        SessionOptions {
            subscription_debounce: Duration::ZERO,
            ..SessionOptions::default()
        }
        .with_mode(ConnectionMode::Direct)
    }

    fn auth_result() -> JsonValue {
        json!({
            "token": "t",
            "edges": [{"id": "edge0", "role": "owner", "isOnline": true}]
        })
    }

    async fn authenticated(
        mode: ConnectionMode,
    ) -> (Session, MemoryPeer, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (connector, mut peers) = MemoryConnector::new();
        let session = Session::with_connector(options().with_mode(mode), connector);
        session.connect("ws://edge.invalid:8085").await.expect("connect");
        let mut peer = peers.recv().await.expect("peer");
        if mode.is_backend() {
            peer.send(Notification::new(AUTHENTICATE_WITH_SESSION_ID, auth_result()));
            session
                .wait_for_state(ConnectionState::Authenticated)
                .await
                .expect("authenticated by push");
        } else {
            let (_, login) = exchange(
                &mut peer,
                {
                    let session = session.clone();
                    async move { session.login_with_password(None, "user").await }
                },
                auth_result(),
            )
            .await;
            login.expect("login");
        }
        (session, peer, peers)
    }

    /// Run `call`, answer the request it sends with `result`, and return both.
    async fn exchange<F, T>(peer: &mut MemoryPeer, call: F, result: JsonValue) -> (Request, T)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handle = tokio::spawn(call);
        let request = request_of(peer.recv().await);
        peer.send(ResponseSuccess {
            id: request.id.clone(),
            result,
        });
        (request, handle.await.expect("join"))
    }

    #[tokio::test]
    async fn configuration_helpers_send_expected_params() {
        let (session, mut peer, _peers) = authenticated(ConnectionMode::Direct).await;
        let edge = session.edge(DIRECT_EDGE_ID);

        let (request, created) = exchange(
            &mut peer,
            {
                let edge = edge.clone();
                async move {
                    edge.create_component_config(
                        "Controller.Ess.FixActivePower",
                        vec![Property::new("id", json!("ctrlFix0"))],
                    )
                    .await
                }
            },
            json!({}),
        )
        .await;
        created.expect("created");
        assert_eq!(request.method, "createComponentConfig");
        assert_eq!(
            request.params,
            json!({
                "factoryPid": "Controller.Ess.FixActivePower",
                "properties": [{"name": "id", "value": "ctrlFix0"}]
            })
        );

        let (request, updated) = exchange(
            &mut peer,
            {
                let edge = edge.clone();
                async move {
                    edge.update_component_config("ctrlFix0", vec![Property::new("power", json!(-500))])
                        .await
                }
            },
            json!({}),
        )
        .await;
        updated.expect("updated");
        assert_eq!(request.method, "updateComponentConfig");
        assert_eq!(
            request.params,
            json!({
                "componentId": "ctrlFix0",
                "properties": [{"name": "power", "value": -500}]
            })
        );

        let (request, toggled) = exchange(
            &mut peer,
            {
                let edge = edge.clone();
                async move { edge.subscribe_system_log(true).await }
            },
            json!({}),
        )
        .await;
        toggled.expect("subscribed");
        assert_eq!(request.method, "subscribeSystemLog");
        assert_eq!(request.params, json!({"subscribe": true}));
    }

    #[tokio::test]
    async fn channel_and_component_helpers_send_expected_params() {
        let (session, mut peer, _peers) = authenticated(ConnectionMode::Direct).await;
        let edge = session.edge(DIRECT_EDGE_ID);

        let (request, written) = exchange(
            &mut peer,
            {
                let edge = edge.clone();
                async move {
                    let address: ChannelAddress =
                        "ess0/SetActivePowerEquals".parse().expect("address");
                    edge.set_channel_value(&address, json!(500)).await
                }
            },
            json!({}),
        )
        .await;
        written.expect("written");
        assert_eq!(request.method, "setChannelValue");
        assert_eq!(
            request.params,
            json!({"componentId": "ess0", "channelId": "SetActivePowerEquals", "value": 500})
        );

        let (request, answered) = exchange(
            &mut peer,
            {
                let edge = edge.clone();
                async move {
                    let inner = Request::with_id(
                        "inner-1",
                        "getChannelsOfComponent",
                        json!({"componentId": "meter0"}),
                    );
                    edge.component_json_api("_componentManager", inner).await
                }
            },
            json!({"channels": []}),
        )
        .await;
        assert_eq!(answered.expect("answered"), json!({"channels": []}));
        assert_eq!(request.method, "componentJsonApi");
        assert_eq!(
            request.params,
            json!({
                "componentId": "_componentManager",
                "payload": {
                    "jsonrpc": "2.0",
                    "id": "inner-1",
                    "method": "getChannelsOfComponent",
                    "params": {"componentId": "meter0"}
                }
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn per_call_timeout_overrides_session_default() {
        let (session, mut peer, _peers) = authenticated(ConnectionMode::Direct).await;
        let edge = session.edge(DIRECT_EDGE_ID);

        let started = tokio::time::Instant::now();
        let call = {
            let edge = edge.clone();
            tokio::spawn(async move {
                edge.send_request_with_timeout("getEdgeConfig", json!({}), Duration::from_millis(50))
                    .await
            })
        };
        let request = request_of(peer.recv().await);
        assert_eq!(request.method, "getEdgeConfig");

        let err = call.await.expect("join").expect_err("unanswered");
        match err {
            ClientError::Timeout { method, timeout } => {
                assert_eq!(method, "getEdgeConfig");
                assert_eq!(timeout, Duration::from_millis(50));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() < session.options().request_timeout);
        assert_eq!(session.pending_count().await.expect("alive"), 0);
    }

    #[tokio::test]
    async fn backend_helpers_travel_inside_edge_rpc() {
        let (session, mut peer, _peers) = authenticated(ConnectionMode::Backend).await;
        let edge = session.edge("edge0");

        let call = tokio::spawn(async move {
            let address: ChannelAddress = "ess0/SetActivePowerEquals".parse().expect("address");
            edge.set_channel_value(&address, json!(-1000)).await
        });
        let outer = request_of(peer.recv().await);
        assert_eq!(outer.method, "edgeRpc");
        assert_eq!(outer.params["edgeId"], "edge0");
        let payload = &outer.params["payload"];
        assert_eq!(payload["jsonrpc"], "2.0");
        assert_eq!(payload["method"], "setChannelValue");
        assert_eq!(
            payload["params"],
            json!({"componentId": "ess0", "channelId": "SetActivePowerEquals", "value": -1000})
        );

        let inner_id = payload["id"].as_str().expect("inner id").to_owned();
        peer.send(ResponseSuccess {
            id: outer.id,
            result: json!({"payload": {"jsonrpc": "2.0", "id": inner_id, "result": {}}}),
        });
        assert_eq!(call.await.expect("join").expect("written"), json!({}));
    }

    #[tokio::test]
    async fn send_request_when_ready_waits_for_login() {
        let (connector, mut peers) = MemoryConnector::new();
        let session = Session::with_connector(options(), connector);
        session.connect("ws://edge.invalid:8085").await.expect("connect");
        let mut peer = peers.recv().await.expect("peer");

        let edge = session.edge(DIRECT_EDGE_ID);
        let early = edge
            .send_request("getEdgeConfig", json!({}))
            .await
            .expect_err("rejected before login");
        assert!(matches!(early, ClientError::NotAuthenticated));

        let waiting = {
            let edge = edge.clone();
            tokio::spawn(async move { edge.send_request_when_ready("getEdgeConfig", json!({})).await })
        };

        let login = {
            let session = session.clone();
            tokio::spawn(async move { session.login_with_password(None, "user").await })
        };
        let auth = request_of(peer.recv().await);
        peer.send(ResponseSuccess {
            id: auth.id,
            result: json!({"token": "t", "edges": []}),
        });
        login.await.expect("join").expect("login");

        let queued = request_of(peer.recv().await);
        assert_eq!(queued.method, "getEdgeConfig");
        peer.send(ResponseSuccess {
            id: queued.id,
            result: json!({"components": {}}),
        });
        assert_eq!(
            waiting.await.expect("join").expect("answered"),
            json!({"components": {}})
        );
    }

    #[tokio::test]
    async fn watch_channels_filters_current_data() {
        let (connector, mut peers) = MemoryConnector::new();
        let session = Session::with_connector(options(), connector);
        session.connect("ws://edge.invalid:8085").await.expect("connect");
        let mut peer = peers.recv().await.expect("peer");

        let login = {
            let session = session.clone();
            tokio::spawn(async move { session.login_with_password(None, "user").await })
        };
        let auth = request_of(peer.recv().await);
        peer.send(ResponseSuccess {
            id: auth.id,
            result: json!({"token": "t", "edges": []}),
        });
        login.await.expect("join").expect("login");

        let state: ChannelAddress = "_sum/State".parse().expect("address");
        let mut watch = session
            .edge(DIRECT_EDGE_ID)
            .watch_channels("ui", [state.clone()])
            .await
            .expect("watch");
        let subscribe = request_of(peer.recv().await);
        assert_eq!(subscribe.method, "subscribeChannels");
        assert_eq!(subscribe.params["channels"], json!(["_sum/State"]));

        peer.send(Notification::new(
            "currentData",
            json!({"_sum/State": 0, "_sum/GridActivePower": 1200}),
        ));
        let values = watch.recv().await.expect("values");
        assert_eq!(values.get(&state), Some(&json!(0)));
        assert_eq!(values.0.len(), 1);

        watch.close().await.expect("closed");
        let unsubscribe = request_of(peer.recv().await);
        assert_eq!(unsubscribe.params["channels"], json!([]));
    }
}
