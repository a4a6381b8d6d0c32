//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Integration and validation tests for the ems-link stack."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use ems_link_client::{ConnectionState, Session, SessionOptions};
use ems_link_common::{ClientConfig, ConnectionMode};
use ems_link_msg::methods::{AUTHENTICATE_WITH_SESSION_ID, CURRENT_DATA};
use ems_link_msg::{
    decode, encode, ChannelAddress, EdgeRpcNotification, Message, Notification, Request,
    ResponseError, ResponseSuccess, RpcError,
};
use serde_json::{json, Value};
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Channels each Edge was last asked to push, as seen by the backend.
type Subscriptions = Arc<Mutex<Vec<(String, BTreeSet<String>)>>>;

fn session_payload() -> Value {
    json!({
        "token": "backend-session",
        "edges": [
            {"id": "edge0", "role": "owner", "isOnline": true},
            {"id": "edge7", "role": "installer", "isOnline": true}
        ]
    })
}

/// Answer one inner request the way a backend proxies it to an Edge.
fn answer_edge(edge: &str, request: &Request, subscriptions: &Subscriptions) -> Message {
    match request.method.as_str() {
        "getEdgeConfig" => ResponseSuccess {
            id: request.id.clone(),
            result: json!({"edge": edge, "components": {"_sum": {"factoryId": "Core.Sum"}}}),
        }
        .into(),
        "subscribeChannels" => {
            let channels = request.params["channels"]
                .as_array()
                .map(|list| {
                    list.iter()
                        .filter_map(|c| c.as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default();
            subscriptions
                .lock()
                .unwrap()
                .push((edge.to_owned(), channels));
            ResponseSuccess {
                id: request.id.clone(),
                result: json!({}),
            }
            .into()
        }
        other => ResponseError {
            id: request.id.clone(),
            error: RpcError::new(-32601, format!("method {other} not found")),
        }
        .into(),
    }
}

async fn backend(mut socket: WebSocket, subscriptions: Subscriptions) {
    let hello = Notification::new(AUTHENTICATE_WITH_SESSION_ID, session_payload());
    if socket
        .send(WsMessage::Text(encode(&hello.into())))
        .await
        .is_err()
    {
        return;
    }
    while let Some(Ok(frame)) = socket.recv().await {
        let WsMessage::Text(text) = frame else {
            continue;
        };
        let Ok(Message::Request(outer)) = decode(&text) else {
            continue;
        };
        let edge = outer.params["edgeId"].as_str().unwrap_or_default().to_owned();
        let Ok(Message::Request(inner)) = Message::from_value(outer.params["payload"].clone()) else {
            continue;
        };
        let inner_response = answer_edge(&edge, &inner, &subscriptions);
        let reply = ResponseSuccess {
            id: outer.id,
            result: json!({ "payload": inner_response.to_value() }),
        };
        let mut frames = vec![encode(&reply.into())];
        if inner.method == "subscribeChannels" {
            let push = EdgeRpcNotification {
                edge_id: edge.clone(),
                payload: Notification::new(CURRENT_DATA, json!({"_sum/EssSoc": 54})),
            }
            .into_notification();
            frames.push(encode(&push.into()));
        }
        for frame in frames {
            if socket.send(WsMessage::Text(frame)).await.is_err() {
                return;
            }
        }
    }
}

async fn start_backend() -> (String, Subscriptions) {
    let subscriptions: Subscriptions = Arc::default();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new()
        .route(
            "/websocket",
            get(
                |ws: WebSocketUpgrade, State(subscriptions): State<Subscriptions>| async move {
                    ws.on_upgrade(move |socket| backend(socket, subscriptions))
                },
            ),
        )
        .with_state(subscriptions.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("ws://{addr}/websocket"), subscriptions)
}

#[tokio::test]
async fn configured_backend_session_end_to_end() {
    let (url, subscriptions) = start_backend().await;

    let dir = tempdir().unwrap();
    let path = dir.path().join("client.toml");
    std::fs::write(
        &path,
        format!(
            r#"
[endpoint]
url = "{url}"
mode = "backend"

[timeouts]
request_ms = 2000

[subscriptions]
debounce_ms = 10
"#
        ),
    )
    .unwrap();
    let config = ClientConfig::from_path(&path).unwrap();
    assert_eq!(config.endpoint.mode, ConnectionMode::Backend);

    let options = SessionOptions::from(&config);
    assert_eq!(options.request_timeout, Duration::from_secs(2));
    assert_eq!(options.subscription_debounce, Duration::from_millis(10));

    let session = Session::spawn(options);
    session.connect(&config.endpoint.url).await.unwrap();
    timeout(WAIT, session.wait_for_state(ConnectionState::Authenticated))
        .await
        .unwrap()
        .unwrap();
    let edges: Vec<String> = session
        .devices()
        .await
        .unwrap()
        .into_iter()
        .map(|edge| edge.id)
        .collect();
    assert_eq!(edges, vec!["edge0", "edge7"]);

    let edge7 = session.edge("edge7");
    let edge_config = edge7.get_edge_config().await.unwrap();
    assert_eq!(edge_config["edge"], "edge7");

    let err = edge7
        .send_request("noSuchMethod", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.rpc_error().map(|e| e.code), Some(-32601));

    let soc: ChannelAddress = "_sum/EssSoc".parse().unwrap();
    let mut watch = session
        .edge("edge0")
        .watch_channels("dashboard", [soc.clone()])
        .await
        .unwrap();
    let values = timeout(WAIT, watch.recv()).await.unwrap().unwrap();
    assert_eq!(values.get(&soc), Some(&json!(54)));

    {
        let seen = subscriptions.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "edge0");
        assert!(seen[0].1.contains("_sum/EssSoc"));
    }

    watch.close().await.unwrap();
    session.disconnect().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Disconnected);
}
