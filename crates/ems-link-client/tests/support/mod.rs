//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "integration-tests"
//! ems_type: "test"
//! ems_scope: "code"
//! ems_description: "Scriptable WebSocket peer for session integration tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use ems_link_msg::{decode, encode, Message, Request};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

enum Outbound {
    Frame(String),
    Close,
}

/// Server side of one accepted WebSocket.
pub struct Peer {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<Outbound>,
}

impl Peer {
    pub async fn recv(&mut self) -> Message {
        let text = timeout(WAIT, self.from_client.recv())
            .await
            .expect("client frame in time")
            .expect("client still connected");
        decode(&text).unwrap()
    }

    pub async fn recv_request(&mut self) -> Request {
        match self.recv().await {
            Message::Request(request) => request,
            other => panic!("expected request, got {other:?}"),
        }
    }

    pub fn send(&self, message: impl Into<Message>) {
        let _ = self.to_client.send(Outbound::Frame(encode(&message.into())));
    }

    pub fn close(&self) {
        let _ = self.to_client.send(Outbound::Close);
    }
}

/// WebSocket server handing every accepted connection to the test.
pub struct MockPeerServer {
    addr: SocketAddr,
    peers: mpsc::UnboundedReceiver<Peer>,
}

impl MockPeerServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (peers_tx, peers) = mpsc::unbounded_channel();
        let app = Router::new()
            .route("/websocket", get(upgrade))
            .with_state(peers_tx);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { addr, peers }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/websocket", self.addr)
    }

    pub async fn accept(&mut self) -> Peer {
        timeout(WAIT, self.peers.recv())
            .await
            .expect("connection in time")
            .expect("server running")
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    State(peers): State<mpsc::UnboundedSender<Peer>>,
) -> axum::response::Response {
    ws.on_upgrade(move |socket| serve_peer(socket, peers))
}

async fn serve_peer(mut socket: WebSocket, peers: mpsc::UnboundedSender<Peer>) {
    let (from_client_tx, from_client) = mpsc::unbounded_channel();
    let (to_client, mut outbound) = mpsc::unbounded_channel();
    if peers
        .send(Peer {
            from_client,
            to_client,
        })
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Frame(text)) => {
                    if socket.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = socket.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            message = socket.recv() => match message {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = from_client_tx.send(text);
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
