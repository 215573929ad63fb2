use super::*;

use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    routing::get,
    Router,
};
use serde_json::json;
use tokio::{net::TcpListener, time::timeout};

#[derive(Clone, Default)]
struct WsState {
    connections: Arc<Mutex<Vec<Vec<ClientFrame>>>>,
    tokens: Arc<Mutex<Vec<String>>>,
    drop_first_connection_after_join: bool,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<WsState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    state
        .tokens
        .lock()
        .await
        .push(query.get("token").cloned().unwrap_or_default());
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn new_message_frame(chat_room_id: &str) -> String {
    json!({
        "type": "new_message",
        "payload": {
            "chatRoomId": chat_room_id,
            "message": {
                "_id": "m-live",
                "chatRoomId": chat_room_id,
                "sender": {"_id": "u2", "name": "Bo", "role": "engineer"},
                "type": "text",
                "content": "live",
                "createdAt": "2024-05-01T10:00:00Z"
            }
        }
    })
    .to_string()
}

async fn handle_socket(mut socket: WebSocket, state: WsState) {
    let index = {
        let mut connections = state.connections.lock().await;
        connections.push(Vec::new());
        connections.len() - 1
    };
    while let Some(Ok(message)) = socket.recv().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
            continue;
        };
        state.connections.lock().await[index].push(frame.clone());

        if index == 0 && state.drop_first_connection_after_join {
            let _ = socket.send(WsMessage::Close(None)).await;
            return;
        }

        if let ClientFrame::JoinRoom { chat_room_id } = frame {
            let _ = socket
                .send(WsMessage::Text("{\"type\":\"mystery\"}".to_string()))
                .await;
            let _ = socket
                .send(WsMessage::Text(new_message_frame(chat_room_id.as_str())))
                .await;
        }
    }
}

async fn spawn_ws_server(drop_first_connection_after_join: bool) -> (String, WsState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = WsState {
        drop_first_connection_after_join,
        ..WsState::default()
    };
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(200),
        outage_grace: Duration::from_secs(10),
    }
}

async fn next_matching(
    events: &mut broadcast::Receiver<TransportEvent>,
    predicate: impl Fn(&TransportEvent) -> bool,
) -> TransportEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("transport event");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for transport event")
}

#[test]
fn websocket_url_follows_server_scheme() {
    let url = websocket_url("https://chat.example.test/api", "tok en").expect("url");
    assert_eq!(url.as_str(), "wss://chat.example.test/api/ws?token=tok+en");

    let url = websocket_url("https://chat.example.test/api/", "abc").expect("url");
    assert_eq!(url.as_str(), "wss://chat.example.test/api/ws?token=abc");

    let url = websocket_url("http://127.0.0.1:8080", "abc").expect("url");
    assert_eq!(url.as_str(), "ws://127.0.0.1:8080/ws?token=abc");

    assert!(matches!(
        websocket_url("ftp://example.test", "abc"),
        Err(ChatError::Validation { .. })
    ));
}

#[tokio::test]
async fn joined_room_receives_new_message_events_and_skips_unknown_frames() {
    let (server_url, state) = spawn_ws_server(false).await;
    let transport = WsTransport::new(&server_url, "secret", fast_policy()).expect("transport");
    let mut events = transport.subscribe();

    transport.connect().await.expect("connect");
    next_matching(&mut events, |event| {
        matches!(event, TransportEvent::Ready { reconnected: false })
    })
    .await;
    assert_eq!(transport.status().await, ConnectionStatus::Connected);

    transport
        .join_room(&ChatRoomId::from("c1"))
        .await
        .expect("join");
    let event = next_matching(&mut events, |event| {
        matches!(event, TransportEvent::NewMessage { .. })
    })
    .await;
    match event {
        TransportEvent::NewMessage {
            chat_room_id,
            message,
        } => {
            assert_eq!(chat_room_id, ChatRoomId::from("c1"));
            assert_eq!(message.content, "live");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(state.tokens.lock().await.as_slice(), &["secret".to_string()]);

    transport.disconnect().await;
    assert_eq!(transport.status().await, ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn reconnect_rejoins_every_joined_room_before_ready() {
    let (server_url, state) = spawn_ws_server(true).await;
    let transport = WsTransport::new(&server_url, "secret", fast_policy()).expect("transport");
    let mut events = transport.subscribe();

    transport
        .join_room(&ChatRoomId::from("c1"))
        .await
        .expect("deferred join");
    transport.connect().await.expect("connect");
    // Repeated connects share the one physical connection.
    transport.connect().await.expect("connect again");

    next_matching(&mut events, |event| {
        matches!(event, TransportEvent::Reconnecting { attempt: 1, .. })
    })
    .await;
    next_matching(&mut events, |event| {
        matches!(event, TransportEvent::Ready { reconnected: true })
    })
    .await;

    assert_eq!(
        transport.joined_rooms().await,
        vec![ChatRoomId::from("c1")]
    );
    let connections = timeout(Duration::from_secs(5), async {
        loop {
            {
                let connections = state.connections.lock().await;
                if connections.len() >= 2 && !connections[1].is_empty() {
                    return connections.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("second connection frames");
    let rejoin = ClientFrame::JoinRoom {
        chat_room_id: ChatRoomId::from("c1"),
    };
    assert_eq!(connections[0], vec![rejoin.clone()]);
    assert_eq!(connections[1][0], rejoin);

    transport.disconnect().await;
}

#[tokio::test]
async fn leave_room_stops_rejoining() {
    let (server_url, state) = spawn_ws_server(false).await;
    let transport = WsTransport::new(&server_url, "secret", fast_policy()).expect("transport");
    let mut events = transport.subscribe();

    transport.connect().await.expect("connect");
    next_matching(&mut events, |event| {
        matches!(event, TransportEvent::Ready { .. })
    })
    .await;
    transport
        .join_room(&ChatRoomId::from("c1"))
        .await
        .expect("join");
    transport
        .leave_room(&ChatRoomId::from("c1"))
        .await
        .expect("leave");
    // Leaving a room that is not joined is a no-op.
    transport
        .leave_room(&ChatRoomId::from("c2"))
        .await
        .expect("leave unknown");
    assert!(transport.joined_rooms().await.is_empty());

    let frames = timeout(Duration::from_secs(5), async {
        loop {
            {
                let connections = state.connections.lock().await;
                if connections.first().is_some_and(|frames| frames.len() >= 2) {
                    return connections[0].clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("frames");
    assert_eq!(
        frames,
        vec![
            ClientFrame::JoinRoom {
                chat_room_id: ChatRoomId::from("c1")
            },
            ClientFrame::LeaveRoom {
                chat_room_id: ChatRoomId::from("c1")
            },
        ]
    );

    transport.disconnect().await;
}

#[tokio::test]
async fn unreachable_server_backs_off_and_reports_prolonged_outage() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let policy = ReconnectPolicy {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        outage_grace: Duration::from_millis(60),
    };
    let transport =
        WsTransport::new(&format!("http://{addr}"), "secret", policy).expect("transport");
    let mut events = transport.subscribe();
    transport.connect().await.expect("connect");

    let mut delays = Vec::new();
    let outage = timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.expect("event") {
                TransportEvent::Reconnecting { delay, .. } => delays.push(delay),
                TransportEvent::OutageExceeded { down_for } => return down_for,
                other => panic!("unexpected event: {other:?}"),
            }
        }
    })
    .await
    .expect("outage reported");

    assert!(outage >= Duration::from_millis(60));
    assert_eq!(delays.first(), Some(&Duration::from_millis(10)));
    assert!(delays.iter().all(|delay| *delay <= Duration::from_millis(40)));
    assert!(matches!(
        transport.status().await,
        ConnectionStatus::Reconnecting { .. }
    ));

    transport.disconnect().await;
}
