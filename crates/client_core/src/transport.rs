use std::{
    collections::BTreeSet,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::ChatRoomId,
    error::ApiError,
    protocol::{ClientFrame, MessagePayload, ServerEvent},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{config::ReconnectPolicy, error::ChatError};

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connection is up and every joined room has been re-joined.
    Ready { reconnected: bool },
    NewMessage {
        chat_room_id: ChatRoomId,
        message: MessagePayload,
    },
    Reconnecting { attempt: u32, delay: Duration },
    OutageExceeded { down_for: Duration },
    ServerError(ApiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

/// Real-time channel: one physical connection, room subscriptions multiplexed over it.
/// Dropping a receiver returned by `subscribe` unsubscribes it.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self) -> Result<(), ChatError>;
    async fn join_room(&self, chat_room_id: &ChatRoomId) -> Result<(), ChatError>;
    async fn leave_room(&self, chat_room_id: &ChatRoomId) -> Result<(), ChatError>;
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
    async fn disconnect(&self);
}

struct TransportState {
    joined: BTreeSet<ChatRoomId>,
    outbound: Option<mpsc::UnboundedSender<ClientFrame>>,
    status: ConnectionStatus,
}

pub struct WsTransport {
    ws_url: Url,
    policy: ReconnectPolicy,
    events: broadcast::Sender<TransportEvent>,
    shared: Arc<Mutex<TransportState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    pub fn new(
        server_url: &str,
        session_token: &str,
        policy: ReconnectPolicy,
    ) -> Result<Self, ChatError> {
        let ws_url = websocket_url(server_url, session_token)?;
        let (events, _) = broadcast::channel(1024);
        Ok(Self {
            ws_url,
            policy,
            events,
            shared: Arc::new(Mutex::new(TransportState {
                joined: BTreeSet::new(),
                outbound: None,
                status: ConnectionStatus::Disconnected,
            })),
            task: Mutex::new(None),
        })
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.shared.lock().await.status
    }

    pub async fn joined_rooms(&self) -> Vec<ChatRoomId> {
        self.shared.lock().await.joined.iter().cloned().collect()
    }
}

#[async_trait]
impl RealtimeTransport for WsTransport {
    async fn connect(&self) -> Result<(), ChatError> {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }
        self.shared.lock().await.status = ConnectionStatus::Connecting;
        *task = Some(tokio::spawn(run_connection_loop(
            self.ws_url.clone(),
            self.policy,
            Arc::clone(&self.shared),
            self.events.clone(),
        )));
        Ok(())
    }

    async fn join_room(&self, chat_room_id: &ChatRoomId) -> Result<(), ChatError> {
        let mut guard = self.shared.lock().await;
        guard.joined.insert(chat_room_id.clone());
        match &guard.outbound {
            Some(outbound) => {
                if outbound
                    .send(ClientFrame::JoinRoom {
                        chat_room_id: chat_room_id.clone(),
                    })
                    .is_err()
                {
                    debug!(
                        chat_room_id = %chat_room_id,
                        "transport: join deferred until reconnect"
                    );
                }
            }
            None => {
                debug!(chat_room_id = %chat_room_id, "transport: not connected; join deferred");
            }
        }
        Ok(())
    }

    async fn leave_room(&self, chat_room_id: &ChatRoomId) -> Result<(), ChatError> {
        let mut guard = self.shared.lock().await;
        if !guard.joined.remove(chat_room_id) {
            return Ok(());
        }
        if let Some(outbound) = &guard.outbound {
            let _ = outbound.send(ClientFrame::LeaveRoom {
                chat_room_id: chat_room_id.clone(),
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn disconnect(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        let mut guard = self.shared.lock().await;
        guard.outbound = None;
        guard.joined.clear();
        guard.status = ConnectionStatus::Disconnected;
        info!("transport: disconnected");
    }
}

pub fn websocket_url(server_url: &str, session_token: &str) -> Result<Url, ChatError> {
    let mut url = Url::parse(server_url)
        .map_err(|err| ChatError::validation(format!("invalid server url '{server_url}': {err}")))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(ChatError::validation(format!(
                "server url must use http(s) or ws(s), got '{other}'"
            )))
        }
    };
    let underivable =
        || ChatError::validation(format!("cannot derive websocket url from '{server_url}'"));
    url.set_scheme(scheme).map_err(|_| underivable())?;
    // Keep any base path, the same way REST endpoints are built.
    url.path_segments_mut()
        .map_err(|_| underivable())?
        .pop_if_empty()
        .push("ws");
    url.query_pairs_mut()
        .clear()
        .append_pair("token", session_token);
    Ok(url)
}

async fn run_connection_loop(
    ws_url: Url,
    policy: ReconnectPolicy,
    shared: Arc<Mutex<TransportState>>,
    events: broadcast::Sender<TransportEvent>,
) {
    let mut attempt: u32 = 0;
    let mut down_since: Option<Instant> = None;
    let mut outage_reported = false;
    let mut connected_before = false;

    loop {
        match connect_async(ws_url.as_str()).await {
            Ok((ws_stream, _)) => {
                let (mut writer, mut reader) = ws_stream.split();
                let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
                let rooms = {
                    let mut guard = shared.lock().await;
                    guard.outbound = Some(outbound_tx);
                    guard.status = ConnectionStatus::Connected;
                    guard.joined.iter().cloned().collect::<Vec<_>>()
                };

                let mut rejoined = true;
                for chat_room_id in rooms {
                    let frame = ClientFrame::JoinRoom {
                        chat_room_id: chat_room_id.clone(),
                    };
                    if let Err(err) = send_frame(&mut writer, &frame).await {
                        warn!(chat_room_id = %chat_room_id, "transport: re-join failed: {err}");
                        rejoined = false;
                        break;
                    }
                }

                if rejoined {
                    if down_since.is_some() || connected_before {
                        info!(attempt, "transport: connection restored");
                    } else {
                        info!("transport: connected");
                    }
                    attempt = 0;
                    down_since = None;
                    outage_reported = false;
                    let _ = events.send(TransportEvent::Ready {
                        reconnected: connected_before,
                    });
                    connected_before = true;

                    loop {
                        tokio::select! {
                            inbound = reader.next() => match inbound {
                                Some(Ok(Message::Text(text))) => dispatch_text(&events, &text),
                                Some(Ok(Message::Close(_))) | None => {
                                    info!("transport: server closed connection");
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(err)) => {
                                    warn!("transport: websocket receive failed: {err}");
                                    break;
                                }
                            },
                            outbound = outbound_rx.recv() => match outbound {
                                Some(frame) => {
                                    if let Err(err) = send_frame(&mut writer, &frame).await {
                                        warn!("transport: websocket send failed: {err}");
                                        break;
                                    }
                                }
                                None => break,
                            },
                        }
                    }
                }

                shared.lock().await.outbound = None;
            }
            Err(err) => {
                warn!(attempt, "transport: connect failed: {err}");
            }
        }

        attempt = attempt.saturating_add(1);
        let since = *down_since.get_or_insert_with(Instant::now);
        let down_for = since.elapsed();
        if !outage_reported && down_for >= policy.outage_grace {
            outage_reported = true;
            error!(
                down_for_ms = down_for.as_millis() as u64,
                "transport: outage exceeded grace period"
            );
            let _ = events.send(TransportEvent::OutageExceeded { down_for });
        }

        let delay = policy.delay_for(attempt);
        shared.lock().await.status = ConnectionStatus::Reconnecting { attempt };
        debug!(attempt, delay_ms = delay.as_millis() as u64, "transport: reconnecting");
        let _ = events.send(TransportEvent::Reconnecting { attempt, delay });
        tokio::time::sleep(delay).await;
    }
}

async fn send_frame<S>(writer: &mut S, frame: &ClientFrame) -> Result<(), ChatError>
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(frame)?;
    writer
        .send(Message::Text(text))
        .await
        .map_err(|err| ChatError::Transport(err.to_string()))
}

fn dispatch_text(events: &broadcast::Sender<TransportEvent>, text: &str) {
    match serde_json::from_str::<ServerEvent>(text) {
        Ok(ServerEvent::NewMessage {
            chat_room_id,
            message,
        }) => {
            let _ = events.send(TransportEvent::NewMessage {
                chat_room_id,
                message,
            });
        }
        Ok(ServerEvent::RoomJoined { chat_room_id }) => {
            debug!(chat_room_id = %chat_room_id, "transport: room joined");
        }
        Ok(ServerEvent::RoomLeft { chat_room_id }) => {
            debug!(chat_room_id = %chat_room_id, "transport: room left");
        }
        Ok(ServerEvent::Error(err)) => {
            warn!(code = ?err.code, "transport: server error frame: {}", err.message);
            let _ = events.send(TransportEvent::ServerError(err));
        }
        Err(err) => {
            warn!("transport: skipping invalid server frame: {err}");
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
