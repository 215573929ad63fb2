//! In-memory collaborators shared by the unit tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{ChatRoomId, ChatRoomKind, MessageId, MessageKind, ProjectRoomId, Role, UserId},
    protocol::{
        Attachment, ChatRoom, IdRef, MessagePage, MessagePayload, Participant, ProjectRoom,
        Sender,
    },
};
use tokio::sync::{broadcast, Mutex};

use crate::{
    api::{ChatApi, OutgoingMessage, ProgressFn},
    error::ChatError,
    transport::{RealtimeTransport, TransportEvent},
};

pub(crate) fn at_minute(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).single().expect("base time")
        + chrono::Duration::minutes(minute)
}

pub(crate) fn message(chat_room_id: &str, id: &str, minute: i64) -> MessagePayload {
    MessagePayload {
        id: MessageId::from(id),
        chat_room_id: ChatRoomId::from(chat_room_id),
        sender: Sender {
            id: UserId::from("u2"),
            name: "Bo".to_string(),
            role: Some(Role::Engineer),
        },
        kind: MessageKind::Text,
        content: format!("message {id}"),
        attachments: Vec::new(),
        created_at: at_minute(minute),
    }
}

pub(crate) fn project_room(id: &str) -> ProjectRoom {
    ProjectRoom {
        id: ProjectRoomId::from(id),
        project_title: format!("Project {id}"),
        last_activity_at: None,
    }
}

pub(crate) fn chat_room(
    id: &str,
    project_room_id: &str,
    kind: ChatRoomKind,
    participants: &[&str],
) -> ChatRoom {
    ChatRoom {
        id: ChatRoomId::from(id),
        kind,
        project_room: IdRef::bare(project_room_id),
        participants: participants
            .iter()
            .map(|user| Participant {
                user: IdRef::bare(*user),
                role: None,
            })
            .collect(),
        engineer: None,
        company: None,
        last_message: None,
    }
}

/// Pages of `page_size` messages, one minute apart, oldest first across the whole history.
pub(crate) fn paged_history(
    chat_room_id: &str,
    total: usize,
    page_size: usize,
) -> Vec<MessagePage> {
    let all = (0..total)
        .map(|n| message(chat_room_id, &format!("m{n:03}"), n as i64))
        .collect::<Vec<_>>();
    let total_pages = all.len().div_ceil(page_size).max(1) as u32;
    // Page 1 holds the newest messages.
    all.rchunks(page_size)
        .enumerate()
        .map(|(index, chunk)| MessagePage {
            messages: chunk.to_vec(),
            page: index as u32 + 1,
            total_pages,
        })
        .collect()
}

#[derive(Default)]
pub(crate) struct FakeChatApi {
    pub project_rooms: Mutex<Option<Vec<ProjectRoom>>>,
    pub chat_rooms: Mutex<HashMap<ProjectRoomId, Vec<ChatRoom>>>,
    pub pages: Mutex<HashMap<(ChatRoomId, u32), MessagePage>>,
    pub fetch_delays: Mutex<HashMap<ChatRoomId, Duration>>,
    pub fetch_errors: Mutex<HashMap<ChatRoomId, ChatError>>,
    pub fetch_calls: Mutex<Vec<(ChatRoomId, u32)>>,
    pub post_error: Mutex<Option<ChatError>>,
    pub post_delay: Mutex<Duration>,
    pub posted: Mutex<Vec<(ChatRoomId, OutgoingMessage)>>,
    pub post_calls: AtomicUsize,
    pub mark_read_error: Mutex<Option<ChatError>>,
    pub mark_read_calls: Mutex<Vec<ChatRoomId>>,
}

impl FakeChatApi {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) async fn with_pages(&self, chat_room_id: &str, pages: Vec<MessagePage>) {
        let mut guard = self.pages.lock().await;
        for page in pages {
            guard.insert((ChatRoomId::from(chat_room_id), page.page), page);
        }
    }

    pub(crate) async fn with_chat_rooms(&self, project_room_id: &str, rooms: Vec<ChatRoom>) {
        self.chat_rooms
            .lock()
            .await
            .insert(ProjectRoomId::from(project_room_id), rooms);
    }

    pub(crate) fn post_count(&self) -> usize {
        self.post_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn list_project_rooms(&self) -> Result<Vec<ProjectRoom>, ChatError> {
        self.project_rooms
            .lock()
            .await
            .clone()
            .ok_or(ChatError::NotFound)
    }

    async fn list_chat_rooms(
        &self,
        project_room_id: &ProjectRoomId,
    ) -> Result<Vec<ChatRoom>, ChatError> {
        self.chat_rooms
            .lock()
            .await
            .get(project_room_id)
            .cloned()
            .ok_or(ChatError::NotFound)
    }

    async fn fetch_messages(
        &self,
        chat_room_id: &ChatRoomId,
        page: u32,
        _page_size: u32,
    ) -> Result<MessagePage, ChatError> {
        self.fetch_calls
            .lock()
            .await
            .push((chat_room_id.clone(), page));
        let delay = self.fetch_delays.lock().await.get(chat_room_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.fetch_errors.lock().await.get(chat_room_id).cloned() {
            return Err(err);
        }
        self.pages
            .lock()
            .await
            .get(&(chat_room_id.clone(), page))
            .cloned()
            .ok_or(ChatError::NotFound)
    }

    async fn post_message(
        &self,
        chat_room_id: &ChatRoomId,
        message: OutgoingMessage,
        progress: Option<ProgressFn>,
    ) -> Result<MessagePayload, ChatError> {
        let call = self.post_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.post_delay.lock().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.post_error.lock().await.clone() {
            return Err(err);
        }
        if let Some(progress) = &progress {
            progress(0);
            progress(100);
        }

        let created = MessagePayload {
            id: MessageId::new(format!("sent-{call}")),
            chat_room_id: chat_room_id.clone(),
            sender: Sender {
                id: UserId::from("u1"),
                name: "Ana".to_string(),
                role: Some(Role::Client),
            },
            kind: message.kind,
            content: message.content.clone(),
            attachments: message
                .attachments
                .iter()
                .map(|attachment| Attachment {
                    filename: attachment.filename.clone(),
                    size: attachment.size(),
                    mime_type: attachment.mime_type.clone(),
                    url: Some(format!("/uploads/{}", attachment.filename)),
                })
                .collect(),
            created_at: at_minute(500 + call as i64),
        };
        self.posted
            .lock()
            .await
            .push((chat_room_id.clone(), message));
        Ok(created)
    }

    async fn mark_read(&self, chat_room_id: &ChatRoomId) -> Result<(), ChatError> {
        self.mark_read_calls.lock().await.push(chat_room_id.clone());
        match self.mark_read_error.lock().await.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransportCall {
    Connect,
    Join(ChatRoomId),
    Leave(ChatRoomId),
    Disconnect,
}

pub(crate) struct FakeTransport {
    events: broadcast::Sender<TransportEvent>,
    pub calls: Mutex<Vec<TransportCall>>,
    /// Joins for these rooms take this long before they count as subscribed.
    pub join_delays: Mutex<HashMap<ChatRoomId, Duration>>,
    subscribed: Mutex<HashSet<ChatRoomId>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            calls: Mutex::new(Vec::new()),
            join_delays: Mutex::new(HashMap::new()),
            subscribed: Mutex::new(HashSet::new()),
        })
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) async fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().await.clone()
    }

    pub(crate) async fn subscribed_rooms(&self) -> HashSet<ChatRoomId> {
        self.subscribed.lock().await.clone()
    }
}

#[async_trait]
impl RealtimeTransport for FakeTransport {
    async fn connect(&self) -> Result<(), ChatError> {
        self.calls.lock().await.push(TransportCall::Connect);
        Ok(())
    }

    async fn join_room(&self, chat_room_id: &ChatRoomId) -> Result<(), ChatError> {
        let delay = self.join_delays.lock().await.get(chat_room_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.calls
            .lock()
            .await
            .push(TransportCall::Join(chat_room_id.clone()));
        self.subscribed.lock().await.insert(chat_room_id.clone());
        Ok(())
    }

    async fn leave_room(&self, chat_room_id: &ChatRoomId) -> Result<(), ChatError> {
        self.calls
            .lock()
            .await
            .push(TransportCall::Leave(chat_room_id.clone()));
        self.subscribed.lock().await.remove(chat_room_id);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn disconnect(&self) {
        self.calls.lock().await.push(TransportCall::Disconnect);
    }
}
