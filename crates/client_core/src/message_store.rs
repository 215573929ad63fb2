use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use shared::{
    domain::{ChatRoomId, MessageId},
    protocol::{MessagePage, MessagePayload},
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{api::ChatApi, error::ChatError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMerge {
    /// Swap in the fetched page; only applied once the response arrived.
    Replace,
    /// Fold the page into what is already held.
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    Loaded {
        added: usize,
        page: u32,
        total_pages: u32,
    },
    /// The server did not answer in time; cached messages were kept.
    TimedOut,
}

/// Ordered, de-duplicated message list for one chat room.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    messages: Vec<MessagePayload>,
    ids: HashSet<MessageId>,
    pages_loaded: u32,
    total_pages: u32,
    loaded: bool,
}

impl MessageLog {
    pub fn messages(&self) -> &[MessagePayload] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn page(&self) -> u32 {
        self.pages_loaded
    }

    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }

    pub fn has_more(&self) -> bool {
        self.pages_loaded < self.total_pages
    }

    pub fn next_page(&self) -> u32 {
        self.pages_loaded.saturating_add(1)
    }

    /// Returns false when a message with the same id is already held.
    pub fn append(&mut self, message: MessagePayload) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        self.messages.push(message);
        self.sort();
        true
    }

    fn merge(&mut self, incoming: Vec<MessagePayload>) -> usize {
        let mut added = 0;
        for message in incoming {
            if self.ids.insert(message.id.clone()) {
                self.messages.push(message);
                added += 1;
            }
        }
        self.sort();
        added
    }

    fn replace(&mut self, incoming: Vec<MessagePayload>) -> usize {
        self.messages.clear();
        self.ids.clear();
        self.merge(incoming)
    }

    fn sort(&mut self) {
        self.messages
            .sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    }
}

#[derive(Default)]
struct StoreState {
    logs: HashMap<ChatRoomId, MessageLog>,
    attempted: HashSet<ChatRoomId>,
}

/// Per-room message cache. Network fetches never run while the state lock is held.
pub struct MessageStore {
    api: Arc<dyn ChatApi>,
    load_timeout: Duration,
    state: Mutex<StoreState>,
}

impl MessageStore {
    pub fn new(api: Arc<dyn ChatApi>, load_timeout: Duration) -> Self {
        Self {
            api,
            load_timeout,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Fetches one page without touching the cache. A missing room reads as an empty page.
    pub async fn fetch_page(
        &self,
        chat_room_id: &ChatRoomId,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage, ChatError> {
        let fetched = tokio::time::timeout(
            self.load_timeout,
            self.api.fetch_messages(chat_room_id, page, page_size),
        )
        .await
        .map_err(|_| ChatError::Timeout {
            operation: "load_page",
            after: self.load_timeout,
        })?;

        let mut page = match fetched {
            Ok(page) => page,
            Err(ChatError::NotFound) => {
                debug!(chat_room_id = %chat_room_id, page, "store: room has no messages yet");
                MessagePage::empty()
            }
            Err(err) => return Err(err),
        };

        let before = page.messages.len();
        page.messages
            .retain(|message| &message.chat_room_id == chat_room_id);
        if page.messages.len() < before {
            warn!(
                chat_room_id = %chat_room_id,
                dropped = before - page.messages.len(),
                "store: page carried messages for another room"
            );
        }
        Ok(page)
    }

    pub async fn apply_page(
        &self,
        chat_room_id: &ChatRoomId,
        page: MessagePage,
        merge: PageMerge,
    ) -> PageOutcome {
        let mut guard = self.state.lock().await;
        let log = guard.logs.entry(chat_room_id.clone()).or_default();
        let added = match merge {
            PageMerge::Replace => {
                log.pages_loaded = page.page;
                log.replace(page.messages)
            }
            PageMerge::Append => {
                log.pages_loaded = log.pages_loaded.max(page.page);
                log.merge(page.messages)
            }
        };
        log.total_pages = page.total_pages.max(page.page);
        log.loaded = true;
        debug!(
            chat_room_id = %chat_room_id,
            page = page.page,
            total_pages = log.total_pages,
            added,
            "store: page applied"
        );
        PageOutcome::Loaded {
            added,
            page: page.page,
            total_pages: log.total_pages,
        }
    }

    pub async fn load_page(
        &self,
        chat_room_id: &ChatRoomId,
        page: u32,
        page_size: u32,
        merge: PageMerge,
    ) -> Result<PageOutcome, ChatError> {
        match self.fetch_page(chat_room_id, page, page_size).await {
            Ok(fetched) => Ok(self.apply_page(chat_room_id, fetched, merge).await),
            Err(ChatError::Timeout { after, .. }) => {
                warn!(
                    chat_room_id = %chat_room_id,
                    page,
                    after_ms = after.as_millis() as u64,
                    "store: page load timed out; keeping cached messages"
                );
                Ok(PageOutcome::TimedOut)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn append(&self, chat_room_id: &ChatRoomId, message: MessagePayload) -> bool {
        if &message.chat_room_id != chat_room_id {
            warn!(
                chat_room_id = %chat_room_id,
                message_room = %message.chat_room_id,
                "store: refusing message for another room"
            );
            return false;
        }
        self.state
            .lock()
            .await
            .logs
            .entry(chat_room_id.clone())
            .or_default()
            .append(message)
    }

    pub async fn contains(&self, chat_room_id: &ChatRoomId, message_id: &MessageId) -> bool {
        self.state
            .lock()
            .await
            .logs
            .get(chat_room_id)
            .is_some_and(|log| log.contains(message_id))
    }

    pub async fn messages(&self, chat_room_id: &ChatRoomId) -> Vec<MessagePayload> {
        self.state
            .lock()
            .await
            .logs
            .get(chat_room_id)
            .map(|log| log.messages().to_vec())
            .unwrap_or_default()
    }

    pub async fn len(&self, chat_room_id: &ChatRoomId) -> usize {
        self.state
            .lock()
            .await
            .logs
            .get(chat_room_id)
            .map_or(0, MessageLog::len)
    }

    pub async fn log(&self, chat_room_id: &ChatRoomId) -> Option<MessageLog> {
        self.state.lock().await.logs.get(chat_room_id).cloned()
    }

    pub async fn has_more(&self, chat_room_id: &ChatRoomId) -> bool {
        self.state
            .lock()
            .await
            .logs
            .get(chat_room_id)
            .is_some_and(MessageLog::has_more)
    }

    pub async fn next_page(&self, chat_room_id: &ChatRoomId) -> u32 {
        self.state
            .lock()
            .await
            .logs
            .get(chat_room_id)
            .map_or(1, MessageLog::next_page)
    }

    /// True only the first time a load is attempted for `chat_room_id`.
    pub async fn begin_load(&self, chat_room_id: &ChatRoomId) -> bool {
        self.state
            .lock()
            .await
            .attempted
            .insert(chat_room_id.clone())
    }

    pub async fn forget_load(&self, chat_room_id: &ChatRoomId) {
        self.state.lock().await.attempted.remove(chat_room_id);
    }

    pub async fn is_loaded(&self, chat_room_id: &ChatRoomId) -> bool {
        self.state
            .lock()
            .await
            .logs
            .get(chat_room_id)
            .is_some_and(|log| log.loaded)
    }

    pub async fn reset_pagination(&self, chat_room_id: &ChatRoomId) {
        if let Some(log) = self.state.lock().await.logs.get_mut(chat_room_id) {
            log.pages_loaded = log.pages_loaded.min(1);
        }
    }
}

#[cfg(test)]
#[path = "tests/message_store_tests.rs"]
mod tests;
