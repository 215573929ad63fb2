use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{ChatRoomId, ChatRoomKind, ProjectRoomId, UserId},
    protocol::{ChatRoom, IdRef, LastMessageSummary, MessagePayload, ProjectRoom},
};
pub use shared::protocol::normalize_user_id;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{api::ChatApi, error::ChatError};

/// Whether `user_id` may see `room`. `admin-*` rooms also honor the denormalized
/// engineer/company reference because they can exist before participants are filled in.
pub fn is_visible_to(room: &ChatRoom, user_id: &UserId) -> bool {
    let listed = room
        .participants
        .iter()
        .any(|participant| &participant.user_id() == user_id);
    match room.kind {
        ChatRoomKind::Group => listed,
        ChatRoomKind::AdminEngineer | ChatRoomKind::AdminCompany => {
            listed
                || [room.engineer.as_ref(), room.company.as_ref()]
                    .into_iter()
                    .flatten()
                    .any(|reference| &normalize_user_id(reference) == user_id)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selection<Id> {
    #[default]
    None,
    Automatic(Id),
    Explicit(Id),
}

impl<Id: Clone + PartialEq> Selection<Id> {
    pub fn current(&self) -> Option<&Id> {
        match self {
            Selection::None => None,
            Selection::Automatic(id) | Selection::Explicit(id) => Some(id),
        }
    }

    pub fn is_explicit(&self) -> bool {
        matches!(self, Selection::Explicit(_))
    }

    /// Applies the default-selection rule after a refresh. Returns true when the selection changed.
    fn offer(&mut self, available: &[Id]) -> bool {
        match self {
            Selection::Explicit(_) => false,
            Selection::Automatic(id) if available.contains(id) => false,
            _ => {
                let next = available
                    .first()
                    .cloned()
                    .map_or(Selection::None, Selection::Automatic);
                let changed = *self != next;
                *self = next;
                changed
            }
        }
    }
}

#[derive(Default)]
struct DirectoryState {
    project_rooms: Vec<ProjectRoom>,
    chat_rooms: HashMap<ProjectRoomId, Vec<ChatRoom>>,
    project_selection: Selection<ProjectRoomId>,
    chat_selection: Selection<ChatRoomId>,
}

impl DirectoryState {
    fn chat_room_mut(&mut self, chat_room_id: &ChatRoomId) -> Option<&mut ChatRoom> {
        self.chat_rooms
            .values_mut()
            .flat_map(|rooms| rooms.iter_mut())
            .find(|room| &room.id == chat_room_id)
    }
}

/// Cached two-level room hierarchy, filtered for one user.
pub struct RoomDirectory {
    api: Arc<dyn ChatApi>,
    user_id: UserId,
    state: Mutex<DirectoryState>,
}

impl RoomDirectory {
    pub fn new(api: Arc<dyn ChatApi>, user_id: UserId) -> Self {
        Self {
            api,
            user_id,
            state: Mutex::new(DirectoryState::default()),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub async fn list_project_rooms(&self) -> Result<Vec<ProjectRoom>, ChatError> {
        let rooms = match self.api.list_project_rooms().await {
            Ok(rooms) => rooms,
            Err(ChatError::NotFound) => {
                info!("directory: no project rooms yet");
                Vec::new()
            }
            Err(err) => return Err(err),
        };

        let mut guard = self.state.lock().await;
        let ids = rooms.iter().map(|room| room.id.clone()).collect::<Vec<_>>();
        if guard.project_selection.offer(&ids) {
            guard.chat_selection = Selection::None;
        }
        guard.project_rooms = rooms.clone();
        Ok(rooms)
    }

    pub async fn list_chat_rooms(
        &self,
        project_room_id: &ProjectRoomId,
    ) -> Result<Vec<ChatRoom>, ChatError> {
        let raw = match self.api.list_chat_rooms(project_room_id).await {
            Ok(rooms) => rooms,
            Err(ChatError::NotFound) => Vec::new(),
            Err(err) => return Err(err),
        };

        let total = raw.len();
        let visible = raw
            .into_iter()
            .filter(|room| is_visible_to(room, &self.user_id))
            .collect::<Vec<_>>();
        if visible.len() < total {
            debug!(
                project_room_id = %project_room_id,
                dropped = total - visible.len(),
                "directory: filtered chat rooms not visible to user"
            );
        }

        let mut guard = self.state.lock().await;
        if guard.project_selection.current() == Some(project_room_id) {
            let ids = visible
                .iter()
                .map(|room| room.id.clone())
                .collect::<Vec<_>>();
            guard.chat_selection.offer(&ids);
        }
        guard
            .chat_rooms
            .insert(project_room_id.clone(), visible.clone());
        Ok(visible)
    }

    pub async fn select_project_room(&self, project_room_id: &ProjectRoomId) {
        let mut guard = self.state.lock().await;
        if guard.project_selection.current() != Some(project_room_id) {
            guard.chat_selection = Selection::None;
        }
        guard.project_selection = Selection::Explicit(project_room_id.clone());
    }

    pub async fn select_chat_room(&self, chat_room_id: &ChatRoomId) {
        self.state.lock().await.chat_selection = Selection::Explicit(chat_room_id.clone());
    }

    pub async fn selected_project_room(&self) -> Option<ProjectRoomId> {
        self.state
            .lock()
            .await
            .project_selection
            .current()
            .cloned()
    }

    pub async fn selected_chat_room(&self) -> Option<ChatRoomId> {
        self.state.lock().await.chat_selection.current().cloned()
    }

    pub async fn project_rooms(&self) -> Vec<ProjectRoom> {
        self.state.lock().await.project_rooms.clone()
    }

    pub async fn chat_rooms(&self, project_room_id: &ProjectRoomId) -> Vec<ChatRoom> {
        self.state
            .lock()
            .await
            .chat_rooms
            .get(project_room_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn chat_room(&self, chat_room_id: &ChatRoomId) -> Option<ChatRoom> {
        self.state
            .lock()
            .await
            .chat_room_mut(chat_room_id)
            .map(|room| room.clone())
    }

    /// Folds an observed message into the cached room summaries. Returns true if anything changed.
    pub async fn record_activity(&self, message: &MessagePayload) -> bool {
        let mut guard = self.state.lock().await;
        let Some(room) = guard.chat_room_mut(&message.chat_room_id) else {
            return false;
        };

        let is_newer = room
            .last_message
            .as_ref()
            .and_then(|summary| summary.created_at)
            .map_or(true, |seen| message.created_at > seen);
        if !is_newer {
            return false;
        }
        room.last_message = Some(LastMessageSummary {
            content: message.content.clone(),
            created_at: Some(message.created_at),
            sender: Some(IdRef::bare(message.sender.id.as_str())),
        });
        let project_room_id = room.project_room_id();

        if let Some(project_room) = guard
            .project_rooms
            .iter_mut()
            .find(|project_room| project_room.id == project_room_id)
        {
            if project_room
                .last_activity_at
                .map_or(true, |seen| message.created_at > seen)
            {
                project_room.last_activity_at = Some(message.created_at);
            }
        }
        true
    }
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
