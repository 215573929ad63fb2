use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        AttachmentKind, ChatRoomId, ChatRoomKind, MessageId, MessageKind, ProjectRoomId, Role,
        UserId, SYSTEM_SENDER_ID,
    },
    error::ApiError,
};

/// Picks the first value that is present and not blank. The server spells several fields
/// two ways and sometimes sends both, so aliases cannot be used for them.
fn first_present(candidates: impl IntoIterator<Item = Option<String>>) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .find(|value| !value.trim().is_empty())
}

fn required_id(
    underscore_id: Option<String>,
    id: Option<String>,
    what: &str,
) -> Result<String, String> {
    first_present([underscore_id, id])
        .ok_or_else(|| format!("{what} is missing `_id`"))
}

/// A reference the server may send either as a bare id or as an embedded document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdRef {
    Bare(String),
    Embedded(EmbeddedRef),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EmbeddedRefRepr")]
pub struct EmbeddedRef {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

#[derive(Deserialize)]
struct EmbeddedRefRepr {
    #[serde(default, rename = "_id")]
    underscore_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    role: Option<Role>,
}

impl TryFrom<EmbeddedRefRepr> for EmbeddedRef {
    type Error = String;

    fn try_from(value: EmbeddedRefRepr) -> Result<Self, Self::Error> {
        Ok(EmbeddedRef {
            id: required_id(value.underscore_id, value.id, "reference")?,
            name: first_present([value.name, value.username]),
            role: value.role,
        })
    }
}

impl IdRef {
    pub fn bare(id: impl Into<String>) -> Self {
        IdRef::Bare(id.into())
    }

    pub fn embedded(id: impl Into<String>) -> Self {
        IdRef::Embedded(EmbeddedRef {
            id: id.into(),
            name: None,
            role: None,
        })
    }

    pub fn id(&self) -> &str {
        match self {
            IdRef::Bare(id) => id.trim(),
            IdRef::Embedded(embedded) => embedded.id.trim(),
        }
    }
}

/// Single normalization point for user references; every participant comparison goes
/// through this.
pub fn normalize_user_id(value: &IdRef) -> UserId {
    UserId(value.id().to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ParticipantRepr")]
pub struct Participant {
    pub user: IdRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ParticipantRepr {
    Member {
        user: IdRef,
        #[serde(default)]
        role: Option<Role>,
    },
    User(IdRef),
}

impl From<ParticipantRepr> for Participant {
    fn from(value: ParticipantRepr) -> Self {
        match value {
            ParticipantRepr::Member { user, role } => Participant { user, role },
            ParticipantRepr::User(user) => {
                let role = match &user {
                    IdRef::Embedded(embedded) => embedded.role,
                    IdRef::Bare(_) => None,
                };
                Participant { user, role }
            }
        }
    }
}

impl Participant {
    pub fn user_id(&self) -> UserId {
        normalize_user_id(&self.user)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "ProjectRoomRepr")]
pub struct ProjectRoom {
    #[serde(rename = "_id")]
    pub id: ProjectRoomId,
    pub project_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectRoomRepr {
    #[serde(default, rename = "_id")]
    underscore_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    project_title: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    last_activity_at: Option<DateTime<Utc>>,
}

impl TryFrom<ProjectRoomRepr> for ProjectRoom {
    type Error = String;

    fn try_from(value: ProjectRoomRepr) -> Result<Self, Self::Error> {
        Ok(ProjectRoom {
            id: ProjectRoomId(required_id(value.underscore_id, value.id, "project room")?),
            project_title: first_present([value.project_title, value.title])
                .unwrap_or_default(),
            last_activity_at: value.last_activity_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "LastMessageSummaryRepr")]
pub struct LastMessageSummary {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<IdRef>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LastMessageSummaryRepr {
    #[serde(default)]
    content: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    sender: Option<IdRef>,
}

impl From<LastMessageSummaryRepr> for LastMessageSummary {
    fn from(value: LastMessageSummaryRepr) -> Self {
        LastMessageSummary {
            content: value.content,
            created_at: value.created_at.or(value.timestamp),
            sender: value.sender,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "ChatRoomRepr")]
pub struct ChatRoom {
    #[serde(rename = "_id")]
    pub id: ChatRoomId,
    #[serde(rename = "type")]
    pub kind: ChatRoomKind,
    pub project_room: IdRef,
    pub participants: Vec<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engineer: Option<IdRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<IdRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessageSummary>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRoomRepr {
    #[serde(default, rename = "_id")]
    underscore_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    kind: ChatRoomKind,
    #[serde(default)]
    project_room: Option<IdRef>,
    #[serde(default)]
    project_room_id: Option<IdRef>,
    #[serde(default)]
    participants: Vec<Participant>,
    #[serde(default)]
    engineer: Option<IdRef>,
    #[serde(default)]
    company: Option<IdRef>,
    #[serde(default)]
    last_message: Option<LastMessageSummary>,
}

impl TryFrom<ChatRoomRepr> for ChatRoom {
    type Error = String;

    fn try_from(value: ChatRoomRepr) -> Result<Self, Self::Error> {
        let id = required_id(value.underscore_id, value.id, "chat room")?;
        let project_room = value
            .project_room
            .or(value.project_room_id)
            .ok_or_else(|| format!("chat room {id} is missing `projectRoom`"))?;
        Ok(ChatRoom {
            id: ChatRoomId(id),
            kind: value.kind,
            project_room,
            participants: value.participants,
            engineer: value.engineer,
            company: value.company,
            last_message: value.last_message,
        })
    }
}

impl ChatRoom {
    pub fn project_room_id(&self) -> ProjectRoomId {
        ProjectRoomId(self.project_room.id().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SenderRepr")]
pub struct Sender {
    #[serde(rename = "_id")]
    pub id: UserId,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SenderRepr {
    Bare(String),
    Full(EmbeddedRefRepr),
}

impl TryFrom<SenderRepr> for Sender {
    type Error = String;

    fn try_from(value: SenderRepr) -> Result<Self, Self::Error> {
        match value {
            SenderRepr::Bare(id) => Ok(Sender {
                id: UserId(id),
                name: String::new(),
                role: None,
            }),
            SenderRepr::Full(full) => {
                let embedded = EmbeddedRef::try_from(full)?;
                Ok(Sender {
                    id: UserId(embedded.id),
                    name: embedded.name.unwrap_or_default(),
                    role: embedded.role,
                })
            }
        }
    }
}

impl Sender {
    pub fn system() -> Self {
        Sender {
            id: UserId(SYSTEM_SENDER_ID.to_string()),
            name: "System".to_string(),
            role: Some(Role::System),
        }
    }

    pub fn is_system(&self) -> bool {
        self.id.as_str() == SYSTEM_SENDER_ID || self.role == Some(Role::System)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "AttachmentRepr")]
pub struct Attachment {
    /// Display name; the stored file name is only a fallback.
    pub filename: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachmentRepr {
    #[serde(default)]
    original_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    file_size: Option<u64>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    mimetype: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    file_url: Option<String>,
}

impl From<AttachmentRepr> for Attachment {
    fn from(value: AttachmentRepr) -> Self {
        Attachment {
            filename: first_present([value.original_name, value.name, value.filename])
                .unwrap_or_default(),
            size: value.size.or(value.file_size).unwrap_or_default(),
            mime_type: first_present([value.mime_type, value.mimetype]),
            url: first_present([value.url, value.file_url]),
        }
    }
}

impl Attachment {
    pub fn kind(&self) -> AttachmentKind {
        match self.mime_type.as_deref() {
            Some(mime_type) if !mime_type.trim().is_empty() => AttachmentKind::from_mime(mime_type),
            _ => AttachmentKind::from_filename(&self.filename),
        }
    }

    /// `None` while the upload has not produced a resolvable location yet.
    pub fn url(&self) -> Option<&str> {
        self.url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub fn is_pending(&self) -> bool {
        self.url().is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "MessagePayloadRepr")]
pub struct MessagePayload {
    #[serde(rename = "_id")]
    pub id: MessageId,
    #[serde(rename = "chatRoomId")]
    pub chat_room_id: ChatRoomId,
    pub sender: Sender,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePayloadRepr {
    #[serde(default, rename = "_id")]
    underscore_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    chat_room_id: Option<IdRef>,
    #[serde(default)]
    chat_room: Option<IdRef>,
    sender: Sender,
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(default)]
    content: String,
    #[serde(default)]
    attachments: Vec<Attachment>,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessagePayloadRepr> for MessagePayload {
    type Error = String;

    fn try_from(value: MessagePayloadRepr) -> Result<Self, Self::Error> {
        let id = required_id(value.underscore_id, value.id, "message")?;
        let chat_room_id = value
            .chat_room_id
            .or(value.chat_room)
            .map(|room| ChatRoomId(room.id().to_string()))
            .ok_or_else(|| format!("message {id} is missing `chatRoomId`"))?;
        Ok(MessagePayload {
            id: MessageId(id),
            chat_room_id,
            sender: value.sender,
            kind: value.kind,
            content: value.content,
            attachments: value.attachments,
            created_at: value.created_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    #[serde(default)]
    pub messages: Vec<MessagePayload>,
    #[serde(default = "first_page")]
    pub page: u32,
    #[serde(default = "first_page")]
    pub total_pages: u32,
}

fn first_page() -> u32 {
    1
}

impl MessagePage {
    pub fn empty() -> Self {
        Self {
            messages: Vec::new(),
            page: 1,
            total_pages: 1,
        }
    }
}

/// JSON body for a text-only message; attachments go through multipart instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    JoinRoom {
        #[serde(rename = "chatRoomId")]
        chat_room_id: ChatRoomId,
    },
    LeaveRoom {
        #[serde(rename = "chatRoomId")]
        chat_room_id: ChatRoomId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage {
        #[serde(rename = "chatRoomId")]
        chat_room_id: ChatRoomId,
        message: MessagePayload,
    },
    RoomJoined {
        #[serde(rename = "chatRoomId")]
        chat_room_id: ChatRoomId,
    },
    RoomLeft {
        #[serde(rename = "chatRoomId")]
        chat_room_id: ChatRoomId,
    },
    Error(ApiError),
}
