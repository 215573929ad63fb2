use std::{
    io,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use reqwest::{
    multipart::{Form, Part},
    Body, Client, RequestBuilder,
};
use serde::de::DeserializeOwned;
use shared::{
    domain::{AttachmentKind, ChatRoomId, MessageKind, ProjectRoomId},
    protocol::{
        Attachment, ChatRoom, MessagePage, MessagePayload, ProjectRoom, SendMessageRequest,
    },
};
use tracing::debug;
use url::Url;

use crate::{
    config::{ClientSettings, Identity},
    error::ChatError,
};

const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

/// Upload progress callback, called with a percentage in `0..=100`.
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingAttachment {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl OutgoingAttachment {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        let filename = filename.into();
        let mime_type = mime_guess::from_path(&filename)
            .first()
            .map(|mime| mime.essence_str().to_string());
        Self {
            filename,
            mime_type,
            bytes,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn kind(&self) -> AttachmentKind {
        match self.mime_type.as_deref() {
            Some(mime_type) => AttachmentKind::from_mime(mime_type),
            None => AttachmentKind::from_filename(&self.filename),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub kind: MessageKind,
    pub content: String,
    pub attachments: Vec<OutgoingAttachment>,
}

/// REST collaborator consumed by the engine.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_project_rooms(&self) -> Result<Vec<ProjectRoom>, ChatError>;
    async fn list_chat_rooms(
        &self,
        project_room_id: &ProjectRoomId,
    ) -> Result<Vec<ChatRoom>, ChatError>;
    async fn fetch_messages(
        &self,
        chat_room_id: &ChatRoomId,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage, ChatError>;
    async fn post_message(
        &self,
        chat_room_id: &ChatRoomId,
        message: OutgoingMessage,
        progress: Option<ProgressFn>,
    ) -> Result<MessagePayload, ChatError>;
    async fn mark_read(&self, chat_room_id: &ChatRoomId) -> Result<(), ChatError>;
}

pub struct HttpChatApi {
    http: Client,
    server_url: Url,
    session_token: String,
}

impl HttpChatApi {
    pub fn new(settings: &ClientSettings, identity: &Identity) -> Result<Self, ChatError> {
        let server_url = Url::parse(&settings.server_url).map_err(|err| {
            ChatError::validation(format!(
                "invalid server url '{}': {err}",
                settings.server_url
            ))
        })?;
        let http = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| ChatError::Network(format!("failed to build http client: {err}")))?;
        Ok(Self {
            http,
            server_url,
            session_token: identity.session_token.clone(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ChatError> {
        let mut url = self.server_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ChatError::validation(format!("server url '{}' cannot be a base", self.server_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<reqwest::Response, ChatError> {
        let response = request.bearer_auth(&self.session_token).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), "api: request failed");
        Err(ChatError::from_response(status.as_u16(), &body))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ChatError> {
        let response = self.execute(self.http.get(url)).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_project_rooms(&self) -> Result<Vec<ProjectRoom>, ChatError> {
        self.get_json(self.endpoint(&["project-rooms"])?).await
    }

    async fn list_chat_rooms(
        &self,
        project_room_id: &ProjectRoomId,
    ) -> Result<Vec<ChatRoom>, ChatError> {
        self.get_json(self.endpoint(&["project-rooms", project_room_id.as_str(), "chat-rooms"])?)
            .await
    }

    async fn fetch_messages(
        &self,
        chat_room_id: &ChatRoomId,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage, ChatError> {
        let mut url = self.endpoint(&["chat-rooms", chat_room_id.as_str(), "messages"])?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("pageSize", &page_size.to_string());
        self.get_json(url).await
    }

    async fn post_message(
        &self,
        chat_room_id: &ChatRoomId,
        message: OutgoingMessage,
        progress: Option<ProgressFn>,
    ) -> Result<MessagePayload, ChatError> {
        let url = self.endpoint(&["chat-rooms", chat_room_id.as_str(), "messages"])?;
        let tracker = Arc::new(UploadProgress::new(
            message.attachments.iter().map(OutgoingAttachment::size).sum(),
            progress,
        ));

        let request = if message.attachments.is_empty() {
            self.http.post(url).json(&SendMessageRequest {
                content: message.content,
                kind: message.kind,
            })
        } else {
            let mut form = Form::new()
                .text("content", message.content)
                .text("type", message_kind_field(message.kind));
            for attachment in message.attachments {
                form = form.part("files", progress_part(attachment, Arc::clone(&tracker))?);
            }
            self.http.post(url).multipart(form)
        };

        let response = self.execute(request).await?;
        let created: MessagePayload = response.json().await?;
        tracker.finish();
        Ok(created)
    }

    async fn mark_read(&self, chat_room_id: &ChatRoomId) -> Result<(), ChatError> {
        let url = self.endpoint(&["chat-rooms", chat_room_id.as_str(), "read"])?;
        self.execute(self.http.post(url)).await?;
        Ok(())
    }
}

/// Download location for `attachment`, with relative paths resolved against `server_url`.
/// `None` while the upload is still pending.
pub fn resolve_attachment_url(server_url: &str, attachment: &Attachment) -> Option<String> {
    let raw = attachment.url()?;
    if let Ok(absolute) = Url::parse(raw) {
        return Some(absolute.to_string());
    }
    Url::parse(server_url)
        .and_then(|base| base.join(raw))
        .map(|url| url.to_string())
        .ok()
}

fn message_kind_field(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text",
        MessageKind::File => "file",
        MessageKind::System => "system",
    }
}

fn progress_part(
    attachment: OutgoingAttachment,
    tracker: Arc<UploadProgress>,
) -> Result<Part, ChatError> {
    let length = attachment.size();
    let chunks = attachment
        .bytes
        .chunks(UPLOAD_CHUNK_BYTES)
        .map(<[u8]>::to_vec)
        .collect::<Vec<_>>();
    let stream = futures::stream::iter(chunks.into_iter().map(move |chunk| {
        tracker.advance(chunk.len() as u64);
        Ok::<_, io::Error>(chunk)
    }));

    let part = Part::stream_with_length(Body::wrap_stream(stream), length)
        .file_name(attachment.filename.clone());
    match attachment.mime_type {
        Some(mime_type) => part.mime_str(&mime_type).map_err(|err| ChatError::Validation {
            message: format!("invalid mime type '{mime_type}': {err}"),
            files: vec![attachment.filename],
        }),
        None => Ok(part),
    }
}

/// Percentages stay below 100 until the server has accepted the upload.
struct UploadProgress {
    total: u64,
    sent: AtomicU64,
    reported: AtomicU8,
    callback: Option<ProgressFn>,
}

impl UploadProgress {
    fn new(total: u64, callback: Option<ProgressFn>) -> Self {
        let progress = Self {
            total,
            sent: AtomicU64::new(0),
            reported: AtomicU8::new(0),
            callback,
        };
        if let Some(callback) = &progress.callback {
            callback(0);
        }
        progress
    }

    fn advance(&self, bytes: u64) {
        let sent = self.sent.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let percent = if self.total == 0 {
            0
        } else {
            ((sent.min(self.total) * 100) / self.total).min(99) as u8
        };
        self.report(percent);
    }

    fn finish(&self) {
        self.report(100);
    }

    fn report(&self, percent: u8) {
        let previous = self.reported.fetch_max(percent, Ordering::Relaxed);
        if percent > previous {
            if let Some(callback) = &self.callback {
                callback(percent);
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
