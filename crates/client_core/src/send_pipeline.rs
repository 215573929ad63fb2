use std::{sync::Arc, time::Duration};

use shared::{
    domain::{AttachmentKind, ChatRoomId, MessageKind},
    protocol::MessagePayload,
};
use tracing::{debug, info, warn};

use crate::{
    api::{ChatApi, OutgoingAttachment, OutgoingMessage, ProgressFn},
    config::{AttachmentLimits, AttachmentScope, MB},
    error::ChatError,
    message_store::MessageStore,
};

/// Called when the fallback timer had to insert a sent message itself.
pub type ReconcileHook = Arc<dyn Fn(MessagePayload) + Send + Sync>;

/// Draft state behind a message input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Composer {
    pub content: String,
    pub attachments: Vec<OutgoingAttachment>,
    pub last_error: Option<String>,
}

impl Composer {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn attach(&mut self, attachment: OutgoingAttachment) {
        self.attachments.push(attachment);
    }

    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.attachments.is_empty()
    }

    pub fn clear(&mut self) {
        self.content.clear();
        self.attachments.clear();
        self.last_error = None;
    }
}

pub fn placeholder_for(attachment_count: usize) -> String {
    if attachment_count == 1 {
        "Sent 1 file".to_string()
    } else {
        format!("Sent {attachment_count} files")
    }
}

pub struct SendPipeline {
    api: Arc<dyn ChatApi>,
    store: Arc<MessageStore>,
    scope: AttachmentScope,
    limits: AttachmentLimits,
    reconcile_fallback: Duration,
    on_reconciled: Option<ReconcileHook>,
}

impl SendPipeline {
    pub fn new(
        api: Arc<dyn ChatApi>,
        store: Arc<MessageStore>,
        scope: AttachmentScope,
        limits: AttachmentLimits,
        reconcile_fallback: Duration,
    ) -> Self {
        Self {
            api,
            store,
            scope,
            limits,
            reconcile_fallback,
            on_reconciled: None,
        }
    }

    pub fn with_reconcile_hook(mut self, hook: ReconcileHook) -> Self {
        self.on_reconciled = Some(hook);
        self
    }

    pub fn scope(&self) -> AttachmentScope {
        self.scope
    }

    /// Rejects a draft before anything touches the network.
    pub fn validate(
        &self,
        content: &str,
        attachments: &[OutgoingAttachment],
    ) -> Result<(), ChatError> {
        if content.trim().is_empty() && attachments.is_empty() {
            return Err(ChatError::validation("message is empty"));
        }

        let max_bytes = self.limits.max_bytes(self.scope);
        let oversized = attachments
            .iter()
            .filter(|attachment| attachment.size() > max_bytes)
            .map(|attachment| attachment.filename.clone())
            .collect::<Vec<_>>();
        let wrong_kind = if self.scope == AttachmentScope::Image {
            attachments
                .iter()
                .filter(|attachment| attachment.kind() != AttachmentKind::Image)
                .map(|attachment| attachment.filename.clone())
                .collect::<Vec<_>>()
        } else {
            Vec::new()
        };
        if oversized.is_empty() && wrong_kind.is_empty() {
            return Ok(());
        }

        let mut problems = Vec::new();
        if !oversized.is_empty() {
            problems.push(format!(
                "exceeds the {} limit: {}",
                format_limit(max_bytes),
                oversized.join(", ")
            ));
        }
        if !wrong_kind.is_empty() {
            problems.push(format!("not an image: {}", wrong_kind.join(", ")));
        }
        let mut files = oversized;
        for name in wrong_kind {
            if !files.contains(&name) {
                files.push(name);
            }
        }
        Err(ChatError::Validation {
            message: problems.join("; "),
            files,
        })
    }

    pub fn compose(&self, content: &str, attachments: Vec<OutgoingAttachment>) -> OutgoingMessage {
        let content = content.trim();
        let kind = if attachments.is_empty() {
            MessageKind::Text
        } else {
            MessageKind::File
        };
        let content = if content.is_empty() && !attachments.is_empty() {
            placeholder_for(attachments.len())
        } else {
            content.to_string()
        };
        OutgoingMessage {
            kind,
            content,
            attachments,
        }
    }

    /// One REST write. The returned message is not inserted here; the live event or
    /// the fallback timer does that.
    pub async fn send(
        &self,
        chat_room_id: &ChatRoomId,
        content: &str,
        attachments: Vec<OutgoingAttachment>,
        progress: Option<ProgressFn>,
    ) -> Result<MessagePayload, ChatError> {
        self.validate(content, &attachments)?;
        let outgoing = self.compose(content, attachments);
        let attachment_count = outgoing.attachments.len();

        let created = match self.api.post_message(chat_room_id, outgoing, progress).await {
            Ok(created) => created,
            Err(err) => {
                warn!(chat_room_id = %chat_room_id, "send: message rejected: {err}");
                return Err(err);
            }
        };
        info!(
            chat_room_id = %chat_room_id,
            message_id = %created.id,
            attachments = attachment_count,
            "send: message accepted"
        );

        self.schedule_reconcile(created.clone());
        Ok(created)
    }

    /// Sends the composer's draft; the draft is cleared on success and kept on failure.
    pub async fn submit(
        &self,
        chat_room_id: &ChatRoomId,
        composer: &mut Composer,
        progress: Option<ProgressFn>,
    ) -> Result<MessagePayload, ChatError> {
        let attachments = composer.attachments.clone();
        match self
            .send(chat_room_id, &composer.content, attachments, progress)
            .await
        {
            Ok(created) => {
                composer.clear();
                Ok(created)
            }
            Err(err) => {
                composer.last_error = Some(err.user_message());
                Err(err)
            }
        }
    }

    /// Inserts `message` unless it already arrived. Returns true when it was missing.
    pub async fn reconcile(&self, message: MessagePayload) -> bool {
        reconcile_into(&self.store, self.on_reconciled.as_ref(), message).await
    }

    fn schedule_reconcile(&self, created: MessagePayload) {
        let store = Arc::clone(&self.store);
        let hook = self.on_reconciled.clone();
        let fallback = self.reconcile_fallback;
        tokio::spawn(async move {
            tokio::time::sleep(fallback).await;
            reconcile_into(&store, hook.as_ref(), created).await;
        });
    }
}

async fn reconcile_into(
    store: &MessageStore,
    hook: Option<&ReconcileHook>,
    message: MessagePayload,
) -> bool {
    let chat_room_id = message.chat_room_id.clone();
    if store.contains(&chat_room_id, &message.id).await {
        return false;
    }
    if !store.append(&chat_room_id, message.clone()).await {
        return false;
    }
    debug!(
        chat_room_id = %chat_room_id,
        message_id = %message.id,
        "send: no live event yet; inserted from response"
    );
    if let Some(hook) = hook {
        hook(message);
    }
    true
}

fn format_limit(bytes: u64) -> String {
    if bytes >= MB && bytes % MB == 0 {
        format!("{} MB", bytes / MB)
    } else {
        format!("{bytes} bytes")
    }
}

#[cfg(test)]
#[path = "tests/send_pipeline_tests.rs"]
mod tests;
