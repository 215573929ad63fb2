//! Client-side synchronization for project chat rooms: a REST collaborator for history and
//! sends, one shared WebSocket for live delivery, and a coordinator that keeps the selected
//! room's message list consistent across both.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod message_store;
pub mod send_pipeline;
pub mod transport;

pub use api::{
    resolve_attachment_url, ChatApi, HttpChatApi, OutgoingAttachment, OutgoingMessage, ProgressFn,
};
pub use config::{load_settings, AttachmentLimits, AttachmentScope, ClientSettings, Identity};
pub use coordinator::{RoomPhase, SelectOutcome, SelectionToken, SyncCoordinator, SyncEvent};
pub use directory::{is_visible_to, normalize_user_id, RoomDirectory, Selection};
pub use error::ChatError;
pub use message_store::{MessageLog, MessageStore, PageMerge, PageOutcome};
pub use send_pipeline::{Composer, SendPipeline};
pub use transport::{ConnectionStatus, RealtimeTransport, TransportEvent, WsTransport};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
