use std::{collections::HashSet, sync::Arc, time::Duration};

use shared::{
    domain::{ChatRoomId, ProjectRoomId},
    protocol::{Attachment, ChatRoom, MessagePage, MessagePayload, ProjectRoom},
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    api::{resolve_attachment_url, ChatApi, HttpChatApi, OutgoingAttachment, ProgressFn},
    config::{AttachmentScope, ClientSettings, Identity},
    directory::RoomDirectory,
    error::ChatError,
    message_store::{MessageStore, PageMerge, PageOutcome},
    send_pipeline::{Composer, SendPipeline},
    transport::{RealtimeTransport, TransportEvent, WsTransport},
};

/// Shown while a room's history could not be fetched in time.
pub const STILL_SYNCING_MESSAGE: &str = "still syncing";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    Idle,
    Loading,
    Ready,
    /// History could not be fetched; the room stays joined and live messages still arrive.
    Degraded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    PhaseChanged {
        chat_room_id: ChatRoomId,
        phase: RoomPhase,
    },
    MessageAppended {
        chat_room_id: ChatRoomId,
        message: MessagePayload,
    },
    HistoryMerged {
        chat_room_id: ChatRoomId,
        added: usize,
    },
    DirectoryUpdated,
    Connected {
        reconnected: bool,
    },
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    OutageExceeded {
        down_for: Duration,
    },
    Error {
        chat_room_id: Option<ChatRoomId>,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub enum SelectOutcome {
    Ready,
    Degraded(ChatError),
    /// A load for this room was already running; its completion settles the phase.
    Loading,
    /// Another room was selected before this load finished; nothing was applied.
    Stale,
}

/// Identifies the selection a load was started for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionToken {
    pub chat_room_id: ChatRoomId,
    pub generation: u64,
}

struct SyncState {
    generation: u64,
    active: Option<ChatRoomId>,
    phase: RoomPhase,
    in_flight: HashSet<ChatRoomId>,
    /// Set once `start` has run; a later selection resumes the pump after `close`.
    started: bool,
    pump: Option<JoinHandle<()>>,
}

impl SyncState {
    fn token(&self) -> Option<SelectionToken> {
        self.active.clone().map(|chat_room_id| SelectionToken {
            chat_room_id,
            generation: self.generation,
        })
    }

    fn is_current(&self, token: &SelectionToken) -> bool {
        self.generation == token.generation && self.active.as_ref() == Some(&token.chat_room_id)
    }
}

pub struct SyncCoordinator {
    settings: ClientSettings,
    identity: Identity,
    api: Arc<dyn ChatApi>,
    transport: Arc<dyn RealtimeTransport>,
    directory: RoomDirectory,
    store: Arc<MessageStore>,
    pipeline: SendPipeline,
    inner: Mutex<SyncState>,
    /// Room the transport is joined to. Held across leave and join so overlapping
    /// selections apply in order.
    subscription: Mutex<Option<ChatRoomId>>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncCoordinator {
    pub fn new(settings: ClientSettings, identity: Identity) -> Result<Arc<Self>, ChatError> {
        let api = Arc::new(HttpChatApi::new(&settings, &identity)?);
        let transport = Arc::new(WsTransport::new(
            &settings.server_url,
            &identity.session_token,
            settings.reconnect,
        )?);
        Ok(Self::new_with_dependencies(api, transport, settings, identity))
    }

    pub fn new_with_dependencies(
        api: Arc<dyn ChatApi>,
        transport: Arc<dyn RealtimeTransport>,
        settings: ClientSettings,
        identity: Identity,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let store = Arc::new(MessageStore::new(Arc::clone(&api), settings.load_timeout));
        let reconciled_events = events.clone();
        let pipeline = SendPipeline::new(
            Arc::clone(&api),
            Arc::clone(&store),
            AttachmentScope::Chat,
            settings.attachment_limits,
            settings.reconcile_fallback,
        )
        .with_reconcile_hook(Arc::new(move |message: MessagePayload| {
            let _ = reconciled_events.send(SyncEvent::MessageAppended {
                chat_room_id: message.chat_room_id.clone(),
                message,
            });
        }));

        Arc::new(Self {
            directory: RoomDirectory::new(Arc::clone(&api), identity.user_id.clone()),
            settings,
            identity,
            api,
            transport,
            store,
            pipeline,
            inner: Mutex::new(SyncState {
                generation: 0,
                active: None,
                phase: RoomPhase::Idle,
                in_flight: HashSet::new(),
                started: false,
                pump: None,
            }),
            subscription: Mutex::new(None),
            events,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn directory(&self) -> &RoomDirectory {
        &self.directory
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn attachment_url(&self, attachment: &Attachment) -> Option<String> {
        resolve_attachment_url(&self.settings.server_url, attachment)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Connects the transport and starts consuming its events.
    pub async fn start(self: &Arc<Self>) -> Result<(), ChatError> {
        {
            let mut guard = self.inner.lock().await;
            if guard
                .pump
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
            {
                return Ok(());
            }
            guard.started = true;
            self.ensure_pump(&mut guard);
        }
        info!(user_id = %self.identity.user_id, "sync: starting");
        self.transport.connect().await
    }

    pub async fn refresh_directory(&self) -> Result<Vec<ProjectRoom>, ChatError> {
        let rooms = self.directory.list_project_rooms().await?;
        let _ = self.events.send(SyncEvent::DirectoryUpdated);
        Ok(rooms)
    }

    /// Selects a project room and, when a chat room ends up selected, opens it too.
    pub async fn open_project_room(
        self: &Arc<Self>,
        project_room_id: &ProjectRoomId,
    ) -> Result<(Vec<ChatRoom>, Option<SelectOutcome>), ChatError> {
        self.directory.select_project_room(project_room_id).await;
        let rooms = self.directory.list_chat_rooms(project_room_id).await?;
        let _ = self.events.send(SyncEvent::DirectoryUpdated);

        let Some(chat_room_id) = self.directory.selected_chat_room().await else {
            info!(
                project_room_id = %project_room_id,
                "sync: project room has no visible chat rooms"
            );
            return Ok((rooms, None));
        };
        let outcome = self.select_chat_room(&chat_room_id).await?;
        Ok((rooms, Some(outcome)))
    }

    pub async fn select_chat_room(
        self: &Arc<Self>,
        chat_room_id: &ChatRoomId,
    ) -> Result<SelectOutcome, ChatError> {
        self.directory.select_chat_room(chat_room_id).await;

        let token = {
            let mut guard = self.inner.lock().await;
            guard.generation += 1;
            guard.active = Some(chat_room_id.clone());
            guard.phase = RoomPhase::Loading;
            let _ = self.events.send(SyncEvent::PhaseChanged {
                chat_room_id: chat_room_id.clone(),
                phase: RoomPhase::Loading,
            });
            if guard.started {
                self.ensure_pump(&mut guard);
            }
            SelectionToken {
                chat_room_id: chat_room_id.clone(),
                generation: guard.generation,
            }
        };
        info!(
            chat_room_id = %chat_room_id,
            generation = token.generation,
            "sync: chat room selected"
        );

        self.follow_active_room().await;
        self.spawn_mark_read(chat_room_id.clone());
        self.store.reset_pagination(chat_room_id).await;

        {
            let mut guard = self.inner.lock().await;
            if guard.in_flight.contains(chat_room_id) {
                debug!(chat_room_id = %chat_room_id, "sync: adopting load already in flight");
                return Ok(SelectOutcome::Loading);
            }
            let first_attempt = self.store.begin_load(chat_room_id).await;
            if !first_attempt && self.store.is_loaded(chat_room_id).await {
                if !guard.is_current(&token) {
                    return Ok(SelectOutcome::Stale);
                }
                debug!(chat_room_id = %chat_room_id, "sync: history already loaded this session");
                self.set_phase(&mut guard, RoomPhase::Ready);
                return Ok(SelectOutcome::Ready);
            }
            guard.in_flight.insert(chat_room_id.clone());
        }

        let fetched = self
            .store
            .fetch_page(chat_room_id, 1, self.settings.page_size)
            .await;
        Ok(self.finish_initial_load(&token, fetched).await)
    }

    async fn finish_initial_load(
        &self,
        token: &SelectionToken,
        fetched: Result<MessagePage, ChatError>,
    ) -> SelectOutcome {
        let chat_room_id = &token.chat_room_id;
        let mut guard = self.inner.lock().await;
        guard.in_flight.remove(chat_room_id);

        // A reselection of the same room adopts this load; any other selection makes it stale.
        if guard.active.as_ref() != Some(chat_room_id) {
            drop(guard);
            self.store.forget_load(chat_room_id).await;
            info!(
                chat_room_id = %chat_room_id,
                generation = token.generation,
                "sync: discarded stale history load"
            );
            return SelectOutcome::Stale;
        }

        match fetched {
            Ok(page) => {
                let outcome = self
                    .store
                    .apply_page(chat_room_id, page, PageMerge::Append)
                    .await;
                if let PageOutcome::Loaded { added, .. } = outcome {
                    debug!(chat_room_id = %chat_room_id, added, "sync: initial history loaded");
                }
                self.set_phase(&mut guard, RoomPhase::Ready);
                SelectOutcome::Ready
            }
            Err(err) => {
                self.store.forget_load(chat_room_id).await;
                self.set_phase(&mut guard, RoomPhase::Degraded);
                warn!(
                    chat_room_id = %chat_room_id,
                    "sync: history load failed; room degraded: {err}"
                );
                self.report_load_error(chat_room_id, &err);
                SelectOutcome::Degraded(err)
            }
        }
    }

    /// Reloads the first page of the active room, merging into what is held.
    pub async fn refresh(&self) -> Result<SelectOutcome, ChatError> {
        let token = self.current_token().await?;
        let chat_room_id = &token.chat_room_id;
        self.store.reset_pagination(chat_room_id).await;
        let fetched = self
            .store
            .fetch_page(chat_room_id, 1, self.settings.page_size)
            .await;

        let mut guard = self.inner.lock().await;
        if !guard.is_current(&token) {
            return Ok(SelectOutcome::Stale);
        }
        match fetched {
            Ok(page) => {
                self.store.begin_load(chat_room_id).await;
                if let PageOutcome::Loaded { added, .. } = self
                    .store
                    .apply_page(chat_room_id, page, PageMerge::Append)
                    .await
                {
                    self.announce_merge(chat_room_id, added);
                }
                self.set_phase(&mut guard, RoomPhase::Ready);
                Ok(SelectOutcome::Ready)
            }
            Err(err) => {
                self.set_phase(&mut guard, RoomPhase::Degraded);
                self.report_load_error(chat_room_id, &err);
                Ok(SelectOutcome::Degraded(err))
            }
        }
    }

    /// Loads the next older page of the active room. `None` when there is nothing more
    /// to load or the selection moved on while fetching.
    pub async fn load_older(&self) -> Result<Option<PageOutcome>, ChatError> {
        let token = self.current_token().await?;
        let chat_room_id = &token.chat_room_id;
        if !self.store.has_more(chat_room_id).await {
            return Ok(None);
        }
        let page = self.store.next_page(chat_room_id).await;
        let fetched = self
            .store
            .fetch_page(chat_room_id, page, self.settings.page_size)
            .await;

        let guard = self.inner.lock().await;
        if !guard.is_current(&token) {
            debug!(chat_room_id = %chat_room_id, page, "sync: dropping stale older page");
            return Ok(None);
        }
        match fetched {
            Ok(fetched) => {
                let outcome = self
                    .store
                    .apply_page(chat_room_id, fetched, PageMerge::Append)
                    .await;
                if let PageOutcome::Loaded { added, .. } = outcome {
                    self.announce_merge(chat_room_id, added);
                }
                Ok(Some(outcome))
            }
            Err(ChatError::Timeout { .. }) => {
                self.report_load_error(
                    chat_room_id,
                    &ChatError::Timeout {
                        operation: "load_page",
                        after: self.settings.load_timeout,
                    },
                );
                Ok(Some(PageOutcome::TimedOut))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn send(
        &self,
        content: &str,
        attachments: Vec<OutgoingAttachment>,
        progress: Option<ProgressFn>,
    ) -> Result<MessagePayload, ChatError> {
        let token = self.current_token().await?;
        self.pipeline
            .send(&token.chat_room_id, content, attachments, progress)
            .await
    }

    pub async fn submit(
        &self,
        composer: &mut Composer,
        progress: Option<ProgressFn>,
    ) -> Result<MessagePayload, ChatError> {
        let token = match self.current_token().await {
            Ok(token) => token,
            Err(err) => {
                composer.last_error = Some(err.user_message());
                return Err(err);
            }
        };
        self.pipeline
            .submit(&token.chat_room_id, composer, progress)
            .await
    }

    /// Leaves the joined room and stops consuming transport events. Safe to call twice.
    /// The shared transport connection itself stays up; see [`SyncCoordinator::shutdown`].
    /// Selecting a room afterwards resumes live delivery without another `start`.
    pub async fn close(&self) {
        let (pump, previous) = {
            let mut guard = self.inner.lock().await;
            guard.generation += 1;
            let previous = guard.active.take();
            guard.phase = RoomPhase::Idle;
            guard.in_flight.clear();
            (guard.pump.take(), previous)
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        self.follow_active_room().await;
        if let Some(chat_room_id) = previous {
            info!(chat_room_id = %chat_room_id, "sync: closed");
            let _ = self.events.send(SyncEvent::PhaseChanged {
                chat_room_id,
                phase: RoomPhase::Idle,
            });
        }
    }

    pub async fn shutdown(&self) {
        self.close().await;
        self.transport.disconnect().await;
    }

    pub async fn active_room(&self) -> Option<ChatRoomId> {
        self.inner.lock().await.active.clone()
    }

    pub async fn phase(&self) -> RoomPhase {
        self.inner.lock().await.phase
    }

    pub async fn messages(&self) -> Vec<MessagePayload> {
        match self.active_room().await {
            Some(chat_room_id) => self.store.messages(&chat_room_id).await,
            None => Vec::new(),
        }
    }

    pub async fn has_more(&self) -> bool {
        match self.active_room().await {
            Some(chat_room_id) => self.store.has_more(&chat_room_id).await,
            None => false,
        }
    }

    fn ensure_pump(self: &Arc<Self>, state: &mut SyncState) {
        if state
            .pump
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }
        let receiver = self.transport.subscribe();
        let coordinator = Arc::clone(self);
        state.pump = Some(tokio::spawn(async move {
            coordinator.run_event_pump(receiver).await;
        }));
    }

    /// Moves the transport subscription to whichever room is active when the lock is won,
    /// so a leave never overtakes an earlier selection's join.
    async fn follow_active_room(&self) {
        let mut subscribed = self.subscription.lock().await;
        let wanted = self.inner.lock().await.active.clone();
        if *subscribed == wanted {
            return;
        }
        if let Some(previous) = subscribed.take() {
            if let Err(err) = self.transport.leave_room(&previous).await {
                warn!(chat_room_id = %previous, "sync: leave_room failed: {err}");
            }
        }
        if let Some(chat_room_id) = wanted {
            if let Err(err) = self.transport.join_room(&chat_room_id).await {
                warn!(chat_room_id = %chat_room_id, "sync: join_room failed: {err}");
            }
            *subscribed = Some(chat_room_id);
        }
    }

    async fn current_token(&self) -> Result<SelectionToken, ChatError> {
        self.inner
            .lock()
            .await
            .token()
            .ok_or_else(|| ChatError::validation("no chat room selected"))
    }

    fn set_phase(&self, state: &mut SyncState, phase: RoomPhase) {
        if state.phase == phase {
            return;
        }
        state.phase = phase;
        if let Some(chat_room_id) = state.active.clone() {
            debug!(chat_room_id = %chat_room_id, phase = ?phase, "sync: phase changed");
            let _ = self.events.send(SyncEvent::PhaseChanged {
                chat_room_id,
                phase,
            });
        }
    }

    fn report_load_error(&self, chat_room_id: &ChatRoomId, err: &ChatError) {
        let message = match err {
            ChatError::Timeout { .. } => STILL_SYNCING_MESSAGE.to_string(),
            other => other.to_string(),
        };
        let _ = self.events.send(SyncEvent::Error {
            chat_room_id: Some(chat_room_id.clone()),
            message,
        });
    }

    fn announce_merge(&self, chat_room_id: &ChatRoomId, added: usize) {
        if added > 0 {
            let _ = self.events.send(SyncEvent::HistoryMerged {
                chat_room_id: chat_room_id.clone(),
                added,
            });
        }
    }

    fn spawn_mark_read(&self, chat_room_id: ChatRoomId) {
        let api = Arc::clone(&self.api);
        tokio::spawn(async move {
            if let Err(err) = api.mark_read(&chat_room_id).await {
                warn!(chat_room_id = %chat_room_id, "sync: mark_read failed: {err}");
            }
        });
    }

    async fn run_event_pump(self: Arc<Self>, mut receiver: broadcast::Receiver<TransportEvent>) {
        loop {
            match receiver.recv().await {
                Ok(event) => self.handle_transport_event(event).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "sync: transport events lagged; catching up");
                    self.spawn_catch_up();
                }
                Err(RecvError::Closed) => {
                    debug!("sync: transport event stream closed");
                    break;
                }
            }
        }
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Ready { reconnected } => {
                let _ = self.events.send(SyncEvent::Connected { reconnected });
                if reconnected {
                    self.spawn_catch_up();
                }
            }
            TransportEvent::NewMessage {
                chat_room_id,
                message,
            } => self.accept_live_message(chat_room_id, message).await,
            TransportEvent::Reconnecting { attempt, delay } => {
                let _ = self.events.send(SyncEvent::Reconnecting { attempt, delay });
            }
            TransportEvent::OutageExceeded { down_for } => {
                let _ = self.events.send(SyncEvent::OutageExceeded { down_for });
            }
            TransportEvent::ServerError(err) => {
                let _ = self.events.send(SyncEvent::Error {
                    chat_room_id: None,
                    message: err.message,
                });
            }
        }
    }

    async fn accept_live_message(&self, chat_room_id: ChatRoomId, message: MessagePayload) {
        let mut guard = self.inner.lock().await;
        if guard.active.as_ref() != Some(&chat_room_id) {
            debug!(chat_room_id = %chat_room_id, "sync: ignoring message for inactive room");
            return;
        }
        let added = self.store.append(&chat_room_id, message.clone()).await;
        if guard.phase == RoomPhase::Degraded {
            info!(chat_room_id = %chat_room_id, "sync: live message received; room recovered");
            self.set_phase(&mut guard, RoomPhase::Ready);
        }
        drop(guard);

        if added {
            self.directory.record_activity(&message).await;
            let _ = self.events.send(SyncEvent::MessageAppended {
                chat_room_id,
                message,
            });
        }
    }

    fn spawn_catch_up(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.catch_up().await;
        });
    }

    async fn catch_up(&self) {
        let Ok(token) = self.current_token().await else {
            return;
        };
        let chat_room_id = &token.chat_room_id;
        let fetched = self
            .store
            .fetch_page(chat_room_id, 1, self.settings.page_size)
            .await;

        let mut guard = self.inner.lock().await;
        if !guard.is_current(&token) {
            return;
        }
        match fetched {
            Ok(page) => {
                if let PageOutcome::Loaded { added, .. } = self
                    .store
                    .apply_page(chat_room_id, page, PageMerge::Append)
                    .await
                {
                    info!(chat_room_id = %chat_room_id, added, "sync: caught up after reconnect");
                    self.announce_merge(chat_room_id, added);
                }
                if guard.phase == RoomPhase::Degraded {
                    self.set_phase(&mut guard, RoomPhase::Ready);
                }
            }
            Err(err) => {
                warn!(chat_room_id = %chat_room_id, "sync: catch-up load failed: {err}");
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/coordinator_tests.rs"]
mod tests;
