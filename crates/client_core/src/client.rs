use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use chrono::Utc;
use shared::{
    domain::{ConversationId, DeleteScope, Identity, MessageId, MessageKind, UserId},
    protocol::{
        ClientCommand, ConversationSummary, MessageBody, MessagePayload, RelayEvent,
        SendMessageRequest,
    },
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    backend::{ChatBackend, FileUpload, HttpChatBackend, HISTORY_PAGE_SIZE},
    deletion::{announcement, available_scopes, DeletionEffect},
    presence::{typing_label, PresenceTracker, TypingNotifier, TypingSignal, TypingTracker},
    receipts::{is_read_by_all, ReadReceiptAggregator},
    timeline::{ConfirmOutcome, TempId, TempIdGenerator, Timeline, TimelineEntry},
    transport::{RelaySink, TransportEvent, TransportHandle},
    voice::VoiceClip,
};

/// How often [`ChatClient::run`] expires typing state.
pub const TICK_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ConnectionChanged {
        connected: bool,
    },
    ConversationsUpdated,
    TimelineUpdated {
        conversation_id: ConversationId,
    },
    UnreadChanged {
        conversation_id: ConversationId,
        unread: u32,
        total: u32,
    },
    TypingChanged {
        conversation_id: ConversationId,
        label: Option<String>,
    },
    PresenceChanged,
    SendFailed {
        conversation_id: ConversationId,
        temp_id: TempId,
        reason: String,
    },
    Error(String),
}

struct ClientState {
    connection_id: Option<u64>,
    conversations: Vec<ConversationSummary>,
    timeline: Option<Timeline>,
    receipts: ReadReceiptAggregator,
    presence: PresenceTracker,
    typing: TypingTracker,
    notifier: TypingNotifier,
    temp_ids: TempIdGenerator,
}

impl ClientState {
    fn new(me: UserId) -> Self {
        Self {
            connection_id: None,
            conversations: Vec::new(),
            timeline: None,
            receipts: ReadReceiptAggregator::new(me),
            presence: PresenceTracker::default(),
            typing: TypingTracker::default(),
            notifier: TypingNotifier::default(),
            temp_ids: TempIdGenerator::default(),
        }
    }

    fn timeline_for(&mut self, conversation_id: ConversationId) -> Option<&mut Timeline> {
        self.timeline
            .as_mut()
            .filter(|timeline| timeline.conversation_id() == conversation_id)
    }

    /// Moves the conversation's `updated_at` and preview forward and keeps
    /// the list newest-first.
    fn bump_conversation(&mut self, message: &MessagePayload) -> bool {
        let Some(summary) = self
            .conversations
            .iter_mut()
            .find(|summary| summary.conversation_id == message.conversation_id)
        else {
            return false;
        };
        if message.created_at < summary.updated_at {
            return false;
        }
        summary.updated_at = message.created_at;
        summary.last_message_preview = Some(message.body.preview());
        sort_conversations(&mut self.conversations);
        true
    }

    fn participants(&self, conversation_id: ConversationId) -> Vec<UserId> {
        self.conversations
            .iter()
            .find(|summary| summary.conversation_id == conversation_id)
            .map(|summary| {
                summary
                    .participants
                    .iter()
                    .map(|participant| participant.user_id)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn display_name(&self, conversation_id: ConversationId, user_id: UserId) -> String {
        self.conversations
            .iter()
            .find(|summary| summary.conversation_id == conversation_id)
            .and_then(|summary| {
                summary
                    .participants
                    .iter()
                    .find(|participant| participant.user_id == user_id)
            })
            .map(|participant| participant.display_name.clone())
            .unwrap_or_else(|| format!("User {user_id}"))
    }

    fn typing_label(&self, conversation_id: ConversationId, me: UserId, now: Instant) -> Option<String> {
        let names: Vec<String> = self
            .typing
            .typing_users(conversation_id, now)
            .into_iter()
            .filter(|user_id| *user_id != me)
            .map(|user_id| self.display_name(conversation_id, user_id))
            .collect();
        typing_label(&names)
    }
}

fn sort_conversations(conversations: &mut [ConversationSummary]) {
    conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}

/// Client-side chat core for one signed-in user.
///
/// Relay events are fed in through [`ChatClient::handle_transport_event`]
/// (or [`ChatClient::run`]); UI actions call the async methods directly.
/// State changes are announced on [`ChatClient::subscribe_events`].
pub struct ChatClient {
    identity: Identity,
    backend: Arc<dyn ChatBackend>,
    relay: Arc<dyn RelaySink>,
    inner: Mutex<ClientState>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new(
        identity: Identity,
        backend: Arc<dyn ChatBackend>,
        relay: Arc<dyn RelaySink>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            inner: Mutex::new(ClientState::new(identity.user_id)),
            identity,
            backend,
            relay,
            events,
        })
    }

    /// HTTP backend plus a reconnecting relay transport for `server_url`.
    /// Feed the returned receiver to [`ChatClient::run`].
    pub fn connect(
        server_url: &str,
        identity: Identity,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let (transport, transport_events) = TransportHandle::spawn(server_url, identity.clone())?;
        let backend = Arc::new(HttpChatBackend::new(server_url));
        Ok((Self::new(identity, backend, Arc::new(transport)), transport_events))
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn send_typing(&self, signal: Option<TypingSignal>) {
        if let Some(signal) = signal {
            self.relay.send(signal.into_command(self.identity.user_id));
        }
    }

    /// Drives the client until the transport goes away.
    pub async fn run(&self, mut transport: mpsc::UnboundedReceiver<TransportEvent>) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = transport.recv() => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => break,
                },
                _ = ticker.tick() => self.tick().await,
            }
        }
        debug!("chat: transport closed");
    }

    pub async fn handle_transport_event(&self, event: TransportEvent) {
        self.handle_transport_event_at(event, Instant::now()).await;
    }

    /// As [`ChatClient::handle_transport_event`], stamping typing
    /// indicators with `now`.
    pub async fn handle_transport_event_at(&self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Connected => self.emit(ClientEvent::ConnectionChanged { connected: true }),
            TransportEvent::Disconnected => {
                let typing = {
                    let mut state = self.inner.lock().await;
                    state.connection_id = None;
                    state.presence.clear();
                    state.typing.clear()
                };
                self.emit(ClientEvent::ConnectionChanged { connected: false });
                self.emit(ClientEvent::PresenceChanged);
                for conversation_id in typing {
                    self.emit(ClientEvent::TypingChanged {
                        conversation_id,
                        label: None,
                    });
                }
            }
            TransportEvent::Event(event) => self.handle_relay_event(event, now).await,
        }
    }

    async fn handle_relay_event(&self, event: RelayEvent, now: Instant) {
        match event {
            RelayEvent::Authenticated { connection_id, .. } => {
                self.on_authenticated(connection_id).await;
            }
            RelayEvent::NewMessage { message } => self.on_new_message(message).await,
            RelayEvent::UserTyping {
                conversation_id,
                user_id,
                is_typing,
            } => {
                if user_id == self.identity.user_id {
                    return;
                }
                let label = {
                    let mut state = self.inner.lock().await;
                    if !state.typing.apply(conversation_id, user_id, is_typing, now) {
                        return;
                    }
                    state.typing_label(conversation_id, self.identity.user_id, now)
                };
                self.emit(ClientEvent::TypingChanged {
                    conversation_id,
                    label,
                });
            }
            RelayEvent::PresenceUpdate { user_id, is_online } => {
                let changed = self
                    .inner
                    .lock()
                    .await
                    .presence
                    .apply_update(user_id, is_online);
                if changed {
                    self.emit(ClientEvent::PresenceChanged);
                }
            }
            RelayEvent::OnlineUsers { user_ids } => {
                self.inner.lock().await.presence.apply_snapshot(user_ids);
                self.emit(ClientEvent::PresenceChanged);
            }
            RelayEvent::ReadReceipt {
                conversation_id,
                message_ids,
                reader_id,
            } => {
                let changed = {
                    let mut state = self.inner.lock().await;
                    state
                        .timeline_for(conversation_id)
                        .map(|timeline| timeline.apply_read_receipt(&message_ids, reader_id))
                        .unwrap_or(0)
                };
                if changed > 0 {
                    self.emit(ClientEvent::TimelineUpdated { conversation_id });
                }
            }
            event @ (RelayEvent::MessageDeleted { .. } | RelayEvent::MessageDeletedForMe { .. }) => {
                if let Some(effect) = DeletionEffect::from_event(&event) {
                    self.apply_deletion(effect).await;
                }
            }
            RelayEvent::Error(err) => {
                warn!(code = ?err.code, message = %err.message, "chat: relay rejected command");
                self.emit(ClientEvent::Error(err.message));
            }
        }
    }

    async fn on_authenticated(&self, connection_id: u64) {
        self.inner.lock().await.connection_id = Some(connection_id);
        info!(
            user_id = self.identity.user_id.0,
            connection_id, "chat: channel authenticated"
        );

        let mut rooms = match self.refresh_conversations().await {
            Ok(rooms) => rooms,
            Err(err) => {
                warn!(%err, "chat: conversation list fetch failed");
                self.emit(ClientEvent::Error(format!("failed to load conversations: {err}")));
                Vec::new()
            }
        };
        if let Some(active) = self.active_conversation().await {
            if !rooms.contains(&active) {
                rooms.push(active);
            }
        }
        for conversation_id in rooms {
            self.relay
                .send(ClientCommand::JoinConversation { conversation_id });
        }
        self.relay.send(ClientCommand::GetOnlineUsers);
    }

    async fn on_new_message(&self, message: MessagePayload) {
        let conversation_id = message.conversation_id;
        let from_other = message.sender_id != self.identity.user_id;
        let (bumped, unread, appended) = {
            let mut state = self.inner.lock().await;
            let bumped = state.bump_conversation(&message);
            let unread = state
                .receipts
                .on_inbound(&message)
                .map(|unread| (unread, state.receipts.total_unread()));
            let appended = match state.timeline_for(conversation_id) {
                Some(timeline) => match timeline.apply_incoming(message) {
                    Ok(appended) => appended,
                    Err(err) => {
                        warn!(%err, "chat: dropped inbound message");
                        false
                    }
                },
                None => false,
            };
            (bumped, unread, appended)
        };

        if bumped {
            self.emit(ClientEvent::ConversationsUpdated);
        }
        if let Some((unread, total)) = unread {
            self.emit(ClientEvent::UnreadChanged {
                conversation_id,
                unread,
                total,
            });
        }
        if appended {
            self.emit(ClientEvent::TimelineUpdated { conversation_id });
            if from_other {
                if let Err(err) = self
                    .backend
                    .mark_read(self.identity.user_id, conversation_id)
                    .await
                {
                    warn!(%err, conversation_id = conversation_id.0, "chat: mark read failed");
                }
            }
        }
    }

    /// Reloads the conversation list and seeds unread counters from it.
    /// Returns the conversation ids, newest first.
    pub async fn refresh_conversations(&self) -> Result<Vec<ConversationId>> {
        let mut conversations = self
            .backend
            .list_conversations(self.identity.user_id)
            .await?;
        sort_conversations(&mut conversations);
        let ids = conversations
            .iter()
            .map(|summary| summary.conversation_id)
            .collect();
        {
            let mut state = self.inner.lock().await;
            state.receipts.seed(&conversations);
            state.conversations = conversations;
        }
        self.emit(ClientEvent::ConversationsUpdated);
        Ok(ids)
    }

    /// Opens a conversation: zeroes its counter, marks it read upstream,
    /// joins its room and loads the latest history page.
    pub async fn select_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        let (stop, total) = {
            let mut state = self.inner.lock().await;
            let stop = state.notifier.stop();
            state.receipts.activate(conversation_id);
            if state.timeline_for(conversation_id).is_none() {
                state.timeline = Some(Timeline::new(conversation_id));
            }
            (stop, state.receipts.total_unread())
        };
        self.send_typing(stop);
        self.emit(ClientEvent::UnreadChanged {
            conversation_id,
            unread: 0,
            total,
        });
        self.emit(ClientEvent::TimelineUpdated { conversation_id });

        self.relay
            .send(ClientCommand::JoinConversation { conversation_id });
        if let Err(err) = self
            .backend
            .mark_read(self.identity.user_id, conversation_id)
            .await
        {
            warn!(%err, conversation_id = conversation_id.0, "chat: mark read failed");
        }

        let history = self
            .backend
            .fetch_messages(self.identity.user_id, conversation_id, HISTORY_PAGE_SIZE, None)
            .await
            .with_context(|| format!("failed to load history for conversation {conversation_id}"))?;
        let loaded = {
            let mut state = self.inner.lock().await;
            match state.timeline_for(conversation_id) {
                Some(timeline) => {
                    timeline.replace_history(history);
                    true
                }
                None => false,
            }
        };
        if loaded {
            self.emit(ClientEvent::TimelineUpdated { conversation_id });
        }
        Ok(())
    }

    /// Leaves the active conversation view; its room stays joined so unread
    /// counting continues.
    pub async fn close_conversation(&self) {
        let stop = {
            let mut state = self.inner.lock().await;
            state.receipts.deactivate();
            state.timeline = None;
            state.notifier.stop()
        };
        self.send_typing(stop);
    }

    /// Fetches the page before the oldest loaded message of the active
    /// conversation and prepends it. Returns how many rows were added.
    pub async fn load_older(&self) -> Result<usize> {
        let (conversation_id, oldest) = {
            let state = self.inner.lock().await;
            let Some(timeline) = state.timeline.as_ref() else {
                return Ok(0);
            };
            let Some(oldest) = timeline.oldest_server_id() else {
                return Ok(0);
            };
            (timeline.conversation_id(), oldest)
        };

        let older = self
            .backend
            .fetch_messages(
                self.identity.user_id,
                conversation_id,
                HISTORY_PAGE_SIZE,
                Some(oldest),
            )
            .await?;
        let added = self
            .inner
            .lock()
            .await
            .timeline_for(conversation_id)
            .map(|timeline| timeline.prepend_older(older))
            .unwrap_or(0);
        if added > 0 {
            self.emit(ClientEvent::TimelineUpdated { conversation_id });
        }
        Ok(added)
    }

    /// Zeroes the conversation's counter and records the read upstream.
    pub async fn mark_all_read(&self, conversation_id: ConversationId) -> Result<()> {
        self.backend
            .mark_read(self.identity.user_id, conversation_id)
            .await
            .with_context(|| format!("failed to mark conversation {conversation_id} read"))?;
        let total = {
            let mut state = self.inner.lock().await;
            state.receipts.mark_all_read(conversation_id);
            state.receipts.total_unread()
        };
        self.emit(ClientEvent::UnreadChanged {
            conversation_id,
            unread: 0,
            total,
        });
        Ok(())
    }

    pub async fn send_text(&self, conversation_id: ConversationId, text: &str) -> Result<MessageId> {
        let body = MessageBody::text(text)?;
        self.send_body(conversation_id, body).await
    }

    /// Uploads every file, then sends one message carrying all of them.
    pub async fn send_attachments(
        &self,
        conversation_id: ConversationId,
        uploads: Vec<FileUpload>,
    ) -> Result<MessageId> {
        let mut attachments = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let uploaded = self
                .backend
                .upload_file(self.identity.user_id, upload)
                .await?;
            attachments.push(uploaded.into_attachment(None));
        }
        let body = MessageBody::compose(None, String::new(), attachments)?;
        self.send_body(conversation_id, body).await
    }

    /// Uploads a finished recording and sends it as an `AUDIO` message.
    pub async fn send_voice_note(
        &self,
        conversation_id: ConversationId,
        clip: VoiceClip,
    ) -> Result<MessageId> {
        let duration_ms = clip.duration_ms();
        let upload = FileUpload {
            file_name: clip.file_name(Utc::now().timestamp_millis()),
            mime_type: clip.mime_type,
            bytes: clip.bytes,
        };
        let uploaded = self
            .backend
            .upload_file(self.identity.user_id, upload)
            .await
            .context("failed to upload voice note")?;
        debug!(duration_ms, size = uploaded.size, "voice: uploaded note");
        let body = MessageBody::compose(
            Some(MessageKind::Audio),
            String::new(),
            vec![uploaded.into_attachment(Some(duration_ms))],
        )?;
        self.send_body(conversation_id, body).await
    }

    async fn send_body(&self, conversation_id: ConversationId, body: MessageBody) -> Result<MessageId> {
        let (temp_id, origin_connection, stop) = {
            let mut state = self.inner.lock().await;
            let temp_id = state.temp_ids.next_id();
            if let Some(timeline) = state.timeline_for(conversation_id) {
                timeline.push_optimistic(temp_id, &self.identity, body.clone());
            }
            (temp_id, state.connection_id, state.notifier.stop())
        };
        self.send_typing(stop);
        self.emit(ClientEvent::TimelineUpdated { conversation_id });

        let request = SendMessageRequest {
            user_id: self.identity.user_id,
            conversation_id,
            content: body.content().to_string(),
            attachments: body.attachments().to_vec(),
            kind: Some(body.kind()),
            origin_connection,
        };
        match self.backend.post_message(&request).await {
            Ok(message) => {
                let message_id = message.message_id;
                let bumped = {
                    let mut state = self.inner.lock().await;
                    if let Some(timeline) = state.timeline_for(conversation_id) {
                        match timeline.confirm(temp_id, message.clone()) {
                            Ok(ConfirmOutcome::Deduplicated) => {
                                debug!(%temp_id, message_id = message_id.0, "chat: echo won the race")
                            }
                            Ok(_) => {}
                            Err(err) => warn!(%err, "chat: confirmation for wrong timeline"),
                        }
                    }
                    state.bump_conversation(&message)
                };
                self.emit(ClientEvent::TimelineUpdated { conversation_id });
                if bumped {
                    self.emit(ClientEvent::ConversationsUpdated);
                }
                Ok(message_id)
            }
            Err(err) => {
                warn!(%err, %temp_id, conversation_id = conversation_id.0, "chat: send failed");
                {
                    let mut state = self.inner.lock().await;
                    if let Some(timeline) = state.timeline_for(conversation_id) {
                        timeline.rollback(temp_id);
                    }
                }
                self.emit(ClientEvent::TimelineUpdated { conversation_id });
                self.emit(ClientEvent::SendFailed {
                    conversation_id,
                    temp_id,
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Deletes upstream, applies the local effect and, for scope `all`,
    /// asks the relay to fan the tombstone out to the room.
    pub async fn delete_message(&self, message_id: MessageId, scope: DeleteScope) -> Result<()> {
        let response = self
            .backend
            .delete_message(self.identity.user_id, message_id, scope)
            .await?;
        self.apply_deletion(DeletionEffect::from_response(&response))
            .await;
        if let Some(command) = announcement(&response, self.identity.user_id) {
            self.relay.send(command);
        }
        Ok(())
    }

    async fn apply_deletion(&self, effect: DeletionEffect) {
        let changed = {
            let mut state = self.inner.lock().await;
            state
                .timeline
                .as_mut()
                .map(|timeline| effect.apply(timeline))
                .unwrap_or(false)
        };
        if changed {
            self.emit(ClientEvent::TimelineUpdated {
                conversation_id: effect.conversation_id(),
            });
        }
    }

    pub async fn keystroke(&self, conversation_id: ConversationId) {
        self.keystroke_at(conversation_id, Instant::now()).await;
    }

    pub async fn keystroke_at(&self, conversation_id: ConversationId, now: Instant) {
        let signals = self
            .inner
            .lock()
            .await
            .notifier
            .keystroke(conversation_id, now);
        for signal in signals {
            self.send_typing(Some(signal));
        }
    }

    pub async fn tick(&self) {
        self.tick_at(Instant::now()).await;
    }

    /// Stops the local typing signal after inactivity and expires remote
    /// indicators whose stop event never arrived.
    pub async fn tick_at(&self, now: Instant) {
        let (stop, changed) = {
            let mut state = self.inner.lock().await;
            let stop = state.notifier.tick(now);
            let changed: Vec<(ConversationId, Option<String>)> = state
                .typing
                .expire(now)
                .into_iter()
                .map(|conversation_id| {
                    (
                        conversation_id,
                        state.typing_label(conversation_id, self.identity.user_id, now),
                    )
                })
                .collect();
            (stop, changed)
        };
        self.send_typing(stop);
        for (conversation_id, label) in changed {
            self.emit(ClientEvent::TypingChanged {
                conversation_id,
                label,
            });
        }
    }

    pub async fn connection_id(&self) -> Option<u64> {
        self.inner.lock().await.connection_id
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.inner.lock().await.receipts.active()
    }

    /// Conversation list, newest first, with live unread counters.
    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        let state = self.inner.lock().await;
        state
            .conversations
            .iter()
            .cloned()
            .map(|mut summary| {
                summary.unread_count = state.receipts.unread(summary.conversation_id);
                summary
            })
            .collect()
    }

    pub async fn timeline(&self) -> Vec<TimelineEntry> {
        self.inner
            .lock()
            .await
            .timeline
            .as_ref()
            .map(|timeline| timeline.entries().to_vec())
            .unwrap_or_default()
    }

    pub async fn unread(&self, conversation_id: ConversationId) -> u32 {
        self.inner.lock().await.receipts.unread(conversation_id)
    }

    pub async fn total_unread(&self) -> u32 {
        self.inner.lock().await.receipts.total_unread()
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        self.inner.lock().await.presence.online_users()
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.inner.lock().await.presence.is_online(user_id)
    }

    pub async fn typing_label(&self, conversation_id: ConversationId) -> Option<String> {
        self.inner
            .lock()
            .await
            .typing_label(conversation_id, self.identity.user_id, Instant::now())
    }

    /// Whether every participant other than the sender has read the message.
    pub async fn is_read_by_all(&self, message_id: MessageId) -> bool {
        let state = self.inner.lock().await;
        let Some(entry) = state
            .timeline
            .as_ref()
            .and_then(|timeline| timeline.get(message_id))
        else {
            return false;
        };
        let participants = state.participants(entry.conversation_id);
        is_read_by_all(entry.sender_id, &entry.read_by, &participants)
    }

    /// Deletion scopes to offer for a row of the active timeline.
    pub async fn delete_options(&self, message_id: MessageId) -> Vec<DeleteScope> {
        self.inner
            .lock()
            .await
            .timeline
            .as_ref()
            .and_then(|timeline| timeline.get(message_id))
            .map(|entry| available_scopes(entry, self.identity.user_id))
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "tests/client_tests.rs"]
mod tests;
