use std::sync::{Arc, Weak};

use shared::{
    domain::{Conversation, ConversationId, MessageId, SessionIdentity, User, UserId},
    protocol::{ClientRequest, Message, MessageDraft, ServerEvent, ServerEventKind, TypingPayload},
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod notifications;
pub mod router;
pub mod store;
pub mod typing;

pub use api::{
    ChatApi, HttpChatApi, HttpMediaUploader, MediaUploader, MissingChatApi,
    MissingMediaUploader, OutgoingFile, UploadedMedia,
};
pub use channel::{ChannelTransport, EventChannel, WsTransport};
pub use config::{load_settings, ClientSettings};
pub use error::{SyncError, SyncResult};
pub use notifications::{badge_label, NotificationEntry};
pub use router::{GroupAdminPolicy, MemberPolicy, ReadOnlyPolicy, RouteDecision, SendPolicy};

use channel::{handler, HandlerRegistry};
use notifications::NotificationBacklog;
use router::ConversationRouter;
use store::{apply_reply, ConversationStores};
use typing::{RemoteTyping, TypingController, TypingEmit};

/// Everything the UI layer needs to re-render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    ConnectionLost,
    ConversationOpened {
        conversation_id: ConversationId,
    },
    ConversationClosed {
        conversation_id: ConversationId,
    },
    HistoryLoaded {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    MessageAppended(Message),
    PlaceholderAdded(Message),
    PlaceholderResolved {
        local_id: MessageId,
        message: Message,
    },
    PlaceholderDropped {
        conversation_id: ConversationId,
        local_id: MessageId,
    },
    MessageRemoved {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    NotificationAdded(NotificationEntry),
    NotificationsChanged {
        unread: usize,
    },
    RemoteTypingChanged {
        conversation_id: ConversationId,
        is_typing: bool,
    },
    Error(SyncError),
}

struct LiveSession {
    channel: EventChannel,
    status_task: JoinHandle<()>,
}

impl LiveSession {
    fn shutdown(mut self) {
        self.status_task.abort();
        self.channel.close();
    }
}

struct SyncState {
    /// Bumped on every reset; continuations from an older session compare
    /// against it before touching state.
    epoch: u64,
    identity: Option<SessionIdentity>,
    router: ConversationRouter,
    stores: ConversationStores,
    notifications: NotificationBacklog,
    typing: TypingController,
    remote_typing: RemoteTyping,
}

impl SyncState {
    fn me(&self) -> SyncResult<User> {
        self.identity
            .as_ref()
            .map(SessionIdentity::as_user)
            .ok_or(SyncError::NotSignedIn)
    }

    fn current_for_send(&self) -> SyncResult<(User, ConversationId)> {
        let me = self.me()?;
        let conversation_id = self
            .router
            .current_id()
            .cloned()
            .ok_or(SyncError::NoConversationSelected)?;
        if !self.router.can_send(&conversation_id, &me.id) {
            return Err(SyncError::SendForbidden { conversation_id });
        }
        Ok((me, conversation_id))
    }

    fn reset(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        self.identity = None;
        self.router.set_current(None);
        self.stores.clear();
        self.notifications.clear();
        self.typing.force_idle();
        self.remote_typing.clear();
    }
}

/// Client-side sync core for one signed-in session.
pub struct SyncClient {
    settings: ClientSettings,
    api: Arc<dyn ChatApi>,
    uploader: Arc<dyn MediaUploader>,
    inner: Mutex<SyncState>,
    session: Mutex<Option<LiveSession>>,
    typing_timer: Mutex<Option<JoinHandle<()>>>,
    remote_typing_timer: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl SyncClient {
    pub fn new(settings: ClientSettings) -> Arc<Self> {
        Self::new_with_dependencies(
            settings,
            Arc::new(MissingChatApi),
            Arc::new(MissingMediaUploader),
            Arc::new(MemberPolicy),
        )
    }

    /// Wires the HTTP collaborators for `identity` from `settings`.
    pub fn for_session(
        settings: ClientSettings,
        identity: &SessionIdentity,
        policy: Arc<dyn SendPolicy>,
    ) -> anyhow::Result<Arc<Self>> {
        let base_url = settings.api_base()?;
        let api = HttpChatApi::new(base_url.clone(), identity.auth_token.clone());
        let uploader = HttpMediaUploader::new(base_url, identity.auth_token.clone());
        Ok(Self::new_with_dependencies(
            settings,
            Arc::new(api),
            Arc::new(uploader),
            policy,
        ))
    }

    pub fn new_with_dependencies(
        settings: ClientSettings,
        api: Arc<dyn ChatApi>,
        uploader: Arc<dyn MediaUploader>,
        policy: Arc<dyn SendPolicy>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        let timeout = settings.typing_timeout();
        Arc::new(Self {
            settings,
            api,
            uploader,
            inner: Mutex::new(SyncState {
                epoch: 0,
                identity: None,
                router: ConversationRouter::new(policy),
                stores: ConversationStores::default(),
                notifications: NotificationBacklog::new(),
                typing: TypingController::new(timeout),
                remote_typing: RemoteTyping::new(timeout),
            }),
            session: Mutex::new(None),
            typing_timer: Mutex::new(None),
            remote_typing_timer: Mutex::new(None),
            events,
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn fail(&self, err: SyncError) -> SyncError {
        warn!("sync: {err}");
        self.emit(ClientEvent::Error(err.clone()));
        err
    }

    /// Opens the websocket channel configured in the settings.
    pub async fn connect_websocket(self: &Arc<Self>, identity: SessionIdentity) -> SyncResult<()> {
        let url = self
            .settings
            .resolved_channel_url()
            .map_err(|err| self.fail(SyncError::connect_failed(&err)))?;
        let transport = WsTransport::connect(&url, &identity.id)
            .await
            .map_err(|err| self.fail(SyncError::connect_failed(&err)))?;
        self.connect(identity, transport).await
    }

    /// Starts the session for `identity` on `transport`, replacing any
    /// previous channel. Signing in as a different user resets all state.
    pub async fn connect(
        self: &Arc<Self>,
        identity: SessionIdentity,
        transport: ChannelTransport,
    ) -> SyncResult<()> {
        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            previous.shutdown();
        }

        let rejoin = {
            let mut state = self.inner.lock().await;
            if state.identity.as_ref().map(|known| &known.id) != Some(&identity.id) {
                state.reset();
            }
            state.identity = Some(identity.clone());
            state.router.current_id().cloned()
        };

        let channel = EventChannel::open(identity.id.clone(), transport, self.handlers())
            .await
            .map_err(|err| self.fail(err))?;
        if let Some(conversation_id) = rejoin {
            if let Err(err) = channel.send(ClientRequest::JoinChat(conversation_id)).await {
                warn!("sync: rejoin failed: {err}");
            }
        }
        let status_task = self.spawn_status_watch(channel.status());
        *session = Some(LiveSession {
            channel,
            status_task,
        });
        info!(user_id = %identity.id, "sync: session started");
        Ok(())
    }

    /// Signs out: closes the channel and forgets every piece of session state.
    pub async fn disconnect(&self) {
        if let Some(live) = self.session.lock().await.take() {
            live.shutdown();
        }
        self.cancel_typing_timer().await;
        self.cancel_remote_typing_timer().await;
        self.inner.lock().await.reset();
        info!("sync: session ended");
    }

    pub async fn is_connected(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|live| live.channel.is_connected())
    }

    fn handlers(self: &Arc<Self>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        for kind in [
            ServerEventKind::Connected,
            ServerEventKind::MessageReceived,
            ServerEventKind::Typing,
            ServerEventKind::StopTyping,
        ] {
            let client = Arc::downgrade(self);
            registry.on(
                kind,
                handler(move |event| {
                    let client = Weak::clone(&client);
                    async move {
                        if let Some(client) = client.upgrade() {
                            client.dispatch(event).await;
                        }
                    }
                }),
            );
        }
        registry
    }

    async fn dispatch(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::Connected => {
                info!("sync: channel connected");
                self.emit(ClientEvent::Connected);
            }
            ServerEvent::MessageReceived(message) => self.handle_inbound(message).await,
            ServerEvent::Typing(payload) => self.observe_remote_typing(payload).await,
            ServerEvent::StopTyping(payload) => self.observe_remote_stop(payload).await,
        }
    }

    fn spawn_status_watch(self: &Arc<Self>, mut status: watch::Receiver<bool>) -> JoinHandle<()> {
        let client = Arc::downgrade(self);
        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                if *status.borrow_and_update() {
                    continue;
                }
                if let Some(client) = client.upgrade() {
                    client.on_connection_lost().await;
                }
                break;
            }
        })
    }

    async fn on_connection_lost(&self) {
        warn!("sync: live channel lost");
        self.cancel_typing_timer().await;
        self.cancel_remote_typing_timer().await;
        {
            let mut state = self.inner.lock().await;
            state.typing.force_idle();
            state.remote_typing.clear();
        }
        self.emit(ClientEvent::ConnectionLost);
    }

    async fn publish(&self, request: ClientRequest) -> SyncResult<()> {
        let session = self.session.lock().await;
        match session.as_ref() {
            Some(live) => live.channel.send(request).await,
            None => Err(SyncError::NotConnected),
        }
    }

    pub async fn register_conversation(&self, conversation: Conversation) {
        self.inner.lock().await.router.register(conversation);
    }

    /// Makes `conversation` current, joins it on the channel and reloads its
    /// history. A failed fetch keeps whatever was loaded before.
    pub async fn open_conversation(&self, conversation: Conversation) -> SyncResult<()> {
        let conversation_id = conversation.id.clone();
        let (epoch, stop) = {
            let mut state = self.inner.lock().await;
            state.router.register(conversation);
            let previous = state.router.set_current(Some(conversation_id.clone()));
            state.stores.entry(&conversation_id).begin_refresh();
            let stop = if previous.is_some() {
                state.remote_typing.clear();
                state.typing.force_idle()
            } else {
                None
            };
            (state.epoch, stop)
        };
        self.stop_composing(stop).await;
        self.cancel_remote_typing_timer().await;
        info!(conversation_id = %conversation_id, "sync: conversation opened");
        self.emit(ClientEvent::ConversationOpened {
            conversation_id: conversation_id.clone(),
        });

        if let Err(err) = self
            .publish(ClientRequest::JoinChat(conversation_id.clone()))
            .await
        {
            debug!(conversation_id = %conversation_id, "sync: join not sent: {err}");
        }

        let fetched = self.api.list_messages(&conversation_id).await;
        let messages = {
            let mut state = self.inner.lock().await;
            if state.epoch != epoch {
                debug!(conversation_id = %conversation_id, "sync: history dropped, session changed");
                return Ok(());
            }
            let store = state.stores.entry(&conversation_id);
            match fetched {
                Ok(history) => {
                    store.replace_history(history);
                    store.messages().to_vec()
                }
                Err(err) => {
                    store.cancel_refresh();
                    drop(state);
                    return Err(self.fail(SyncError::fetch_failed(&err)));
                }
            }
        };
        debug!(
            conversation_id = %conversation_id,
            count = messages.len(),
            "sync: history loaded"
        );
        self.emit(ClientEvent::HistoryLoaded {
            conversation_id: conversation_id.clone(),
            messages,
        });

        if let Err(err) = self.api.mark_read(&conversation_id).await {
            warn!(conversation_id = %conversation_id, "sync: mark read failed: {err:#}");
        }
        Ok(())
    }

    pub async fn close_conversation(&self) {
        let (previous, stop) = {
            let mut state = self.inner.lock().await;
            let previous = state.router.set_current(None);
            state.remote_typing.clear();
            (previous, state.typing.force_idle())
        };
        self.stop_composing(stop).await;
        self.cancel_remote_typing_timer().await;
        if let Some(conversation_id) = previous {
            info!(conversation_id = %conversation_id, "sync: conversation closed");
            self.emit(ClientEvent::ConversationClosed { conversation_id });
        }
    }

    /// Local keystroke in the open conversation's composer.
    pub async fn keystroke(self: &Arc<Self>) -> SyncResult<()> {
        if !self.is_connected().await {
            debug!("typing: keystroke ignored while disconnected");
            return Ok(());
        }
        let (emits, deadline) = {
            let mut state = self.inner.lock().await;
            let Some(conversation_id) = state.router.current_id().cloned() else {
                return Err(self.fail(SyncError::NoConversationSelected));
            };
            let emits = state.typing.keystroke(&conversation_id, Instant::now());
            (emits, state.typing.deadline())
        };
        if let Some(deadline) = deadline {
            self.arm_typing_timer(deadline).await;
        }
        for emit in emits {
            self.publish(emit.into()).await.map_err(|err| self.fail(err))?;
        }
        Ok(())
    }

    async fn arm_typing_timer(self: &Arc<Self>, deadline: Instant) {
        let client = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(client) = client.upgrade() {
                client.expire_typing().await;
            }
        });
        if let Some(previous) = self.typing_timer.lock().await.replace(task) {
            previous.abort();
        }
    }

    async fn expire_typing(&self) {
        let emit = self.inner.lock().await.typing.expire(Instant::now());
        if let Some(emit) = emit {
            debug!("typing: inactivity timeout");
            if let Err(err) = self.publish(emit.into()).await {
                debug!("typing: stop not delivered: {err}");
            }
        }
    }

    async fn cancel_typing_timer(&self) {
        if let Some(task) = self.typing_timer.lock().await.take() {
            task.abort();
        }
    }

    async fn stop_composing(&self, stop: Option<TypingEmit>) {
        self.cancel_typing_timer().await;
        if let Some(emit) = stop {
            if let Err(err) = self.publish(emit.into()).await {
                debug!("typing: stop not delivered: {err}");
            }
        }
    }

    pub async fn is_composing(&self) -> bool {
        self.inner.lock().await.typing.is_composing()
    }

    async fn observe_remote_typing(self: &Arc<Self>, payload: TypingPayload) {
        let now = Instant::now();
        let (started, expires_at) = {
            let mut state = self.inner.lock().await;
            let was_typing = state.remote_typing.is_typing(now);
            let current = state.router.current_id().cloned();
            if !state
                .remote_typing
                .observe_typing(&payload, current.as_ref(), now)
            {
                return;
            }
            (!was_typing, state.remote_typing.expires_at())
        };

        if let Some(expires_at) = expires_at {
            let client = Arc::downgrade(self);
            let task = tokio::spawn(async move {
                tokio::time::sleep_until(expires_at).await;
                if let Some(client) = client.upgrade() {
                    client.expire_remote_typing().await;
                }
            });
            if let Some(previous) = self.remote_typing_timer.lock().await.replace(task) {
                previous.abort();
            }
        }
        if started {
            self.emit(ClientEvent::RemoteTypingChanged {
                conversation_id: payload.conversation_id,
                is_typing: true,
            });
        }
    }

    async fn observe_remote_stop(&self, payload: TypingPayload) {
        let stopped = {
            let mut state = self.inner.lock().await;
            let current = state.router.current_id().cloned();
            state.remote_typing.observe_stop(&payload, current.as_ref())
        };
        if stopped {
            self.cancel_remote_typing_timer().await;
            self.emit(ClientEvent::RemoteTypingChanged {
                conversation_id: payload.conversation_id,
                is_typing: false,
            });
        }
    }

    async fn expire_remote_typing(&self) {
        let lapsed = {
            let mut state = self.inner.lock().await;
            let now = Instant::now();
            if state
                .remote_typing
                .expires_at()
                .is_some_and(|at| at <= now)
            {
                let conversation_id = state
                    .remote_typing
                    .signal()
                    .map(|signal| signal.conversation_id.clone());
                state.remote_typing.clear();
                conversation_id
            } else {
                None
            }
        };
        if let Some(conversation_id) = lapsed {
            self.emit(ClientEvent::RemoteTypingChanged {
                conversation_id,
                is_typing: false,
            });
        }
    }

    async fn cancel_remote_typing_timer(&self) {
        if let Some(task) = self.remote_typing_timer.lock().await.take() {
            task.abort();
        }
    }

    pub async fn is_remote_typing(&self) -> bool {
        self.inner.lock().await.remote_typing.is_typing(Instant::now())
    }

    /// Routes one inbound message using the conversation that is current
    /// right now.
    pub async fn handle_inbound(&self, message: Message) {
        let appended_to = {
            let mut state = self.inner.lock().await;
            match state.router.route(&message) {
                RouteDecision::Append => {
                    let conversation_id = message.conversation_id.clone();
                    if state
                        .stores
                        .entry(&conversation_id)
                        .append_confirmed(message.clone())
                    {
                        self.emit(ClientEvent::MessageAppended(message));
                        Some(conversation_id)
                    } else {
                        None
                    }
                }
                RouteDecision::Notify => {
                    let message_id = message.id.clone();
                    if state.notifications.add(message) {
                        if let Some(entry) = state.notifications.get(&message_id) {
                            debug!(message_id = %message_id, "sync: notification queued");
                            self.emit(ClientEvent::NotificationAdded(entry.clone()));
                        }
                        self.emit(ClientEvent::NotificationsChanged {
                            unread: state.notifications.unread_count(),
                        });
                    }
                    None
                }
            }
        };

        if let Some(conversation_id) = appended_to {
            if let Err(err) = self.api.mark_read(&conversation_id).await {
                warn!(conversation_id = %conversation_id, "sync: mark read failed: {err:#}");
            }
        }
    }

    pub async fn send_text(
        &self,
        body: &str,
        reply_to_id: Option<MessageId>,
    ) -> SyncResult<Message> {
        if body.trim().is_empty() {
            return Err(self.fail(SyncError::SendFailed("message body is empty".into())));
        }
        let (epoch, draft, stop) = {
            let mut state = self.inner.lock().await;
            let (me, conversation_id) = state.current_for_send().map_err(|err| self.fail(err))?;
            let draft = apply_reply(MessageDraft::text(me, conversation_id, body), reply_to_id);
            (state.epoch, draft, state.typing.force_idle())
        };
        self.stop_composing(stop).await;

        let message = self
            .api
            .create_message(draft.to_create_request(None))
            .await
            .map_err(|err| self.fail(SyncError::send_failed(&err)))?;

        let appended = {
            let mut state = self.inner.lock().await;
            if state.epoch != epoch {
                warn!(message_id = %message.id, "sync: sent after the session ended, not shown");
                return Ok(message);
            }
            state
                .stores
                .entry(&message.conversation_id)
                .append_confirmed(message.clone())
        };
        if appended {
            self.emit(ClientEvent::MessageAppended(message.clone()));
        }
        self.announce(&message).await;
        Ok(message)
    }

    /// Shows a pending placeholder right away, uploads the file, then swaps
    /// the placeholder for the created message in the same slot.
    pub async fn send_file(
        &self,
        file: OutgoingFile,
        reply_to_id: Option<MessageId>,
    ) -> SyncResult<Message> {
        let local_id = MessageId::placeholder();
        let (epoch, draft, placeholder, stop) = {
            let mut state = self.inner.lock().await;
            let (me, conversation_id) = state.current_for_send().map_err(|err| self.fail(err))?;
            let draft = apply_reply(
                MessageDraft::file(me, conversation_id.clone(), &file.name, &file.mime_type),
                reply_to_id,
            );
            let store = state.stores.entry(&conversation_id);
            store.append_placeholder(local_id.clone(), draft.clone());
            let placeholder = store.get(&local_id).cloned();
            (state.epoch, draft, placeholder, state.typing.force_idle())
        };
        self.stop_composing(stop).await;
        if let Some(placeholder) = placeholder {
            self.emit(ClientEvent::PlaceholderAdded(placeholder));
        }
        info!(
            conversation_id = %draft.conversation_id,
            local_id = %local_id,
            size = file.bytes.len(),
            "sync: upload started"
        );

        let uploaded = match self.uploader.upload(&file).await {
            Ok(uploaded) => uploaded,
            Err(err) => {
                self.drop_placeholder(&draft.conversation_id, &local_id)
                    .await;
                return Err(self.fail(SyncError::upload_failed(&err)));
            }
        };

        if self.inner.lock().await.epoch != epoch {
            warn!(local_id = %local_id, "sync: upload finished after the session ended, message not created");
            return Err(SyncError::NotSignedIn);
        }

        let mut request = draft.to_create_request(Some(uploaded.url));
        request.attachment_name = Some(uploaded.name);
        request.attachment_mime_type = Some(uploaded.mime_type);
        let message = match self.api.create_message(request).await {
            Ok(message) => message,
            Err(err) => {
                self.drop_placeholder(&draft.conversation_id, &local_id)
                    .await;
                return Err(self.fail(SyncError::send_failed(&err)));
            }
        };

        let resolved = {
            let mut state = self.inner.lock().await;
            if state.epoch != epoch {
                warn!(message_id = %message.id, "sync: sent after the session ended, not shown");
                return Ok(message);
            }
            let store = state.stores.entry(&draft.conversation_id);
            if store.resolve_placeholder(&local_id, message.clone()) {
                store.get(&message.id).cloned()
            } else {
                None
            }
        };
        // A placeholder deleted locally while uploading stays deleted.
        let Some(resolved) = resolved else {
            debug!(local_id = %local_id, "sync: placeholder gone before the upload finished");
            return Ok(message);
        };
        self.emit(ClientEvent::PlaceholderResolved {
            local_id,
            message: resolved,
        });
        self.announce(&message).await;
        Ok(message)
    }

    async fn drop_placeholder(&self, conversation_id: &ConversationId, local_id: &MessageId) {
        let dropped = self
            .inner
            .lock()
            .await
            .stores
            .entry(conversation_id)
            .drop_placeholder(local_id);
        if dropped {
            self.emit(ClientEvent::PlaceholderDropped {
                conversation_id: conversation_id.clone(),
                local_id: local_id.clone(),
            });
        }
    }

    async fn announce(&self, message: &Message) {
        if let Err(err) = self
            .publish(ClientRequest::NewMessage(message.clone()))
            .await
        {
            warn!(message_id = %message.id, "sync: new message not announced: {err}");
        }
    }

    /// Removes a message from the open conversation. With `for_everyone`
    /// the server deletes it first; only the sender may do that, and a
    /// pending upload can only be discarded locally.
    pub async fn delete_message(
        &self,
        message_id: &MessageId,
        for_everyone: bool,
    ) -> SyncResult<()> {
        let (epoch, conversation_id) = {
            let state = self.inner.lock().await;
            let me = state.me().map_err(|err| self.fail(err))?;
            let conversation_id = state
                .router
                .current_id()
                .cloned()
                .ok_or_else(|| self.fail(SyncError::NoConversationSelected))?;
            let Some(target) = state
                .stores
                .get(&conversation_id)
                .and_then(|store| store.get(message_id))
            else {
                return Err(self.fail(SyncError::UnknownMessage {
                    message_id: message_id.clone(),
                }));
            };
            if for_everyone && (target.sender.id != me.id || target.is_pending()) {
                return Err(self.fail(SyncError::DeleteForbidden {
                    message_id: message_id.clone(),
                }));
            }
            (state.epoch, conversation_id)
        };

        if for_everyone {
            self.api
                .delete_message(message_id)
                .await
                .map_err(|err| self.fail(SyncError::delete_failed(&err)))?;
        }

        let removed = {
            let mut state = self.inner.lock().await;
            state.epoch == epoch
                && state
                    .stores
                    .entry(&conversation_id)
                    .remove(message_id)
                    .is_some()
        };
        if removed {
            info!(message_id = %message_id, for_everyone, "sync: message deleted");
            self.emit(ClientEvent::MessageRemoved {
                conversation_id,
                message_id: message_id.clone(),
            });
        }
        Ok(())
    }

    pub async fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.inner.lock().await.stores.snapshot(conversation_id)
    }

    pub async fn current_conversation(&self) -> Option<ConversationId> {
        self.inner.lock().await.router.current_id().cloned()
    }

    /// Header title of the open conversation as seen by the signed-in user.
    pub async fn current_title(&self) -> Option<String> {
        let state = self.inner.lock().await;
        let me = state
            .identity
            .as_ref()
            .map(|identity| identity.id.clone())
            .unwrap_or_else(|| UserId::new(""));
        state
            .router
            .current()
            .map(|conversation| conversation.title(&me).to_string())
    }

    pub async fn can_send(&self, conversation_id: &ConversationId) -> bool {
        let state = self.inner.lock().await;
        state
            .identity
            .as_ref()
            .is_some_and(|identity| state.router.can_send(conversation_id, &identity.id))
    }

    pub async fn notifications(&self) -> Vec<NotificationEntry> {
        self.inner.lock().await.notifications.snapshot()
    }

    pub async fn unread_count(&self) -> usize {
        self.inner.lock().await.notifications.unread_count()
    }

    pub async fn unread_count_for(&self, conversation_id: &ConversationId) -> usize {
        self.inner
            .lock()
            .await
            .notifications
            .unread_count_for(conversation_id)
    }

    pub async fn badge(&self) -> Option<String> {
        badge_label(self.unread_count().await)
    }

    pub async fn mark_notification_read(&self, message_id: &MessageId) -> bool {
        let unread = {
            let mut state = self.inner.lock().await;
            if !state.notifications.mark_read(message_id) {
                return false;
            }
            state.notifications.unread_count()
        };
        self.emit(ClientEvent::NotificationsChanged { unread });
        true
    }

    /// Marks the notification read and opens its conversation. Returns the
    /// conversation switched to, or `None` for an unknown notification.
    pub async fn select_notification(
        &self,
        message_id: &MessageId,
    ) -> SyncResult<Option<ConversationId>> {
        let (conversation, unread) = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            let Some(conversation_id) = state.notifications.select(message_id) else {
                return Ok(None);
            };
            let conversation = match state.router.conversation(&conversation_id) {
                Some(known) => known.clone(),
                None => {
                    let mut members = Vec::new();
                    if let Some(identity) = &state.identity {
                        members.push(identity.as_user());
                    }
                    if let Some(entry) = state.notifications.get(message_id) {
                        members.push(entry.message.sender.clone());
                    }
                    Conversation {
                        id: conversation_id,
                        is_group: false,
                        display_name: String::new(),
                        members,
                        group_admin: None,
                    }
                }
            };
            (conversation, state.notifications.unread_count())
        };
        self.emit(ClientEvent::NotificationsChanged { unread });

        let conversation_id = conversation.id.clone();
        self.open_conversation(conversation).await?;
        Ok(Some(conversation_id))
    }

    /// Clears the backlog after the server accepted the clear.
    pub async fn clear_notifications(&self) -> SyncResult<()> {
        self.api
            .clear_notifications()
            .await
            .map_err(|err| self.fail(SyncError::clear_failed(&err)))?;
        self.inner.lock().await.notifications.clear();
        self.emit(ClientEvent::NotificationsChanged { unread: 0 });
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
