use super::*;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use shared::protocol::{Attachment, CreateMessageRequest, UploadState};
use tokio::sync::Semaphore;

use crate::channel::{memory_transport, MemoryPeer};

fn user(id: &str, name: &str) -> User {
    User {
        id: UserId::from(id),
        display_name: name.into(),
        email: String::new(),
        avatar_url: String::new(),
    }
}

fn identity() -> SessionIdentity {
    identity_for("me", "Me")
}

fn identity_for(id: &str, name: &str) -> SessionIdentity {
    SessionIdentity {
        id: UserId::from(id),
        display_name: name.into(),
        avatar_url: String::new(),
        auth_token: format!("token-{id}"),
    }
}

fn direct(id: &str) -> Conversation {
    Conversation {
        id: ConversationId::from(id),
        is_group: false,
        display_name: String::new(),
        members: vec![user("me", "Me"), user("bob", "Bob")],
        group_admin: None,
    }
}

fn group(id: &str, admin: &str) -> Conversation {
    Conversation {
        id: ConversationId::from(id),
        is_group: true,
        display_name: "Team".into(),
        members: vec![user("me", "Me"), user("bob", "Bob"), user("cy", "Cy")],
        group_admin: Some(UserId::from(admin)),
    }
}

fn message(id: &str, conversation_id: &str, body: &str) -> Message {
    Message {
        id: MessageId::from(id),
        sender: user("bob", "Bob"),
        body: body.into(),
        conversation_id: ConversationId::from(conversation_id),
        reply_to_id: None,
        attachment: None,
        created_at: Utc::now(),
        upload_state: UploadState::None,
    }
}

#[derive(Default)]
struct FakeChatApi {
    history: StdMutex<HashMap<ConversationId, Vec<Message>>>,
    created: StdMutex<Vec<CreateMessageRequest>>,
    read: StdMutex<Vec<ConversationId>>,
    deleted: StdMutex<Vec<MessageId>>,
    list_gate: Option<Arc<Semaphore>>,
    create_gate: Option<Arc<Semaphore>>,
    fail_list: AtomicBool,
    fail_delete: AtomicBool,
    fail_create: AtomicBool,
    fail_clear: AtomicBool,
    clear_calls: AtomicUsize,
}

impl FakeChatApi {
    fn with_history(self, conversation_id: &str, messages: Vec<Message>) -> Self {
        self.history
            .lock()
            .unwrap()
            .insert(ConversationId::from(conversation_id), messages);
        self
    }

    fn gate_list(mut self, gate: &Arc<Semaphore>) -> Self {
        self.list_gate = Some(Arc::clone(gate));
        self
    }

    fn gate_create(mut self, gate: &Arc<Semaphore>) -> Self {
        self.create_gate = Some(Arc::clone(gate));
        self
    }

    fn deleted(&self) -> Vec<MessageId> {
        self.deleted.lock().unwrap().clone()
    }

    fn created(&self) -> Vec<CreateMessageRequest> {
        self.created.lock().unwrap().clone()
    }

    fn read(&self) -> Vec<ConversationId> {
        self.read.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn list_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        if let Some(gate) = &self.list_gate {
            gate.acquire().await?.forget();
        }
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(anyhow!("history unavailable"));
        }
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_message(&self, request: CreateMessageRequest) -> Result<Message> {
        if let Some(gate) = &self.create_gate {
            gate.acquire().await?.forget();
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(anyhow!("request failed with status 500"));
        }
        let mut created = self.created.lock().unwrap();
        created.push(request.clone());
        let attachment = request.attachment_url.clone().map(|url| Attachment {
            url,
            name: request.attachment_name.clone().unwrap_or_default(),
            mime_type: request.attachment_mime_type.clone().unwrap_or_default(),
        });
        Ok(Message {
            id: MessageId::new(format!("srv-{}", created.len())),
            sender: user("me", "Me"),
            body: request.body,
            conversation_id: request.conversation_id,
            reply_to_id: request.reply_to_id,
            attachment,
            created_at: Utc::now(),
            upload_state: UploadState::None,
        })
    }

    async fn mark_read(&self, conversation_id: &ConversationId) -> Result<()> {
        self.read.lock().unwrap().push(conversation_id.clone());
        Ok(())
    }

    async fn clear_notifications(&self) -> Result<()> {
        self.clear_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_clear.load(Ordering::SeqCst) {
            return Err(anyhow!("request failed with status 500"));
        }
        Ok(())
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(anyhow!("request failed with status 403"));
        }
        self.deleted.lock().unwrap().push(message_id.clone());
        Ok(())
    }
}

struct FakeUploader {
    gate: Option<Arc<Semaphore>>,
    fail: bool,
}

impl FakeUploader {
    fn ok() -> Self {
        Self {
            gate: None,
            fail: false,
        }
    }
}

#[async_trait]
impl MediaUploader for FakeUploader {
    async fn upload(&self, file: &OutgoingFile) -> Result<UploadedMedia> {
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        if self.fail {
            return Err(anyhow!("upload rejected"));
        }
        Ok(UploadedMedia {
            url: format!("https://cdn.test/{}", file.name),
            name: file.name.clone(),
            mime_type: file.mime_type.clone(),
        })
    }
}

struct Harness {
    client: Arc<SyncClient>,
    api: Arc<FakeChatApi>,
    peer: MemoryPeer,
    events: broadcast::Receiver<ClientEvent>,
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

async fn harness_with(
    api: FakeChatApi,
    uploader: FakeUploader,
    policy: Arc<dyn SendPolicy>,
) -> Harness {
    let api = Arc::new(api);
    let client = SyncClient::new_with_dependencies(
        ClientSettings::default(),
        Arc::clone(&api) as Arc<dyn ChatApi>,
        Arc::new(uploader),
        policy,
    );
    let events = client.subscribe_events();
    let (transport, peer) = memory_transport();
    client.connect(identity(), transport).await.expect("connect");
    push(&peer, json!({"event": "connected"}));
    settle().await;
    assert!(client.is_connected().await);
    Harness {
        client,
        api,
        peer,
        events,
    }
}

/// Signs the client out and back in as `eve` on a fresh in-memory channel.
async fn sign_in_as_eve(client: &Arc<SyncClient>) -> MemoryPeer {
    client.disconnect().await;
    let (transport, peer) = memory_transport();
    client
        .connect(identity_for("eve", "Eve"), transport)
        .await
        .expect("connect eve");
    push(&peer, json!({"event": "connected"}));
    settle().await;
    peer
}

async fn harness() -> Harness {
    harness_with(FakeChatApi::default(), FakeUploader::ok(), Arc::new(MemberPolicy)).await
}

fn push(peer: &MemoryPeer, frame: Value) {
    peer.inbound.send(Ok(frame.to_string())).expect("push frame");
}

fn push_message(peer: &MemoryPeer, message: &Message) {
    push(
        peer,
        json!({"event": "message received", "payload": serde_json::to_value(message).unwrap()}),
    );
}

fn frames(peer: &mut MemoryPeer) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = peer.outbound.try_recv() {
        frames.push(serde_json::from_str(&frame).expect("json frame"));
    }
    frames
}

fn frame_names(peer: &mut MemoryPeer) -> Vec<String> {
    frames(peer)
        .into_iter()
        .map(|frame| frame["event"].as_str().unwrap_or_default().to_string())
        .collect()
}

fn drain_events(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

#[tokio::test]
async fn session_announces_setup_then_joins_opened_conversation() {
    let mut h = harness().await;
    h.client.open_conversation(direct("c-1")).await.expect("open");

    let sent = frames(&mut h.peer);
    assert_eq!(sent[0], json!({"event": "setup", "payload": {"userId": "me"}}));
    assert_eq!(sent[1], json!({"event": "join chat", "payload": "c-1"}));
    assert_eq!(h.client.current_title().await.as_deref(), Some("Bob"));
    assert!(drain_events(&mut h.events).contains(&ClientEvent::Connected));
}

#[tokio::test]
async fn inbound_for_open_conversation_is_appended_once() {
    let h = harness().await;
    h.client.open_conversation(direct("c-1")).await.expect("open");

    let m1 = message("m-1", "c-1", "hi");
    push_message(&h.peer, &m1);
    push(
        &h.peer,
        json!({"event": "message recieved", "payload": serde_json::to_value(&m1).unwrap()}),
    );
    settle().await;

    let messages = h.client.messages(&ConversationId::from("c-1")).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, MessageId::from("m-1"));
    assert!(h.client.notifications().await.is_empty());
    assert_eq!(
        h.api.read(),
        vec![ConversationId::from("c-1"), ConversationId::from("c-1")]
    );
}

#[tokio::test]
async fn switching_away_turns_inbound_into_one_notification() {
    let mut h = harness().await;
    h.client.open_conversation(direct("c-1")).await.expect("open c-1");
    push_message(&h.peer, &message("m-1", "c-1", "first"));
    settle().await;
    h.client.open_conversation(direct("c-2")).await.expect("open c-2");
    drain_events(&mut h.events);

    let m2 = message("m-2", "c-1", "second");
    push_message(&h.peer, &m2);
    push_message(&h.peer, &m2);
    settle().await;

    let backlog = h.client.notifications().await;
    assert_eq!(backlog.len(), 1);
    assert_eq!(backlog[0].id(), &MessageId::from("m-2"));
    assert!(!backlog[0].is_read);
    assert_eq!(backlog[0].text, "Bob has sent you a message: \"second\"");
    assert_eq!(h.client.unread_count_for(&ConversationId::from("c-1")).await, 1);
    assert_eq!(h.client.badge().await.as_deref(), Some("1"));

    let c1 = h.client.messages(&ConversationId::from("c-1")).await;
    assert_eq!(c1.len(), 1);
    assert_eq!(c1[0].id, MessageId::from("m-1"));

    let events = drain_events(&mut h.events);
    let added = events
        .iter()
        .filter(|event| matches!(event, ClientEvent::NotificationAdded(_)))
        .count();
    assert_eq!(added, 1);
}

#[tokio::test]
async fn reopening_refreshes_from_history_not_from_notifications() {
    let api = FakeChatApi::default().with_history(
        "c-1",
        vec![message("m-1", "c-1", "one"), message("m-2", "c-1", "two")],
    );
    let h = harness_with(api, FakeUploader::ok(), Arc::new(MemberPolicy)).await;

    h.client.open_conversation(direct("c-2")).await.expect("open c-2");
    push_message(&h.peer, &message("m-2", "c-1", "two"));
    settle().await;
    h.client.open_conversation(direct("c-1")).await.expect("open c-1");

    let ids: Vec<_> = h
        .client
        .messages(&ConversationId::from("c-1"))
        .await
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec![MessageId::from("m-1"), MessageId::from("m-2")]);
    assert_eq!(h.client.notifications().await.len(), 1);
}

#[tokio::test]
async fn failed_fetch_keeps_last_loaded_view() {
    let api = FakeChatApi::default().with_history("c-1", vec![message("m-1", "c-1", "one")]);
    let mut h = harness_with(api, FakeUploader::ok(), Arc::new(MemberPolicy)).await;
    h.client.open_conversation(direct("c-1")).await.expect("open");
    drain_events(&mut h.events);

    h.api.fail_list.store(true, Ordering::SeqCst);
    let err = h
        .client
        .open_conversation(direct("c-1"))
        .await
        .expect_err("fetch fails");

    assert!(matches!(err, SyncError::FetchFailed(_)));
    assert_eq!(h.client.messages(&ConversationId::from("c-1")).await.len(), 1);
    assert!(drain_events(&mut h.events)
        .iter()
        .any(|event| matches!(event, ClientEvent::Error(SyncError::FetchFailed(_)))));
}

#[tokio::test]
async fn send_text_appends_and_announces_once_even_with_echo() {
    let mut h = harness().await;
    h.client.open_conversation(direct("c-1")).await.expect("open");
    frames(&mut h.peer);

    let sent = h
        .client
        .send_text("hello", Some(MessageId::from("gone")))
        .await
        .expect("send");
    push_message(&h.peer, &sent);
    settle().await;

    assert_eq!(h.api.created()[0].reply_to_id, Some(MessageId::from("gone")));
    assert_eq!(h.client.messages(&ConversationId::from("c-1")).await, vec![sent]);
    assert_eq!(frame_names(&mut h.peer), vec!["new message"]);
}

#[tokio::test]
async fn failed_send_is_surfaced_and_not_stored() {
    let mut h = harness().await;
    h.client.open_conversation(direct("c-1")).await.expect("open");
    h.api.fail_create.store(true, Ordering::SeqCst);
    drain_events(&mut h.events);

    let err = h.client.send_text("hello", None).await.expect_err("fails");

    assert!(matches!(err, SyncError::SendFailed(_)));
    assert!(h.client.messages(&ConversationId::from("c-1")).await.is_empty());
    assert_eq!(
        drain_events(&mut h.events),
        vec![ClientEvent::Error(err)]
    );
}

#[tokio::test]
async fn send_requires_sign_in_and_an_open_conversation() {
    let client = SyncClient::new(ClientSettings::default());
    assert_eq!(
        client.send_text("hi", None).await.expect_err("signed out"),
        SyncError::NotSignedIn
    );

    let h = harness().await;
    assert_eq!(
        h.client.send_text("hi", None).await.expect_err("nothing open"),
        SyncError::NoConversationSelected
    );
}

#[tokio::test]
async fn read_only_policy_blocks_sends_without_side_effects() {
    let h = harness_with(
        FakeChatApi::default(),
        FakeUploader::ok(),
        Arc::new(ReadOnlyPolicy),
    )
    .await;
    h.client.open_conversation(direct("c-1")).await.expect("open");

    let err = h.client.send_text("hi", None).await.expect_err("denied");
    let file_err = h
        .client
        .send_file(
            OutgoingFile {
                name: "a.png".into(),
                mime_type: "image/png".into(),
                bytes: vec![1, 2, 3],
            },
            None,
        )
        .await
        .expect_err("denied");

    let forbidden = SyncError::SendForbidden {
        conversation_id: ConversationId::from("c-1"),
    };
    assert_eq!(err, forbidden);
    assert_eq!(file_err, forbidden);
    assert!(h.api.created().is_empty());
    assert!(h.client.messages(&ConversationId::from("c-1")).await.is_empty());
}

#[tokio::test]
async fn group_admin_policy_only_allows_administered_groups() {
    let h = harness_with(
        FakeChatApi::default(),
        FakeUploader::ok(),
        Arc::new(GroupAdminPolicy),
    )
    .await;
    h.client.register_conversation(group("g-2", "bob")).await;

    h.client.open_conversation(group("g-1", "me")).await.expect("open");
    assert!(h.client.send_text("announcement", None).await.is_ok());
    assert!(!h.client.can_send(&ConversationId::from("g-2")).await);

    h.client.open_conversation(direct("c-1")).await.expect("open");
    assert!(matches!(
        h.client.send_text("hi", None).await,
        Err(SyncError::SendForbidden { .. })
    ));
}

#[tokio::test]
async fn file_placeholder_resolves_in_the_same_slot() {
    let gate = Arc::new(Semaphore::new(0));
    let api = FakeChatApi::default().with_history("c-1", vec![message("m-1", "c-1", "before")]);
    let mut h = harness_with(
        api,
        FakeUploader {
            gate: Some(Arc::clone(&gate)),
            fail: false,
        },
        Arc::new(MemberPolicy),
    )
    .await;
    h.client.open_conversation(direct("c-1")).await.expect("open");
    frames(&mut h.peer);

    let client = Arc::clone(&h.client);
    let upload = tokio::spawn(async move {
        client
            .send_file(
                OutgoingFile {
                    name: "clip.mp4".into(),
                    mime_type: "video/mp4".into(),
                    bytes: vec![0u8; 5 * 1024 * 1024],
                },
                None,
            )
            .await
    });
    settle().await;

    let pending = h.client.messages(&ConversationId::from("c-1")).await;
    assert_eq!(pending.len(), 2);
    assert!(pending[1].id.is_placeholder());
    assert_eq!(pending[1].upload_state, UploadState::Pending);

    push_message(&h.peer, &message("m-2", "c-1", "meanwhile"));
    settle().await;
    gate.add_permits(1);
    let confirmed = upload.await.expect("join").expect("upload");

    let after = h.client.messages(&ConversationId::from("c-1")).await;
    assert_eq!(after.len(), 3);
    assert_eq!(after[1].id, confirmed.id);
    assert_eq!(after[1].id, MessageId::from("srv-1"));
    assert_eq!(after[1].upload_state, UploadState::None);
    assert_eq!(
        after[1].attachment.as_ref().map(|a| a.url.as_str()),
        Some("https://cdn.test/clip.mp4")
    );
    assert_eq!(after[2].id, MessageId::from("m-2"));
    assert_eq!(frame_names(&mut h.peer), vec!["new message"]);
    assert!(drain_events(&mut h.events)
        .iter()
        .any(|event| matches!(event, ClientEvent::PlaceholderResolved { .. })));
}

#[tokio::test]
async fn failed_upload_removes_placeholder_entirely() {
    let mut h = harness_with(
        FakeChatApi::default(),
        FakeUploader {
            gate: None,
            fail: true,
        },
        Arc::new(MemberPolicy),
    )
    .await;
    h.client.open_conversation(direct("c-1")).await.expect("open");
    drain_events(&mut h.events);

    let err = h
        .client
        .send_file(
            OutgoingFile {
                name: "doc.pdf".into(),
                mime_type: "application/pdf".into(),
                bytes: vec![1],
            },
            None,
        )
        .await
        .expect_err("upload fails");

    assert!(matches!(err, SyncError::UploadFailed(_)));
    assert!(h.client.messages(&ConversationId::from("c-1")).await.is_empty());
    assert!(h.client.notifications().await.is_empty());
    assert!(h.api.created().is_empty());
    let events = drain_events(&mut h.events);
    assert!(matches!(events[0], ClientEvent::PlaceholderAdded(_)));
    assert!(matches!(events[1], ClientEvent::PlaceholderDropped { .. }));
    assert!(matches!(events[2], ClientEvent::Error(SyncError::UploadFailed(_))));
}

#[tokio::test]
async fn rejected_create_after_upload_drops_placeholder() {
    let h = harness().await;
    h.client.open_conversation(direct("c-1")).await.expect("open");
    h.api.fail_create.store(true, Ordering::SeqCst);

    let err = h
        .client
        .send_file(
            OutgoingFile {
                name: "doc.pdf".into(),
                mime_type: "application/pdf".into(),
                bytes: vec![1],
            },
            None,
        )
        .await
        .expect_err("create fails");

    assert!(matches!(err, SyncError::SendFailed(_)));
    assert!(h.client.messages(&ConversationId::from("c-1")).await.is_empty());
}

#[tokio::test]
async fn selecting_a_notification_opens_its_conversation() {
    let mut h = harness().await;
    h.client.register_conversation(direct("c-2")).await;
    h.client.open_conversation(direct("c-1")).await.expect("open");
    push_message(&h.peer, &message("m-9", "c-2", "ping"));
    settle().await;
    frames(&mut h.peer);

    let opened = h
        .client
        .select_notification(&MessageId::from("m-9"))
        .await
        .expect("select");

    assert_eq!(opened, Some(ConversationId::from("c-2")));
    assert_eq!(
        h.client.current_conversation().await,
        Some(ConversationId::from("c-2"))
    );
    assert_eq!(h.client.unread_count().await, 0);
    assert!(h.client.notifications().await[0].is_read);
    assert_eq!(frame_names(&mut h.peer), vec!["join chat"]);
    assert_eq!(
        h.client
            .select_notification(&MessageId::from("missing"))
            .await
            .expect("unknown"),
        None
    );
}

#[tokio::test]
async fn clear_all_waits_for_the_server() {
    let h = harness().await;
    h.client.open_conversation(direct("c-1")).await.expect("open");
    push_message(&h.peer, &message("m-5", "c-3", "hey"));
    settle().await;

    h.api.fail_clear.store(true, Ordering::SeqCst);
    assert!(matches!(
        h.client.clear_notifications().await,
        Err(SyncError::ClearFailed(_))
    ));
    assert_eq!(h.client.notifications().await.len(), 1);

    h.api.fail_clear.store(false, Ordering::SeqCst);
    h.client.clear_notifications().await.expect("clear");
    assert!(h.client.notifications().await.is_empty());
    assert_eq!(h.api.clear_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn mark_notification_read_keeps_order() {
    let h = harness().await;
    push_message(&h.peer, &message("m-1", "c-1", "a"));
    push_message(&h.peer, &message("m-2", "c-2", "b"));
    settle().await;

    assert!(h.client.mark_notification_read(&MessageId::from("m-1")).await);
    assert!(!h.client.mark_notification_read(&MessageId::from("zz")).await);

    let backlog = h.client.notifications().await;
    assert_eq!(backlog[0].id(), &MessageId::from("m-2"));
    assert!(backlog[1].is_read);
    assert_eq!(h.client.unread_count().await, 1);
}

#[tokio::test]
async fn lost_channel_is_reported_and_silences_typing() {
    let mut h = harness().await;
    h.client.open_conversation(direct("c-1")).await.expect("open");
    drain_events(&mut h.events);

    let Harness {
        client,
        mut events,
        peer,
        ..
    } = h;
    drop(peer);
    settle().await;

    assert!(!client.is_connected().await);
    assert!(drain_events(&mut events).contains(&ClientEvent::ConnectionLost));
    client.keystroke().await.expect("ignored");
    assert!(!client.is_composing().await);
}

#[tokio::test]
async fn disconnect_forgets_the_session() {
    let h = harness().await;
    h.client.open_conversation(direct("c-1")).await.expect("open");
    push_message(&h.peer, &message("m-1", "c-1", "a"));
    push_message(&h.peer, &message("m-2", "c-2", "b"));
    settle().await;

    h.client.disconnect().await;

    assert!(!h.client.is_connected().await);
    assert_eq!(h.client.current_conversation().await, None);
    assert!(h.client.messages(&ConversationId::from("c-1")).await.is_empty());
    assert!(h.client.notifications().await.is_empty());
    assert_eq!(
        h.client.send_text("hi", None).await.expect_err("signed out"),
        SyncError::NotSignedIn
    );
}

#[tokio::test(start_paused = true)]
async fn keystroke_burst_emits_one_typing_then_one_stop() {
    let mut h = harness().await;
    h.client.open_conversation(direct("c-1")).await.expect("open");
    frames(&mut h.peer);

    for _ in 0..5 {
        h.client.keystroke().await.expect("keystroke");
        tokio::time::advance(Duration::from_millis(500)).await;
        settle().await;
    }
    assert_eq!(
        frames(&mut h.peer),
        vec![json!({"event": "typing", "payload": "c-1"})]
    );

    // last keystroke was 500ms ago
    tokio::time::advance(Duration::from_millis(2400)).await;
    settle().await;
    assert!(frames(&mut h.peer).is_empty());

    tokio::time::advance(Duration::from_millis(100)).await;
    settle().await;
    assert_eq!(
        frames(&mut h.peer),
        vec![json!({"event": "stop typing", "payload": "c-1"})]
    );

    tokio::time::advance(Duration::from_secs(10)).await;
    settle().await;
    assert!(frames(&mut h.peer).is_empty());
}

#[tokio::test(start_paused = true)]
async fn sending_forces_stop_typing_before_the_timeout() {
    let mut h = harness().await;
    h.client.open_conversation(direct("c-1")).await.expect("open");
    frames(&mut h.peer);

    h.client.keystroke().await.expect("keystroke");
    h.client.send_text("done", None).await.expect("send");
    assert_eq!(
        frame_names(&mut h.peer),
        vec!["typing", "stop typing", "new message"]
    );

    tokio::time::advance(Duration::from_secs(5)).await;
    settle().await;
    assert!(frames(&mut h.peer).is_empty());
}

#[tokio::test(start_paused = true)]
async fn switching_conversation_stops_typing_in_the_old_one() {
    let mut h = harness().await;
    h.client.open_conversation(direct("c-1")).await.expect("open");
    h.client.keystroke().await.expect("keystroke");
    frames(&mut h.peer);

    h.client.open_conversation(direct("c-2")).await.expect("switch");

    assert_eq!(
        frames(&mut h.peer),
        vec![
            json!({"event": "stop typing", "payload": "c-1"}),
            json!({"event": "join chat", "payload": "c-2"}),
        ]
    );
    assert!(!h.client.is_composing().await);
}

#[tokio::test(start_paused = true)]
async fn remote_typing_is_scoped_and_times_out() {
    let mut h = harness().await;
    h.client.open_conversation(direct("c-1")).await.expect("open");
    drain_events(&mut h.events);

    push(
        &h.peer,
        json!({"event": "typing", "payload": {"conversationId": "c-9", "userId": "zed"}}),
    );
    settle().await;
    assert!(!h.client.is_remote_typing().await);

    push(
        &h.peer,
        json!({"event": "typing", "payload": {"conversationId": "c-1", "userId": "bob"}}),
    );
    settle().await;
    assert!(h.client.is_remote_typing().await);

    tokio::time::advance(Duration::from_millis(3000)).await;
    settle().await;
    assert!(!h.client.is_remote_typing().await);

    let changes: Vec<bool> = drain_events(&mut h.events)
        .into_iter()
        .filter_map(|event| match event {
            ClientEvent::RemoteTypingChanged { is_typing, .. } => Some(is_typing),
            _ => None,
        })
        .collect();
    assert_eq!(changes, vec![true, false]);
}

#[tokio::test(start_paused = true)]
async fn remote_stop_clears_indicator_immediately() {
    let h = harness().await;
    h.client.open_conversation(direct("c-1")).await.expect("open");

    push(
        &h.peer,
        json!({"event": "typing", "payload": {"conversationId": "c-1"}}),
    );
    settle().await;
    push(
        &h.peer,
        json!({"event": "stop typing", "payload": {"conversationId": "c-1"}}),
    );
    settle().await;

    assert!(!h.client.is_remote_typing().await);
}

#[tokio::test]
async fn inbound_during_history_fetch_is_kept_after_the_page_lands() {
    let gate = Arc::new(Semaphore::new(0));
    let api = FakeChatApi::default()
        .with_history("c-1", vec![message("m-old", "c-1", "old")])
        .gate_list(&gate);
    let h = harness_with(api, FakeUploader::ok(), Arc::new(MemberPolicy)).await;

    let client = Arc::clone(&h.client);
    let open = tokio::spawn(async move { client.open_conversation(direct("c-1")).await });
    settle().await;

    push_message(&h.peer, &message("m-live", "c-1", "while loading"));
    settle().await;
    let during: Vec<_> = h
        .client
        .messages(&ConversationId::from("c-1"))
        .await
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(during, vec![MessageId::from("m-live")]);

    gate.add_permits(1);
    open.await.expect("join").expect("open");

    let after: Vec<_> = h
        .client
        .messages(&ConversationId::from("c-1"))
        .await
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(after, vec![MessageId::from("m-old"), MessageId::from("m-live")]);
    assert!(h.client.notifications().await.is_empty());
}

#[tokio::test]
async fn upload_finishing_after_sign_out_leaves_the_next_session_alone() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness_with(
        FakeChatApi::default(),
        FakeUploader {
            gate: Some(Arc::clone(&gate)),
            fail: false,
        },
        Arc::new(MemberPolicy),
    )
    .await;
    h.client.open_conversation(direct("c-1")).await.expect("open");

    let client = Arc::clone(&h.client);
    let upload = tokio::spawn(async move {
        client
            .send_file(
                OutgoingFile {
                    name: "photo.png".into(),
                    mime_type: "image/png".into(),
                    bytes: vec![1u8; 64],
                },
                None,
            )
            .await
    });
    settle().await;

    let mut eve_peer = sign_in_as_eve(&h.client).await;
    frames(&mut eve_peer);
    gate.add_permits(1);
    let outcome = upload.await.expect("join");

    assert_eq!(outcome.expect_err("session ended"), SyncError::NotSignedIn);
    assert!(h.api.created().is_empty());
    assert!(h.client.messages(&ConversationId::from("c-1")).await.is_empty());
    assert!(frame_names(&mut eve_peer).is_empty());
}

#[tokio::test]
async fn text_confirmed_after_sign_out_is_not_shown_or_announced() {
    let gate = Arc::new(Semaphore::new(0));
    let api = FakeChatApi::default().gate_create(&gate);
    let h = harness_with(api, FakeUploader::ok(), Arc::new(MemberPolicy)).await;
    h.client.open_conversation(direct("c-1")).await.expect("open");

    let client = Arc::clone(&h.client);
    let send = tokio::spawn(async move { client.send_text("late", None).await });
    settle().await;

    let mut eve_peer = sign_in_as_eve(&h.client).await;
    frames(&mut eve_peer);
    gate.add_permits(1);
    let sent = send.await.expect("join").expect("created on the server");

    assert_eq!(sent.id, MessageId::from("srv-1"));
    assert!(h.client.messages(&ConversationId::from("c-1")).await.is_empty());
    assert!(frame_names(&mut eve_peer).is_empty());
}

#[tokio::test]
async fn history_arriving_after_sign_out_is_discarded() {
    let gate = Arc::new(Semaphore::new(0));
    let api = FakeChatApi::default()
        .with_history("c-1", vec![message("m-1", "c-1", "private")])
        .gate_list(&gate);
    let h = harness_with(api, FakeUploader::ok(), Arc::new(MemberPolicy)).await;

    let client = Arc::clone(&h.client);
    let open = tokio::spawn(async move { client.open_conversation(direct("c-1")).await });
    settle().await;

    sign_in_as_eve(&h.client).await;
    gate.add_permits(1);
    open.await.expect("join").expect("open");

    assert!(h.client.messages(&ConversationId::from("c-1")).await.is_empty());
}

#[tokio::test]
async fn delete_for_me_removes_locally_without_the_server() {
    let mut h = harness().await;
    h.client.open_conversation(direct("c-1")).await.expect("open");
    push_message(&h.peer, &message("m-1", "c-1", "a"));
    push_message(&h.peer, &message("m-2", "c-1", "b"));
    settle().await;
    drain_events(&mut h.events);

    h.client
        .delete_message(&MessageId::from("m-1"), false)
        .await
        .expect("delete");

    let remaining = h.client.messages(&ConversationId::from("c-1")).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, MessageId::from("m-2"));
    assert!(h.api.deleted().is_empty());
    assert!(drain_events(&mut h.events).contains(&ClientEvent::MessageRemoved {
        conversation_id: ConversationId::from("c-1"),
        message_id: MessageId::from("m-1"),
    }));
}

#[tokio::test]
async fn delete_for_everyone_is_limited_to_own_confirmed_messages() {
    let h = harness().await;
    h.client.open_conversation(direct("c-1")).await.expect("open");
    push_message(&h.peer, &message("m-1", "c-1", "from bob"));
    settle().await;
    let mine = h.client.send_text("mine", None).await.expect("send");

    assert_eq!(
        h.client
            .delete_message(&MessageId::from("m-1"), true)
            .await
            .expect_err("not the sender"),
        SyncError::DeleteForbidden {
            message_id: MessageId::from("m-1")
        }
    );
    assert_eq!(
        h.client
            .delete_message(&MessageId::from("nope"), false)
            .await
            .expect_err("unknown"),
        SyncError::UnknownMessage {
            message_id: MessageId::from("nope")
        }
    );

    h.api.fail_delete.store(true, Ordering::SeqCst);
    assert!(matches!(
        h.client.delete_message(&mine.id, true).await,
        Err(SyncError::DeleteFailed(_))
    ));
    assert_eq!(h.client.messages(&ConversationId::from("c-1")).await.len(), 2);

    h.api.fail_delete.store(false, Ordering::SeqCst);
    h.client.delete_message(&mine.id, true).await.expect("delete");
    assert_eq!(h.api.deleted(), vec![mine.id.clone()]);
    let ids: Vec<_> = h
        .client
        .messages(&ConversationId::from("c-1"))
        .await
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec![MessageId::from("m-1")]);
}

#[tokio::test]
async fn discarded_placeholder_does_not_come_back_when_upload_finishes() {
    let gate = Arc::new(Semaphore::new(0));
    let mut h = harness_with(
        FakeChatApi::default(),
        FakeUploader {
            gate: Some(Arc::clone(&gate)),
            fail: false,
        },
        Arc::new(MemberPolicy),
    )
    .await;
    h.client.open_conversation(direct("c-1")).await.expect("open");
    frames(&mut h.peer);

    let client = Arc::clone(&h.client);
    let upload = tokio::spawn(async move {
        client
            .send_file(
                OutgoingFile {
                    name: "notes.txt".into(),
                    mime_type: "text/plain".into(),
                    bytes: vec![b'x'; 16],
                },
                None,
            )
            .await
    });
    settle().await;
    let local_id = h.client.messages(&ConversationId::from("c-1")).await[0]
        .id
        .clone();

    assert!(matches!(
        h.client.delete_message(&local_id, true).await,
        Err(SyncError::DeleteForbidden { .. })
    ));
    h.client
        .delete_message(&local_id, false)
        .await
        .expect("discard");
    gate.add_permits(1);
    upload.await.expect("join").expect("upload");

    assert!(h.client.messages(&ConversationId::from("c-1")).await.is_empty());
    assert!(frame_names(&mut h.peer).is_empty());
}
