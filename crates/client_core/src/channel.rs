//! The live event channel: one connection per signed-in session.
//!
//! Inbound frames are decoded into [`ServerEvent`]s and handed to the
//! handlers registered for that event, one event at a time, in registration
//! order. Nothing is buffered or retried across a disconnect.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{future::BoxFuture, stream::BoxStream, SinkExt, StreamExt};
use shared::{
    domain::UserId,
    protocol::{ClientRequest, ServerEvent, ServerEventKind, SetupPayload},
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{SyncError, SyncResult};

pub type EventHandler = Arc<dyn Fn(ServerEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure as an [`EventHandler`].
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(ServerEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
pub struct HandlerRegistry {
    next_id: u64,
    handlers: HashMap<ServerEventKind, Vec<(HandlerId, EventHandler)>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&mut self, kind: ServerEventKind, handler: EventHandler) -> HandlerId {
        self.next_id += 1;
        let id = HandlerId(self.next_id);
        self.handlers.entry(kind).or_default().push((id, handler));
        id
    }

    pub fn off(&mut self, kind: ServerEventKind, id: HandlerId) -> bool {
        let Some(registered) = self.handlers.get_mut(&kind) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|(handler_id, _)| *handler_id != id);
        registered.len() != before
    }

    pub fn handlers_for(&self, kind: ServerEventKind) -> Vec<EventHandler> {
        self.handlers
            .get(&kind)
            .map(|registered| registered.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}

#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: String) -> Result<()>;
}

pub type FrameStream = BoxStream<'static, Result<String>>;

pub struct ChannelTransport {
    pub sink: Arc<dyn FrameSink>,
    pub inbound: FrameStream,
}

/// Sink backed by an unbounded queue; the receiving side owns the socket.
pub struct QueueFrameSink {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl FrameSink for QueueFrameSink {
    async fn send_frame(&self, frame: String) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| anyhow!("channel writer has shut down"))
    }
}

/// Test double for the transport: the peer sees every outbound frame and can
/// push inbound frames or end the stream by dropping `inbound`.
pub struct MemoryPeer {
    pub outbound: mpsc::UnboundedReceiver<String>,
    pub inbound: mpsc::UnboundedSender<Result<String>>,
}

pub fn memory_transport() -> (ChannelTransport, MemoryPeer) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let transport = ChannelTransport {
        sink: Arc::new(QueueFrameSink { tx: outbound_tx }),
        inbound: UnboundedReceiverStream::new(inbound_rx).boxed(),
    };
    (
        transport,
        MemoryPeer {
            outbound: outbound_rx,
            inbound: inbound_tx,
        },
    )
}

pub struct WsTransport;

impl WsTransport {
    /// Opens the websocket. This is the only place a socket is created.
    pub async fn connect(channel_url: &str, user_id: &UserId) -> Result<ChannelTransport> {
        let mut url =
            Url::parse(channel_url).with_context(|| format!("invalid channel url: {channel_url}"))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(anyhow!("channel url must start with ws:// or wss://"));
        }
        url.query_pairs_mut().append_pair("userId", user_id.as_str());

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {channel_url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(Message::Text(frame)).await {
                    warn!("channel: websocket send failed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Result<String>>();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(Ok(text)).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = inbound_tx.send(Err(anyhow!("websocket receive failed: {err}")));
                        break;
                    }
                }
            }
        });

        Ok(ChannelTransport {
            sink: Arc::new(QueueFrameSink { tx: outbound_tx }),
            inbound: UnboundedReceiverStream::new(inbound_rx).boxed(),
        })
    }
}

pub struct EventChannel {
    user_id: UserId,
    sink: Option<Arc<dyn FrameSink>>,
    registry: Arc<Mutex<HandlerRegistry>>,
    alive: Arc<AtomicBool>,
    connected: Arc<watch::Sender<bool>>,
    reader_task: Option<JoinHandle<()>>,
}

fn lock_registry(registry: &Mutex<HandlerRegistry>) -> MutexGuard<'_, HandlerRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EventChannel {
    /// Announces `setup` for `user_id`, then starts delivering inbound events
    /// to `handlers`. Handlers passed here see every event, including the
    /// server's `connected` ack.
    pub async fn open(
        user_id: UserId,
        transport: ChannelTransport,
        handlers: HandlerRegistry,
    ) -> SyncResult<Self> {
        let (connected, _) = watch::channel(false);
        let mut channel = Self {
            user_id,
            sink: Some(transport.sink),
            registry: Arc::new(Mutex::new(handlers)),
            alive: Arc::new(AtomicBool::new(true)),
            connected: Arc::new(connected),
            reader_task: None,
        };

        channel
            .send(ClientRequest::Setup(SetupPayload {
                user_id: channel.user_id.clone(),
            }))
            .await?;

        channel.reader_task = Some(tokio::spawn(run_reader(
            transport.inbound,
            Arc::clone(&channel.registry),
            Arc::clone(&channel.alive),
            Arc::clone(&channel.connected),
        )));
        info!(user_id = %channel.user_id, "channel: opened");
        Ok(channel)
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn on(&self, kind: ServerEventKind, handler: EventHandler) -> HandlerId {
        lock_registry(&self.registry).on(kind, handler)
    }

    pub fn off(&self, kind: ServerEventKind, id: HandlerId) -> bool {
        lock_registry(&self.registry).off(kind, id)
    }

    pub fn handler_count(&self) -> usize {
        lock_registry(&self.registry).len()
    }

    pub fn is_open(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Set by the server's `connected` ack, cleared when the stream ends.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn status(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub async fn send(&self, request: ClientRequest) -> SyncResult<()> {
        let sink = match &self.sink {
            Some(sink) if self.is_open() => Arc::clone(sink),
            _ => return Err(SyncError::ConnectionLost),
        };
        let name = request.name();
        let frame =
            serde_json::to_string(&request).map_err(|err| SyncError::Protocol(err.to_string()))?;
        if let Err(err) = sink.send_frame(frame).await {
            warn!(event = name, "channel: send failed: {err:#}");
            self.alive.store(false, Ordering::SeqCst);
            self.connected.send_replace(false);
            return Err(SyncError::ConnectionLost);
        }
        debug!(event = name, "channel: sent");
        Ok(())
    }

    /// Unregisters every handler and shuts the connection down.
    pub fn close(&mut self) {
        lock_registry(&self.registry).clear();
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.sink = None;
        self.alive.store(false, Ordering::SeqCst);
        self.connected.send_replace(false);
        info!(user_id = %self.user_id, "channel: closed");
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

async fn run_reader(
    mut inbound: FrameStream,
    registry: Arc<Mutex<HandlerRegistry>>,
    alive: Arc<AtomicBool>,
    connected: Arc<watch::Sender<bool>>,
) {
    while let Some(frame) = inbound.next().await {
        let text = match frame {
            Ok(text) => text,
            Err(err) => {
                warn!("channel: receive failed: {err:#}");
                break;
            }
        };
        let event = match serde_json::from_str::<ServerEvent>(&text) {
            Ok(event) => event,
            Err(err) => {
                warn!("channel: ignoring invalid frame: {err}");
                continue;
            }
        };

        if event == ServerEvent::Connected {
            connected.send_replace(true);
        }

        let handlers = lock_registry(&registry).handlers_for(event.kind());
        for handler in handlers {
            handler(event.clone()).await;
        }
    }

    alive.store(false, Ordering::SeqCst);
    connected.send_replace(false);
    info!("channel: inbound stream ended");
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
