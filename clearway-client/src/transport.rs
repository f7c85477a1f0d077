//! WebSocket transport to the relay.
//!
//! Delivers opaque JSON text frames both ways, exposes connectivity through
//! status listeners, and queues outbound traffic while disconnected. There
//! is no automatic reconnection; callers decide when to call `connect()`
//! again.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use clearway_core::RpcMessage;

/// Connectivity of the relay channel. Mutated only by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Handle returned by listener registration, used to deregister.
pub type ListenerId = u64;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Observer registry with defined iteration-during-mutation semantics:
/// dispatch walks a snapshot taken under the lock, so a listener may
/// remove itself (or any other listener) while being notified.
pub(crate) struct ListenerRegistry<T> {
    next_id: ListenerId,
    entries: Vec<(ListenerId, Listener<T>)>,
}

impl<T> ListenerRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            entries: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, listener: Listener<T>) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((id, listener));
        id
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    /// Listeners in registration order.
    pub(crate) fn snapshot(&self) -> Vec<Listener<T>> {
        self.entries.iter().map(|(_, l)| Arc::clone(l)).collect()
    }
}

struct SocketState {
    status: ConnectionState,
    queue: VecDeque<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    /// Bumped on every connect/close; a socket task only touches shared
    /// state while its epoch is current.
    epoch: u64,
    task: Option<tokio::task::JoinHandle<()>>,
}

struct TransportInner {
    url: String,
    state: Mutex<SocketState>,
    status_listeners: Mutex<ListenerRegistry<ConnectionState>>,
    message_listeners: Mutex<ListenerRegistry<RpcMessage>>,
}

/// Persistent bidirectional message channel to the relay.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                url: url.into(),
                state: Mutex::new(SocketState {
                    status: ConnectionState::Disconnected,
                    queue: VecDeque::new(),
                    outbound: None,
                    epoch: 0,
                    task: None,
                }),
                status_listeners: Mutex::new(ListenerRegistry::new()),
                message_listeners: Mutex::new(ListenerRegistry::new()),
            }),
        }
    }

    /// Open the channel. A no-op while already connecting or connected.
    pub fn connect(&self) {
        let epoch = {
            let mut state = self.inner.state.lock();
            if state.status != ConnectionState::Disconnected {
                return;
            }
            state.epoch += 1;
            state.status = ConnectionState::Connecting;
            state.epoch
        };
        notify_status(&self.inner, ConnectionState::Connecting);

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_socket(inner, epoch));

        let mut state = self.inner.state.lock();
        if state.epoch == epoch {
            state.task = Some(handle);
        }
    }

    /// Deliver a frame now if connected, else enqueue it. Queued frames
    /// flush in FIFO order when the channel opens.
    pub fn send(&self, payload: impl Into<String>) {
        let payload = payload.into();
        let mut state = self.inner.state.lock();
        if state.status == ConnectionState::Connected {
            if let Some(tx) = state.outbound.clone() {
                match tx.send(payload) {
                    Ok(()) => return,
                    // Writer already gone; keep the frame for the next open.
                    Err(returned) => {
                        state.queue.push_back(returned.0);
                        return;
                    }
                }
            }
        }
        state.queue.push_back(payload);
    }

    /// Tear the channel down. Queued frames survive for a later connect.
    pub fn close(&self) {
        let (task, was_open) = {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            state.outbound = None;
            let was_open = state.status != ConnectionState::Disconnected;
            state.status = ConnectionState::Disconnected;
            (state.task.take(), was_open)
        };
        if let Some(task) = task {
            task.abort();
        }
        if was_open {
            notify_status(&self.inner, ConnectionState::Disconnected);
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().status
    }

    /// Register a status observer. It immediately receives the current
    /// state, then every transition.
    pub fn add_status_listener(
        &self,
        listener: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> ListenerId {
        let listener: Listener<ConnectionState> = Arc::new(listener);
        let id = self.inner.status_listeners.lock().add(Arc::clone(&listener));
        let current = self.state();
        listener(&current);
        id
    }

    pub fn remove_status_listener(&self, id: ListenerId) -> bool {
        self.inner.status_listeners.lock().remove(id)
    }

    /// Register a message observer, invoked once per parsed inbound frame
    /// in registration order.
    pub fn add_message_listener(
        &self,
        listener: impl Fn(&RpcMessage) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.message_listeners.lock().add(Arc::new(listener))
    }

    pub fn remove_message_listener(&self, id: ListenerId) -> bool {
        self.inner.message_listeners.lock().remove(id)
    }
}

async fn run_socket(inner: Arc<TransportInner>, epoch: u64) {
    let ws = match connect_async(inner.url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            tracing::warn!(url = %inner.url, "websocket connect failed: {}", e);
            settle_disconnected(&inner, epoch);
            return;
        }
    };

    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Drain the queue and flip to Connected under one lock, so a send()
    // issued after observing Connected can never overtake a queued frame.
    {
        let mut state = inner.state.lock();
        if state.epoch != epoch {
            return;
        }
        while let Some(queued) = state.queue.pop_front() {
            let _ = tx.send(queued);
        }
        state.outbound = Some(tx);
        state.status = ConnectionState::Connected;
    }
    notify_status(&inner, ConnectionState::Connected);
    tracing::info!(url = %inner.url, "transport connected");

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match RpcMessage::parse(text.as_str()) {
                Ok(message) => dispatch_message(&inner, &message),
                Err(e) => tracing::warn!("dropping malformed inbound frame: {}", e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("websocket receive error: {}", e);
                break;
            }
        }
    }

    writer.abort();
    settle_disconnected(&inner, epoch);
}

fn settle_disconnected(inner: &Arc<TransportInner>, epoch: u64) {
    let changed = {
        let mut state = inner.state.lock();
        if state.epoch != epoch {
            // A newer connect/close owns the state now.
            return;
        }
        state.outbound = None;
        state.task = None;
        let changed = state.status != ConnectionState::Disconnected;
        state.status = ConnectionState::Disconnected;
        changed
    };
    if changed {
        notify_status(inner, ConnectionState::Disconnected);
    }
}

fn notify_status(inner: &Arc<TransportInner>, status: ConnectionState) {
    let snapshot = inner.status_listeners.lock().snapshot();
    for listener in snapshot {
        listener(&status);
    }
}

fn dispatch_message(inner: &Arc<TransportInner>, message: &RpcMessage) {
    let snapshot = inner.message_listeners.lock().snapshot();
    for listener in snapshot {
        listener(message);
    }
}
