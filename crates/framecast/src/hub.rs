//! Live view broadcast hub.
//!
//! One trusted publisher attaches to the ingress endpoint and every message it
//! sends is rebroadcast, unmodified, to all subscribers connected to the
//! subscriber endpoint. A slow or dead subscriber never holds up the others.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Endpoint for external, receive-only subscribers
pub const SUBSCRIBER_PATH: &str = "/ws/frame";
/// Endpoint for the internal publisher (the producer's relay)
pub const INGRESS_PATH: &str = "/ws/frame_internal";

/// Frames buffered per subscriber before new ones are dropped for it
const SUBSCRIBER_BUFFER: usize = 8;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receiving side of a registered subscriber
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<Message>,
}

/// Currently connected subscribers
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Message>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<u64, mpsc::Sender<Message>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers().insert(id, tx);
        Subscription { id, receiver }
    }

    pub fn unregister(&self, id: u64) -> bool {
        self.subscribers().remove(&id).is_some()
    }

    /// Hand `message` to every subscriber, returns how many accepted it.
    ///
    /// Subscribers whose connection is gone are dropped from the registry.
    pub fn broadcast(&self, message: &Message) -> usize {
        let mut delivered = 0;
        self.subscribers()
            .retain(|id, tx| match tx.try_send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    log::debug!("Subscriber {} is lagging, frame dropped", id);
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    log::debug!("Subscriber {} disconnected, removing", id);
                    false
                }
            });
        delivered
    }

    pub fn len(&self) -> usize {
        self.subscribers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers().is_empty()
    }
}

/// Shared hub state: subscriber registry plus the single publisher slot
#[derive(Debug, Default)]
pub struct Hub {
    registry: SubscriberRegistry,
    publisher_attached: AtomicBool,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    pub fn publisher_attached(&self) -> bool {
        self.publisher_attached.load(Ordering::Acquire)
    }
}

/// Held for the lifetime of the publisher connection
struct PublisherSlot(Arc<Hub>);

impl PublisherSlot {
    fn try_acquire(hub: &Arc<Hub>) -> Option<Self> {
        hub.publisher_attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(hub.clone()))
    }
}

impl Drop for PublisherSlot {
    fn drop(&mut self) {
        self.0.publisher_attached.store(false, Ordering::Release);
    }
}

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route(SUBSCRIBER_PATH, get(subscriber_ws))
        .route(INGRESS_PATH, get(ingress_ws))
        .route("/health", get(health))
        .with_state(hub)
}

/// Serve the hub on `listener` until the task is dropped or IO fails.
///
/// Every accepted socket has Nagle's algorithm disabled.
pub async fn serve(listener: TcpListener, hub: Arc<Hub>) -> Result<(), HubError> {
    use axum::serve::ListenerExt;

    if let Ok(addr) = listener.local_addr() {
        log::info!("Live view hub listening on {}", addr);
        log::info!("  Subscribers: ws://{}{}", addr, SUBSCRIBER_PATH);
        log::info!("  Publisher:   ws://{}{}", addr, INGRESS_PATH);
    }

    let listener = listener.tap_io(|tcp| {
        if let Err(e) = tcp.set_nodelay(true) {
            log::warn!("Failed to set TCP_NODELAY: {}", e);
        }
    });

    axum::serve(listener, router(hub)).await?;
    Ok(())
}

async fn health(State(hub): State<Arc<Hub>>) -> Json<serde_json::Value> {
    Json(json!({
        "subscribers": hub.registry.len(),
        "publisher_attached": hub.publisher_attached(),
    }))
}

async fn subscriber_ws(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> Response {
    ws.on_upgrade(move |socket| handle_subscriber(socket, hub))
}

async fn handle_subscriber(socket: WebSocket, hub: Arc<Hub>) {
    let Subscription { id, mut receiver } = hub.registry.register();
    log::info!(
        "Subscriber {} connected ({} total)",
        id,
        hub.registry.len()
    );

    let (mut sink, mut stream) = socket.split();

    let forward = async {
        while let Some(message) = receiver.recv().await {
            if let Err(e) = sink.send(message).await {
                log::debug!("Failed to send to subscriber {}: {}", id, e);
                break;
            }
        }
    };

    // Subscribers are receive-only; reading just detects the close
    let drain = async {
        while let Some(Ok(message)) = stream.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    };

    tokio::select! {
        _ = forward => {},
        _ = drain => {},
    }

    hub.registry.unregister(id);
    log::info!(
        "Subscriber {} disconnected ({} remaining)",
        id,
        hub.registry.len()
    );
}

async fn ingress_ws(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> Response {
    let Some(slot) = PublisherSlot::try_acquire(&hub) else {
        log::warn!("Rejected publisher connection: one is already attached");
        return (StatusCode::CONFLICT, "publisher already attached").into_response();
    };

    ws.on_upgrade(move |socket| async move {
        handle_publisher(socket, &hub).await;
        drop(slot);
    })
}

async fn handle_publisher(mut socket: WebSocket, hub: &Hub) {
    log::info!("Publisher attached");
    let mut relayed: u64 = 0;

    while let Some(message) = socket.recv().await {
        match message {
            Ok(message @ (Message::Text(_) | Message::Binary(_))) => {
                hub.registry.broadcast(&message);
                relayed += 1;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::warn!("Publisher connection error: {}", e);
                break;
            }
        }
    }

    log::info!("Publisher detached after {} messages", relayed);
}
