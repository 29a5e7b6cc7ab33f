pub mod discovery;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::protocol::{CONSUMER_PATH, DISCOVERY_PATH, PRODUCER_PATH};

/// Frames queued per consumer before that consumer starts missing frames
pub const CONSUMER_QUEUE: usize = 2;

pub type ConnectionId = u64;

/// Server-owned connection registry.
///
/// One optional producer slot and one consumer map, both mutated only by
/// the attach/detach calls made from the connection handlers.
#[derive(Clone, Default)]
pub struct RelayState {
    inner: Arc<RelayInner>,
}

#[derive(Default)]
struct RelayInner {
    producer: RwLock<Option<ConnectionId>>,
    consumers: RwLock<HashMap<ConnectionId, mpsc::Sender<Bytes>>>,
    next_id: AtomicU64,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> ConnectionId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Take the producer slot. Last writer wins.
    pub async fn attach_producer(&self) -> ConnectionId {
        let id = self.allocate_id();
        let previous = self.inner.producer.write().await.replace(id);
        match previous {
            Some(old) => info!("📡 Producer {} replaced producer {}", id, old),
            None => info!("📡 Producer {} connected", id),
        }
        id
    }

    /// Clear the slot if `id` still holds it. A replaced producer closing
    /// leaves its successor in place.
    pub async fn detach_producer(&self, id: ConnectionId) -> bool {
        let mut slot = self.inner.producer.write().await;
        if *slot == Some(id) {
            *slot = None;
            info!("🔌 Producer {} disconnected", id);
            true
        } else {
            debug!("stale producer {} closed", id);
            false
        }
    }

    pub async fn is_current_producer(&self, id: ConnectionId) -> bool {
        *self.inner.producer.read().await == Some(id)
    }

    pub async fn has_producer(&self) -> bool {
        self.inner.producer.read().await.is_some()
    }

    pub async fn attach_consumer(&self, outbound: mpsc::Sender<Bytes>) -> ConnectionId {
        let id = self.allocate_id();
        let mut consumers = self.inner.consumers.write().await;
        consumers.insert(id, outbound);
        info!("👀 Viewer {} connected ({} watching)", id, consumers.len());
        id
    }

    pub async fn detach_consumer(&self, id: ConnectionId) -> bool {
        let mut consumers = self.inner.consumers.write().await;
        let removed = consumers.remove(&id).is_some();
        if removed {
            info!("🔌 Viewer {} disconnected ({} watching)", id, consumers.len());
        }
        removed
    }

    pub async fn consumer_count(&self) -> usize {
        self.inner.consumers.read().await.len()
    }

    /// Queue `payload` for every connected consumer without waiting on any.
    ///
    /// A consumer whose queue is full misses this frame; the others are
    /// unaffected. Returns how many consumers took it.
    pub async fn broadcast(&self, payload: Bytes) -> usize {
        let consumers = self.inner.consumers.read().await;
        let mut delivered = 0;
        for (id, outbound) in consumers.iter() {
            match outbound.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("viewer {} is behind, dropping frame", id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }
}

/// Relay for one producer and any number of viewers
/// - Payloads are forwarded untouched and never stored
/// - Nothing but the current producer's binary messages is forwarded
/// - Also answers the `/local-ip` discovery request on the same port
pub struct RelayServer {
    addr: String,
    state: RelayState,
}

impl RelayServer {
    pub fn new(addr: String) -> Self {
        Self {
            addr,
            state: RelayState::new(),
        }
    }

    pub fn state(&self) -> RelayState {
        self.state.clone()
    }

    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("failed to bind {}", self.addr))?;
        let port = listener.local_addr()?.port();
        println!("🖥️  Screen relay");
        println!("📡 Listening on: {}", self.addr);
        println!(
            "🔗 Viewers: http://{}:{}{}",
            discovery::local_ipv4(),
            port,
            CONSUMER_PATH
        );
        println!();
        info!(addr = %self.addr, "relay listening");

        serve(listener, self.state.clone())
            .await
            .context("relay server failed")
    }
}

/// Serve the relay on an already-bound listener
pub async fn serve(listener: TcpListener, state: RelayState) -> std::io::Result<()> {
    axum::serve(listener, build_app(state)).await
}

pub fn build_app(state: RelayState) -> Router {
    Router::new()
        .route(PRODUCER_PATH, get(producer_upgrade).options(preflight))
        .route(CONSUMER_PATH, get(consumer_upgrade).options(preflight))
        .route(
            DISCOVERY_PATH,
            get(discovery::local_ip_handler).options(preflight),
        )
        .fallback(fallback)
        .layer(middleware::map_response(with_cors_headers))
        .with_state(state)
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn fallback(method: Method) -> StatusCode {
    if method == Method::OPTIONS {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn with_cors_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}

async fn producer_upgrade(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_producer(socket, state))
}

async fn consumer_upgrade(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_consumer(socket, state))
}

async fn handle_producer(mut socket: WebSocket, state: RelayState) {
    let id = state.attach_producer().await;

    while let Some(msg) = socket.recv().await {
        match msg {
            Ok(Message::Binary(data)) => {
                // Frames from a replaced producer are not forwarded
                if state.is_current_producer(id).await {
                    state.broadcast(data).await;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    // Viewers are not told; they just stop receiving frames
    state.detach_producer(id).await;
}

async fn handle_consumer(socket: WebSocket, state: RelayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Bytes>(CONSUMER_QUEUE);
    let id = state.attach_consumer(tx).await;

    // One writer per viewer so a slow socket only delays itself
    let mut send_task = tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if ws_sender.send(Message::Binary(data)).await.is_err() {
                break;
            }
        }
    });

    // Viewers send nothing meaningful; watch for close or failure
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.detach_consumer(id).await;
}

pub async fn start_relay(addr: String) -> Result<()> {
    let server = RelayServer::new(addr);
    server.run().await
}
