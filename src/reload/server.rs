//! Reload server: accepts one WebSocket connection per execution context
//! and sequences build cycles across them.
//!
//! The connection table is a `DashMap`, so contexts connect and disconnect
//! in parallel with no global lock. Every connection has its own ordered
//! outbound queue; a broadcast enqueues on each in turn, which keeps
//! `done-update` ahead of `build-complete` on every connection.
//!
//! Cycle transitions (start, complete, fail) and connection registration
//! run under one cycle lock, so every connection sees a cycle's
//! `build-started` and `do-update` before any `done-update` for it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use super::config::ReloadConfig;
use super::message::{BuildId, ExecutionContext, MessageKind, ReloadMessage, UpdatePayload};
use crate::CrxError;

pub type ConnectionId = u64;

/// Lifecycle and traffic notifications, for hooks and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Connected {
        id: ConnectionId,
        context: ExecutionContext,
    },
    Disconnected {
        id: ConnectionId,
        context: ExecutionContext,
    },
    Received {
        id: ConnectionId,
        context: ExecutionContext,
        message: ReloadMessage,
    },
    CycleComplete {
        build_id: BuildId,
    },
    CycleFailed {
        build_id: BuildId,
        reason: String,
    },
}

struct Connection {
    context: ExecutionContext,
    tx: mpsc::UnboundedSender<Message>,
}

struct Shared {
    config: ReloadConfig,
    connections: DashMap<ConnectionId, Connection>,
    next_connection: AtomicU64,
    last_build: AtomicU64,
    /// Cycle waiting for the service worker's `done-update`.
    pending: Mutex<Option<BuildId>>,
    /// Serializes cycle broadcasts and connection registration.
    cycle: Mutex<()>,
    events: broadcast::Sender<ServerEvent>,
}

impl Shared {
    fn emit(&self, event: ServerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn broadcast(&self, message: &ReloadMessage) -> Result<usize, CrxError> {
        let text = message.to_json()?;
        let mut delivered = 0;
        for conn in self.connections.iter() {
            if conn.tx.send(Message::Text(text.clone())).is_ok() {
                delivered += 1;
            }
        }
        tracing::debug!(
            kind = %message.kind,
            build_id = message.build_id,
            delivered,
            "broadcast"
        );
        Ok(delivered)
    }

    /// Clear `pending` if it still names `build_id`.
    fn take_pending(&self, build_id: BuildId) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if *pending == Some(build_id) {
            *pending = None;
            true
        } else {
            false
        }
    }

    fn pending(&self) -> Option<BuildId> {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cycle_lock(&self) -> MutexGuard<'_, ()> {
        self.cycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Relay the ack for `build_id` if it is the cycle still pending.
    fn complete_cycle(&self, build_id: BuildId) -> bool {
        let _cycle = self.cycle_lock();
        if !self.take_pending(build_id) {
            return false;
        }
        let relayed = self
            .broadcast(&ReloadMessage::done_update(build_id))
            .and_then(|_| self.broadcast(&ReloadMessage::build_complete(build_id)));
        if let Err(e) = relayed {
            tracing::warn!(build_id, error = %e, "failed to complete build cycle");
        }
        tracing::info!(build_id, "build cycle complete");
        self.emit(ServerEvent::CycleComplete { build_id });
        true
    }

    fn fail_cycle(&self, build_id: BuildId, reason: String) {
        let _cycle = self.cycle_lock();
        if !self.take_pending(build_id) {
            return;
        }
        tracing::warn!(build_id, %reason, "build cycle failed");
        if let Err(e) = self.broadcast(&ReloadMessage::error(build_id, reason.clone())) {
            tracing::warn!(build_id, error = %e, "failed to broadcast cycle error");
        }
        self.emit(ServerEvent::CycleFailed { build_id, reason });
    }

    fn on_message(&self, id: ConnectionId, context: ExecutionContext, message: ReloadMessage) {
        match message.kind {
            MessageKind::DoneUpdate if context.is_service_worker() => {
                if !self.complete_cycle(message.build_id) {
                    tracing::debug!(
                        build_id = message.build_id,
                        "discarding stale acknowledgement"
                    );
                }
            }
            MessageKind::Error => tracing::warn!(
                %context,
                build_id = message.build_id,
                error = message.error_message().unwrap_or_default(),
                "context reported a reload failure"
            ),
            _ => {}
        }
        self.emit(ServerEvent::Received {
            id,
            context,
            message,
        });
    }
}

pub struct ReloadServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl ReloadServer {
    /// Bind `config.bind` and start accepting contexts.
    pub async fn bind(config: ReloadConfig) -> Result<Self, CrxError> {
        let listener = TcpListener::bind(config.bind).await.map_err(|e| {
            CrxError::ReloadTransportError(format!("failed to bind {}: {}", config.bind, e))
        })?;
        let local_addr = listener.local_addr()?;
        let (events, _) = broadcast::channel(256);

        let shared = Arc::new(Shared {
            config,
            connections: DashMap::new(),
            next_connection: AtomicU64::new(1),
            last_build: AtomicU64::new(0),
            pending: Mutex::new(None),
            cycle: Mutex::new(()),
            events,
        });

        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&shared)));
        tracing::info!(addr = %local_addr, "reload server listening");

        Ok(Self {
            shared,
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    /// Run `hook` for every new connection.
    pub fn on_connect<F>(&self, mut hook: F) -> JoinHandle<()>
    where
        F: FnMut(ConnectionId, ExecutionContext) + Send + 'static,
    {
        let mut events = self.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ServerEvent::Connected { id, context }) => hook(id, context),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Run `hook` for every closed connection.
    pub fn on_disconnect<F>(&self, mut hook: F) -> JoinHandle<()>
    where
        F: FnMut(ConnectionId, ExecutionContext) + Send + 'static,
    {
        let mut events = self.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ServerEvent::Disconnected { id, context }) => hook(id, context),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Currently connected contexts.
    pub fn connections(&self) -> Vec<(ConnectionId, ExecutionContext)> {
        let mut out: Vec<_> = self
            .shared
            .connections
            .iter()
            .map(|c| (*c.key(), c.context))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Send `message` to every connected context. Returns how many
    /// connections it was queued on.
    pub fn broadcast(&self, message: &ReloadMessage) -> Result<usize, CrxError> {
        self.shared.broadcast(message)
    }

    /// Id of the latest cycle started.
    pub fn current_build(&self) -> BuildId {
        self.shared.last_build.load(Ordering::SeqCst)
    }

    /// Open a new build cycle, superseding any unacknowledged one.
    ///
    /// Broadcasts `build-started` and `do-update`. The cycle completes when
    /// the service worker acknowledges (or reconnects fresh), and fails with
    /// an `error` broadcast after `ack_timeout`.
    pub fn start_cycle(&self, update: UpdatePayload) -> Result<BuildId, CrxError> {
        let build_id = {
            let _cycle = self.shared.cycle_lock();
            let build_id = self.shared.last_build.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::info!(
                build_id,
                changed = update.changed.len(),
                resync = update.requires_worker_resync,
                "starting build cycle"
            );
            self.shared.broadcast(&ReloadMessage::build_started(build_id))?;
            self.shared
                .broadcast(&ReloadMessage::do_update(build_id, update))?;

            // Armed last: an ack can only complete a cycle every connection
            // has already been told about.
            let mut pending = self
                .shared
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = pending.replace(build_id) {
                tracing::info!(previous, build_id, "superseding unacknowledged cycle");
            }
            build_id
        };

        let shared = Arc::clone(&self.shared);
        let ack_timeout = shared.config.ack_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(ack_timeout).await;
            shared.fail_cycle(
                build_id,
                format!(
                    "service worker did not acknowledge build {} within {} ms",
                    build_id,
                    ack_timeout.as_millis()
                ),
            );
        });

        Ok(build_id)
    }

    /// Stop accepting and drop every connection.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        self.shared.connections.clear();
    }
}

impl Drop for ReloadServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_connection(Arc::clone(&shared), stream, peer));
            }
            Err(e) => tracing::warn!(error = %e, "reload accept failed"),
        }
    }
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    let mut context: Option<ExecutionContext> = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match ExecutionContext::from_path(request.uri().path()) {
            Some(c) => {
                context = Some(c);
                Ok(response)
            }
            None => {
                let mut error = ErrorResponse::new(Some("unknown reload endpoint".into()));
                *error.status_mut() = StatusCode::NOT_FOUND;
                Err(error)
            }
        }
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(%peer, error = %e, "reload handshake rejected");
            return;
        }
    };
    let Some(context) = context else {
        return;
    };

    let id = shared.next_connection.fetch_add(1, Ordering::SeqCst);
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    {
        // Joins between cycle broadcasts, never halfway through one.
        let _cycle = shared.cycle_lock();
        shared.connections.insert(id, Connection { context, tx });
    }
    tracing::info!(%context, id, "context connected");
    shared.emit(ServerEvent::Connected { id, context });

    // A fresh worker while a cycle waits means the reload already happened.
    if context.is_service_worker() {
        if let Some(build_id) = shared.pending() {
            shared.complete_cycle(build_id);
        }
    }

    let (mut sink, mut stream) = ws.split();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match ReloadMessage::from_json(&text) {
                Ok(message) => shared.on_message(id, context, message),
                Err(e) => tracing::warn!(%context, error = %e, "malformed reload message"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(%context, error = %e, "reload connection error");
                break;
            }
        }
    }

    shared.connections.remove(&id);
    writer.abort();
    tracing::info!(%context, id, "context disconnected");
    shared.emit(ServerEvent::Disconnected { id, context });
}
