//! Reconnecting reload client.
//!
//! One client per execution context, on its own connection. While
//! disconnected nothing is buffered in either direction: sends fail with
//! `ReloadTransportError`, and messages received on a previous connection
//! are dropped once a new one opens. A rebuild that happened during the gap
//! is simply missed until the next notification.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::config::Backoff;
use super::message::{ExecutionContext, ReloadMessage};
use crate::CrxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Connecting,
    Connected,
    Disconnected,
    /// The retry bound was exhausted.
    GaveUp,
}

pub struct ReloadClient;

impl ReloadClient {
    /// Start connecting `context` to the server at `base_url`
    /// (`ws://host:port`). Returns immediately; the connection is retried
    /// with `backoff` for as long as the handle lives.
    pub fn connect(
        base_url: impl Into<String>,
        context: ExecutionContext,
        backoff: Backoff,
    ) -> ClientHandle {
        let url = format!(
            "{}{}",
            base_url.into().trim_end_matches('/'),
            context.endpoint_path()
        );
        let epoch = Arc::new(AtomicU64::new(0));
        let (status_tx, status_rx) = watch::channel(ClientStatus::Connecting);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run_connection(
            url,
            context,
            backoff,
            Arc::clone(&epoch),
            status_tx,
            inbound_tx,
            outbound_rx,
        ));

        ClientHandle {
            context,
            inbound: inbound_rx,
            outbound: outbound_tx,
            epoch,
            status: status_rx,
            task,
        }
    }
}

/// Owner side of a client. Dropping it closes the connection.
pub struct ClientHandle {
    context: ExecutionContext,
    inbound: mpsc::UnboundedReceiver<(u64, ReloadMessage)>,
    outbound: mpsc::UnboundedSender<ReloadMessage>,
    /// Incremented on every disconnect.
    epoch: Arc<AtomicU64>,
    status: watch::Receiver<ClientStatus>,
    task: JoinHandle<()>,
}

impl ClientHandle {
    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    pub fn status(&self) -> ClientStatus {
        *self.status.borrow()
    }

    /// Number of connections lost so far.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Wait until the client reaches `status`.
    pub async fn wait_for_status(&mut self, status: ClientStatus) -> Result<(), CrxError> {
        self.status
            .wait_for(|s| *s == status)
            .await
            .map(|_| ())
            .map_err(|_| CrxError::ReloadTransportError("client task stopped".into()))
    }

    /// Next message from the current connection. `None` once the client has
    /// stopped for good.
    pub async fn next_message(&mut self) -> Option<ReloadMessage> {
        loop {
            let (epoch, message) = self.inbound.recv().await?;
            if epoch == self.epoch.load(Ordering::SeqCst) {
                return Some(message);
            }
            tracing::debug!(
                context = %self.context,
                build_id = message.build_id,
                kind = %message.kind,
                "dropping message from a previous connection"
            );
        }
    }

    pub fn send(&self, message: ReloadMessage) -> Result<(), CrxError> {
        if self.status() != ClientStatus::Connected {
            return Err(CrxError::ReloadTransportError(format!(
                "{} is not connected",
                self.context
            )));
        }
        self.outbound
            .send(message)
            .map_err(|_| CrxError::ReloadTransportError("client task stopped".into()))
    }

    /// Hand every future message to `callback` on a background task.
    pub fn on_message<F>(mut self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(ReloadMessage) + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(message) = self.next_message().await {
                callback(message);
            }
        })
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_connection(
    url: String,
    context: ExecutionContext,
    backoff: Backoff,
    epoch: Arc<AtomicU64>,
    status: watch::Sender<ClientStatus>,
    inbound: mpsc::UnboundedSender<(u64, ReloadMessage)>,
    mut outbound: mpsc::UnboundedReceiver<ReloadMessage>,
) {
    let mut attempt: u32 = 0;

    loop {
        status.send_replace(ClientStatus::Connecting);
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                attempt = 0;
                // Anything queued while down belongs to the old connection.
                while outbound.try_recv().is_ok() {}
                let current = epoch.load(Ordering::SeqCst);
                status.send_replace(ClientStatus::Connected);
                tracing::info!(%context, "reload client connected");

                let (mut sink, mut stream) = ws.split();
                loop {
                    tokio::select! {
                        frame = stream.next() => match frame {
                            Some(Ok(Message::Text(text))) => match ReloadMessage::from_json(&text) {
                                Ok(message) => {
                                    if inbound.send((current, message)).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => tracing::warn!(%context, error = %e, "malformed reload message"),
                            },
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::warn!(%context, error = %e, "reload connection error");
                                break;
                            }
                        },
                        out = outbound.recv() => match out {
                            Some(message) => {
                                let text = match message.to_json() {
                                    Ok(text) => text,
                                    Err(e) => {
                                        tracing::warn!(%context, error = %e, "unencodable reload message");
                                        continue;
                                    }
                                };
                                if let Err(e) = sink.send(Message::Text(text)).await {
                                    tracing::warn!(%context, error = %e, "reload send failed");
                                    break;
                                }
                            }
                            None => {
                                let _ = sink.close().await;
                                return;
                            }
                        },
                    }
                }

                epoch.fetch_add(1, Ordering::SeqCst);
                status.send_replace(ClientStatus::Disconnected);
                tracing::warn!(%context, "reload client disconnected");
            }
            Err(e) => {
                tracing::debug!(%context, attempt, error = %e, "reload connect failed");
            }
        }

        let Some(delay) = backoff.delay(attempt) else {
            status.send_replace(ClientStatus::GaveUp);
            tracing::warn!(%context, attempt, "reload client gave up reconnecting");
            return;
        };
        attempt = attempt.saturating_add(1);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inbound.closed() => return,
        }
    }
}
