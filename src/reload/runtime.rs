//! Drives a [`Coordinator`] from a live [`ClientHandle`].
//!
//! The runtime owns the `awaiting-peer` timer and performs the coordinator's
//! effects against a [`ContextHost`]: the thing that can actually reload a
//! service worker or reinject a content script.

use std::future;
use std::pin::Pin;

use tokio::sync::watch;
use tokio::time::Sleep;

use super::client::ClientHandle;
use super::coordinator::{Coordinator, CoordinatorInput, CoordinatorState, Effect};
use super::message::BuildId;
use crate::CrxError;

/// The execution context's own reload primitives.
pub trait ContextHost: Send {
    /// Restart the extension runtime (service worker).
    fn reload_self(&mut self, build_id: BuildId) -> Result<(), CrxError>;

    /// Tear down and inject the new build (content script).
    fn reinject(&mut self, build_id: BuildId) -> Result<(), CrxError>;
}

pub struct ContextRuntime<H: ContextHost> {
    coordinator: Coordinator,
    host: H,
    client: ClientHandle,
    state: watch::Sender<CoordinatorState>,
    timer: Option<(BuildId, Pin<Box<Sleep>>)>,
}

impl<H: ContextHost> ContextRuntime<H> {
    pub fn new(coordinator: Coordinator, host: H, client: ClientHandle) -> Self {
        let (state, _) = watch::channel(coordinator.state().clone());
        Self {
            coordinator,
            host,
            client,
            state,
            timer: None,
        }
    }

    /// Observe coordinator state changes.
    pub fn subscribe(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    /// Run until the client stops for good. Returns the host.
    pub async fn run(mut self) -> H {
        loop {
            tokio::select! {
                message = self.client.next_message() => match message {
                    Some(message) => self.apply(CoordinatorInput::Message(message)),
                    None => break,
                },
                build_id = Self::peer_timer(&mut self.timer) => {
                    self.timer = None;
                    self.apply(CoordinatorInput::PeerTimeout(build_id));
                }
            }
        }
        self.host
    }

    async fn peer_timer(timer: &mut Option<(BuildId, Pin<Box<Sleep>>)>) -> BuildId {
        match timer {
            Some((build_id, sleep)) => {
                sleep.as_mut().await;
                *build_id
            }
            None => future::pending().await,
        }
    }

    fn apply(&mut self, input: CoordinatorInput) {
        let mut queue = vec![input];
        while let Some(input) = queue.pop() {
            for effect in self.coordinator.handle(input) {
                if let Some(next) = self.perform(effect) {
                    queue.push(next);
                }
            }
        }
        self.state.send_replace(self.coordinator.state().clone());
    }

    fn perform(&mut self, effect: Effect) -> Option<CoordinatorInput> {
        match effect {
            Effect::ReloadSelf { build_id } => Some(outcome(self.host.reload_self(build_id))),
            Effect::Reinject { build_id } => Some(outcome(self.host.reinject(build_id))),
            Effect::Send(message) => {
                if let Err(e) = self.client.send(message) {
                    tracing::warn!(context = %self.coordinator.context(), error = %e, "reload send failed");
                }
                None
            }
            Effect::StartPeerTimer { build_id, after } => {
                self.timer = Some((build_id, Box::pin(tokio::time::sleep(after))));
                None
            }
            Effect::CancelPeerTimer => {
                self.timer = None;
                None
            }
            Effect::Report { build_id, reason } => {
                let error = CrxError::ReloadContextFailure {
                    context: self.coordinator.context(),
                    build_id,
                    reason,
                };
                tracing::error!(
                    %error,
                    "reload failed; reload the extension manually"
                );
                None
            }
        }
    }
}

fn outcome(result: Result<(), CrxError>) -> CoordinatorInput {
    match result {
        Ok(()) => CoordinatorInput::ReloadSucceeded,
        Err(e) => CoordinatorInput::ReloadFailed(e.to_string()),
    }
}
