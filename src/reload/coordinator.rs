//! Context Reload Coordinator
//!
//! A pure finite-state machine, one per execution context. It never performs
//! I/O: each input yields a list of [`Effect`]s for the driver to carry out,
//! so every interleaving can be tested without a browser or a socket.
//!
//! ```text
//!            do-update (service worker)            reload ok
//!   idle ───────────────────────────────► reloading ─────────► idle
//!     │                                      ▲   │
//!     │ do-update + requiresWorkerResync     │   │ reload error
//!     │ (content script)                     │   ▼
//!     └──────────► awaiting-peer ────────────┘  failed
//!                       │     done-update (same build)
//!                       └── timeout / error ──► failed
//! ```
//!
//! A `do-update` for a newer build that arrives during `reloading` is held
//! and applied as soon as the reload in flight settles.
//!
//! `failed` is terminal until [`Coordinator::reset`]: a half-reloaded content
//! script can leave duplicated DOM state, so it is never retried silently.

use std::fmt;
use std::time::Duration;

use super::message::{BuildId, ExecutionContext, MessageKind, ReloadMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    AwaitingPeer { build_id: BuildId },
    Reloading { build_id: BuildId },
    Failed { build_id: BuildId, reason: String },
}

impl CoordinatorState {
    pub fn name(&self) -> &'static str {
        match self {
            CoordinatorState::Idle => "idle",
            CoordinatorState::AwaitingPeer { .. } => "awaiting-peer",
            CoordinatorState::Reloading { .. } => "reloading",
            CoordinatorState::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorInput {
    /// A message from the reload server.
    Message(ReloadMessage),
    /// The context finished reloading itself.
    ReloadSucceeded,
    ReloadFailed(String),
    /// The `awaiting-peer` timer for this build fired.
    PeerTimeout(BuildId),
}

/// Work the driver must perform after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Service worker: restart the extension runtime.
    ReloadSelf { build_id: BuildId },
    /// Content script: tear down and inject the new build.
    Reinject { build_id: BuildId },
    Send(ReloadMessage),
    StartPeerTimer { build_id: BuildId, after: Duration },
    CancelPeerTimer,
    /// Surface a context failure to the developer-facing log.
    Report { build_id: BuildId, reason: String },
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    context: ExecutionContext,
    state: CoordinatorState,
    /// Highest build id seen; anything older is stale.
    latest: Option<BuildId>,
    /// Highest build the service worker is known to have acknowledged.
    acked: Option<BuildId>,
    /// A newer `do-update` that arrived while a reload was in flight.
    queued: Option<ReloadMessage>,
    peer_timeout: Duration,
}

impl Coordinator {
    pub fn new(context: ExecutionContext, peer_timeout: Duration) -> Self {
        Self {
            context,
            state: CoordinatorState::Idle,
            latest: None,
            acked: None,
            queued: None,
            peer_timeout,
        }
    }

    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    pub fn state(&self) -> &CoordinatorState {
        &self.state
    }

    pub fn latest_build(&self) -> Option<BuildId> {
        self.latest
    }

    /// Leave `failed` after a manual full reload.
    pub fn reset(&mut self) {
        self.state = CoordinatorState::Idle;
        self.queued = None;
    }

    pub fn handle(&mut self, input: CoordinatorInput) -> Vec<Effect> {
        if let CoordinatorState::Failed { build_id, .. } = &self.state {
            tracing::debug!(
                context = %self.context,
                build_id,
                "ignoring input while failed"
            );
            return Vec::new();
        }

        match input {
            CoordinatorInput::Message(message) => self.on_message(message),
            CoordinatorInput::ReloadSucceeded => self.on_reload_succeeded(),
            CoordinatorInput::ReloadFailed(reason) => self.on_reload_failed(reason),
            CoordinatorInput::PeerTimeout(build_id) => self.on_peer_timeout(build_id),
        }
    }

    fn on_message(&mut self, message: ReloadMessage) -> Vec<Effect> {
        let build_id = message.build_id;
        if self.latest.is_some_and(|latest| build_id < latest) {
            tracing::debug!(
                context = %self.context,
                build_id,
                kind = %message.kind,
                "discarding stale message"
            );
            return Vec::new();
        }
        self.latest = Some(build_id);

        match message.kind {
            MessageKind::BuildStarted => self.supersede(build_id),
            MessageKind::DoUpdate => self.on_do_update(&message),
            MessageKind::DoneUpdate => self.on_done_update(build_id),
            MessageKind::Error => self.on_error(&message),
            MessageKind::BuildComplete => Vec::new(),
        }
    }

    /// A newer cycle abandons a wait on an older one.
    fn supersede(&mut self, build_id: BuildId) -> Vec<Effect> {
        match self.state {
            CoordinatorState::AwaitingPeer { build_id: waiting } if waiting < build_id => {
                tracing::info!(
                    context = %self.context,
                    superseded = waiting,
                    build_id,
                    "newer build supersedes pending reload"
                );
                self.state = CoordinatorState::Idle;
                vec![Effect::CancelPeerTimer]
            }
            _ => Vec::new(),
        }
    }

    fn on_do_update(&mut self, message: &ReloadMessage) -> Vec<Effect> {
        let build_id = message.build_id;
        let mut effects = self.supersede(build_id);

        match self.state {
            CoordinatorState::Idle => {}
            CoordinatorState::Reloading { build_id: current } if current < build_id => {
                // Applied once the reload in flight settles.
                tracing::info!(
                    context = %self.context,
                    reloading = current,
                    build_id,
                    "queueing update behind reload in flight"
                );
                self.queued = Some(message.clone());
                return effects;
            }
            CoordinatorState::AwaitingPeer { .. } | CoordinatorState::Reloading { .. } => {
                // Same build repeated.
                return effects;
            }
            CoordinatorState::Failed { .. } => return effects,
        }

        if self.context.is_service_worker() {
            self.state = CoordinatorState::Reloading { build_id };
            effects.push(Effect::ReloadSelf { build_id });
        } else if message.requires_worker_resync() && self.acked == Some(build_id) {
            // The worker's ack overtook this update.
            self.state = CoordinatorState::Reloading { build_id };
            effects.push(Effect::Reinject { build_id });
        } else if message.requires_worker_resync() {
            self.state = CoordinatorState::AwaitingPeer { build_id };
            effects.push(Effect::StartPeerTimer {
                build_id,
                after: self.peer_timeout,
            });
        } else {
            self.state = CoordinatorState::Reloading { build_id };
            effects.push(Effect::Reinject { build_id });
        }
        tracing::info!(context = %self.context, build_id, state = %self.state, "update received");
        effects
    }

    fn on_done_update(&mut self, build_id: BuildId) -> Vec<Effect> {
        self.acked = Some(build_id);
        match self.state {
            CoordinatorState::AwaitingPeer { build_id: waiting } if waiting == build_id => {
                self.state = CoordinatorState::Reloading { build_id };
                vec![Effect::CancelPeerTimer, Effect::Reinject { build_id }]
            }
            _ => Vec::new(),
        }
    }

    fn on_error(&mut self, message: &ReloadMessage) -> Vec<Effect> {
        let build_id = message.build_id;
        match self.state {
            CoordinatorState::AwaitingPeer { build_id: waiting } if waiting == build_id => {
                let reason = message
                    .error_message()
                    .unwrap_or("server reported an error")
                    .to_string();
                let mut effects = vec![Effect::CancelPeerTimer];
                effects.extend(self.fail(build_id, reason));
                effects
            }
            _ => {
                tracing::warn!(
                    context = %self.context,
                    build_id,
                    error = message.error_message().unwrap_or_default(),
                    "server reported an error"
                );
                Vec::new()
            }
        }
    }

    fn on_reload_succeeded(&mut self) -> Vec<Effect> {
        let CoordinatorState::Reloading { build_id } = self.state else {
            return Vec::new();
        };
        self.state = CoordinatorState::Idle;
        tracing::info!(context = %self.context, build_id, "reload complete");
        let mut effects = Vec::new();
        if self.context.is_service_worker() {
            effects.push(Effect::Send(ReloadMessage::done_update(build_id)));
        }
        if let Some(next) = self.queued.take() {
            if self.latest == Some(next.build_id) {
                effects.extend(self.on_do_update(&next));
            }
        }
        effects
    }

    fn on_reload_failed(&mut self, reason: String) -> Vec<Effect> {
        self.queued = None;
        match self.state {
            CoordinatorState::Reloading { build_id } => self.fail(build_id, reason),
            _ => Vec::new(),
        }
    }

    fn on_peer_timeout(&mut self, build_id: BuildId) -> Vec<Effect> {
        match self.state {
            CoordinatorState::AwaitingPeer { build_id: waiting } if waiting == build_id => self
                .fail(
                    build_id,
                    format!(
                        "service worker did not resync within {} ms",
                        self.peer_timeout.as_millis()
                    ),
                ),
            // Timer of a superseded wait.
            _ => Vec::new(),
        }
    }

    fn fail(&mut self, build_id: BuildId, reason: String) -> Vec<Effect> {
        self.state = CoordinatorState::Failed {
            build_id,
            reason: reason.clone(),
        };
        vec![Effect::Report { build_id, reason }]
    }
}
