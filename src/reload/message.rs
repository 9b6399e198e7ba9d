//! Reload wire protocol.
//!
//! ```text
//! {"type": "do-update", "buildId": 7, "payload": {"changed": [...], "requiresWorkerResync": true}}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::CrxError;

/// Monotonic build-cycle id assigned by the server.
pub type BuildId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    BuildStarted,
    BuildComplete,
    DoUpdate,
    DoneUpdate,
    Error,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::BuildStarted => "build-started",
            MessageKind::BuildComplete => "build-complete",
            MessageKind::DoUpdate => "do-update",
            MessageKind::DoneUpdate => "done-update",
            MessageKind::Error => "error",
        };
        f.write_str(s)
    }
}

/// Payload of a `do-update`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePayload {
    /// Emitted files that changed since the previous build.
    #[serde(default)]
    pub changed: Vec<String>,
    /// The manifest changed, so the service worker must re-register before
    /// content scripts reload.
    #[serde(default)]
    pub requires_worker_resync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessagePayload {
    Error { message: String },
    Update(UpdatePayload),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub build_id: BuildId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<MessagePayload>,
}

impl ReloadMessage {
    fn bare(kind: MessageKind, build_id: BuildId) -> Self {
        Self {
            kind,
            build_id,
            payload: None,
        }
    }

    pub fn build_started(build_id: BuildId) -> Self {
        Self::bare(MessageKind::BuildStarted, build_id)
    }

    pub fn build_complete(build_id: BuildId) -> Self {
        Self::bare(MessageKind::BuildComplete, build_id)
    }

    pub fn do_update(build_id: BuildId, update: UpdatePayload) -> Self {
        Self {
            kind: MessageKind::DoUpdate,
            build_id,
            payload: Some(MessagePayload::Update(update)),
        }
    }

    pub fn done_update(build_id: BuildId) -> Self {
        Self::bare(MessageKind::DoneUpdate, build_id)
    }

    pub fn error(build_id: BuildId, message: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Error,
            build_id,
            payload: Some(MessagePayload::Error {
                message: message.into(),
            }),
        }
    }

    pub fn requires_worker_resync(&self) -> bool {
        matches!(
            &self.payload,
            Some(MessagePayload::Update(UpdatePayload {
                requires_worker_resync: true,
                ..
            }))
        )
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.payload {
            Some(MessagePayload::Error { message }) => Some(message),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, CrxError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, CrxError> {
        Ok(serde_json::from_str(raw)?)
    }
}

// ---------------------------------------------------------------------------
// Execution Context
// ---------------------------------------------------------------------------

/// A runtime context of the extension under development.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ExecutionContext {
    ServiceWorker,
    #[serde(rename_all = "camelCase")]
    ContentScript { tab_id: i64, frame_id: i64 },
}

impl ExecutionContext {
    pub fn is_service_worker(&self) -> bool {
        matches!(self, ExecutionContext::ServiceWorker)
    }

    /// Path a context connects to, which is how the server tells them apart.
    pub fn endpoint_path(&self) -> String {
        match self {
            ExecutionContext::ServiceWorker => "/service-worker".into(),
            ExecutionContext::ContentScript { tab_id, frame_id } => {
                format!("/content-script/{}/{}", tab_id, frame_id)
            }
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.split('?').next()?.trim_end_matches('/');
        if path == "/service-worker" {
            return Some(ExecutionContext::ServiceWorker);
        }
        let rest = path.strip_prefix("/content-script/")?;
        let (tab, frame) = rest.split_once('/')?;
        Some(ExecutionContext::ContentScript {
            tab_id: tab.parse().ok()?,
            frame_id: frame.parse().ok()?,
        })
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionContext::ServiceWorker => f.write_str("service-worker"),
            ExecutionContext::ContentScript { tab_id, frame_id } => {
                write!(f, "content-script(tab {}, frame {})", tab_id, frame_id)
            }
        }
    }
}
