//! Live-reload runtime.
//!
//! A development process pushes build cycles into every running context of
//! the extension under development and brings them back into a consistent
//! state.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐                         ┌──────────────────────┐
//! │  dev process       │   /service-worker       │  service worker      │
//! │                    │◄───────────────────────►│  ReloadClient        │
//! │  ReloadServer      │                         │  → Coordinator       │
//! │  (one socket per   │   /content-script/T/F   ├──────────────────────┤
//! │   context)         │◄───────────────────────►│  content script(s)   │
//! │                    │                         │  ReloadClient        │
//! └────────────────────┘                         │  → Coordinator       │
//!                                                └──────────────────────┘
//! ```
//!
//! # Build cycle
//!
//! 1. `build-started`, then `do-update` to every connected context
//! 2. service worker reloads and answers `done-update`
//! 3. server relays `done-update`, then `build-complete`
//! 4. content scripts waiting on the worker reinject
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `message` | Wire records and execution contexts |
//! | `config` | Endpoint, timeouts and reconnect backoff |
//! | `server` | WebSocket server and build-cycle sequencing |
//! | `client` | Reconnecting per-context client |
//! | `coordinator` | Per-context reload state machine |
//! | `runtime` | Drives a coordinator from a client |

// ============================================================================
// Submodules
// ============================================================================

pub mod client;
pub mod config;
pub mod coordinator;
pub mod message;
pub mod runtime;
pub mod server;

// ============================================================================
// Re-exports
// ============================================================================

pub use client::{ClientHandle, ClientStatus, ReloadClient};
pub use config::{Backoff, ReloadConfig};
pub use coordinator::{Coordinator, CoordinatorInput, CoordinatorState, Effect};
pub use message::{
    BuildId, ExecutionContext, MessageKind, MessagePayload, ReloadMessage, UpdatePayload,
};
pub use runtime::{ContextHost, ContextRuntime};
pub use server::{ConnectionId, ReloadServer, ServerEvent};
