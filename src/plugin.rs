//! Bundler hook facade.
//!
//! - [`script_loader`]: `resolve_id` / `load` / `transform` hooks that turn
//!   `?script` imports into registry placeholders
//! - [`output_cache`]: per-file content hashes between builds, for the
//!   changed-file list of a reload cycle
//! - [`reload_client`]: generated reload clients and their dev-mode
//!   manifest injection

pub mod output_cache;
pub mod reload_client;
pub mod script_loader;

pub use output_cache::OutputCache;
pub use script_loader::CrxPlugin;
