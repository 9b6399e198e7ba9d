//! # CRX Bundler
//!
//! Extension-aware build layer that sits on top of a generic bundler and
//! turns a browser-extension manifest plus its loosely-related sources into
//! a deployable package, plus the live-reload protocol used while the
//! extension is under development.
//!
//! ```text
//! manifest.json ─► ManifestDocument ─► EntryResolver ─► BuildEntry set ─► BundlerHost
//!                                         │                                  │
//!                                         └─► VirtualAssetRegistry ◄─────────┤ emitted paths
//!                                                                            ▼
//!                                               ManifestRewriter ─► final manifest.json
//! ```
//!
//! The bundler itself is a collaborator behind [`host::BundlerHost`]. This
//! crate never tree-shakes or splits code; it only discovers inputs, tracks
//! their emitted names and keeps the manifest consistent with them.
//!
//! The runtime half lives in [`reload`]: a WebSocket channel between the dev
//! process and every extension context, and a per-context state machine that
//! decides when a context may safely reload.

pub mod bundle;
pub mod host;
pub mod html;
pub mod manifest;
pub mod plugin;
pub mod registry;
pub mod reload;
pub mod resolver;
pub mod rewriter;
pub mod utils;
pub mod watch;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use host::{BundleOutputs, BundlerHost, EmittedFile, EmittedSource, PassthroughHost};
pub use manifest::{ExecutionWorld, ManifestDocument, ManifestLocation, ManifestVersion};
pub use registry::{LogicalId, VirtualAssetRegistry};
pub use reload::{ExecutionContext, ReloadConfig, ReloadMessage};
pub use resolver::{BuildEntry, EntryId, EntryKind, EntryResolver, FsSourceGraph, SourceGraph};
pub use rewriter::ManifestRewriter;

// ---------------------------------------------------------------------------
// Build Mode
// ---------------------------------------------------------------------------

/// The build mode decides whether runtime reload helpers are injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildMode {
    /// Development: reload clients injected, CSP extended for the endpoint.
    Dev,
    /// Production: manifest rewritten, nothing injected.
    Prod,
}

// ---------------------------------------------------------------------------
// Diagnostic
// ---------------------------------------------------------------------------

/// A structured diagnostic emitted during a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticLevel {
    Error,
    Warning,
    Info,
}

impl Diagnostic {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Info,
            message: message.into(),
            context: None,
        }
    }

    pub fn warning(message: impl Into<String>, context: Option<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            message: message.into(),
            context,
        }
    }
}

// ---------------------------------------------------------------------------
// Reference Site
// ---------------------------------------------------------------------------

/// Where a path was referenced from. Carried by `MissingSourceFile` so a
/// dangling reference is always reported at its exact origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceSite {
    /// A manifest field.
    Manifest(ManifestLocation),
    /// An import statement inside a source file.
    Import { importer: String, specifier: String },
}

impl fmt::Display for ReferenceSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceSite::Manifest(location) => write!(f, "manifest field `{}`", location),
            ReferenceSite::Import {
                importer,
                specifier,
            } => write!(f, "import '{}' in {}", specifier, importer),
        }
    }
}

// ---------------------------------------------------------------------------
// CrxError
// ---------------------------------------------------------------------------

/// Every failure the build layer or the reload runtime can surface.
///
/// Build-time variants abort the current build and no partial manifest is
/// emitted. Only the two reload variants are recoverable.
#[derive(Debug, Error)]
pub enum CrxError {
    #[error("Malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("Missing source file '{path}' referenced by {site}")]
    MissingSourceFile { path: String, site: ReferenceSite },

    #[error("Invalid script import '{specifier}' in {importer}: {reason}")]
    InvalidScriptImport {
        importer: String,
        specifier: String,
        reason: String,
    },

    #[error("Premature resolution of {logical_id}: {reason}")]
    PrematureResolution { logical_id: String, reason: String },

    #[error("Unresolved build entry '{source_path}' ({kind}): no emitted path recorded")]
    UnresolvedBuildEntry { source_path: String, kind: EntryKind },

    #[error("Unknown manifest location: {0}")]
    UnknownLocation(ManifestLocation),

    #[error("Unknown virtual asset: {0}")]
    UnknownVirtualAsset(String),

    #[error("Bundler error: {0}")]
    BundlerError(String),

    #[error("Reload transport error: {0}")]
    ReloadTransportError(String),

    #[error("Reload failed in {context} for build {build_id}: {reason}")]
    ReloadContextFailure {
        context: ExecutionContext,
        build_id: u64,
        reason: String,
    },

    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CrxError {
    /// Runtime errors are contained per context; everything else aborts.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CrxError::ReloadTransportError(_) | CrxError::ReloadContextFailure { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// BuildPlan
// ---------------------------------------------------------------------------

/// Describes WHAT to build.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    /// Project root. Manifest paths are relative to it.
    pub root: PathBuf,
    /// Manifest file, relative to `root`.
    pub manifest: PathBuf,
    /// Output directory. Defaults to `dist/` under the root.
    pub out_dir: Option<PathBuf>,
    /// Build mode.
    pub mode: BuildMode,
}

impl BuildPlan {
    pub fn new(root: impl Into<PathBuf>, mode: BuildMode) -> Self {
        Self {
            root: root.into(),
            manifest: PathBuf::from("manifest.json"),
            out_dir: None,
            mode,
        }
    }

    pub fn out_dir(&self) -> PathBuf {
        self.out_dir
            .clone()
            .unwrap_or_else(|| self.root.join("dist"))
    }
}

// ---------------------------------------------------------------------------
// BuildOptions
// ---------------------------------------------------------------------------

/// Describes HOW to build.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Whether to write emitted files and `manifest.json` to disk.
    pub write_to_disk: bool,
    /// Strict mode (default: true). Leftover placeholders abort the build.
    pub strict: bool,
    /// Reload endpoint and timings, used by dev-mode injection.
    pub reload: ReloadConfig,
    /// Additional CSP tokens as `(directive, token)` pairs.
    pub extra_csp: Vec<(String, String)>,
    /// Match patterns for derived web-accessible resources whose referrer
    /// has no content-script match list.
    pub dynamic_resource_matches: Vec<String>,
    /// Set `use_dynamic_url` on derived web-accessible resources (MV3).
    pub use_dynamic_url: bool,
    /// Label written to `version_name` in dev builds.
    pub build_label: Option<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            write_to_disk: false,
            strict: true,
            reload: ReloadConfig::default(),
            extra_csp: Vec::new(),
            dynamic_resource_matches: vec!["http://*/*".into(), "https://*/*".into()],
            use_dynamic_url: false,
            build_label: None,
        }
    }
}

// ---------------------------------------------------------------------------
// BuildResult
// ---------------------------------------------------------------------------

/// The sealed output of a successful build.
#[derive(Debug, Clone)]
pub struct BuildResult {
    /// The rewritten manifest. Every path in it names an emitted file.
    pub manifest: ManifestDocument,
    /// Every discovered input, in discovery order.
    pub entries: Vec<BuildEntry>,
    /// Emitted files keyed by output file name, `manifest.json` included.
    pub files: BTreeMap<String, EmittedSource>,
    /// Output file of every entry the host emitted.
    pub entry_outputs: BTreeMap<EntryId, String>,
    /// Diagnostics collected during the build.
    pub diagnostics: Vec<Diagnostic>,
}

impl BuildResult {
    /// Output files of the manifest's background entries. In dev builds the
    /// manifest itself points at the reload loader instead.
    pub fn background_outputs(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries
            .iter()
            .filter(|e| {
                e.manifest_location
                    .as_ref()
                    .is_some_and(ManifestLocation::is_background)
            })
            .filter_map(|e| self.entry_outputs.get(&e.id).map(String::as_str))
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Build an extension.
///
/// Parses the manifest, discovers every input it implies (including
/// `?script` imports found through `graph`), hands them to `host`, resolves
/// the virtual asset registry against the emitted names and rewrites the
/// manifest. In dev mode the reload clients are injected afterwards.
pub async fn build_extension<H, G>(
    plan: &BuildPlan,
    opts: &BuildOptions,
    host: &mut H,
    graph: &G,
) -> Result<BuildResult, CrxError>
where
    H: BundlerHost,
    G: SourceGraph,
{
    bundle::execute_build(plan, opts, host, graph).await
}
