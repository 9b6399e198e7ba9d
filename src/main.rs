//! `crx-bundler` command line.
//!
//! Usage:
//!   crx-bundler build --root ./extension [--dev]
//!   crx-bundler dev --root ./extension --port 8899
//!
//! `build` runs one build through the passthrough host and writes the
//! output directory. `dev` does the same in dev mode, then serves the
//! reload channel and rebuilds whenever a project file changes.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crx_bundler::bundle::MANIFEST_FILE;
use crx_bundler::plugin::OutputCache;
use crx_bundler::reload::{ReloadServer, UpdatePayload};
use crx_bundler::watch::ProjectWatcher;
use crx_bundler::{
    build_extension, BuildMode, BuildOptions, BuildPlan, BuildResult, DiagnosticLevel,
    EmittedSource, FsSourceGraph, PassthroughHost, ReloadConfig,
};

#[derive(Parser, Debug)]
#[command(name = "crx-bundler")]
#[command(about = "Build browser extensions from their manifest")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build once and write the output directory
    Build {
        #[command(flatten)]
        project: ProjectArgs,

        /// Inject the reload clients
        #[arg(long)]
        dev: bool,

        /// Reload server port embedded in the clients (with --dev)
        #[arg(long, default_value_t = crx_bundler::reload::config::DEFAULT_PORT)]
        port: u16,
    },
    /// Dev build, reload server and rebuild-on-change loop
    Dev {
        #[command(flatten)]
        project: ProjectArgs,

        /// Reload server port
        #[arg(long, default_value_t = crx_bundler::reload::config::DEFAULT_PORT)]
        port: u16,

        /// How long content scripts wait for the service worker (ms)
        #[arg(long, default_value = "5000")]
        peer_timeout_ms: u64,

        /// How long the server waits for the service worker's ack (ms)
        #[arg(long, default_value = "10000")]
        ack_timeout_ms: u64,

        /// Quiet period before a burst of file changes triggers a rebuild (ms)
        #[arg(long, default_value = "100")]
        debounce_ms: u64,
    },
}

#[derive(Args, Debug)]
struct ProjectArgs {
    /// Project root
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Manifest path, relative to the root
    #[arg(short, long, default_value = "manifest.json")]
    manifest: PathBuf,

    /// Output directory (default: <root>/dist)
    #[arg(short, long)]
    out_dir: Option<PathBuf>,
}

impl ProjectArgs {
    fn plan(&self, mode: BuildMode) -> BuildPlan {
        let mut plan = BuildPlan::new(&self.root, mode);
        plan.manifest = self.manifest.clone();
        plan.out_dir = self.out_dir.clone();
        plan
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .compact()
        .init();

    match cli.command {
        Command::Build { project, dev, port } => {
            let mode = if dev { BuildMode::Dev } else { BuildMode::Prod };
            let plan = project.plan(mode);
            let opts = BuildOptions {
                write_to_disk: true,
                reload: reload_config(port, None, None),
                ..Default::default()
            };
            let result = run_build(&plan, &opts).await?;
            report(&result);
            Ok(())
        }
        Command::Dev {
            project,
            port,
            peer_timeout_ms,
            ack_timeout_ms,
            debounce_ms,
        } => {
            let config = reload_config(port, Some(peer_timeout_ms), Some(ack_timeout_ms));
            run_dev(project.plan(BuildMode::Dev), config, Duration::from_millis(debounce_ms)).await
        }
    }
}

fn reload_config(port: u16, peer_timeout_ms: Option<u64>, ack_timeout_ms: Option<u64>) -> ReloadConfig {
    let mut config = ReloadConfig {
        bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        ..Default::default()
    };
    if let Some(ms) = peer_timeout_ms {
        config.peer_timeout_ms = ms;
    }
    if let Some(ms) = ack_timeout_ms {
        config.ack_timeout_ms = ms;
    }
    config
}

async fn run_build(plan: &BuildPlan, opts: &BuildOptions) -> Result<BuildResult> {
    let graph = FsSourceGraph::new(&plan.root).context("failed to open source graph")?;
    let mut host = PassthroughHost::new(&plan.root);
    build_extension(plan, opts, &mut host, &graph)
        .await
        .with_context(|| format!("build of {} failed", plan.root.join(&plan.manifest).display()))
}

fn report(result: &BuildResult) {
    for diagnostic in &result.diagnostics {
        match diagnostic.level {
            DiagnosticLevel::Error => tracing::error!("{}", diagnostic.message),
            DiagnosticLevel::Warning => tracing::warn!(
                context = diagnostic.context.as_deref().unwrap_or(""),
                "{}",
                diagnostic.message
            ),
            DiagnosticLevel::Info => tracing::debug!("{}", diagnostic.message),
        }
    }
    tracing::info!(
        entries = result.entries.len(),
        files = result.files.len(),
        "build written"
    );
}

// ---------------------------------------------------------------------------
// Dev Loop
// ---------------------------------------------------------------------------

async fn run_dev(plan: BuildPlan, config: ReloadConfig, debounce: Duration) -> Result<()> {
    let server = ReloadServer::bind(config.clone())
        .await
        .with_context(|| format!("failed to bind reload server on {}", config.bind))?;
    tracing::info!(url = %server.ws_url(), "reload server listening");

    // Watching starts before the first build so no edit falls in between.
    let mut watcher = ProjectWatcher::new(&plan.root, &plan.out_dir(), debounce)
        .with_context(|| format!("failed to watch {}", plan.root.display()))?;
    let cache = OutputCache::new();
    let mut build_number: u64 = 0;

    loop {
        build_number += 1;
        let opts = BuildOptions {
            write_to_disk: true,
            reload: config.clone(),
            build_label: Some(format!("dev build {}", build_number)),
            ..Default::default()
        };

        match run_build(&plan, &opts).await {
            Ok(result) => {
                report(&result);
                // The label changes every build; compare without it.
                cache.record_build(&without_label(&result));
                let changed = cache.take_changed();
                if build_number > 1 && !changed.is_empty() {
                    let requires_worker_resync = changed.iter().any(|f| f == MANIFEST_FILE)
                        || touches_background(&result, &changed);
                    let build_id = server.start_cycle(UpdatePayload {
                        changed,
                        requires_worker_resync,
                    })?;
                    tracing::info!(build_id, requires_worker_resync, "reload cycle started");
                }
            }
            // The previous output stays in place; wait for the next change.
            Err(e) => tracing::error!("{:#}", e),
        }

        tokio::select! {
            change = watcher.next_change() => {
                let Some(paths) = change else {
                    server.shutdown();
                    anyhow::bail!("file watcher stopped");
                };
                tracing::debug!(files = paths.len(), "project changed");
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                tracing::info!("shutting down");
                server.shutdown();
                return Ok(());
            }
        }
    }
}

/// Build outputs with the per-build `version_name` stripped from the manifest.
fn without_label(result: &BuildResult) -> BTreeMap<String, EmittedSource> {
    let mut files = result.files.clone();
    let mut manifest = result.manifest.clone();
    manifest.extra.remove("version_name");
    if let Ok(json) = manifest.to_json_string() {
        files.insert(MANIFEST_FILE.to_string(), EmittedSource::Text(json));
    }
    files
}

/// Whether a background entry's own output changed. Dev manifests point at
/// the reload loader, so the lookup goes through the emitted entries.
fn touches_background(result: &BuildResult, changed: &[String]) -> bool {
    result
        .background_outputs()
        .any(|path| changed.iter().any(|c| c == path))
}
