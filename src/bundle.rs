//! Build pipeline.
//!
//! 1. Read and validate the manifest (nothing is written on failure)
//! 2. Resolve every build entry through the source graph
//! 3. Hand entries to the bundler host with the `?script` plugin attached
//! 4. Resolve virtual assets against the emitted names and rewrite the
//!    files that embed their placeholders, then point every HTML page at
//!    the emitted scripts, stylesheets and images it loads
//! 5. Rewrite the manifest; in dev mode inject the reload clients
//! 6. Return the sealed result, optionally written to the output directory
//!    with files from earlier builds removed
//!
//! Every step before the last is pure with respect to the output directory,
//! so a failed build leaves the previous output untouched.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use walkdir::WalkDir;

use crate::host::{BundleOutputs, BundlerHost, EmittedSource};
use crate::html::HtmlScanner;
use crate::manifest::csp::CspRequirement;
use crate::manifest::ManifestDocument;
use crate::plugin::reload_client::{self, BACKGROUND_CLIENT_FILE, CONTENT_CLIENT_FILE};
use crate::plugin::CrxPlugin;
use crate::registry::{LogicalId, VirtualAssetRegistry};
use crate::resolver::{BuildEntry, EntryId, EntryKind, EntryResolver, ResolvedGraph, SourceGraph};
use crate::rewriter::{ManifestRewriter, RewriteOptions};
use crate::utils;
use crate::{BuildMode, BuildOptions, BuildPlan, BuildResult, CrxError, Diagnostic};

/// Output name of the rewritten manifest.
pub const MANIFEST_FILE: &str = "manifest.json";

/// `version_name` of dev builds without an explicit label.
const DEFAULT_BUILD_LABEL: &str = "development build";

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub async fn execute_build<H, G>(
    plan: &BuildPlan,
    opts: &BuildOptions,
    host: &mut H,
    graph: &G,
) -> Result<BuildResult, CrxError>
where
    H: BundlerHost,
    G: SourceGraph,
{
    let mut diagnostics: Vec<Diagnostic> = Vec::new();
    let dev = plan.mode == BuildMode::Dev;

    let manifest_path = plan.root.join(&plan.manifest);
    let raw = tokio::fs::read_to_string(&manifest_path).await?;
    let manifest = ManifestDocument::parse(&raw)?;

    tracing::info!(
        manifest = %manifest_path.display(),
        version = manifest.manifest_version.as_number(),
        mode = ?plan.mode,
        "build started"
    );

    let ResolvedGraph { entries, registry } = EntryResolver::new(&manifest, graph).resolve()?;
    diagnostics.push(Diagnostic::info(format!(
        "Resolved {} entries ({} dynamic scripts)",
        entries.len(),
        entries
            .iter()
            .filter(|e| e.kind == EntryKind::DynamicScript)
            .count()
    )));

    let mut plugin = CrxPlugin::new(registry)?;
    for entry in &entries {
        host.add_input(entry)?;
    }
    if dev {
        host.add_virtual_input(
            BACKGROUND_CLIENT_FILE,
            reload_client::background_client_code(&opts.reload, manifest.manifest_version),
        )?;
        host.add_virtual_input(
            CONTENT_CLIENT_FILE,
            reload_client::content_client_code(&opts.reload),
        )?;
    }

    let mut outputs = host.finish(&mut plugin)?;
    let mut registry = plugin.into_registry();

    resolve_virtual_assets(&entries, &mut registry, &mut outputs, opts.strict, &mut diagnostics)?;
    rewrite_page_references(&entries, &mut outputs)?;

    let mut rewriter = ManifestRewriter::new(entries.clone(), rewrite_options(plan, opts));
    for entry in &entries {
        if let Some(file_name) = outputs.file_for_entry(entry.id) {
            rewriter.record_emitted(entry.id, file_name)?;
        }
    }
    let mut final_manifest = rewriter.rewrite(&manifest)?;

    if dev {
        let label = opts.build_label.as_deref().unwrap_or(DEFAULT_BUILD_LABEL);
        if let Some(loader) = reload_client::inject(&mut final_manifest, label) {
            outputs.push_generated(loader.file_name, loader.code);
        }
        diagnostics.push(Diagnostic::info(format!(
            "Reload clients injected for {}",
            opts.reload.ws_url()
        )));
    }

    let entry_outputs: BTreeMap<EntryId, String> = entries
        .iter()
        .filter_map(|e| Some((e.id, outputs.file_for_entry(e.id)?.to_string())))
        .collect();
    let mut files = outputs.into_map();
    files.insert(
        MANIFEST_FILE.to_string(),
        EmittedSource::Text(final_manifest.to_json_string()?),
    );

    if opts.write_to_disk {
        let out_dir = plan.out_dir();
        write_outputs(&plan.root, &out_dir, &files).await?;
        diagnostics.push(Diagnostic::info(format!(
            "Written {} files to {}",
            files.len(),
            out_dir.display()
        )));
    }

    tracing::info!(entries = entries.len(), files = files.len(), "build complete");

    Ok(BuildResult {
        manifest: final_manifest,
        entries,
        files,
        entry_outputs,
        diagnostics,
    })
}

fn rewrite_options(plan: &BuildPlan, opts: &BuildOptions) -> RewriteOptions {
    let mut csp: Vec<CspRequirement> = Vec::new();
    if plan.mode == BuildMode::Dev {
        csp.extend(reload_client::dev_csp_requirements(&opts.reload));
    }
    csp.extend(
        opts.extra_csp
            .iter()
            .map(|(directive, token)| CspRequirement::new(directive.as_str(), token.as_str())),
    );
    RewriteOptions {
        csp,
        dynamic_resource_matches: opts.dynamic_resource_matches.clone(),
        use_dynamic_url: opts.use_dynamic_url,
    }
}

// ---------------------------------------------------------------------------
// Virtual Asset Resolution
// ---------------------------------------------------------------------------

/// Link placeholders to their emitting files, resolve every dynamic script
/// against its output and rewrite the files that embed them.
fn resolve_virtual_assets(
    entries: &[BuildEntry],
    registry: &mut VirtualAssetRegistry,
    outputs: &mut BundleOutputs,
    strict: bool,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<(), CrxError> {
    let by_placeholder: HashMap<String, LogicalId> = registry
        .records()
        .iter()
        .map(|r| (r.logical_id.placeholder(), r.logical_id.clone()))
        .collect();

    for file in outputs.iter() {
        let Some(code) = file.source.as_text() else {
            continue;
        };
        for placeholder in utils::find_placeholders(code)? {
            if let Some(id) = by_placeholder.get(&placeholder) {
                registry.record_referrer(id, &file.file_name)?;
            }
        }
    }

    for entry in entries.iter().filter(|e| e.kind == EntryKind::DynamicScript) {
        let (Some(id), Some(file_name)) = (&entry.logical_id, outputs.file_for_entry(entry.id))
        else {
            continue;
        };
        registry.resolve(id, file_name)?;
    }

    for file_name in registry.take_ready_referrers() {
        let Some(file) = outputs.get_mut(&file_name) else {
            continue;
        };
        let EmittedSource::Text(code) = &mut file.source else {
            continue;
        };
        match registry.rewrite_referrer(&file_name, code) {
            Ok(rewritten) => *code = rewritten,
            Err(e) if !strict => {
                diagnostics.push(Diagnostic::warning(e.to_string(), Some(file_name.clone())));
            }
            Err(e) => return Err(e),
        }
    }

    if let Some(record) = registry.unresolved().next() {
        let error = CrxError::PrematureResolution {
            logical_id: record.logical_id.to_string(),
            reason: "the bundler emitted no output for it".into(),
        };
        if strict {
            return Err(error);
        }
        diagnostics.push(Diagnostic::warning(error.to_string(), None));
    }

    if strict {
        for file in outputs.iter() {
            let Some(code) = file.source.as_text() else {
                continue;
            };
            if let Some(placeholder) = utils::find_placeholders(code)?.into_iter().next() {
                let logical_id = by_placeholder
                    .get(&placeholder)
                    .map(|id| id.to_string())
                    .unwrap_or(placeholder);
                return Err(CrxError::PrematureResolution {
                    logical_id,
                    reason: format!("placeholder left in {}", file.file_name),
                });
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// HTML Pages
// ---------------------------------------------------------------------------

/// Rewrite the `src`/`href` references of every emitted page to the
/// root-relative output of the file they load.
fn rewrite_page_references(
    entries: &[BuildEntry],
    outputs: &mut BundleOutputs,
) -> Result<(), CrxError> {
    let scanner = HtmlScanner::new()?;

    // Dynamic scripts are emitted once per world; a page loads the plain file.
    let mut emitted: HashMap<String, String> = HashMap::new();
    for entry in entries
        .iter()
        .filter(|e| !matches!(e.kind, EntryKind::HtmlPage | EntryKind::DynamicScript))
    {
        if let Some(file_name) = outputs.file_for_entry(entry.id) {
            emitted
                .entry(entry.source_path.clone())
                .or_insert_with(|| format!("/{}", file_name));
        }
    }

    let mut pages: Vec<(String, String)> = entries
        .iter()
        .filter(|e| e.kind == EntryKind::HtmlPage)
        .filter_map(|e| Some((outputs.file_for_entry(e.id)?.to_string(), e.source_path.clone())))
        .collect();
    pages.sort();
    pages.dedup();

    for (file_name, source_path) in pages {
        let Some(file) = outputs.get_mut(&file_name) else {
            continue;
        };
        let EmittedSource::Text(html) = &mut file.source else {
            continue;
        };
        let urls: HashMap<String, String> = scanner
            .scan(html)
            .into_iter()
            .filter_map(|r| {
                let url = emitted.get(&r.source_path(&source_path))?.clone();
                Some((r.value, url))
            })
            .collect();
        if !urls.is_empty() {
            tracing::debug!(page = %file_name, references = urls.len(), "rewrote page references");
            *html = scanner.rewrite(html, &urls);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

async fn write_outputs(
    root: &Path,
    out_dir: &Path,
    files: &BTreeMap<String, EmittedSource>,
) -> Result<(), CrxError> {
    if root.starts_with(out_dir) {
        return Err(CrxError::BundlerError(format!(
            "output directory {} contains the project root",
            out_dir.display()
        )));
    }
    remove_stale_outputs(out_dir, files)?;

    for (name, source) in files {
        let path = out_dir.join(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, source.as_bytes()).await?;
    }
    Ok(())
}

/// Delete files under `out_dir` that `files` no longer names, then every
/// directory left empty.
fn remove_stale_outputs(
    out_dir: &Path,
    files: &BTreeMap<String, EmittedSource>,
) -> Result<(), CrxError> {
    if !out_dir.is_dir() {
        return Ok(());
    }
    for entry in WalkDir::new(out_dir).min_depth(1).contents_first(true) {
        let entry = entry.map_err(std::io::Error::from)?;
        let path = entry.path();
        if entry.file_type().is_dir() {
            if std::fs::read_dir(path)?.next().is_none() {
                std::fs::remove_dir(path)?;
            }
            continue;
        }
        let Ok(relative) = path.strip_prefix(out_dir) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !files.contains_key(&name) {
            tracing::debug!(file = %name, "removing stale output");
            std::fs::remove_file(path)?;
        }
    }
    Ok(())
}
