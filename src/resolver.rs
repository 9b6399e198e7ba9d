//! Entry Resolver
//!
//! Walks the manifest and the source graph behind it to produce every build
//! input, each tagged with the manifest field it must be written back to.
//!
//! 1. Seed one entry per path the manifest references (globs pass through).
//! 2. From every background and content-script entry, follow static imports
//!    through the [`SourceGraph`].
//! 3. Every `?script` import becomes a `DynamicScript` entry, registered in
//!    the [`VirtualAssetRegistry`] by `(path, world)`, and is traversed in
//!    turn. A pair already seen is never added twice.
//! 4. Every HTML page the manifest names is scanned for the scripts,
//!    stylesheets and images it loads; its scripts are traversed like
//!    background entries, in the page's own context.
//!
//! A dangling reference fails with `MissingSourceFile` at its exact origin.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::html::{HtmlReference, HtmlReferenceKind, HtmlScanner};
use crate::manifest::{Background, ManifestDocument, ManifestLocation, WebAccessibleResources};
use crate::registry::{
    parse_script_specifier, LogicalId, ScriptFormat, ScriptRequest, VirtualAssetRegistry,
};
use crate::utils::{self, compile_regex};
use crate::{CrxError, ExecutionWorld, ReferenceSite};

// ---------------------------------------------------------------------------
// Entry Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Background entry: MV3 service worker or MV2 background script.
    ServiceWorker,
    ContentScript,
    HtmlPage,
    Css,
    DynamicScript,
    StaticAsset,
    /// Script an HTML page loads with `<script src>`.
    PageScript,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryKind::ServiceWorker => "service-worker",
            EntryKind::ContentScript => "content-script",
            EntryKind::HtmlPage => "html-page",
            EntryKind::Css => "css",
            EntryKind::DynamicScript => "dynamic-script",
            EntryKind::StaticAsset => "static-asset",
            EntryKind::PageScript => "page-script",
        };
        f.write_str(s)
    }
}

/// The extension context a piece of code runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionContext {
    Background,
    /// Isolated-world content script.
    ContentScript,
    /// Popup, options and other extension-origin pages.
    ExtensionPage,
    /// Page scope of the host tab.
    MainWorld,
}

impl ExtensionContext {
    /// Code in these contexts runs on a web origin and can only fetch
    /// extension files declared web-accessible.
    pub fn is_web_hosted(self) -> bool {
        matches!(
            self,
            ExtensionContext::ContentScript | ExtensionContext::MainWorld
        )
    }

    fn for_world(world: ExecutionWorld) -> Self {
        match world {
            ExecutionWorld::Main => ExtensionContext::MainWorld,
            ExecutionWorld::Isolated => ExtensionContext::ContentScript,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub usize);

/// Who pulled a dynamic script or static asset into the build.
#[derive(Debug, Clone, PartialEq)]
pub struct Referrer {
    pub file: String,
    pub context: ExtensionContext,
    /// Match patterns of the content script(s) the referrer belongs to.
    pub matches: Vec<String>,
}

/// One discovered build input. Immutable once resolution finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildEntry {
    pub id: EntryId,
    pub source_path: String,
    pub kind: EntryKind,
    pub execution_world: Option<ExecutionWorld>,
    /// ES-module output requested (`type: "module"` worker, `?script&module`).
    pub module: bool,
    /// The manifest field to rewrite, for manifest-seeded entries.
    pub manifest_location: Option<ManifestLocation>,
    pub logical_id: Option<LogicalId>,
    pub referrer: Option<Referrer>,
}

impl BuildEntry {
    /// Whether the emitted file must be listed as a web-accessible resource.
    pub fn needs_web_access(&self) -> bool {
        matches!(self.kind, EntryKind::DynamicScript | EntryKind::StaticAsset)
            && self
                .referrer
                .as_ref()
                .is_some_and(|r| r.context.is_web_hosted())
    }
}

// ---------------------------------------------------------------------------
// Source Graph
// ---------------------------------------------------------------------------

/// An import statement found in a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSite {
    pub specifier: String,
}

/// Probe into the project sources, supplied by the bundler side.
pub trait SourceGraph {
    /// Whether the root-relative `path` exists.
    fn exists(&self, path: &str) -> bool;

    /// Import sites in `path`, in source order.
    fn import_sites(&self, path: &str) -> Result<Vec<ImportSite>, CrxError>;

    /// Local files the HTML page at `path` references, in source order.
    fn html_references(&self, path: &str) -> Result<Vec<HtmlReference>, CrxError>;
}

/// Regex scanner for `import … from`, bare `import '…'`, `export … from`
/// and `import('…')`.
#[derive(Debug, Clone)]
pub struct ImportScanner {
    patterns: Vec<Regex>,
}

impl ImportScanner {
    pub fn new() -> Result<Self, CrxError> {
        let patterns = [
            r#"(?m)(?:^|[;\s])import\s+(?:[\w*{}\s,$]+?\s+from\s+)?["']([^"'\n]+)["']"#,
            r#"(?m)(?:^|[;\s])export\s+[\w*{}\s,$]+?\s+from\s+["']([^"'\n]+)["']"#,
            r#"import\(\s*["']([^"'\n]+)["']\s*\)"#,
        ]
        .into_iter()
        .map(compile_regex)
        .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn scan(&self, code: &str) -> Vec<ImportSite> {
        let mut found: Vec<(usize, &str)> = self
            .patterns
            .iter()
            .flat_map(|re| re.captures_iter(code))
            .filter_map(|cap| cap.get(1))
            .map(|m| (m.start(), m.as_str()))
            .collect();
        found.sort_by_key(|(pos, _)| *pos);

        let mut seen = HashSet::new();
        found
            .into_iter()
            .filter(|(_, spec)| seen.insert(*spec))
            .map(|(_, spec)| ImportSite {
                specifier: spec.to_string(),
            })
            .collect()
    }
}

/// Source graph over a project directory.
#[derive(Debug, Clone)]
pub struct FsSourceGraph {
    root: PathBuf,
    scanner: ImportScanner,
    html: HtmlScanner,
}

impl FsSourceGraph {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CrxError> {
        Ok(Self {
            root: root.into(),
            scanner: ImportScanner::new()?,
            html: HtmlScanner::new()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SourceGraph for FsSourceGraph {
    fn exists(&self, path: &str) -> bool {
        self.root.join(path).is_file()
    }

    fn import_sites(&self, path: &str) -> Result<Vec<ImportSite>, CrxError> {
        if !utils::is_script_path(path) {
            return Ok(Vec::new());
        }
        let code = std::fs::read_to_string(self.root.join(path))?;
        Ok(self.scanner.scan(&code))
    }

    fn html_references(&self, path: &str) -> Result<Vec<HtmlReference>, CrxError> {
        if !utils::is_html_path(path) {
            return Ok(Vec::new());
        }
        let html = std::fs::read_to_string(self.root.join(path))?;
        Ok(self.html.scan(&html))
    }
}

/// Source graph over in-memory files, keyed by root-relative path.
#[derive(Debug, Clone)]
pub struct MemorySourceGraph {
    files: HashMap<String, String>,
    scanner: ImportScanner,
    html: HtmlScanner,
}

impl MemorySourceGraph {
    pub fn new() -> Result<Self, CrxError> {
        Ok(Self {
            files: HashMap::new(),
            scanner: ImportScanner::new()?,
            html: HtmlScanner::new()?,
        })
    }

    fn source(&self, path: &str) -> Result<&str, CrxError> {
        self.files.get(path).map(String::as_str).ok_or_else(|| {
            CrxError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not in source graph", path),
            ))
        })
    }

    pub fn with_file(mut self, path: &str, code: &str) -> Self {
        self.insert(path, code);
        self
    }

    pub fn insert(&mut self, path: &str, code: &str) {
        self.files
            .insert(utils::normalize_source_path(path), code.to_string());
    }
}

impl SourceGraph for MemorySourceGraph {
    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    fn import_sites(&self, path: &str) -> Result<Vec<ImportSite>, CrxError> {
        let code = self.source(path)?;
        if !utils::is_script_path(path) {
            return Ok(Vec::new());
        }
        Ok(self.scanner.scan(code))
    }

    fn html_references(&self, path: &str) -> Result<Vec<HtmlReference>, CrxError> {
        let html = self.source(path)?;
        if !utils::is_html_path(path) {
            return Ok(Vec::new());
        }
        Ok(self.html.scan(html))
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Extensions tried, in order, for extensionless import specifiers.
pub(crate) const IMPORT_CANDIDATES: &[&str] = &[
    ".ts", ".tsx", ".js", ".jsx", ".mjs", "/index.ts", "/index.js",
];

/// Output of entry resolution.
#[derive(Debug)]
pub struct ResolvedGraph {
    pub entries: Vec<BuildEntry>,
    pub registry: VirtualAssetRegistry,
}

pub struct EntryResolver<'a, G: SourceGraph> {
    manifest: &'a ManifestDocument,
    graph: &'a G,
}

/// A file whose static imports are followed, with the context it runs in.
struct TraversalRoot {
    path: String,
    context: ExtensionContext,
    matches: Vec<String>,
}

struct ResolveState {
    entries: Vec<BuildEntry>,
    registry: VirtualAssetRegistry,
    /// `(path, world)` → dynamic-script entry index.
    dynamic: HashMap<(String, ExecutionWorld), usize>,
    /// path → static-asset entry index.
    assets: HashMap<String, usize>,
    /// path → entry index of a script or stylesheet an HTML page loads.
    page_refs: HashMap<String, usize>,
    /// HTML pages to scan once the manifest is seeded.
    pages: Vec<(String, ExtensionContext)>,
    roots: VecDeque<TraversalRoot>,
}

impl ResolveState {
    fn push(&mut self, mut entry: BuildEntry) -> usize {
        let idx = self.entries.len();
        entry.id = EntryId(idx);
        tracing::debug!(
            path = %entry.source_path,
            kind = %entry.kind,
            "discovered build entry"
        );
        self.entries.push(entry);
        idx
    }
}

impl<'a, G: SourceGraph> EntryResolver<'a, G> {
    pub fn new(manifest: &'a ManifestDocument, graph: &'a G) -> Self {
        Self { manifest, graph }
    }

    /// Produce the ordered entry set and the registry of dynamic scripts.
    pub fn resolve(&self) -> Result<ResolvedGraph, CrxError> {
        let mut state = ResolveState {
            entries: Vec::new(),
            registry: VirtualAssetRegistry::new(),
            dynamic: HashMap::new(),
            assets: HashMap::new(),
            page_refs: HashMap::new(),
            pages: Vec::new(),
            roots: VecDeque::new(),
        };

        self.seed(&mut state)?;

        while let Some(root) = state.roots.pop_front() {
            self.traverse(&mut state, root)?;
        }

        Ok(ResolvedGraph {
            entries: state.entries,
            registry: state.registry,
        })
    }

    fn seed(&self, state: &mut ResolveState) -> Result<(), CrxError> {
        let module_worker = matches!(
            self.manifest.background,
            Some(Background::ServiceWorker { module: true, .. })
        );

        for (raw, location) in self.manifest.enumerate_referenced_paths() {
            if utils::is_glob_pattern(raw) {
                tracing::debug!(pattern = raw, %location, "glob passed through");
                continue;
            }
            let path = utils::normalize_source_path(raw);
            if !self.graph.exists(&path) {
                return Err(CrxError::MissingSourceFile {
                    path: raw.to_string(),
                    site: ReferenceSite::Manifest(location),
                });
            }

            let mut entry = BuildEntry {
                id: EntryId(0),
                source_path: path.clone(),
                kind: EntryKind::StaticAsset,
                execution_world: None,
                module: false,
                manifest_location: None,
                logical_id: None,
                referrer: None,
            };

            match &location {
                ManifestLocation::ServiceWorker | ManifestLocation::BackgroundScript(_) => {
                    entry.kind = EntryKind::ServiceWorker;
                    entry.module = module_worker;
                    state.roots.push_back(TraversalRoot {
                        path,
                        context: ExtensionContext::Background,
                        matches: Vec::new(),
                    });
                }
                ManifestLocation::ContentScriptJs { script, .. } => {
                    let cs = &self.manifest.content_scripts[*script];
                    let world = cs.world.unwrap_or_default();
                    entry.kind = EntryKind::ContentScript;
                    entry.execution_world = Some(world);
                    state.roots.push_back(TraversalRoot {
                        path,
                        context: ExtensionContext::for_world(world),
                        matches: cs.matches.clone(),
                    });
                }
                ManifestLocation::ContentScriptCss { .. } => entry.kind = EntryKind::Css,
                ManifestLocation::BackgroundPage => {
                    entry.kind = EntryKind::HtmlPage;
                    state.pages.push((path, ExtensionContext::Background));
                }
                ManifestLocation::Page(_) => {
                    entry.kind = EntryKind::HtmlPage;
                    state.pages.push((path, ExtensionContext::ExtensionPage));
                }
                ManifestLocation::WebAccessiblePath(_)
                | ManifestLocation::WebAccessibleResource { .. } => {
                    entry.kind = if utils::is_script_path(&entry.source_path) {
                        // Pages load these with `<script src>`, in their own world.
                        entry.execution_world = Some(ExecutionWorld::Main);
                        state.roots.push_back(TraversalRoot {
                            path,
                            context: ExtensionContext::for_world(ExecutionWorld::Main),
                            matches: self.web_accessible_matches(&location),
                        });
                        EntryKind::DynamicScript
                    } else if utils::is_style_path(&entry.source_path) {
                        EntryKind::Css
                    } else if utils::is_html_path(&entry.source_path) {
                        state.pages.push((path, ExtensionContext::ExtensionPage));
                        EntryKind::HtmlPage
                    } else {
                        EntryKind::StaticAsset
                    };
                }
                ManifestLocation::Icon(_)
                | ManifestLocation::ActionIcon(_)
                | ManifestLocation::RuleResource(_) => {}
            }

            entry.manifest_location = Some(location);
            state.push(entry);
        }

        for (page, context) in std::mem::take(&mut state.pages) {
            self.seed_page_references(state, &page, context)?;
        }
        Ok(())
    }

    /// Seed the scripts, stylesheets and images `page` loads. Its scripts
    /// are traversed in `context`.
    fn seed_page_references(
        &self,
        state: &mut ResolveState,
        page: &str,
        context: ExtensionContext,
    ) -> Result<(), CrxError> {
        let page_root = TraversalRoot {
            path: page.to_string(),
            context,
            matches: Vec::new(),
        };
        for reference in self.graph.html_references(page)? {
            let path = reference.source_path(page);
            if !self.graph.exists(&path) {
                return Err(CrxError::MissingSourceFile {
                    path,
                    site: ReferenceSite::Import {
                        importer: page.to_string(),
                        specifier: reference.value,
                    },
                });
            }
            tracing::debug!(page, kind = %reference.kind, %path, "page reference");

            let kind = match reference.kind {
                HtmlReferenceKind::Image => {
                    self.add_static_asset(state, &page_root, page, path);
                    continue;
                }
                HtmlReferenceKind::Script => EntryKind::PageScript,
                HtmlReferenceKind::Stylesheet => EntryKind::Css,
            };
            if state.page_refs.contains_key(&path) {
                continue;
            }
            if kind == EntryKind::PageScript {
                state.roots.push_back(TraversalRoot {
                    path: path.clone(),
                    context,
                    matches: Vec::new(),
                });
            }
            let idx = state.push(BuildEntry {
                id: EntryId(0),
                source_path: path.clone(),
                kind,
                execution_world: None,
                module: false,
                manifest_location: None,
                logical_id: None,
                referrer: Some(Referrer {
                    file: page.to_string(),
                    context,
                    matches: Vec::new(),
                }),
            });
            state.page_refs.insert(path, idx);
        }
        Ok(())
    }

    /// The page patterns a web-accessible path is exposed to. MV2 paths carry
    /// none.
    fn web_accessible_matches(&self, location: &ManifestLocation) -> Vec<String> {
        match (location, &self.manifest.web_accessible_resources) {
            (
                ManifestLocation::WebAccessibleResource { entry, .. },
                Some(WebAccessibleResources::Entries(entries)),
            ) => entries
                .get(*entry)
                .map(|war| war.matches.clone())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    fn traverse(&self, state: &mut ResolveState, root: TraversalRoot) -> Result<(), CrxError> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut stack = vec![root.path.clone()];

        while let Some(file) = stack.pop() {
            if !visited.insert(file.clone()) {
                continue;
            }
            let sites = self.graph.import_sites(&file)?;
            let mut static_imports = Vec::new();

            for site in sites {
                utils::reject_internal_specifier(&file, &site.specifier)?;
                let (raw_path, query) = utils::split_query(&site.specifier);
                if !utils::is_path_specifier(raw_path) {
                    continue;
                }

                let parsed = parse_script_specifier(&site.specifier).map_err(|reason| {
                    CrxError::InvalidScriptImport {
                        importer: file.clone(),
                        specifier: site.specifier.clone(),
                        reason,
                    }
                })?;

                if let Some((path, request)) = parsed {
                    let target = self.locate(&file, path, &site.specifier)?;
                    self.add_dynamic_script(state, &root, &file, &site.specifier, target, request)?;
                    continue;
                }

                if query.is_some() {
                    // `?raw`, `?url` and friends belong to the bundler.
                    continue;
                }

                let target = self.locate(&file, raw_path, &site.specifier)?;
                if utils::is_script_path(&target) {
                    static_imports.push(target);
                } else if !utils::is_style_path(&target) {
                    self.add_static_asset(state, &root, &file, target);
                }
            }

            // Reverse so the stack pops in source order.
            stack.extend(static_imports.into_iter().rev());
        }
        Ok(())
    }

    /// Resolve `specifier` (query stripped as `path`) against `importer`,
    /// trying known extensions for extensionless paths.
    fn locate(&self, importer: &str, path: &str, specifier: &str) -> Result<String, CrxError> {
        let joined = utils::join_specifier(importer, path);
        if self.graph.exists(&joined) {
            return Ok(joined);
        }
        if utils::extension_of(&joined).is_empty() {
            for suffix in IMPORT_CANDIDATES {
                let candidate = format!("{}{}", joined, suffix);
                if self.graph.exists(&candidate) {
                    return Ok(candidate);
                }
            }
        }
        Err(CrxError::MissingSourceFile {
            path: joined,
            site: ReferenceSite::Import {
                importer: importer.to_string(),
                specifier: specifier.to_string(),
            },
        })
    }

    fn add_dynamic_script(
        &self,
        state: &mut ResolveState,
        root: &TraversalRoot,
        importer: &str,
        specifier: &str,
        target: String,
        request: ScriptRequest,
    ) -> Result<(), CrxError> {
        if let Some(existing) = state.registry.lookup(&target, request.world) {
            if existing.request.format != request.format {
                return Err(CrxError::InvalidScriptImport {
                    importer: importer.to_string(),
                    specifier: specifier.to_string(),
                    reason: format!(
                        "'{}' is already requested in the {} world with a different format",
                        target, request.world
                    ),
                });
            }
        }

        let logical_id = state.registry.register(&target, request);
        state.registry.record_referrer(&logical_id, importer)?;

        let key = (target.clone(), request.world);
        if let Some(&idx) = state.dynamic.get(&key) {
            let entry = &mut state.entries[idx];
            let before = entry.referrer.as_ref().map(|r| r.matches.len());
            match entry.referrer.as_mut() {
                Some(existing) if existing.context.is_web_hosted() => {
                    merge_matches(&mut existing.matches, &root.matches);
                }
                _ if root.context.is_web_hosted() => {
                    entry.referrer = Some(Referrer {
                        file: importer.to_string(),
                        context: root.context,
                        matches: root.matches.clone(),
                    });
                }
                _ => {}
            }
            let widened = entry.referrer.as_ref().map(|r| r.matches.len()) != before;
            if widened {
                // Assets the script pulls in are exposed to the new pages too.
                let matches = entry
                    .referrer
                    .as_ref()
                    .map(|r| r.matches.clone())
                    .unwrap_or_default();
                state.roots.push_back(TraversalRoot {
                    path: target,
                    context: ExtensionContext::for_world(request.world),
                    matches,
                });
            }
            return Ok(());
        }

        let idx = state.push(BuildEntry {
            id: EntryId(0),
            source_path: target.clone(),
            kind: EntryKind::DynamicScript,
            execution_world: Some(request.world),
            module: request.format == ScriptFormat::Module,
            manifest_location: None,
            logical_id: Some(logical_id),
            referrer: Some(Referrer {
                file: importer.to_string(),
                context: root.context,
                matches: root.matches.clone(),
            }),
        });
        state.dynamic.insert(key, idx);

        // A dynamic script always ends up injected into a tab, whoever asked.
        state.roots.push_back(TraversalRoot {
            path: target,
            context: ExtensionContext::for_world(request.world),
            matches: root.matches.clone(),
        });
        Ok(())
    }

    fn add_static_asset(
        &self,
        state: &mut ResolveState,
        root: &TraversalRoot,
        importer: &str,
        target: String,
    ) {
        let referrer = Referrer {
            file: importer.to_string(),
            context: root.context,
            matches: root.matches.clone(),
        };
        if let Some(&idx) = state.assets.get(&target) {
            let entry = &mut state.entries[idx];
            match entry.referrer.as_mut() {
                Some(existing) if existing.context.is_web_hosted() => {
                    merge_matches(&mut existing.matches, &root.matches);
                }
                _ if root.context.is_web_hosted() => entry.referrer = Some(referrer),
                _ => {}
            }
            return;
        }
        let idx = state.push(BuildEntry {
            id: EntryId(0),
            source_path: target.clone(),
            kind: EntryKind::StaticAsset,
            execution_world: None,
            module: false,
            manifest_location: None,
            logical_id: None,
            referrer: Some(referrer),
        });
        state.assets.insert(target, idx);
    }
}

fn merge_matches(into: &mut Vec<String>, from: &[String]) {
    for pattern in from {
        if !into.contains(pattern) {
            into.push(pattern.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
