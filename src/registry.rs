//! Virtual Asset Registry
//!
//! Mediates between "a source file wants the runtime URL of another file"
//! and "the bundler has not decided that file's output name yet".
//!
//! Lifecycle per logical id is strict: `register` → `record_referrer`* →
//! `resolve` (once) → referrers rewritten. Records live in an indexed table
//! keyed by `(source_path, world)`; there is no global state.

use std::collections::HashMap;
use std::fmt;

use crate::utils::script_placeholder;
use crate::{CrxError, ExecutionWorld};

// ---------------------------------------------------------------------------
// Script Requests
// ---------------------------------------------------------------------------

/// Output format requested by a `?script` import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScriptFormat {
    #[default]
    Classic,
    /// `?script&module`
    Module,
}

/// What a `?script` import asks for besides the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScriptRequest {
    pub world: ExecutionWorld,
    pub format: ScriptFormat,
}

/// Split a `?script` specifier into its path and request.
///
/// Returns `Ok(None)` for specifiers that are not dynamic-script imports.
/// `Err` carries the reason for an unsupported flag combination.
pub fn parse_script_specifier(specifier: &str) -> Result<Option<(&str, ScriptRequest)>, String> {
    let (path, query) = match specifier.split_once('?') {
        Some(parts) => parts,
        None => return Ok(None),
    };
    let mut flags = query.split('&');
    if flags.next() != Some("script") {
        return Ok(None);
    }

    let mut request = ScriptRequest::default();
    let mut world: Option<ExecutionWorld> = None;
    for flag in flags {
        let requested = match flag {
            "main" => ExecutionWorld::Main,
            "isolated" => ExecutionWorld::Isolated,
            "module" => {
                request.format = ScriptFormat::Module;
                continue;
            }
            "iife" => return Err("the iife script format is not supported".into()),
            "" => continue,
            other => return Err(format!("unknown script flag '{}'", other)),
        };
        if world.is_some_and(|w| w != requested) {
            return Err("conflicting execution worlds".into());
        }
        world = Some(requested);
    }
    request.world = world.unwrap_or_default();
    Ok(Some((path, request)))
}

// ---------------------------------------------------------------------------
// LogicalId
// ---------------------------------------------------------------------------

/// Deterministic id for one `(source_path, world)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalId(String);

impl LogicalId {
    fn new(source_path: &str, world: ExecutionWorld) -> Self {
        Self(format!("{}:{}", world.as_str(), source_path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Token emitted into referrer code until the id is resolved.
    pub fn placeholder(&self) -> String {
        script_placeholder(&self.0)
    }
}

impl fmt::Display for LogicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct VirtualAssetRecord {
    pub logical_id: LogicalId,
    pub source_path: String,
    pub request: ScriptRequest,
    /// `None` until the bundler reports the output name.
    pub resolved_output_path: Option<String>,
    /// Files whose code embeds this record's placeholder.
    pub referrers: Vec<String>,
}

impl VirtualAssetRecord {
    pub fn is_resolved(&self) -> bool {
        self.resolved_output_path.is_some()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct VirtualAssetRegistry {
    records: Vec<VirtualAssetRecord>,
    by_key: HashMap<(String, ExecutionWorld), usize>,
    by_id: HashMap<LogicalId, usize>,
    /// Referrer files whose targets are all known, in queueing order.
    ready: Vec<String>,
}

impl VirtualAssetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the logical id for `(source_path, request.world)`, creating a
    /// record on first sight. The format of the first registration wins;
    /// callers check for conflicts with [`lookup`](Self::lookup).
    pub fn register(&mut self, source_path: &str, request: ScriptRequest) -> LogicalId {
        let key = (source_path.to_string(), request.world);
        if let Some(&idx) = self.by_key.get(&key) {
            return self.records[idx].logical_id.clone();
        }
        let logical_id = LogicalId::new(source_path, request.world);
        let idx = self.records.len();
        self.records.push(VirtualAssetRecord {
            logical_id: logical_id.clone(),
            source_path: source_path.to_string(),
            request,
            resolved_output_path: None,
            referrers: Vec::new(),
        });
        self.by_key.insert(key, idx);
        self.by_id.insert(logical_id.clone(), idx);
        tracing::debug!(id = %logical_id, "registered virtual asset");
        logical_id
    }

    pub fn lookup(&self, source_path: &str, world: ExecutionWorld) -> Option<&VirtualAssetRecord> {
        self.by_key
            .get(&(source_path.to_string(), world))
            .map(|&idx| &self.records[idx])
    }

    pub fn get(&self, id: &LogicalId) -> Option<&VirtualAssetRecord> {
        self.by_id.get(id).map(|&idx| &self.records[idx])
    }

    fn index_of(&self, id: &LogicalId) -> Result<usize, CrxError> {
        self.by_id
            .get(id)
            .copied()
            .ok_or_else(|| CrxError::UnknownVirtualAsset(id.to_string()))
    }

    /// Note that `importing_file` embeds the placeholder for `id`.
    pub fn record_referrer(&mut self, id: &LogicalId, importing_file: &str) -> Result<(), CrxError> {
        let idx = self.index_of(id)?;
        let record = &mut self.records[idx];
        if record.referrers.iter().any(|r| r == importing_file) {
            return Ok(());
        }
        record.referrers.push(importing_file.to_string());
        // Late referrer of an already-resolved target.
        if record.is_resolved() {
            self.queue(importing_file.to_string());
        }
        Ok(())
    }

    /// Record the output name of `id`. Callable once per id.
    pub fn resolve(&mut self, id: &LogicalId, output_path: &str) -> Result<(), CrxError> {
        let idx = self.index_of(id)?;
        let record = &mut self.records[idx];
        if let Some(existing) = &record.resolved_output_path {
            return Err(CrxError::PrematureResolution {
                logical_id: id.to_string(),
                reason: format!("already resolved to '{}'", existing),
            });
        }
        record.resolved_output_path = Some(output_path.to_string());
        tracing::debug!(id = %id, output = output_path, "resolved virtual asset");
        let referrers = record.referrers.clone();
        for referrer in referrers {
            self.queue(referrer);
        }
        Ok(())
    }

    fn queue(&mut self, file: String) {
        if !self.ready.contains(&file) {
            self.ready.push(file);
        }
    }

    /// Drain referrer files queued by `resolve`.
    pub fn take_ready_referrers(&mut self) -> Vec<String> {
        std::mem::take(&mut self.ready)
    }

    /// Replace every placeholder `file` embeds with its target's runtime URL.
    ///
    /// Fails with `PrematureResolution` if any target `file` refers to has no
    /// output path yet; nothing is rewritten in that case.
    pub fn rewrite_referrer(&self, file: &str, code: &str) -> Result<String, CrxError> {
        let targets: Vec<&VirtualAssetRecord> = self
            .records
            .iter()
            .filter(|r| r.referrers.iter().any(|f| f == file))
            .collect();

        let mut replacements = Vec::with_capacity(targets.len());
        for record in targets {
            let output = record.resolved_output_path.as_ref().ok_or_else(|| {
                CrxError::PrematureResolution {
                    logical_id: record.logical_id.to_string(),
                    reason: format!("referrer '{}' rewritten before its target resolved", file),
                }
            })?;
            replacements.push((record.logical_id.placeholder(), format!("/{}", output)));
        }

        let mut out = code.to_string();
        for (placeholder, url) in replacements {
            out = out.replace(&placeholder, &url);
        }
        Ok(out)
    }

    /// Runtime URL (`/<output>`) of a resolved id.
    pub fn runtime_url(&self, id: &LogicalId) -> Result<String, CrxError> {
        let record = &self.records[self.index_of(id)?];
        record
            .resolved_output_path
            .as_ref()
            .map(|p| format!("/{}", p))
            .ok_or_else(|| CrxError::PrematureResolution {
                logical_id: id.to_string(),
                reason: "runtime URL requested before resolution".into(),
            })
    }

    /// All records in registration order.
    pub fn records(&self) -> &[VirtualAssetRecord] {
        &self.records
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &VirtualAssetRecord> {
        self.records.iter().filter(|r| !r.is_resolved())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn main_world() -> ScriptRequest {
        ScriptRequest {
            world: ExecutionWorld::Main,
            format: ScriptFormat::Classic,
        }
    }

    #[test]
    fn parse_specifiers() {
        assert_eq!(parse_script_specifier("./a.ts"), Ok(None));
        assert_eq!(parse_script_specifier("./a.svg?raw"), Ok(None));
        assert_eq!(
            parse_script_specifier("./a.ts?script"),
            Ok(Some(("./a.ts", ScriptRequest::default())))
        );
        assert_eq!(
            parse_script_specifier("./a.ts?script&main"),
            Ok(Some(("./a.ts", main_world())))
        );
        let (_, module) = parse_script_specifier("./a.ts?script&module")
            .unwrap()
            .unwrap();
        assert_eq!(module.format, ScriptFormat::Module);
        assert!(parse_script_specifier("./a.ts?script&iife").is_err());
        assert!(parse_script_specifier("./a.ts?script&bogus").is_err());
        assert!(parse_script_specifier("./a.ts?script&main&isolated").is_err());
    }

    #[test]
    fn register_is_idempotent_per_world() {
        let mut reg = VirtualAssetRegistry::new();
        let a = reg.register("src/inject.ts", main_world());
        let b = reg.register("src/inject.ts", main_world());
        let c = reg.register("src/inject.ts", ScriptRequest::default());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a.placeholder(), c.placeholder());
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn resolve_twice_is_premature() {
        let mut reg = VirtualAssetRegistry::new();
        let id = reg.register("src/inject.ts", main_world());
        reg.resolve(&id, "assets/inject.js").unwrap();
        let err = reg.resolve(&id, "assets/inject.js").unwrap_err();
        assert!(matches!(err, CrxError::PrematureResolution { .. }));
    }

    #[test]
    fn rewrite_before_resolve_is_premature() {
        let mut reg = VirtualAssetRegistry::new();
        let id = reg.register("src/inject.ts", main_world());
        reg.record_referrer(&id, "src/content.ts").unwrap();
        let code = format!("const u = \"{}\";", id.placeholder());
        assert!(matches!(
            reg.rewrite_referrer("src/content.ts", &code),
            Err(CrxError::PrematureResolution { .. })
        ));
    }

    #[test]
    fn resolve_queues_and_rewrites_referrers() {
        let mut reg = VirtualAssetRegistry::new();
        let id = reg.register("src/inject.ts", main_world());
        reg.record_referrer(&id, "src/a.ts").unwrap();
        reg.record_referrer(&id, "src/b.ts").unwrap();
        reg.record_referrer(&id, "src/a.ts").unwrap();
        assert!(reg.take_ready_referrers().is_empty());

        reg.resolve(&id, "assets/inject.1234abcd.js").unwrap();
        assert_eq!(reg.take_ready_referrers(), vec!["src/a.ts", "src/b.ts"]);

        let code = format!("const u = \"{}\";", id.placeholder());
        assert_eq!(
            reg.rewrite_referrer("src/a.ts", &code).unwrap(),
            "const u = \"/assets/inject.1234abcd.js\";"
        );
        assert_eq!(
            reg.runtime_url(&id).unwrap(),
            "/assets/inject.1234abcd.js"
        );
    }

    #[test]
    fn unknown_id() {
        let mut scratch = VirtualAssetRegistry::new();
        let id = scratch.register("x.ts", ScriptRequest::default());

        let mut reg = VirtualAssetRegistry::new();
        assert!(matches!(
            reg.record_referrer(&id, "a.ts"),
            Err(CrxError::UnknownVirtualAsset(_))
        ));
        assert!(matches!(
            reg.resolve(&id, "x.js"),
            Err(CrxError::UnknownVirtualAsset(_))
        ));
    }
}
