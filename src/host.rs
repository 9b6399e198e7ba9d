//! Bundler host seam.
//!
//! The crate never bundles code itself. A [`BundlerHost`] receives every
//! [`BuildEntry`] as an input, runs the crate's [`CrxPlugin`] hooks over the
//! code it loads and reports what it emitted. [`PassthroughHost`] is the
//! reference host: one output per distinct source file, content-hashed
//! names, no transpiling.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use crate::manifest::ExecutionWorld;
use crate::plugin::CrxPlugin;
use crate::resolver::{BuildEntry, EntryId, EntryKind};
use crate::utils;
use crate::CrxError;

// ---------------------------------------------------------------------------
// Emitted Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmittedSource {
    Text(String),
    Binary(Vec<u8>),
}

impl EmittedSource {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            EmittedSource::Text(text) => text.as_bytes(),
            EmittedSource::Binary(bytes) => bytes,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            EmittedSource::Text(text) => Some(text),
            EmittedSource::Binary(_) => None,
        }
    }
}

/// One file written by the bundler.
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedFile {
    /// Output path relative to the output directory.
    pub file_name: String,
    pub source: EmittedSource,
    /// Entries this file is the output of. Empty for generated files.
    pub entries: Vec<EntryId>,
    /// Source paths bundled into this file.
    pub modules: Vec<String>,
}

/// Everything a host emitted for one build.
#[derive(Debug, Clone, Default)]
pub struct BundleOutputs {
    files: Vec<EmittedFile>,
}

impl BundleOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, file: EmittedFile) {
        self.files.push(file);
    }

    /// Add a file that no entry produced (loaders, reload clients).
    pub fn push_generated(&mut self, file_name: impl Into<String>, code: String) {
        self.files.push(EmittedFile {
            file_name: file_name.into(),
            source: EmittedSource::Text(code),
            entries: Vec::new(),
            modules: Vec::new(),
        });
    }

    pub fn get(&self, file_name: &str) -> Option<&EmittedFile> {
        self.files.iter().find(|f| f.file_name == file_name)
    }

    pub fn get_mut(&mut self, file_name: &str) -> Option<&mut EmittedFile> {
        self.files.iter_mut().find(|f| f.file_name == file_name)
    }

    /// Output file name of an entry.
    pub fn file_for_entry(&self, id: EntryId) -> Option<&str> {
        self.files
            .iter()
            .find(|f| f.entries.contains(&id))
            .map(|f| f.file_name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &EmittedFile> {
        self.files.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut EmittedFile> {
        self.files.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Files keyed by name. A later file with the same name replaces an
    /// earlier one.
    pub fn into_map(self) -> BTreeMap<String, EmittedSource> {
        self.files
            .into_iter()
            .map(|f| (f.file_name, f.source))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Host Trait
// ---------------------------------------------------------------------------

/// The bundler the build layer drives.
pub trait BundlerHost {
    /// Register a discovered entry as a bundler input.
    fn add_input(&mut self, entry: &BuildEntry) -> Result<(), CrxError>;

    /// Register generated code to be emitted verbatim under `file_name`.
    fn add_virtual_input(&mut self, file_name: &str, code: String) -> Result<(), CrxError>;

    /// Run the bundler. `plugin` must see every script the host loads.
    fn finish(&mut self, plugin: &mut CrxPlugin) -> Result<BundleOutputs, CrxError>;
}

// ---------------------------------------------------------------------------
// Passthrough Host
// ---------------------------------------------------------------------------

/// Copies inputs from the project root, one output per distinct source.
///
/// - scripts go through [`CrxPlugin::transform`] and are renamed to
///   `assets/<stem>.<hash>.js`
/// - dynamic scripts get one output per execution world, named
///   `assets/<stem>.<world>.<hash>.js`
/// - HTML pages keep their source path, so URLs inside the extension stay
///   valid
/// - styles and static assets are content-hashed like scripts
#[derive(Debug)]
pub struct PassthroughHost {
    root: PathBuf,
    inputs: Vec<BuildEntry>,
    virtual_inputs: Vec<(String, String)>,
}

impl PassthroughHost {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            inputs: Vec::new(),
            virtual_inputs: Vec::new(),
        }
    }

    fn emit_source(
        &self,
        source_path: &str,
        kind: EntryKind,
        world: Option<ExecutionWorld>,
        plugin: &mut CrxPlugin,
    ) -> Result<(String, EmittedSource), CrxError> {
        let bytes = std::fs::read(self.root.join(source_path))?;

        if kind == EntryKind::HtmlPage || utils::is_html_path(source_path) {
            let name = source_path.to_string();
            return Ok((name, into_source(bytes)));
        }

        if utils::is_script_path(source_path) {
            let code = String::from_utf8(bytes).map_err(|_| {
                CrxError::BundlerError(format!("{} is not valid UTF-8", source_path))
            })?;
            let code = plugin.transform(&code, source_path)?.unwrap_or(code);
            let name = match world {
                Some(world) => {
                    utils::hashed_variant_file_name(source_path, world.as_str(), code.as_bytes())
                }
                None => utils::hashed_file_name(source_path, code.as_bytes()),
            };
            return Ok((name, EmittedSource::Text(code)));
        }

        let name = utils::hashed_file_name(source_path, &bytes);
        Ok((name, into_source(bytes)))
    }
}

fn into_source(bytes: Vec<u8>) -> EmittedSource {
    match String::from_utf8(bytes) {
        Ok(text) => EmittedSource::Text(text),
        Err(e) => EmittedSource::Binary(e.into_bytes()),
    }
}

impl BundlerHost for PassthroughHost {
    fn add_input(&mut self, entry: &BuildEntry) -> Result<(), CrxError> {
        self.inputs.push(entry.clone());
        Ok(())
    }

    fn add_virtual_input(&mut self, file_name: &str, code: String) -> Result<(), CrxError> {
        if self.virtual_inputs.iter().any(|(name, _)| name == file_name) {
            return Err(CrxError::BundlerError(format!(
                "virtual input '{}' added twice",
                file_name
            )));
        }
        self.virtual_inputs.push((file_name.to_string(), code));
        Ok(())
    }

    fn finish(&mut self, plugin: &mut CrxPlugin) -> Result<BundleOutputs, CrxError> {
        let mut outputs = BundleOutputs::new();
        let mut by_source: HashMap<(String, Option<ExecutionWorld>), usize> = HashMap::new();

        let inputs = std::mem::take(&mut self.inputs);
        for entry in &inputs {
            // Each world injects its own copy of a dynamic script.
            let world = match entry.kind {
                EntryKind::DynamicScript => Some(entry.execution_world.unwrap_or_default()),
                _ => None,
            };
            let key = (entry.source_path.clone(), world);
            if let Some(&idx) = by_source.get(&key) {
                if let Some(file) = outputs.files.get_mut(idx) {
                    file.entries.push(entry.id);
                }
                continue;
            }
            let (file_name, source) =
                self.emit_source(&entry.source_path, entry.kind, world, plugin)?;
            tracing::debug!(source = %entry.source_path, output = %file_name, "emitted");
            by_source.insert(key, outputs.files.len());
            outputs.push(EmittedFile {
                file_name,
                source,
                entries: vec![entry.id],
                modules: vec![entry.source_path.clone()],
            });
        }

        for (file_name, code) in std::mem::take(&mut self.virtual_inputs) {
            outputs.push_generated(file_name, code);
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::VirtualAssetRegistry;
    use crate::resolver::EntryId;
    use std::fs;

    fn entry(id: usize, path: &str, kind: EntryKind) -> BuildEntry {
        BuildEntry {
            id: EntryId(id),
            source_path: path.into(),
            kind,
            execution_world: None,
            module: false,
            manifest_location: None,
            logical_id: None,
            referrer: None,
        }
    }

    #[test]
    fn passthrough_dedupes_by_source() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.js"), "console.log(1);").unwrap();
        fs::write(dir.path().join("popup.html"), "<html></html>").unwrap();

        let mut host = PassthroughHost::new(dir.path());
        host.add_input(&entry(0, "a.js", EntryKind::ContentScript)).unwrap();
        host.add_input(&entry(1, "a.js", EntryKind::ContentScript)).unwrap();
        host.add_input(&entry(2, "popup.html", EntryKind::HtmlPage)).unwrap();
        host.add_virtual_input("client.js", "//".into()).unwrap();

        let mut plugin = CrxPlugin::new(VirtualAssetRegistry::new()).unwrap();
        let outputs = host.finish(&mut plugin).unwrap();

        assert_eq!(outputs.len(), 3);
        let script = outputs.file_for_entry(EntryId(0)).unwrap();
        assert!(script.starts_with("assets/a.") && script.ends_with(".js"));
        assert_eq!(outputs.file_for_entry(EntryId(1)), Some(script));
        assert_eq!(outputs.file_for_entry(EntryId(2)), Some("popup.html"));
        assert!(outputs.get("client.js").is_some());
    }

    #[test]
    fn dynamic_scripts_get_one_output_per_world() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("inject.js"), "console.log(1);").unwrap();

        let dynamic = |id, world| BuildEntry {
            execution_world: Some(world),
            ..entry(id, "inject.js", EntryKind::DynamicScript)
        };
        let mut host = PassthroughHost::new(dir.path());
        host.add_input(&entry(0, "inject.js", EntryKind::ContentScript)).unwrap();
        host.add_input(&dynamic(1, ExecutionWorld::Isolated)).unwrap();
        host.add_input(&dynamic(2, ExecutionWorld::Main)).unwrap();
        host.add_input(&dynamic(3, ExecutionWorld::Main)).unwrap();

        let mut plugin = CrxPlugin::new(VirtualAssetRegistry::new()).unwrap();
        let outputs = host.finish(&mut plugin).unwrap();

        assert_eq!(outputs.len(), 3);
        let isolated = outputs.file_for_entry(EntryId(1)).unwrap();
        let main = outputs.file_for_entry(EntryId(2)).unwrap();
        assert!(isolated.starts_with("assets/inject.isolated."));
        assert!(main.starts_with("assets/inject.main."));
        assert_eq!(outputs.file_for_entry(EntryId(3)), Some(main));
        assert_ne!(outputs.file_for_entry(EntryId(0)), Some(main));
    }

    #[test]
    fn duplicate_virtual_input_is_rejected() {
        let mut host = PassthroughHost::new(".");
        host.add_virtual_input("x.js", String::new()).unwrap();
        assert!(host.add_virtual_input("x.js", String::new()).is_err());
    }

    #[test]
    fn binary_assets_stay_binary() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("icon.png"), [0x89u8, 0x50, 0xff, 0xfe]).unwrap();

        let mut host = PassthroughHost::new(dir.path());
        host.add_input(&entry(0, "icon.png", EntryKind::StaticAsset)).unwrap();
        let mut plugin = CrxPlugin::new(VirtualAssetRegistry::new()).unwrap();
        let outputs = host.finish(&mut plugin).unwrap();

        let file = outputs.iter().next().unwrap();
        assert!(matches!(file.source, EmittedSource::Binary(_)));
        assert!(file.file_name.ends_with(".png"));
    }
}
