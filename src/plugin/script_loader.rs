//! `?script` loader: bundler hooks that stand in for not-yet-emitted
//! script URLs.
//!
//! - `resolve_id`: map a `?script` specifier to a `\0crx:dynamic-script:`
//!   virtual id, registering the target
//! - `load`: serve the virtual id as a module whose default export is the
//!   target's placeholder
//! - `transform`: rewrite `import x from '…?script'` in place, for hosts
//!   without a virtual module pass
//!
//! Placeholders are swapped for real URLs by the registry once the target is
//! resolved; nothing here ever learns an output name.

use regex::Regex;

use crate::registry::{parse_script_specifier, LogicalId, ScriptRequest, VirtualAssetRegistry};
use crate::resolver::IMPORT_CANDIDATES;
use crate::utils::{self, compile_regex};
use crate::{CrxError, ExecutionWorld};

/// Default-import statements whose specifier carries `?script`.
const SCRIPT_IMPORT_PATTERN: &str =
    r#"import\s+([\w$]+)\s+from\s+["']([^"'\n]+\?script[^"'\n]*)["']\s*;?"#;

/// The crate's bundler plugin. Owns the registry for the duration of a build.
#[derive(Debug)]
pub struct CrxPlugin {
    registry: VirtualAssetRegistry,
    script_import: Regex,
}

impl CrxPlugin {
    pub fn new(registry: VirtualAssetRegistry) -> Result<Self, CrxError> {
        Ok(Self {
            registry,
            script_import: compile_regex(SCRIPT_IMPORT_PATTERN)?,
        })
    }

    pub fn name(&self) -> &'static str {
        "crx-script-loader"
    }

    pub fn registry(&self) -> &VirtualAssetRegistry {
        &self.registry
    }

    pub fn into_registry(self) -> VirtualAssetRegistry {
        self.registry
    }

    /// Map a `?script` specifier from `importer` to its virtual id.
    /// Other `\0crx:` ids resolve to themselves; anything else is `None`.
    pub fn resolve_id(
        &mut self,
        specifier: &str,
        importer: &str,
    ) -> Result<Option<String>, CrxError> {
        if utils::is_virtual(specifier) {
            return Ok(Some(specifier.to_string()));
        }
        let Some((path, request)) = self.parse(specifier, importer)? else {
            return Ok(None);
        };
        let id = self.register(importer, specifier, path, request)?;
        let source_path = self
            .registry
            .get(&id)
            .map(|r| r.source_path.clone())
            .ok_or_else(|| CrxError::UnknownVirtualAsset(id.to_string()))?;
        Ok(Some(utils::dynamic_script_virtual_id(
            request.world,
            &source_path,
        )))
    }

    /// Serve a dynamic-script virtual id.
    pub fn load(&self, id: &str) -> Result<Option<String>, CrxError> {
        let Some((world, path)) = utils::parse_dynamic_script_virtual_id(id) else {
            return Ok(None);
        };
        let record = self
            .registry
            .lookup(path, world)
            .ok_or_else(|| CrxError::UnknownVirtualAsset(id.escape_default().to_string()))?;
        Ok(Some(format!(
            "export default \"{}\";\n",
            utils::escape_js_string(&record.logical_id.placeholder())
        )))
    }

    /// Rewrite `?script` default imports in `code` into placeholder
    /// constants. `None` when nothing matched.
    pub fn transform(&mut self, code: &str, importer: &str) -> Result<Option<String>, CrxError> {
        let mut out = String::with_capacity(code.len());
        let mut last = 0;
        let mut changed = false;

        let captures: Vec<(usize, usize, String, String)> = self
            .script_import
            .captures_iter(code)
            .filter_map(|cap| {
                let whole = cap.get(0)?;
                Some((
                    whole.start(),
                    whole.end(),
                    cap.get(1)?.as_str().to_string(),
                    cap.get(2)?.as_str().to_string(),
                ))
            })
            .collect();

        for (start, end, binding, specifier) in captures {
            let Some((path, request)) = self.parse(&specifier, importer)? else {
                continue;
            };
            let id = self.register(importer, &specifier, path, request)?;
            out.push_str(&code[last..start]);
            out.push_str(&format!(
                "const {} = \"{}\";",
                binding,
                utils::escape_js_string(&id.placeholder())
            ));
            last = end;
            changed = true;
        }

        if !changed {
            return Ok(None);
        }
        out.push_str(&code[last..]);
        Ok(Some(out))
    }

    fn parse<'s>(
        &self,
        specifier: &'s str,
        importer: &str,
    ) -> Result<Option<(&'s str, ScriptRequest)>, CrxError> {
        utils::reject_internal_specifier(importer, specifier)?;
        parse_script_specifier(specifier).map_err(|reason| CrxError::InvalidScriptImport {
            importer: importer.to_string(),
            specifier: specifier.to_string(),
            reason,
        })
    }

    fn register(
        &mut self,
        importer: &str,
        specifier: &str,
        path: &str,
        request: ScriptRequest,
    ) -> Result<LogicalId, CrxError> {
        let joined = utils::join_specifier(importer, path);
        let target = self.registered_path(&joined, request.world).unwrap_or(joined);

        if let Some(existing) = self.registry.lookup(&target, request.world) {
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

        let id = self.registry.register(&target, request);
        self.registry.record_referrer(&id, importer)?;
        Ok(id)
    }

    /// The registered path an extensionless specifier was resolved to.
    fn registered_path(&self, joined: &str, world: ExecutionWorld) -> Option<String> {
        if self.registry.lookup(joined, world).is_some() {
            return Some(joined.to_string());
        }
        IMPORT_CANDIDATES
            .iter()
            .map(|suffix| format!("{}{}", joined, suffix))
            .find(|candidate| self.registry.lookup(candidate, world).is_some())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin() -> CrxPlugin {
        CrxPlugin::new(VirtualAssetRegistry::new()).unwrap()
    }

    #[test]
    fn plugin_name() {
        assert_eq!(plugin().name(), "crx-script-loader");
    }

    #[test]
    fn resolve_and_load_round_through_placeholder() {
        let mut p = plugin();
        let id = p
            .resolve_id("./inject.ts?script&main", "src/content.ts")
            .unwrap()
            .unwrap();
        assert_eq!(id, "\0crx:dynamic-script:main/src/inject.ts");

        let code = p.load(&id).unwrap().unwrap();
        let record = p
            .registry()
            .lookup("src/inject.ts", ExecutionWorld::Main)
            .unwrap();
        assert_eq!(record.referrers, vec!["src/content.ts"]);
        assert!(code.contains(&record.logical_id.placeholder()));
        assert_eq!(p.resolve_id("./util.ts", "src/content.ts").unwrap(), None);
        assert_eq!(p.load("src/util.ts").unwrap(), None);
    }

    #[test]
    fn transform_rewrites_default_imports() {
        let mut p = plugin();
        let code = "import url from './inject.ts?script';\nconsole.log(url);\n";
        let out = p.transform(code, "src/content.ts").unwrap().unwrap();
        let record = p
            .registry()
            .lookup("src/inject.ts", ExecutionWorld::Isolated)
            .unwrap();
        assert_eq!(
            out,
            format!(
                "const url = \"{}\";\nconsole.log(url);\n",
                record.logical_id.placeholder()
            )
        );
        assert_eq!(p.transform("console.log(1)", "src/content.ts").unwrap(), None);
    }

    #[test]
    fn transform_rejects_iife() {
        let mut p = plugin();
        let err = p
            .transform("import u from './x.ts?script&iife';", "src/a.ts")
            .unwrap_err();
        assert!(matches!(err, CrxError::InvalidScriptImport { .. }));
    }

    #[test]
    fn extensionless_specifier_reuses_registered_path() {
        let mut registry = VirtualAssetRegistry::new();
        registry.register("src/inject.ts", ScriptRequest::default());
        let mut p = CrxPlugin::new(registry).unwrap();
        p.transform("import u from './inject?script';", "src/content.ts")
            .unwrap()
            .unwrap();
        assert_eq!(p.registry().len(), 1);
    }
}
