//! Manifest Output Rewriter
//!
//! Once the bundler has named every output, produce the final manifest:
//!
//! 1. Every recorded manifest location is pointed at its emitted path.
//! 2. Dynamic scripts and static assets used from web-hosted contexts are
//!    declared web-accessible, unless the manifest already lists them.
//! 3. CSP tokens required by injected helpers are added without touching
//!    user-declared directives.
//!
//! Each step is idempotent, so rewriting an already-rewritten manifest with
//! the same entries changes nothing.

use std::collections::HashMap;

use crate::manifest::csp::{self, CspRequirement, DEFAULT_EXTENSION_PAGES_POLICY};
use crate::manifest::{
    ContentSecurityPolicy, ManifestDocument, ManifestVersion, WebAccessibleResource,
    WebAccessibleResources,
};
use crate::resolver::{BuildEntry, EntryId};
use crate::CrxError;

/// CSP context key the MV3 extension-page policy lives under.
const EXTENSION_PAGES: &str = "extension_pages";

#[derive(Debug, Clone)]
pub struct RewriteOptions {
    /// Tokens injected helpers need.
    pub csp: Vec<CspRequirement>,
    /// Matches for derived resources whose referrer has none.
    pub dynamic_resource_matches: Vec<String>,
    pub use_dynamic_url: bool,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            csp: Vec::new(),
            dynamic_resource_matches: vec!["http://*/*".into(), "https://*/*".into()],
            use_dynamic_url: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManifestRewriter {
    entries: Vec<BuildEntry>,
    emitted: HashMap<EntryId, String>,
    options: RewriteOptions,
}

impl ManifestRewriter {
    pub fn new(entries: Vec<BuildEntry>, options: RewriteOptions) -> Self {
        Self {
            entries,
            emitted: HashMap::new(),
            options,
        }
    }

    /// Record the emitted path of one entry. Calls may come in any order;
    /// a later call for the same entry wins.
    pub fn record_emitted(&mut self, id: EntryId, path: impl Into<String>) -> Result<(), CrxError> {
        if id.0 >= self.entries.len() {
            return Err(CrxError::BundlerError(format!(
                "emitted path reported for unknown entry #{}",
                id.0
            )));
        }
        self.emitted.insert(id, path.into());
        Ok(())
    }

    pub fn emitted_path(&self, id: EntryId) -> Option<&str> {
        self.emitted.get(&id).map(String::as_str)
    }

    pub fn entries(&self) -> &[BuildEntry] {
        &self.entries
    }

    /// Produce the final manifest from the source manifest.
    pub fn rewrite(&self, manifest: &ManifestDocument) -> Result<ManifestDocument, CrxError> {
        // Checked up front so a failure never leaves a half-written document.
        for entry in &self.entries {
            if !self.emitted.contains_key(&entry.id) {
                return Err(CrxError::UnresolvedBuildEntry {
                    source_path: entry.source_path.clone(),
                    kind: entry.kind,
                });
            }
        }

        let mut out = manifest.clone();
        self.rewrite_locations(&mut out)?;
        self.derive_web_accessible_resources(&mut out);
        self.extend_content_security_policy(&mut out);
        Ok(out)
    }

    fn rewrite_locations(&self, out: &mut ManifestDocument) -> Result<(), CrxError> {
        for entry in &self.entries {
            if let (Some(location), Some(path)) =
                (&entry.manifest_location, self.emitted.get(&entry.id))
            {
                out.set_path(location, path.clone())?;
            }
        }
        Ok(())
    }

    fn derive_web_accessible_resources(&self, out: &mut ManifestDocument) {
        for entry in self.entries.iter().filter(|e| e.needs_web_access()) {
            let Some(path) = self.emitted.get(&entry.id) else {
                continue;
            };
            if out
                .web_accessible_resources
                .as_ref()
                .is_some_and(|war| war.contains(path))
            {
                continue;
            }

            let matches = match entry.referrer.as_ref() {
                Some(r) if !r.matches.is_empty() => r.matches.clone(),
                _ => self.options.dynamic_resource_matches.clone(),
            };
            tracing::debug!(path = %path, "declaring web-accessible resource");

            match out.manifest_version {
                ManifestVersion::V2 => {
                    let war = out
                        .web_accessible_resources
                        .get_or_insert_with(|| WebAccessibleResources::Paths(Vec::new()));
                    if let WebAccessibleResources::Paths(paths) = war {
                        paths.push(path.clone());
                    }
                }
                ManifestVersion::V3 => {
                    let use_dynamic_url = self.options.use_dynamic_url.then_some(true);
                    let war = out
                        .web_accessible_resources
                        .get_or_insert_with(|| WebAccessibleResources::Entries(Vec::new()));
                    if let WebAccessibleResources::Entries(entries) = war {
                        match entries.iter_mut().find(|e| {
                            e.matches == matches
                                && e.extension_ids.is_empty()
                                && e.use_dynamic_url == use_dynamic_url
                        }) {
                            Some(existing) => existing.resources.push(path.clone()),
                            None => entries.push(WebAccessibleResource {
                                resources: vec![path.clone()],
                                matches,
                                extension_ids: Vec::new(),
                                use_dynamic_url,
                            }),
                        }
                    }
                }
            }
        }
    }

    fn extend_content_security_policy(&self, out: &mut ManifestDocument) {
        if self.options.csp.is_empty() {
            return;
        }
        match out.manifest_version {
            ManifestVersion::V3 => {
                let current = match &out.content_security_policy {
                    Some(ContentSecurityPolicy::PerContext(map)) => map
                        .get(EXTENSION_PAGES)
                        .cloned()
                        .unwrap_or_else(|| DEFAULT_EXTENSION_PAGES_POLICY.to_string()),
                    _ => DEFAULT_EXTENSION_PAGES_POLICY.to_string(),
                };
                if let Some(policy) = csp::extend_policy(&current, &self.options.csp) {
                    let csp = out
                        .content_security_policy
                        .get_or_insert_with(|| ContentSecurityPolicy::PerContext(Default::default()));
                    if let ContentSecurityPolicy::PerContext(map) = csp {
                        map.insert(EXTENSION_PAGES.to_string(), policy);
                    }
                }
            }
            ManifestVersion::V2 => {
                let current = match &out.content_security_policy {
                    Some(ContentSecurityPolicy::Single(policy)) => policy.clone(),
                    _ => DEFAULT_EXTENSION_PAGES_POLICY.to_string(),
                };
                if let Some(policy) = csp::extend_policy(&current, &self.options.csp) {
                    out.content_security_policy = Some(ContentSecurityPolicy::Single(policy));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::EntryKind;
    use crate::ManifestLocation;

    fn entry(id: usize, source: &str, location: ManifestLocation) -> BuildEntry {
        BuildEntry {
            id: EntryId(id),
            source_path: source.into(),
            kind: EntryKind::ContentScript,
            execution_world: None,
            module: false,
            manifest_location: Some(location),
            logical_id: None,
            referrer: None,
        }
    }

    #[test]
    fn unresolved_entry_is_fatal() {
        let manifest = ManifestDocument::parse(
            r#"{"manifest_version":3,"content_scripts":[{"matches":["<all_urls>"],"js":["a.ts"]}]}"#,
        )
        .unwrap();
        let rewriter = ManifestRewriter::new(
            vec![entry(
                0,
                "a.ts",
                ManifestLocation::ContentScriptJs {
                    script: 0,
                    index: 0,
                },
            )],
            RewriteOptions::default(),
        );
        let err = rewriter.rewrite(&manifest).unwrap_err();
        assert!(matches!(err, CrxError::UnresolvedBuildEntry { .. }));
    }

    #[test]
    fn record_emitted_rejects_unknown_entry() {
        let mut rewriter = ManifestRewriter::new(Vec::new(), RewriteOptions::default());
        assert!(rewriter.record_emitted(EntryId(3), "x.js").is_err());
    }

    #[test]
    fn csp_untouched_when_already_satisfied() {
        let manifest = ManifestDocument::parse(r#"{"manifest_version":3}"#).unwrap();
        let rewriter = ManifestRewriter::new(
            Vec::new(),
            RewriteOptions {
                csp: vec![CspRequirement::new("script-src", "'self'")],
                ..Default::default()
            },
        );
        let out = rewriter.rewrite(&manifest).unwrap();
        assert_eq!(out.content_security_policy, None);
    }
}
