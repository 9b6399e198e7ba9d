use crx_bundler::resolver::{ExtensionContext, MemorySourceGraph};
use crx_bundler::{
    CrxError, EntryKind, EntryResolver, ExecutionWorld, ManifestDocument, ManifestLocation,
    ReferenceSite,
};
use pretty_assertions::assert_eq;
use serde_json::json;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn manifest(value: serde_json::Value) -> ManifestDocument {
    ManifestDocument::from_value(value).unwrap()
}

fn graph(files: &[(&str, &str)]) -> MemorySourceGraph {
    files
        .iter()
        .fold(MemorySourceGraph::new().unwrap(), |g, (path, code)| {
            g.with_file(path, code)
        })
}

fn content_manifest(scripts: serde_json::Value) -> ManifestDocument {
    manifest(json!({
        "manifest_version": 3,
        "background": { "service_worker": "src/sw.ts" },
        "content_scripts": scripts
    }))
}

// ============================================================================
// Seeding
// ============================================================================

#[test]
fn one_entry_per_manifest_path_with_its_location() {
    let doc = manifest(json!({
        "manifest_version": 3,
        "background": { "service_worker": "src/sw.ts", "type": "module" },
        "content_scripts": [{ "matches": ["https://*/*"], "js": ["src/cs.ts"], "css": ["src/cs.css"] }],
        "action": { "default_popup": "popup.html" },
        "icons": { "16": "icon.png" },
        "web_accessible_resources": [{ "resources": ["img/*", "inject.js"], "matches": ["<all_urls>"] }]
    }));
    let g = graph(&[
        ("src/sw.ts", ""),
        ("src/cs.ts", ""),
        ("src/cs.css", ""),
        ("popup.html", ""),
        ("icon.png", ""),
        ("inject.js", ""),
    ]);

    let resolved = EntryResolver::new(&doc, &g).resolve().unwrap();
    let summary: Vec<(&str, EntryKind, Option<String>)> = resolved
        .entries
        .iter()
        .map(|e| {
            (
                e.source_path.as_str(),
                e.kind,
                e.manifest_location.as_ref().map(|l| l.to_string()),
            )
        })
        .collect();

    assert_eq!(
        summary,
        vec![
            ("src/sw.ts", EntryKind::ServiceWorker, Some("background.service_worker".into())),
            ("src/cs.ts", EntryKind::ContentScript, Some("content_scripts[0].js[0]".into())),
            ("src/cs.css", EntryKind::Css, Some("content_scripts[0].css[0]".into())),
            ("popup.html", EntryKind::HtmlPage, Some("action.default_popup".into())),
            (
                "inject.js",
                EntryKind::DynamicScript,
                Some("web_accessible_resources[0].resources[1]".into())
            ),
            ("icon.png", EntryKind::StaticAsset, Some("icons.16".into())),
        ]
    );
    assert!(resolved.entries[0].module);
    assert_eq!(
        resolved.entries[1].execution_world,
        Some(ExecutionWorld::Isolated)
    );
}

#[test]
fn missing_manifest_file_names_the_exact_field() {
    let doc = content_manifest(json!([
        { "matches": ["https://a.com/*"], "js": ["src/a.ts"] },
        { "matches": ["https://b.com/*"], "js": ["src/b.ts", "src/gone.ts"] }
    ]));
    let g = graph(&[("src/sw.ts", ""), ("src/a.ts", ""), ("src/b.ts", "")]);

    let err = EntryResolver::new(&doc, &g).resolve().unwrap_err();
    match err {
        CrxError::MissingSourceFile { path, site } => {
            assert_eq!(path, "src/gone.ts");
            assert_eq!(
                site,
                ReferenceSite::Manifest(ManifestLocation::ContentScriptJs {
                    script: 1,
                    index: 1
                })
            );
        }
        other => panic!("expected MissingSourceFile, got {:?}", other),
    }
}

#[test]
fn missing_import_names_the_importer() {
    let doc = content_manifest(json!([{ "matches": ["<all_urls>"], "js": ["src/cs.ts"] }]));
    let g = graph(&[
        ("src/sw.ts", ""),
        ("src/cs.ts", "import { x } from './lib/missing';"),
    ]);

    let err = EntryResolver::new(&doc, &g).resolve().unwrap_err();
    let message = err.to_string();
    assert!(message.contains("src/lib/missing"), "{}", message);
    assert!(message.contains("src/cs.ts"), "{}", message);
    assert!(matches!(
        err,
        CrxError::MissingSourceFile {
            site: ReferenceSite::Import { .. },
            ..
        }
    ));
}

// ============================================================================
// Dynamic Scripts
// ============================================================================

#[test]
fn same_path_and_world_is_one_entry() {
    let doc = content_manifest(json!([
        { "matches": ["https://a.com/*"], "js": ["src/a.ts"] },
        { "matches": ["https://b.com/*"], "js": ["src/b.ts"] }
    ]));
    let g = graph(&[
        ("src/sw.ts", ""),
        ("src/a.ts", "import url from './inject.ts?script';"),
        ("src/b.ts", "import url from './inject?script';"),
        ("src/inject.ts", ""),
    ]);

    let resolved = EntryResolver::new(&doc, &g).resolve().unwrap();
    let dynamic: Vec<_> = resolved
        .entries
        .iter()
        .filter(|e| e.kind == EntryKind::DynamicScript)
        .collect();
    assert_eq!(dynamic.len(), 1);
    assert_eq!(resolved.registry.len(), 1);

    let referrer = dynamic[0].referrer.as_ref().unwrap();
    assert_eq!(referrer.context, ExtensionContext::ContentScript);
    assert_eq!(referrer.matches, vec!["https://a.com/*", "https://b.com/*"]);
    assert!(dynamic[0].needs_web_access());
}

#[test]
fn different_worlds_are_distinct_entries() {
    let doc = content_manifest(json!([{ "matches": ["<all_urls>"], "js": ["src/cs.ts"] }]));
    let g = graph(&[
        ("src/sw.ts", ""),
        (
            "src/cs.ts",
            "import a from './inject.ts?script';\nimport b from './inject.ts?script&main';",
        ),
        ("src/inject.ts", ""),
    ]);

    let resolved = EntryResolver::new(&doc, &g).resolve().unwrap();
    let worlds: Vec<_> = resolved
        .entries
        .iter()
        .filter(|e| e.kind == EntryKind::DynamicScript)
        .map(|e| (e.execution_world, e.logical_id.clone().unwrap()))
        .collect();
    assert_eq!(worlds.len(), 2);
    assert_eq!(worlds[0].0, Some(ExecutionWorld::Isolated));
    assert_eq!(worlds[1].0, Some(ExecutionWorld::Main));
    assert_ne!(worlds[0].1, worlds[1].1);
}

#[test]
fn module_flag_sets_module_output() {
    let doc = content_manifest(json!([{ "matches": ["<all_urls>"], "js": ["src/cs.ts"] }]));
    let g = graph(&[
        ("src/sw.ts", ""),
        ("src/cs.ts", "import m from './m.ts?script&module';"),
        ("src/m.ts", ""),
    ]);
    let resolved = EntryResolver::new(&doc, &g).resolve().unwrap();
    let entry = resolved
        .entries
        .iter()
        .find(|e| e.source_path == "src/m.ts")
        .unwrap();
    assert!(entry.module);
}

#[test]
fn unsupported_script_requests_are_rejected() {
    let cases = [
        "import x from './inject.ts?script&iife';",
        "import x from './inject.ts?script&bogus';",
        "import x from './inject.ts?script&main&isolated';",
        "import x from './inject.ts?script';\nimport y from './inject.ts?script&module';",
    ];
    for code in cases {
        let doc = content_manifest(json!([{ "matches": ["<all_urls>"], "js": ["src/cs.ts"] }]));
        let g = graph(&[("src/sw.ts", ""), ("src/cs.ts", code), ("src/inject.ts", "")]);
        let err = EntryResolver::new(&doc, &g).resolve().unwrap_err();
        assert!(
            matches!(err, CrxError::InvalidScriptImport { .. }),
            "{} gave {:?}",
            code,
            err
        );
    }
}

#[test]
fn dynamic_scripts_are_traversed_in_turn() {
    let doc = content_manifest(json!([{ "matches": ["<all_urls>"], "js": ["src/cs.ts"] }]));
    let g = graph(&[
        ("src/sw.ts", "import page from './page.ts?script&main';"),
        ("src/cs.ts", ""),
        ("src/page.ts", "import deeper from './deeper.ts?script&main';"),
        ("src/deeper.ts", ""),
    ]);
    let resolved = EntryResolver::new(&doc, &g).resolve().unwrap();
    let paths: Vec<_> = resolved
        .entries
        .iter()
        .filter(|e| e.kind == EntryKind::DynamicScript)
        .map(|e| e.source_path.as_str())
        .collect();
    assert_eq!(paths, vec!["src/page.ts", "src/deeper.ts"]);

    // Requested from the worker, so no web access; the nested request comes
    // from the main world and needs it.
    assert!(!resolved.entries[2].needs_web_access());
    assert!(resolved.entries[3].needs_web_access());
}

#[test]
fn content_script_importer_widens_a_worker_requested_script() {
    let doc = content_manifest(json!([{ "matches": ["https://a.com/*"], "js": ["src/cs.ts"] }]));
    let g = graph(&[
        ("src/sw.ts", "import url from './inject.ts?script';"),
        ("src/cs.ts", "import url from './inject.ts?script';"),
        ("src/inject.ts", "import logo from './logo.png';"),
        ("src/logo.png", ""),
    ]);
    let resolved = EntryResolver::new(&doc, &g).resolve().unwrap();

    let inject = resolved
        .entries
        .iter()
        .find(|e| e.kind == EntryKind::DynamicScript)
        .unwrap();
    let referrer = inject.referrer.as_ref().unwrap();
    assert_eq!(referrer.file, "src/cs.ts");
    assert_eq!(referrer.context, ExtensionContext::ContentScript);
    assert_eq!(referrer.matches, vec!["https://a.com/*"]);
    assert!(inject.needs_web_access());

    // The script's own assets follow it onto the page.
    let logo = resolved
        .entries
        .iter()
        .find(|e| e.source_path == "src/logo.png")
        .unwrap();
    assert_eq!(logo.referrer.as_ref().unwrap().matches, vec!["https://a.com/*"]);
}

#[test]
fn web_accessible_scripts_are_traversed_in_the_main_world() {
    let doc = manifest(json!({
        "manifest_version": 3,
        "web_accessible_resources": [
            { "resources": ["src/page.ts"], "matches": ["https://a.com/*"] }
        ]
    }));
    let g = graph(&[
        ("src/page.ts", "import helper from './helper.ts?script&main';"),
        ("src/helper.ts", ""),
    ]);
    let resolved = EntryResolver::new(&doc, &g).resolve().unwrap();

    assert_eq!(resolved.entries[0].kind, EntryKind::DynamicScript);
    assert_eq!(resolved.entries[0].execution_world, Some(ExecutionWorld::Main));

    let helper = &resolved.entries[1];
    assert_eq!(helper.source_path, "src/helper.ts");
    assert_eq!(helper.kind, EntryKind::DynamicScript);
    let referrer = helper.referrer.as_ref().unwrap();
    assert_eq!(referrer.context, ExtensionContext::MainWorld);
    assert_eq!(referrer.matches, vec!["https://a.com/*"]);
    assert!(helper.needs_web_access());
}

// ============================================================================
// Static Assets and Passthrough
// ============================================================================

#[test]
fn content_script_assets_become_web_accessible_entries() {
    let doc = content_manifest(json!([{ "matches": ["https://a.com/*"], "js": ["src/cs.ts"] }]));
    let g = graph(&[
        ("src/sw.ts", "import icon from './logo.png';"),
        ("src/cs.ts", "import logo from './logo.png';\nimport './cs.css';\nimport React from 'react';"),
        ("src/logo.png", ""),
        ("src/cs.css", ""),
    ]);
    let resolved = EntryResolver::new(&doc, &g).resolve().unwrap();
    let assets: Vec<_> = resolved
        .entries
        .iter()
        .filter(|e| e.kind == EntryKind::StaticAsset)
        .collect();
    assert_eq!(assets.len(), 1);
    assert_eq!(assets[0].source_path, "src/logo.png");
    assert!(assets[0].needs_web_access());
    assert_eq!(
        assets[0].referrer.as_ref().unwrap().matches,
        vec!["https://a.com/*"]
    );
}

#[test]
fn reserved_namespace_imports_are_rejected() {
    let doc = content_manifest(json!([{ "matches": ["<all_urls>"], "js": ["src/cs.ts"] }]));
    let g = graph(&[
        ("src/sw.ts", ""),
        ("src/cs.ts", "import x from '\\0crx:dynamic-script:main/x.ts';"),
    ]);
    let err = EntryResolver::new(&doc, &g).resolve().unwrap_err();
    assert!(matches!(err, CrxError::InvalidScriptImport { .. }));
}

// ============================================================================
// HTML Pages
// ============================================================================

#[test]
fn page_references_become_entries() {
    let doc = manifest(json!({
        "manifest_version": 3,
        "action": { "default_popup": "pages/popup.html" },
        "options_page": "pages/options.html"
    }));
    let g = graph(&[
        (
            "pages/popup.html",
            r#"<link rel="stylesheet" href="./popup.css">
               <img src="../img/logo.png">
               <script src="https://cdn.example.com/x.js"></script>
               <script type="module" src="../src/popup.ts"></script>"#,
        ),
        ("pages/options.html", r#"<script src="/src/popup.ts"></script>"#),
        ("pages/popup.css", ""),
        ("img/logo.png", ""),
        ("src/popup.ts", "import inject from './inject.ts?script';\nimport icon from './icon.png';"),
        ("src/inject.ts", ""),
        ("src/icon.png", ""),
    ]);

    let resolved = EntryResolver::new(&doc, &g).resolve().unwrap();
    let summary: Vec<(&str, EntryKind)> = resolved
        .entries
        .iter()
        .map(|e| (e.source_path.as_str(), e.kind))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("pages/popup.html", EntryKind::HtmlPage),
            ("pages/options.html", EntryKind::HtmlPage),
            ("pages/popup.css", EntryKind::Css),
            ("img/logo.png", EntryKind::StaticAsset),
            ("src/popup.ts", EntryKind::PageScript),
            ("src/inject.ts", EntryKind::DynamicScript),
            ("src/icon.png", EntryKind::StaticAsset),
        ]
    );

    let script = &resolved.entries[4];
    let referrer = script.referrer.as_ref().unwrap();
    assert_eq!(referrer.file, "pages/popup.html");
    assert_eq!(referrer.context, ExtensionContext::ExtensionPage);

    // Extension pages load from the extension origin; nothing is exposed.
    assert!(resolved.entries.iter().all(|e| !e.needs_web_access()));
}

#[test]
fn missing_page_reference_names_the_page() {
    let doc = manifest(json!({
        "manifest_version": 3,
        "action": { "default_popup": "popup.html" }
    }));
    let g = graph(&[("popup.html", r#"<script src="./gone.js"></script>"#)]);

    let err = EntryResolver::new(&doc, &g).resolve().unwrap_err();
    assert_eq!(
        err.to_string(),
        "Missing source file 'gone.js' referenced by import './gone.js' in popup.html"
    );
}
