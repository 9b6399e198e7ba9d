//! Dev-mode reload clients and their manifest injection.
//!
//! Two generated scripts are emitted under fixed names:
//!
//! - the background client, which holds the service worker's connection,
//!   reloads the extension on `do-update` and acknowledges with
//!   `done-update` once the fresh worker is up
//! - the content-script client, which runs the `awaiting-peer` protocol
//!   and then asks the background to re-inject the page's content scripts,
//!   reloading the page only when that fails
//!
//! [`inject`] wires both into an already-rewritten manifest. Running it
//! twice leaves the manifest unchanged.

use serde_json::Value;

use crate::manifest::csp::CspRequirement;
use crate::manifest::{Background, ContentScript, ExecutionWorld, ManifestDocument, ManifestVersion};
use crate::reload::ReloadConfig;
use crate::utils::escape_js_string;

pub const BACKGROUND_CLIENT_FILE: &str = "crx-reload-client--background.js";
pub const CONTENT_CLIENT_FILE: &str = "crx-reload-client--content-script.js";
pub const SERVICE_WORKER_LOADER_FILE: &str = "service-worker-loader.js";

/// Prefix marking a manifest description as a development build.
pub const DEV_DESCRIPTION_MARKER: &str = "[DEV BUILD, do not publish]";

/// Match patterns of the content script added when the manifest has none.
const DEFAULT_CLIENT_MATCHES: &[&str] = &["http://*/*", "https://*/*"];

// ---------------------------------------------------------------------------
// Generated clients
// ---------------------------------------------------------------------------

/// Background client source. MV3 keeps the pending build id in
/// `storage.session` and re-injects through `chrome.scripting`; MV2 has
/// neither and uses `storage.local` and `chrome.tabs`.
pub fn background_client_code(config: &ReloadConfig, version: ManifestVersion) -> String {
    let (storage, inject) = match version {
        ManifestVersion::V3 => ("session", MV3_REINJECT),
        ManifestVersion::V2 => ("local", MV2_REINJECT),
    };
    format!(
        r#"// crx reload client (background)
const ENDPOINT = "{endpoint}";
const BACKOFF_INITIAL = {initial};
const BACKOFF_MAX = {max};
const PENDING_KEY = "crxPendingBuild";

function matchesUrl(pattern, url) {{
  if (pattern === "<all_urls>") return /^(https?|file|ftp):/.test(url);
  const parts = /^(\*|https?|file|ftp):\/\/([^/]*)(\/.*)$/.exec(pattern);
  if (!parts) return false;
  let target;
  try {{
    target = new URL(url);
  }} catch (e) {{
    return false;
  }}
  const [, scheme, host, path] = parts;
  const protocol = target.protocol.slice(0, -1);
  if (scheme === "*" ? !/^https?$/.test(protocol) : scheme !== protocol) return false;
  if (host.startsWith("*.")) {{
    const domain = host.slice(2);
    if (target.hostname !== domain && !target.hostname.endsWith("." + domain)) return false;
  }} else if (host !== "*" && host !== target.hostname) {{
    return false;
  }}
  const glob = path
    .split("*")
    .map((part) => part.replace(/[.+?^$()|[\]\\]/g, "\\$&"))
    .join(".*");
  return new RegExp("^" + glob + "$").test(target.pathname + target.search);
}}

{inject}
async function reinject(sender) {{
  const url = sender.url || (sender.tab && sender.tab.url) || "";
  const groups = (chrome.runtime.getManifest().content_scripts || []).filter(
    (cs) => cs.world !== "MAIN" && (cs.matches || []).some((p) => matchesUrl(p, url))
  );
  if (!sender.tab || groups.length === 0) throw new Error("no content scripts match " + url);
  for (const cs of groups) {{
    await injectGroup(sender.tab.id, sender.frameId || 0, cs.css || [], cs.js || []);
  }}
}}

chrome.runtime.onMessage.addListener((message, sender, respond) => {{
  if (!message) return;
  if (message.type === "crx:whoami") {{
    respond({{ tabId: sender.tab ? sender.tab.id : -1, frameId: sender.frameId || 0 }});
  }} else if (message.type === "crx:reinject") {{
    reinject(sender).then(
      () => respond({{ ok: true }}),
      (error) => {{
        console.warn("[crx] re-injection failed for build " + message.buildId + ": " + error);
        respond({{ ok: false }});
      }}
    );
    return true;
  }}
}});

let attempt = 0;
function connect() {{
  const ws = new WebSocket(ENDPOINT + "/service-worker");
  ws.onopen = async () => {{
    attempt = 0;
    const stored = await chrome.storage.{storage}.get(PENDING_KEY);
    const pending = stored[PENDING_KEY];
    if (pending) {{
      await chrome.storage.{storage}.remove(PENDING_KEY);
      ws.send(JSON.stringify({{ type: "done-update", buildId: pending }}));
    }}
  }};
  ws.onmessage = async (event) => {{
    const message = JSON.parse(event.data);
    if (message.type === "do-update") {{
      await chrome.storage.{storage}.set({{ [PENDING_KEY]: message.buildId }});
      chrome.runtime.reload();
    }}
  }};
  ws.onclose = () => {{
    const delay = Math.min(BACKOFF_INITIAL * 2 ** attempt, BACKOFF_MAX);
    attempt += 1;
    setTimeout(connect, delay);
  }};
}}
connect();
"#,
        endpoint = escape_js_string(&config.ws_url()),
        initial = config.backoff.initial_ms,
        max = config.backoff.max_ms,
        storage = storage,
        inject = inject,
    )
}

const MV3_REINJECT: &str = r#"async function injectGroup(tabId, frameId, css, js) {
  const target = { tabId, frameIds: [frameId] };
  if (css.length) await chrome.scripting.insertCSS({ target, files: css });
  if (js.length) await chrome.scripting.executeScript({ target, files: js });
}
"#;

const MV2_REINJECT: &str = r#"function tabsCall(method, tabId, details) {
  return new Promise((resolve, reject) => {
    chrome.tabs[method](tabId, details, () => {
      const error = chrome.runtime.lastError;
      if (error) reject(new Error(error.message));
      else resolve();
    });
  });
}

async function injectGroup(tabId, frameId, css, js) {
  for (const file of css) await tabsCall("insertCSS", tabId, { file, frameId });
  for (const file of js) await tabsCall("executeScript", tabId, { file, frameId });
}
"#;

/// Content-script client source.
pub fn content_client_code(config: &ReloadConfig) -> String {
    format!(
        r#"// crx reload client (content script)
(() => {{
  const ENDPOINT = "{endpoint}";
  const PEER_TIMEOUT = {peer_timeout};
  const BACKOFF_INITIAL = {initial};
  const BACKOFF_MAX = {max};

  let state = "idle";
  let build = 0;
  let timer;
  let attempt = 0;
  let socket;

  function fail(reason) {{
    clearTimeout(timer);
    state = "failed";
    console.error("[crx] reload failed for build " + build + ": " + reason + ". Reload the extension manually.");
  }}

  function reload() {{
    clearTimeout(timer);
    state = "reloading";
    const fallback = () => location.reload();
    try {{
      chrome.runtime.sendMessage({{ type: "crx:reinject", buildId: build }}, (response) => {{
        if (chrome.runtime.lastError || !response || !response.ok) return fallback();
        // The fresh copy of this client owns the page from here on.
        state = "retired";
        if (socket) socket.close();
      }});
    }} catch (e) {{
      // The extension context was invalidated by the reload.
      fallback();
    }}
  }}

  function handle(message) {{
    if (state === "failed" || state === "retired" || message.buildId < build) return;
    if (message.buildId > build && state === "awaiting-peer") {{
      clearTimeout(timer);
      state = "idle";
    }}
    build = message.buildId;
    switch (message.type) {{
      case "do-update":
        if (state !== "idle") return;
        if (message.payload && message.payload.requiresWorkerResync) {{
          state = "awaiting-peer";
          timer = setTimeout(() => fail("service worker did not resync"), PEER_TIMEOUT);
        }} else {{
          reload();
        }}
        break;
      case "done-update":
        if (state === "awaiting-peer") reload();
        break;
      case "error":
        if (state === "awaiting-peer") fail(message.payload ? message.payload.message : "server error");
        break;
    }}
  }}

  function connect() {{
    chrome.runtime.sendMessage({{ type: "crx:whoami" }}, (who) => {{
      const tab = who ? who.tabId : -1;
      const frame = who ? who.frameId : 0;
      const ws = new WebSocket(ENDPOINT + "/content-script/" + tab + "/" + frame);
      socket = ws;
      ws.onopen = () => {{ attempt = 0; }};
      ws.onmessage = (event) => handle(JSON.parse(event.data));
      ws.onclose = () => {{
        if (state === "retired") return;
        const delay = Math.min(BACKOFF_INITIAL * 2 ** attempt, BACKOFF_MAX);
        attempt += 1;
        setTimeout(connect, delay);
      }};
    }});
  }}
  connect();
}})();
"#,
        endpoint = escape_js_string(&config.ws_url()),
        peer_timeout = config.peer_timeout_ms,
        initial = config.backoff.initial_ms,
        max = config.backoff.max_ms,
    )
}

/// Module worker that starts the reload client, then the user's worker.
pub fn service_worker_loader_code(worker: Option<&str>) -> String {
    let mut code = format!("import \"/{}\";\n", escape_js_string(BACKGROUND_CLIENT_FILE));
    if let Some(worker) = worker {
        code.push_str(&format!("import \"/{}\";\n", escape_js_string(worker)));
    }
    code
}

/// CSP tokens the clients need on extension pages.
pub fn dev_csp_requirements(config: &ReloadConfig) -> Vec<CspRequirement> {
    vec![
        CspRequirement::new("script-src", "'self'"),
        CspRequirement::new("connect-src", config.ws_url()),
    ]
}

// ---------------------------------------------------------------------------
// Manifest injection
// ---------------------------------------------------------------------------

/// A file produced by injection rather than by the bundler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedFile {
    pub file_name: String,
    pub code: String,
}

/// Wire the reload clients into `manifest`.
///
/// Returns the service-worker loader when one must be emitted.
pub fn inject(manifest: &mut ManifestDocument, build_label: &str) -> Option<InjectedFile> {
    let loader = inject_background(manifest);
    inject_content_scripts(manifest);
    add_permission(manifest, "storage");
    if manifest.manifest_version == ManifestVersion::V3 {
        add_permission(manifest, "scripting");
    }
    mark_development(manifest, build_label);
    loader
}

fn inject_background(manifest: &mut ManifestDocument) -> Option<InjectedFile> {
    match manifest.manifest_version {
        ManifestVersion::V2 => {
            match &mut manifest.background {
                Some(Background::Scripts { scripts, .. }) => {
                    if !scripts.iter().any(|s| s == BACKGROUND_CLIENT_FILE) {
                        scripts.insert(0, BACKGROUND_CLIENT_FILE.to_string());
                    }
                }
                Some(Background::Page { page, .. }) => {
                    tracing::warn!(
                        page = %page,
                        "background page kept as is; add the reload client to it to enable reloads"
                    );
                }
                Some(Background::ServiceWorker { .. }) => {}
                None => {
                    manifest.background = Some(Background::Scripts {
                        scripts: vec![BACKGROUND_CLIENT_FILE.to_string()],
                        persistent: None,
                    });
                }
            }
            None
        }
        ManifestVersion::V3 => {
            let worker = match &manifest.background {
                Some(Background::ServiceWorker { path, .. }) if path == SERVICE_WORKER_LOADER_FILE => {
                    return None;
                }
                Some(Background::ServiceWorker { path, .. }) => Some(path.clone()),
                _ => None,
            };
            manifest.background = Some(Background::ServiceWorker {
                path: SERVICE_WORKER_LOADER_FILE.to_string(),
                module: true,
            });
            Some(InjectedFile {
                file_name: SERVICE_WORKER_LOADER_FILE.to_string(),
                code: service_worker_loader_code(worker.as_deref()),
            })
        }
    }
}

fn inject_content_scripts(manifest: &mut ManifestDocument) {
    let mut injected = false;
    for script in manifest
        .content_scripts
        .iter_mut()
        .filter(|cs| cs.world != Some(ExecutionWorld::Main))
    {
        if !script.js.iter().any(|js| js == CONTENT_CLIENT_FILE) {
            script.js.insert(0, CONTENT_CLIENT_FILE.to_string());
        }
        injected = true;
    }
    if !injected {
        manifest.content_scripts.push(ContentScript {
            matches: DEFAULT_CLIENT_MATCHES.iter().map(|m| m.to_string()).collect(),
            js: vec![CONTENT_CLIENT_FILE.to_string()],
            ..Default::default()
        });
    }
}

fn add_permission(manifest: &mut ManifestDocument, permission: &str) {
    let permissions = manifest
        .extra
        .entry("permissions")
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(list) = permissions {
        if !list.iter().any(|p| p.as_str() == Some(permission)) {
            list.push(Value::from(permission));
        }
    }
}

fn mark_development(manifest: &mut ManifestDocument, build_label: &str) {
    let description = match manifest.extra.get("description").and_then(Value::as_str) {
        Some(d) if d.starts_with(DEV_DESCRIPTION_MARKER) => d.to_string(),
        Some(d) if !d.is_empty() => format!("{} {}", DEV_DESCRIPTION_MARKER, d),
        _ => DEV_DESCRIPTION_MARKER.to_string(),
    };
    manifest
        .extra
        .insert("description".into(), Value::from(description));
    manifest
        .extra
        .insert("version_name".into(), Value::from(build_label));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clients_embed_endpoint_and_timings() {
        let config = ReloadConfig::default();
        let bg = background_client_code(&config, ManifestVersion::V3);
        assert!(bg.contains("ws://127.0.0.1:8899"));
        assert!(bg.contains("chrome.storage.session"));
        let cs = content_client_code(&config);
        assert!(cs.contains("const PEER_TIMEOUT = 5000;"));
        assert!(cs.contains("awaiting-peer"));
    }

    #[test]
    fn content_client_reinjects_before_reloading_the_page() {
        let cs = content_client_code(&ReloadConfig::default());
        assert!(cs.contains("sendMessage({ type: \"crx:reinject\", buildId: build }"));
        assert!(cs.contains("if (chrome.runtime.lastError || !response || !response.ok) return fallback();"));
        assert!(cs.contains("const fallback = () => location.reload();"));
    }

    #[test]
    fn background_client_reinjects_with_the_version_api() {
        let config = ReloadConfig::default();
        let v3 = background_client_code(&config, ManifestVersion::V3);
        assert!(v3.contains("message.type === \"crx:reinject\""));
        assert!(v3.contains("chrome.scripting.executeScript"));
        assert!(!v3.contains("chrome.tabs[method]"));

        let v2 = background_client_code(&config, ManifestVersion::V2);
        assert!(v2.contains("message.type === \"crx:reinject\""));
        assert!(v2.contains("tabsCall(\"executeScript\""));
        assert!(!v2.contains("chrome.scripting"));
    }

    #[test]
    fn v3_gets_the_scripting_permission() {
        let mut v3 = ManifestDocument::parse(r#"{"manifest_version":3}"#).unwrap();
        inject(&mut v3, "b1");
        assert_eq!(v3.extra["permissions"], serde_json::json!(["storage", "scripting"]));

        let mut v2 = ManifestDocument::parse(r#"{"manifest_version":2}"#).unwrap();
        inject(&mut v2, "b1");
        assert_eq!(v2.extra["permissions"], serde_json::json!(["storage"]));
    }

    #[test]
    fn loader_imports_client_first() {
        assert_eq!(
            service_worker_loader_code(Some("assets/background.1a2b3c4d.js")),
            "import \"/crx-reload-client--background.js\";\nimport \"/assets/background.1a2b3c4d.js\";\n"
        );
    }

    #[test]
    fn v3_without_worker_gets_one() {
        let mut manifest = ManifestDocument::parse(r#"{"manifest_version":3}"#).unwrap();
        let loader = inject(&mut manifest, "build 1").unwrap();
        assert_eq!(loader.file_name, SERVICE_WORKER_LOADER_FILE);
        assert_eq!(
            manifest.background,
            Some(Background::ServiceWorker {
                path: SERVICE_WORKER_LOADER_FILE.into(),
                module: true
            })
        );
        assert_eq!(manifest.content_scripts[0].js, vec![CONTENT_CLIENT_FILE]);
        assert_eq!(manifest.extra["version_name"], "build 1");
    }

    #[test]
    fn injection_is_idempotent() {
        let mut manifest = ManifestDocument::parse(
            r#"{"manifest_version":2,"description":"Demo","background":{"scripts":["bg.js"]},
                "content_scripts":[{"matches":["https://*/*"],"js":["cs.js"]}]}"#,
        )
        .unwrap();
        inject(&mut manifest, "b1");
        let once = manifest.clone();
        inject(&mut manifest, "b1");
        assert_eq!(manifest, once);
        assert_eq!(
            manifest.extra["description"],
            format!("{} Demo", DEV_DESCRIPTION_MARKER)
        );
        assert_eq!(
            manifest.extra["permissions"],
            serde_json::json!(["storage"])
        );
    }
}
