//! Manifest Model
//!
//! Typed in-memory representation of `manifest.json`. The manifest version is
//! a closed tag: fields whose shape differs between MV2 and MV3 (background,
//! actions, web-accessible resources, CSP) are parsed according to it and a
//! shape that belongs to the other version is rejected as malformed.
//!
//! Keys this crate does not interpret (`name`, `permissions`, …) are carried
//! through verbatim in `extra`.

pub mod csp;
mod location;

use std::collections::BTreeMap;
use std::fmt;
use std::iter;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::CrxError;

pub use location::{ManifestLocation, PageSlot};

// ---------------------------------------------------------------------------
// Version & Execution World
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManifestVersion {
    V2,
    V3,
}

impl ManifestVersion {
    pub fn as_number(self) -> u64 {
        match self {
            ManifestVersion::V2 => 2,
            ManifestVersion::V3 => 3,
        }
    }
}

/// The JS world a script executes in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionWorld {
    /// The content-script sandbox.
    #[default]
    Isolated,
    /// Shares scope with the host page.
    Main,
}

impl ExecutionWorld {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionWorld::Isolated => "isolated",
            ExecutionWorld::Main => "main",
        }
    }
}

impl fmt::Display for ExecutionWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Field Types
// ---------------------------------------------------------------------------

/// The background entry. `ServiceWorker` is only valid for MV3, the other two
/// only for MV2.
#[derive(Debug, Clone, PartialEq)]
pub enum Background {
    ServiceWorker { path: String, module: bool },
    Scripts {
        scripts: Vec<String>,
        persistent: Option<bool>,
    },
    Page {
        page: String,
        persistent: Option<bool>,
    },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContentScript {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub js: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub css: Vec<String>,
    /// MV3 only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world: Option<ExecutionWorld>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Which manifest key an action was declared under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKey {
    /// MV3
    Action,
    /// MV2
    BrowserAction,
    /// MV2
    PageAction,
}

impl ActionKey {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKey::Action => "action",
            ActionKey::BrowserAction => "browser_action",
            ActionKey::PageAction => "page_action",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Action {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_popup: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_icon: Option<ActionIcon>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionIcon {
    Single(String),
    Sized(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OptionsUi {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SidePanel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_path: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeclarativeNetRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_resources: Vec<RuleResource>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleResource {
    pub path: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An MV3 `web_accessible_resources` entry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WebAccessibleResource {
    pub resources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_dynamic_url: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebAccessibleResources {
    /// MV2: a flat list of paths.
    Paths(Vec<String>),
    /// MV3: entries scoped by `matches` or `extension_ids`.
    Entries(Vec<WebAccessibleResource>),
}

impl WebAccessibleResources {
    pub fn contains(&self, path: &str) -> bool {
        match self {
            WebAccessibleResources::Paths(paths) => paths.iter().any(|p| p == path),
            WebAccessibleResources::Entries(entries) => entries
                .iter()
                .any(|e| e.resources.iter().any(|r| r == path)),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            WebAccessibleResources::Paths(paths) => paths.is_empty(),
            WebAccessibleResources::Entries(entries) => entries.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentSecurityPolicy {
    /// MV2: one policy string.
    Single(String),
    /// MV3: policy per context (`extension_pages`, `sandbox`).
    PerContext(BTreeMap<String, String>),
}

// ---------------------------------------------------------------------------
// ManifestDocument
// ---------------------------------------------------------------------------

/// The parsed manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestDocument {
    pub manifest_version: ManifestVersion,
    pub background: Option<Background>,
    pub content_scripts: Vec<ContentScript>,
    pub action: Option<(ActionKey, Action)>,
    pub options_page: Option<String>,
    pub options_ui: Option<OptionsUi>,
    pub devtools_page: Option<String>,
    pub side_panel: Option<SidePanel>,
    pub chrome_url_overrides: BTreeMap<String, String>,
    pub web_accessible_resources: Option<WebAccessibleResources>,
    pub content_security_policy: Option<ContentSecurityPolicy>,
    pub icons: BTreeMap<String, String>,
    pub declarative_net_request: Option<DeclarativeNetRequest>,
    /// Every key not listed above, kept verbatim.
    pub extra: Map<String, Value>,
}

#[derive(Deserialize)]
struct RawManifest {
    manifest_version: Value,
    #[serde(default)]
    background: Option<RawBackground>,
    #[serde(default)]
    content_scripts: Vec<ContentScript>,
    #[serde(default)]
    action: Option<Action>,
    #[serde(default)]
    browser_action: Option<Action>,
    #[serde(default)]
    page_action: Option<Action>,
    #[serde(default)]
    options_page: Option<String>,
    #[serde(default)]
    options_ui: Option<OptionsUi>,
    #[serde(default)]
    devtools_page: Option<String>,
    #[serde(default)]
    side_panel: Option<SidePanel>,
    #[serde(default)]
    chrome_url_overrides: BTreeMap<String, String>,
    #[serde(default)]
    web_accessible_resources: Option<Value>,
    #[serde(default)]
    content_security_policy: Option<Value>,
    #[serde(default)]
    icons: BTreeMap<String, String>,
    #[serde(default)]
    declarative_net_request: Option<DeclarativeNetRequest>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Deserialize)]
struct RawBackground {
    service_worker: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    scripts: Option<Vec<String>>,
    page: Option<String>,
    persistent: Option<bool>,
}

fn malformed(message: impl Into<String>) -> CrxError {
    CrxError::MalformedManifest(message.into())
}

impl ManifestDocument {
    /// Parse `manifest.json` source.
    pub fn parse(raw: &str) -> Result<Self, CrxError> {
        let value: Value = serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, CrxError> {
        if !value.is_object() {
            return Err(malformed("manifest must be a JSON object"));
        }
        let raw: RawManifest =
            serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;

        let manifest_version = match raw.manifest_version.as_u64() {
            Some(2) => ManifestVersion::V2,
            Some(3) => ManifestVersion::V3,
            _ => {
                return Err(malformed(format!(
                    "unsupported manifest_version {} (expected 2 or 3)",
                    raw.manifest_version
                )))
            }
        };

        let background = raw
            .background
            .map(|bg| parse_background(manifest_version, bg))
            .transpose()?;

        for (i, script) in raw.content_scripts.iter().enumerate() {
            if script.matches.is_empty() {
                return Err(malformed(format!("content_scripts[{}].matches is required", i)));
            }
            if script.world.is_some() && manifest_version == ManifestVersion::V2 {
                return Err(malformed(format!(
                    "content_scripts[{}].world requires manifest_version 3",
                    i
                )));
            }
        }

        let action = match manifest_version {
            ManifestVersion::V3 => {
                if raw.browser_action.is_some() || raw.page_action.is_some() {
                    return Err(malformed(
                        "browser_action/page_action are manifest_version 2 keys; use action",
                    ));
                }
                raw.action.map(|a| (ActionKey::Action, a))
            }
            ManifestVersion::V2 => {
                if raw.action.is_some() {
                    return Err(malformed("action is a manifest_version 3 key"));
                }
                match (raw.browser_action, raw.page_action) {
                    (Some(_), Some(_)) => {
                        return Err(malformed("browser_action and page_action are exclusive"))
                    }
                    (Some(a), None) => Some((ActionKey::BrowserAction, a)),
                    (None, Some(a)) => Some((ActionKey::PageAction, a)),
                    (None, None) => None,
                }
            }
        };

        let web_accessible_resources = raw
            .web_accessible_resources
            .map(|v| parse_web_accessible_resources(manifest_version, v))
            .transpose()?;

        let content_security_policy = raw
            .content_security_policy
            .map(|v| parse_content_security_policy(manifest_version, v))
            .transpose()?;

        Ok(Self {
            manifest_version,
            background,
            content_scripts: raw.content_scripts,
            action,
            options_page: raw.options_page,
            options_ui: raw.options_ui,
            devtools_page: raw.devtools_page,
            side_panel: raw.side_panel,
            chrome_url_overrides: raw.chrome_url_overrides,
            web_accessible_resources,
            content_security_policy,
            icons: raw.icons,
            declarative_net_request: raw.declarative_net_request,
            extra: raw.extra,
        })
    }

    // -----------------------------------------------------------------------
    // Path enumeration
    // -----------------------------------------------------------------------

    /// Every path the manifest references, with the field it came from.
    ///
    /// Order is fixed: background, content scripts (array order, `js` before
    /// `css`), pages, web-accessible resources, icons, the action icon, then
    /// rule resources.
    pub fn enumerate_referenced_paths(
        &self,
    ) -> impl Iterator<Item = (&str, ManifestLocation)> + '_ {
        let background: Box<dyn Iterator<Item = (&str, ManifestLocation)> + '_> =
            match &self.background {
                Some(Background::ServiceWorker { path, .. }) => Box::new(iter::once((
                    path.as_str(),
                    ManifestLocation::ServiceWorker,
                ))),
                Some(Background::Scripts { scripts, .. }) => Box::new(
                    scripts
                        .iter()
                        .enumerate()
                        .map(|(i, s)| (s.as_str(), ManifestLocation::BackgroundScript(i))),
                ),
                Some(Background::Page { page, .. }) => Box::new(iter::once((
                    page.as_str(),
                    ManifestLocation::BackgroundPage,
                ))),
                None => Box::new(iter::empty()),
            };

        let content_scripts =
            self.content_scripts
                .iter()
                .enumerate()
                .flat_map(|(script, cs)| {
                    let js = cs.js.iter().enumerate().map(move |(index, p)| {
                        (p.as_str(), ManifestLocation::ContentScriptJs { script, index })
                    });
                    let css = cs.css.iter().enumerate().map(move |(index, p)| {
                        (p.as_str(), ManifestLocation::ContentScriptCss { script, index })
                    });
                    js.chain(css)
                });

        let pages = self
            .page_paths()
            .into_iter()
            .map(|(slot, path)| (path, ManifestLocation::Page(slot)));

        let web_accessible: Box<dyn Iterator<Item = (&str, ManifestLocation)> + '_> =
            match &self.web_accessible_resources {
                Some(WebAccessibleResources::Paths(paths)) => Box::new(
                    paths
                        .iter()
                        .enumerate()
                        .map(|(i, p)| (p.as_str(), ManifestLocation::WebAccessiblePath(i))),
                ),
                Some(WebAccessibleResources::Entries(entries)) => {
                    Box::new(entries.iter().enumerate().flat_map(|(entry, war)| {
                        war.resources.iter().enumerate().map(move |(index, p)| {
                            (
                                p.as_str(),
                                ManifestLocation::WebAccessibleResource { entry, index },
                            )
                        })
                    }))
                }
                None => Box::new(iter::empty()),
            };

        let icons = self
            .icons
            .iter()
            .map(|(size, p)| (p.as_str(), ManifestLocation::Icon(size.clone())));

        let action_icon: Box<dyn Iterator<Item = (&str, ManifestLocation)> + '_> =
            match self.action.as_ref().and_then(|(_, a)| a.default_icon.as_ref()) {
                Some(ActionIcon::Single(p)) => {
                    Box::new(iter::once((p.as_str(), ManifestLocation::ActionIcon(None))))
                }
                Some(ActionIcon::Sized(map)) => Box::new(map.iter().map(|(size, p)| {
                    (p.as_str(), ManifestLocation::ActionIcon(Some(size.clone())))
                })),
                None => Box::new(iter::empty()),
            };

        let rule_resources = self
            .declarative_net_request
            .iter()
            .flat_map(|dnr| dnr.rule_resources.iter().enumerate())
            .map(|(i, r)| (r.path.as_str(), ManifestLocation::RuleResource(i)));

        background
            .chain(content_scripts)
            .chain(pages)
            .chain(web_accessible)
            .chain(icons)
            .chain(action_icon)
            .chain(rule_resources)
    }

    /// Declared HTML pages in enumeration order.
    pub fn page_paths(&self) -> Vec<(PageSlot, &str)> {
        let mut pages = Vec::new();
        if let Some(popup) = self.action.as_ref().and_then(|(_, a)| a.default_popup.as_ref()) {
            pages.push((PageSlot::ActionPopup, popup.as_str()));
        }
        if let Some(page) = &self.options_page {
            pages.push((PageSlot::OptionsPage, page.as_str()));
        }
        if let Some(page) = self.options_ui.as_ref().and_then(|o| o.page.as_ref()) {
            pages.push((PageSlot::OptionsUi, page.as_str()));
        }
        if let Some(page) = &self.devtools_page {
            pages.push((PageSlot::DevtoolsPage, page.as_str()));
        }
        if let Some(page) = self.side_panel.as_ref().and_then(|s| s.default_path.as_ref()) {
            pages.push((PageSlot::SidePanel, page.as_str()));
        }
        for (key, page) in &self.chrome_url_overrides {
            pages.push((PageSlot::Override(key.clone()), page.as_str()));
        }
        pages
    }

    // -----------------------------------------------------------------------
    // Field access
    // -----------------------------------------------------------------------

    /// Read the path stored at `location`.
    pub fn get_path(&self, location: &ManifestLocation) -> Option<&str> {
        self.enumerate_referenced_paths()
            .find(|(_, l)| l == location)
            .map(|(p, _)| p)
    }

    /// Overwrite exactly the field at `location`.
    pub fn set_path(
        &mut self,
        location: &ManifestLocation,
        new_path: impl Into<String>,
    ) -> Result<(), CrxError> {
        let slot = self
            .path_mut(location)
            .ok_or_else(|| CrxError::UnknownLocation(location.clone()))?;
        *slot = new_path.into();
        Ok(())
    }

    fn path_mut(&mut self, location: &ManifestLocation) -> Option<&mut String> {
        match location {
            ManifestLocation::ServiceWorker => match self.background.as_mut()? {
                Background::ServiceWorker { path, .. } => Some(path),
                _ => None,
            },
            ManifestLocation::BackgroundScript(i) => match self.background.as_mut()? {
                Background::Scripts { scripts, .. } => scripts.get_mut(*i),
                _ => None,
            },
            ManifestLocation::BackgroundPage => match self.background.as_mut()? {
                Background::Page { page, .. } => Some(page),
                _ => None,
            },
            ManifestLocation::ContentScriptJs { script, index } => {
                self.content_scripts.get_mut(*script)?.js.get_mut(*index)
            }
            ManifestLocation::ContentScriptCss { script, index } => {
                self.content_scripts.get_mut(*script)?.css.get_mut(*index)
            }
            ManifestLocation::Page(slot) => match slot {
                PageSlot::ActionPopup => self.action.as_mut()?.1.default_popup.as_mut(),
                PageSlot::OptionsPage => self.options_page.as_mut(),
                PageSlot::OptionsUi => self.options_ui.as_mut()?.page.as_mut(),
                PageSlot::DevtoolsPage => self.devtools_page.as_mut(),
                PageSlot::SidePanel => self.side_panel.as_mut()?.default_path.as_mut(),
                PageSlot::Override(key) => self.chrome_url_overrides.get_mut(key),
            },
            ManifestLocation::WebAccessiblePath(i) => match self.web_accessible_resources.as_mut()? {
                WebAccessibleResources::Paths(paths) => paths.get_mut(*i),
                _ => None,
            },
            ManifestLocation::WebAccessibleResource { entry, index } => {
                match self.web_accessible_resources.as_mut()? {
                    WebAccessibleResources::Entries(entries) => {
                        entries.get_mut(*entry)?.resources.get_mut(*index)
                    }
                    _ => None,
                }
            }
            ManifestLocation::Icon(size) => self.icons.get_mut(size),
            ManifestLocation::ActionIcon(size) => {
                match (self.action.as_mut()?.1.default_icon.as_mut()?, size) {
                    (ActionIcon::Single(path), None) => Some(path),
                    (ActionIcon::Sized(map), Some(size)) => map.get_mut(size),
                    _ => None,
                }
            }
            ManifestLocation::RuleResource(i) => self
                .declarative_net_request
                .as_mut()?
                .rule_resources
                .get_mut(*i)
                .map(|r| &mut r.path),
        }
    }

    // -----------------------------------------------------------------------
    // Serialization
    // -----------------------------------------------------------------------

    pub fn to_json(&self) -> Result<Value, CrxError> {
        let mut out = self.extra.clone();
        out.insert(
            "manifest_version".into(),
            Value::from(self.manifest_version.as_number()),
        );

        if let Some(background) = &self.background {
            let mut bg = Map::new();
            match background {
                Background::ServiceWorker { path, module } => {
                    bg.insert("service_worker".into(), Value::from(path.clone()));
                    if *module {
                        bg.insert("type".into(), Value::from("module"));
                    }
                }
                Background::Scripts {
                    scripts,
                    persistent,
                } => {
                    bg.insert("scripts".into(), serde_json::to_value(scripts)?);
                    if let Some(persistent) = persistent {
                        bg.insert("persistent".into(), Value::from(*persistent));
                    }
                }
                Background::Page { page, persistent } => {
                    bg.insert("page".into(), Value::from(page.clone()));
                    if let Some(persistent) = persistent {
                        bg.insert("persistent".into(), Value::from(*persistent));
                    }
                }
            }
            out.insert("background".into(), Value::Object(bg));
        }

        if !self.content_scripts.is_empty() {
            out.insert(
                "content_scripts".into(),
                serde_json::to_value(&self.content_scripts)?,
            );
        }
        if let Some((key, action)) = &self.action {
            out.insert(key.as_str().into(), serde_json::to_value(action)?);
        }
        if let Some(page) = &self.options_page {
            out.insert("options_page".into(), Value::from(page.clone()));
        }
        if let Some(options_ui) = &self.options_ui {
            out.insert("options_ui".into(), serde_json::to_value(options_ui)?);
        }
        if let Some(page) = &self.devtools_page {
            out.insert("devtools_page".into(), Value::from(page.clone()));
        }
        if let Some(side_panel) = &self.side_panel {
            out.insert("side_panel".into(), serde_json::to_value(side_panel)?);
        }
        if !self.chrome_url_overrides.is_empty() {
            out.insert(
                "chrome_url_overrides".into(),
                serde_json::to_value(&self.chrome_url_overrides)?,
            );
        }
        match &self.web_accessible_resources {
            Some(WebAccessibleResources::Paths(paths)) => {
                out.insert("web_accessible_resources".into(), serde_json::to_value(paths)?);
            }
            Some(WebAccessibleResources::Entries(entries)) => {
                out.insert(
                    "web_accessible_resources".into(),
                    serde_json::to_value(entries)?,
                );
            }
            None => {}
        }
        match &self.content_security_policy {
            Some(ContentSecurityPolicy::Single(policy)) => {
                out.insert("content_security_policy".into(), Value::from(policy.clone()));
            }
            Some(ContentSecurityPolicy::PerContext(map)) => {
                out.insert("content_security_policy".into(), serde_json::to_value(map)?);
            }
            None => {}
        }
        if !self.icons.is_empty() {
            out.insert("icons".into(), serde_json::to_value(&self.icons)?);
        }
        if let Some(dnr) = &self.declarative_net_request {
            out.insert("declarative_net_request".into(), serde_json::to_value(dnr)?);
        }

        Ok(Value::Object(out))
    }

    /// Pretty JSON with sorted keys.
    pub fn to_json_string(&self) -> Result<String, CrxError> {
        Ok(serde_json::to_string_pretty(&self.to_json()?)?)
    }
}

fn parse_background(
    version: ManifestVersion,
    bg: RawBackground,
) -> Result<Background, CrxError> {
    match version {
        ManifestVersion::V3 => {
            if bg.scripts.is_some() || bg.page.is_some() || bg.persistent.is_some() {
                return Err(malformed(
                    "background.scripts/page/persistent are not valid for manifest_version 3",
                ));
            }
            let path = bg
                .service_worker
                .ok_or_else(|| malformed("background.service_worker is required"))?;
            let module = match bg.kind.as_deref() {
                None | Some("classic") => false,
                Some("module") => true,
                Some(other) => {
                    return Err(malformed(format!(
                        "background.type must be \"module\" or \"classic\", got \"{}\"",
                        other
                    )))
                }
            };
            Ok(Background::ServiceWorker { path, module })
        }
        ManifestVersion::V2 => {
            if bg.service_worker.is_some() || bg.kind.is_some() {
                return Err(malformed(
                    "background.service_worker requires manifest_version 3",
                ));
            }
            match (bg.scripts, bg.page) {
                (Some(scripts), None) => Ok(Background::Scripts {
                    scripts,
                    persistent: bg.persistent,
                }),
                (None, Some(page)) => Ok(Background::Page {
                    page,
                    persistent: bg.persistent,
                }),
                (Some(_), Some(_)) => Err(malformed(
                    "background.scripts and background.page are exclusive",
                )),
                (None, None) => Err(malformed("background requires scripts or page")),
            }
        }
    }
}

fn parse_web_accessible_resources(
    version: ManifestVersion,
    value: Value,
) -> Result<WebAccessibleResources, CrxError> {
    match version {
        ManifestVersion::V2 => serde_json::from_value::<Vec<String>>(value)
            .map(WebAccessibleResources::Paths)
            .map_err(|e| {
                malformed(format!(
                    "web_accessible_resources must be a list of paths for manifest_version 2: {}",
                    e
                ))
            }),
        ManifestVersion::V3 => {
            let entries = serde_json::from_value::<Vec<WebAccessibleResource>>(value).map_err(
                |e| {
                    malformed(format!(
                        "web_accessible_resources must be a list of objects for manifest_version 3: {}",
                        e
                    ))
                },
            )?;
            for (i, entry) in entries.iter().enumerate() {
                if entry.matches.is_empty() && entry.extension_ids.is_empty() {
                    return Err(malformed(format!(
                        "web_accessible_resources[{}] needs matches or extension_ids",
                        i
                    )));
                }
            }
            Ok(WebAccessibleResources::Entries(entries))
        }
    }
}

fn parse_content_security_policy(
    version: ManifestVersion,
    value: Value,
) -> Result<ContentSecurityPolicy, CrxError> {
    match (version, value) {
        (ManifestVersion::V2, Value::String(policy)) => Ok(ContentSecurityPolicy::Single(policy)),
        (ManifestVersion::V3, value @ Value::Object(_)) => {
            serde_json::from_value::<BTreeMap<String, String>>(value)
                .map(ContentSecurityPolicy::PerContext)
                .map_err(|e| malformed(format!("content_security_policy: {}", e)))
        }
        (ManifestVersion::V2, _) => Err(malformed(
            "content_security_policy must be a string for manifest_version 2",
        )),
        (ManifestVersion::V3, _) => Err(malformed(
            "content_security_policy must be an object for manifest_version 3",
        )),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const MV3: &str = r#"{
        "manifest_version": 3,
        "name": "demo",
        "version": "1.0.0",
        "permissions": ["storage"],
        "background": { "service_worker": "src/background.ts", "type": "module" },
        "content_scripts": [
            { "matches": ["https://*/*"], "js": ["src/content.ts"], "css": ["src/content.css"], "run_at": "document_idle" }
        ],
        "action": { "default_popup": "src/popup.html", "default_title": "Demo" }
    }"#;

    #[test]
    fn parse_mv3_preserves_unknown_keys() {
        let doc = ManifestDocument::parse(MV3).unwrap();
        assert_eq!(doc.manifest_version, ManifestVersion::V3);
        assert_eq!(doc.extra.get("name"), Some(&Value::from("demo")));
        assert_eq!(
            doc.content_scripts[0].extra.get("run_at"),
            Some(&Value::from("document_idle"))
        );

        let json = doc.to_json().unwrap();
        assert_eq!(json["permissions"][0], "storage");
        assert_eq!(json["action"]["default_title"], "Demo");
        assert_eq!(json["background"]["type"], "module");
    }

    #[test]
    fn set_path_touches_one_field() {
        let mut doc = ManifestDocument::parse(MV3).unwrap();
        let loc = ManifestLocation::ContentScriptJs {
            script: 0,
            index: 0,
        };
        doc.set_path(&loc, "assets/content.1234abcd.js").unwrap();
        assert_eq!(doc.get_path(&loc), Some("assets/content.1234abcd.js"));
        assert_eq!(doc.content_scripts[0].css[0], "src/content.css");
    }

    #[test]
    fn set_path_unknown_location() {
        let mut doc = ManifestDocument::parse(MV3).unwrap();
        let err = doc
            .set_path(&ManifestLocation::BackgroundScript(0), "x.js")
            .unwrap_err();
        assert!(matches!(err, CrxError::UnknownLocation(_)));
    }

    #[test]
    fn not_an_object() {
        assert!(matches!(
            ManifestDocument::parse("[]"),
            Err(CrxError::MalformedManifest(_))
        ));
    }
}
