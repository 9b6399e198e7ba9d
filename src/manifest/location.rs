//! Pointers back into a [`ManifestDocument`](super::ManifestDocument).

use std::fmt;

/// An HTML entry point declared by the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PageSlot {
    /// `action.default_popup` (or the MV2 `browser_action` / `page_action`).
    ActionPopup,
    OptionsPage,
    /// `options_ui.page`
    OptionsUi,
    DevtoolsPage,
    /// `side_panel.default_path`
    SidePanel,
    /// `chrome_url_overrides.<key>`
    Override(String),
}

/// Exactly one path-bearing field of the manifest.
///
/// Locations are indices into the document they were enumerated from;
/// they stay valid as long as no array the location points into is
/// reordered or shrunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ManifestLocation {
    /// `background.service_worker` (MV3)
    ServiceWorker,
    /// `background.scripts[i]` (MV2)
    BackgroundScript(usize),
    /// `background.page` (MV2)
    BackgroundPage,
    /// `content_scripts[script].js[index]`
    ContentScriptJs { script: usize, index: usize },
    /// `content_scripts[script].css[index]`
    ContentScriptCss { script: usize, index: usize },
    Page(PageSlot),
    /// `web_accessible_resources[i]` (MV2 flat list)
    WebAccessiblePath(usize),
    /// `web_accessible_resources[entry].resources[index]` (MV3)
    WebAccessibleResource { entry: usize, index: usize },
    /// `icons.<size>`
    Icon(String),
    /// `action.default_icon`; `None` for the single-string form.
    ActionIcon(Option<String>),
    /// `declarative_net_request.rule_resources[i].path`
    RuleResource(usize),
}

impl ManifestLocation {
    pub fn is_background(&self) -> bool {
        matches!(
            self,
            ManifestLocation::ServiceWorker
                | ManifestLocation::BackgroundScript(_)
                | ManifestLocation::BackgroundPage
        )
    }
}

impl fmt::Display for PageSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageSlot::ActionPopup => f.write_str("action.default_popup"),
            PageSlot::OptionsPage => f.write_str("options_page"),
            PageSlot::OptionsUi => f.write_str("options_ui.page"),
            PageSlot::DevtoolsPage => f.write_str("devtools_page"),
            PageSlot::SidePanel => f.write_str("side_panel.default_path"),
            PageSlot::Override(key) => write!(f, "chrome_url_overrides.{}", key),
        }
    }
}

impl fmt::Display for ManifestLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestLocation::ServiceWorker => f.write_str("background.service_worker"),
            ManifestLocation::BackgroundScript(i) => write!(f, "background.scripts[{}]", i),
            ManifestLocation::BackgroundPage => f.write_str("background.page"),
            ManifestLocation::ContentScriptJs { script, index } => {
                write!(f, "content_scripts[{}].js[{}]", script, index)
            }
            ManifestLocation::ContentScriptCss { script, index } => {
                write!(f, "content_scripts[{}].css[{}]", script, index)
            }
            ManifestLocation::Page(slot) => slot.fmt(f),
            ManifestLocation::WebAccessiblePath(i) => write!(f, "web_accessible_resources[{}]", i),
            ManifestLocation::WebAccessibleResource { entry, index } => {
                write!(f, "web_accessible_resources[{}].resources[{}]", entry, index)
            }
            ManifestLocation::Icon(size) => write!(f, "icons.{}", size),
            ManifestLocation::ActionIcon(None) => f.write_str("action.default_icon"),
            ManifestLocation::ActionIcon(Some(size)) => write!(f, "action.default_icon.{}", size),
            ManifestLocation::RuleResource(i) => {
                write!(f, "declarative_net_request.rule_resources[{}].path", i)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_json_path_like() {
        assert_eq!(
            ManifestLocation::ContentScriptJs {
                script: 1,
                index: 0
            }
            .to_string(),
            "content_scripts[1].js[0]"
        );
        assert_eq!(
            ManifestLocation::Page(PageSlot::Override("newtab".into())).to_string(),
            "chrome_url_overrides.newtab"
        );
        assert_eq!(
            ManifestLocation::WebAccessibleResource { entry: 2, index: 3 }.to_string(),
            "web_accessible_resources[2].resources[3]"
        );
    }

    #[test]
    fn background_locations() {
        assert!(ManifestLocation::ServiceWorker.is_background());
        assert!(ManifestLocation::BackgroundScript(0).is_background());
        assert!(!ManifestLocation::Icon("16".into()).is_background());
    }
}
