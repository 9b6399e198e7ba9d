//! HTML Page References
//!
//! Extension pages pull in their code and styles through markup:
//! - `<script src="...">` for page scripts
//! - `<link rel="stylesheet" href="...">` for styles
//! - `<img src="...">` and `<link rel="icon" href="...">` for images
//!
//! [`HtmlScanner`] finds these references so the resolver can seed them as
//! build entries, then rewrites them to the emitted file names once the
//! bundler is done. External URLs (`http:`, `https:`, `data:`, `//`) are
//! left alone.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;

use regex::Regex;

use crate::utils::{self, compile_regex};
use crate::CrxError;

/// What a page reference loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HtmlReferenceKind {
    Script,
    Stylesheet,
    Image,
}

impl fmt::Display for HtmlReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HtmlReferenceKind::Script => "script",
            HtmlReferenceKind::Stylesheet => "stylesheet",
            HtmlReferenceKind::Image => "image",
        };
        f.write_str(s)
    }
}

/// A local file referenced from a page, with its attribute value verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtmlReference {
    pub kind: HtmlReferenceKind,
    pub value: String,
}

impl HtmlReference {
    /// Root-relative source path of the reference, resolved against `page`.
    pub fn source_path(&self, page: &str) -> String {
        let (path, _) = utils::split_query(&self.value);
        let path = path.split('#').next().unwrap_or(path);
        utils::join_specifier(page, path)
    }
}

/// An attribute value found inside a tag, located in the page source.
struct AttributeSite {
    kind: HtmlReferenceKind,
    value: String,
    span: Range<usize>,
}

/// Regex scanner for page references.
#[derive(Debug, Clone)]
pub struct HtmlScanner {
    tag: Regex,
    attribute: Regex,
}

impl HtmlScanner {
    pub fn new() -> Result<Self, CrxError> {
        Ok(Self {
            tag: compile_regex(r"(?is)<(script|link|img)\b[^>]*>")?,
            attribute: compile_regex(
                r#"(?i)\s([a-z-]+)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>"']+))"#,
            )?,
        })
    }

    /// Local references in `html`, in source order. The same value is
    /// reported once.
    pub fn scan(&self, html: &str) -> Vec<HtmlReference> {
        let mut seen = Vec::new();
        self.sites(html)
            .into_iter()
            .filter(|site| {
                let key = (site.kind, site.value.clone());
                if seen.contains(&key) {
                    return false;
                }
                seen.push(key);
                true
            })
            .map(|site| HtmlReference {
                kind: site.kind,
                value: site.value,
            })
            .collect()
    }

    /// Replace every reference whose value is a key of `urls`. Attribute
    /// quoting is kept; unquoted values gain double quotes.
    pub fn rewrite(&self, html: &str, urls: &HashMap<String, String>) -> String {
        let mut out = String::with_capacity(html.len());
        let mut last = 0;
        for site in self.sites(html) {
            let Some(url) = urls.get(&site.value) else {
                continue;
            };
            out.push_str(&html[last..site.span.start]);
            let before = site.span.start.checked_sub(1).and_then(|i| html.as_bytes().get(i));
            if matches!(before, Some(b'"' | b'\'')) {
                out.push_str(url);
            } else {
                out.push('"');
                out.push_str(url);
                out.push('"');
            }
            last = site.span.end;
        }
        out.push_str(&html[last..]);
        out
    }

    fn sites(&self, html: &str) -> Vec<AttributeSite> {
        let mut sites = Vec::new();
        for tag in self.tag.captures_iter(html) {
            let (Some(whole), Some(name)) = (tag.get(0), tag.get(1)) else {
                continue;
            };
            let name = name.as_str().to_ascii_lowercase();

            let mut rel = None;
            let mut target = None;
            for attr in self.attribute.captures_iter(whole.as_str()) {
                let Some(attr_name) = attr.get(1) else {
                    continue;
                };
                let Some(value) = attr.get(2).or(attr.get(3)).or(attr.get(4)) else {
                    continue;
                };
                match attr_name.as_str().to_ascii_lowercase().as_str() {
                    "rel" => rel = Some(value.as_str().to_ascii_lowercase()),
                    "src" if name != "link" => target = Some(value),
                    "href" if name == "link" => target = Some(value),
                    _ => {}
                }
            }

            let kind = match (name.as_str(), rel.as_deref()) {
                ("script", _) => HtmlReferenceKind::Script,
                ("img", _) => HtmlReferenceKind::Image,
                ("link", Some("stylesheet")) => HtmlReferenceKind::Stylesheet,
                ("link", Some("icon" | "shortcut icon")) => HtmlReferenceKind::Image,
                _ => continue,
            };
            let Some(value) = target else {
                continue;
            };
            if is_external(value.as_str()) {
                continue;
            }
            let offset = whole.start();
            sites.push(AttributeSite {
                kind,
                value: value.as_str().to_string(),
                span: offset + value.start()..offset + value.end(),
            });
        }
        sites
    }
}

fn is_external(value: &str) -> bool {
    let lower = value.trim().to_ascii_lowercase();
    lower.is_empty()
        || lower.starts_with("//")
        || ["http:", "https:", "data:", "blob:", "chrome-extension:", "moz-extension:"]
            .iter()
            .any(|scheme| lower.starts_with(scheme))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<!doctype html>
<html>
<head>
  <link rel="stylesheet" href="./popup.css">
  <link rel="icon" href='../icons/16.png'>
  <link rel="preconnect" href="./ignored.css">
  <script src="https://cdn.example.com/lib.js"></script>
</head>
<body>
  <img src=logo.png alt="logo">
  <img src="data:image/png;base64,AAAA">
  <script type="module" src="./popup.ts"></script>
  <script src="./popup.ts"></script>
  <script>console.log("inline")</script>
</body>
</html>"#;

    #[test]
    fn finds_local_references_in_source_order() {
        let scanner = HtmlScanner::new().unwrap();
        let found: Vec<(HtmlReferenceKind, String)> = scanner
            .scan(PAGE)
            .into_iter()
            .map(|r| (r.kind, r.value))
            .collect();
        assert_eq!(
            found,
            vec![
                (HtmlReferenceKind::Stylesheet, "./popup.css".to_string()),
                (HtmlReferenceKind::Image, "../icons/16.png".to_string()),
                (HtmlReferenceKind::Image, "logo.png".to_string()),
                (HtmlReferenceKind::Script, "./popup.ts".to_string()),
            ]
        );
    }

    #[test]
    fn references_resolve_against_the_page() {
        let reference = HtmlReference {
            kind: HtmlReferenceKind::Script,
            value: "../src/popup.ts?v=1".into(),
        };
        assert_eq!(reference.source_path("pages/popup.html"), "src/popup.ts");

        let rooted = HtmlReference {
            kind: HtmlReferenceKind::Image,
            value: "/icons/16.png#x".into(),
        };
        assert_eq!(rooted.source_path("pages/popup.html"), "icons/16.png");
    }

    #[test]
    fn rewrite_replaces_every_occurrence_and_keeps_quotes() {
        let scanner = HtmlScanner::new().unwrap();
        let urls = HashMap::from([
            ("./popup.ts".to_string(), "/assets/popup.1a2b3c4d.js".to_string()),
            ("logo.png".to_string(), "/assets/logo.5e6f7a8b.png".to_string()),
            ("../icons/16.png".to_string(), "/assets/16.9c0d1e2f.png".to_string()),
        ]);
        let out = scanner.rewrite(PAGE, &urls);

        assert_eq!(out.matches(r#"src="/assets/popup.1a2b3c4d.js""#).count(), 2);
        assert!(out.contains(r#"<img src="/assets/logo.5e6f7a8b.png" alt="logo">"#));
        assert!(out.contains(r#"<link rel="icon" href='/assets/16.9c0d1e2f.png'>"#));
        assert!(out.contains(r#"href="./popup.css""#));
        assert!(out.contains("https://cdn.example.com/lib.js"));
    }
}
