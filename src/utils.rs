//! Utility functions shared by the build layer.
//!
//! - Virtual module ID construction and parsing
//! - Placeholder tokens for not-yet-emitted script URLs
//! - Source path normalization
//! - Output file naming
//! - JS string escaping (injection-safe)

use std::path::Path;

use regex::Regex;

use crate::{CrxError, ExecutionWorld};

// ---------------------------------------------------------------------------
// Virtual Module IDs
// ---------------------------------------------------------------------------

/// Prefix for all crate-owned virtual modules.
/// The `\0` prefix prevents filesystem resolution collisions.
pub const VIRTUAL_PREFIX: &str = "\0crx:";

const DYNAMIC_SCRIPT_PREFIX: &str = "\0crx:dynamic-script:";

/// Virtual module ID for a `?script` import of `path` in `world`.
pub fn dynamic_script_virtual_id(world: ExecutionWorld, path: &str) -> String {
    format!("{}{}/{}", DYNAMIC_SCRIPT_PREFIX, world.as_str(), path)
}

/// Split a dynamic-script virtual ID back into world and path.
pub fn parse_dynamic_script_virtual_id(id: &str) -> Option<(ExecutionWorld, &str)> {
    let rest = id.strip_prefix(DYNAMIC_SCRIPT_PREFIX)?;
    let (world, path) = rest.split_once('/')?;
    let world = match world {
        "main" => ExecutionWorld::Main,
        "isolated" => ExecutionWorld::Isolated,
        _ => return None,
    };
    Some((world, path))
}

pub fn is_virtual(id: &str) -> bool {
    id.starts_with(VIRTUAL_PREFIX)
}

/// Reject user-space imports that reach into the `\0crx:` namespace.
pub fn reject_internal_specifier(importer: &str, specifier: &str) -> Result<(), CrxError> {
    if specifier.starts_with('\0')
        || specifier.contains("\\0crx:")
        || specifier.contains("%00crx:")
    {
        return Err(CrxError::InvalidScriptImport {
            importer: importer.to_string(),
            specifier: specifier.escape_default().to_string(),
            reason: "the \\0crx: namespace is reserved".into(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Placeholders
// ---------------------------------------------------------------------------

/// Shape of every script placeholder, for leftover detection.
pub const PLACEHOLDER_PATTERN: &str = r"__CRX_SCRIPT_[0-9a-f]{8}__";

/// Opaque token standing in for the runtime URL of a script whose output
/// name is not known yet.
pub fn script_placeholder(logical_id: &str) -> String {
    format!("__CRX_SCRIPT_{}__", stable_hash_8(logical_id))
}

/// Every placeholder still present in `code`.
pub fn find_placeholders(code: &str) -> Result<Vec<String>, CrxError> {
    let re = compile_regex(PLACEHOLDER_PATTERN)?;
    Ok(re.find_iter(code).map(|m| m.as_str().to_string()).collect())
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Deterministic 8-hex-digit content hash.
pub fn stable_hash_8(content: &str) -> String {
    stable_hash_8_bytes(content.as_bytes())
}

pub fn stable_hash_8_bytes(content: &[u8]) -> String {
    let mut hash: i32 = 0;
    for byte in content {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(*byte as i32);
    }
    let normalized = hash.wrapping_abs() as u32;
    format!("{normalized:08x}")
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Normalize a manifest or import path to the root-relative form used as a
/// key everywhere in the crate: forward slashes, no `./`, no leading `/`.
pub fn normalize_source_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let trimmed = unified.trim_start_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    let cleaned = path_clean::clean(Path::new(trimmed));
    let cleaned = cleaned.to_string_lossy().replace('\\', "/");
    if cleaned == "." {
        String::new()
    } else {
        cleaned
    }
}

/// Resolve `specifier` against the file that imports it.
/// Specifiers starting with `/` are root-relative.
pub fn join_specifier(importer: &str, specifier: &str) -> String {
    if specifier.starts_with('/') {
        return normalize_source_path(specifier);
    }
    let dir = match importer.rfind('/') {
        Some(idx) => &importer[..idx],
        None => "",
    };
    if dir.is_empty() {
        normalize_source_path(specifier)
    } else {
        normalize_source_path(&format!("{}/{}", dir, specifier))
    }
}

/// Relative (`./`, `../`) or root-relative (`/`) specifiers. Everything else
/// is a package import owned by the bundler.
pub fn is_path_specifier(specifier: &str) -> bool {
    specifier.starts_with("./") || specifier.starts_with("../") || specifier.starts_with('/')
}

/// Split `path?query`.
pub fn split_query(specifier: &str) -> (&str, Option<&str>) {
    match specifier.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (specifier, None),
    }
}

/// Manifest values that are match globs rather than file paths.
pub fn is_glob_pattern(path: &str) -> bool {
    path.contains('*') || path.contains('<')
}

/// Lower-cased extension of `path`, empty if none.
pub fn extension_of(path: &str) -> String {
    Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

pub fn is_script_path(path: &str) -> bool {
    matches!(
        extension_of(path).as_str(),
        "js" | "mjs" | "cjs" | "ts" | "mts" | "tsx" | "jsx"
    )
}

pub fn is_style_path(path: &str) -> bool {
    matches!(
        extension_of(path).as_str(),
        "css" | "scss" | "sass" | "less"
    )
}

pub fn is_html_path(path: &str) -> bool {
    matches!(extension_of(path).as_str(), "html" | "htm")
}

/// Extension a source file has once bundled.
pub fn output_extension(path: &str) -> String {
    let ext = extension_of(path);
    match ext.as_str() {
        "ts" | "mts" | "tsx" | "jsx" | "mjs" | "cjs" => "js".into(),
        "scss" | "sass" | "less" => "css".into(),
        "htm" => "html".into(),
        _ => ext,
    }
}

/// `assets/<stem>.<hash8>.<ext>` for a bundled file.
pub fn hashed_file_name(source_path: &str, content: &[u8]) -> String {
    asset_name(source_path, None, content)
}

/// `assets/<stem>.<variant>.<hash8>.<ext>`, for a source emitted once per
/// variant (a dynamic script per execution world).
pub fn hashed_variant_file_name(source_path: &str, variant: &str, content: &[u8]) -> String {
    asset_name(source_path, Some(variant), content)
}

fn asset_name(source_path: &str, variant: Option<&str>, content: &[u8]) -> String {
    let mut name = Path::new(source_path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "asset".into());
    if let Some(variant) = variant {
        name.push('.');
        name.push_str(variant);
    }
    let ext = output_extension(source_path);
    let hash = stable_hash_8_bytes(content);
    if ext.is_empty() {
        format!("assets/{}.{}", name, hash)
    } else {
        format!("assets/{}.{}.{}", name, hash, ext)
    }
}

// ---------------------------------------------------------------------------
// JS String Escaping
// ---------------------------------------------------------------------------

/// Escape a string for safe embedding inside a JS double-quoted string literal.
pub fn escape_js_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 16);
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Regex
// ---------------------------------------------------------------------------

pub(crate) fn compile_regex(pattern: &str) -> Result<Regex, CrxError> {
    Regex::new(pattern)
        .map_err(|e| CrxError::BundlerError(format!("failed to compile pattern: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
