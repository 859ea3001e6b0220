//! Entry keys and in-container path conventions.
//!
//! - primary entries: key `{role}_{n}`, path `assets/{key}.{ext}`
//! - proxies: key `{primary}_proxy`, path `assets/{primary}_proxy.{ext}`
//! - source files: `sources/{sanitized}[_{n}].{ext}`
//! - thumbnail: `preview.{ext}`; screenshots: `screenshots/screenshot_{n}.{ext}`

use std::collections::HashSet;

use super::Role;

pub const PROXY_SUFFIX: &str = "_proxy";
pub const ASSETS_DIR: &str = "assets";
pub const SOURCES_DIR: &str = "sources";
pub const SCREENSHOTS_DIR: &str = "screenshots";
pub const IMAGES_DIR: &str = "images";

/// Key of the `n`th primary entry of `role`.
pub fn primary_key(role: Role, n: usize) -> String {
    format!("{role}_{n}")
}

pub fn proxy_key(primary_key: &str) -> String {
    format!("{primary_key}{PROXY_SUFFIX}")
}

/// Index `n` of a `{role}_{n}` key, or `None` when the key does not follow the pattern.
pub fn key_index(role: Role, key: &str) -> Option<usize> {
    key.strip_prefix(role.as_str())?
        .strip_prefix('_')?
        .parse()
        .ok()
}

fn with_ext(base: String, ext: Option<&str>) -> String {
    match ext {
        Some(ext) if !ext.is_empty() => format!("{base}.{ext}"),
        _ => base,
    }
}

pub fn asset_path(key: &str, ext: Option<&str>) -> String {
    with_ext(format!("{ASSETS_DIR}/{key}"), ext)
}

pub fn thumbnail_path(ext: Option<&str>) -> String {
    with_ext("preview".to_string(), ext)
}

pub fn screenshot_path(n: usize, ext: Option<&str>) -> String {
    with_ext(format!("{SCREENSHOTS_DIR}/screenshot_{n}"), ext)
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')
}

/// Replace disallowed characters with `_` and collapse runs of `_`.
///
/// Idempotent: the output contains only allowed characters and no `__`.
pub fn sanitize_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let c = if is_allowed(c) { c } else { '_' };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    if out.is_empty() {
        out.push_str("file");
    }
    out
}

/// Hands out unique `sources/...` paths in insertion order.
#[derive(Debug, Default, Clone)]
pub struct SourceNameAllocator {
    used: HashSet<String>,
}

impl SourceNameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sanitize `original` and suffix `_1`, `_2`, … before the extension until unused.
    pub fn allocate(&mut self, original: &str) -> String {
        let clean = sanitize_file_name(original);
        let (stem, ext) = match clean.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
            _ => (clean.clone(), None),
        };
        let mut candidate = clean;
        let mut n = 0usize;
        while self.used.contains(&candidate) {
            n += 1;
            candidate = with_ext(format!("{stem}_{n}"), ext.as_deref());
        }
        self.used.insert(candidate.clone());
        format!("{SOURCES_DIR}/{candidate}")
    }

    pub fn clear(&mut self) {
        self.used.clear();
    }
}
