//! Allow-list validation for path-like parameters.
//!
//! Both candidates and allowed prefixes are resolved to a canonical absolute
//! form before comparison. Resolution walks the path one component at a time
//! and canonicalizes every prefix that exists, so a symlink is followed
//! before any `..` after it is applied, exactly as the kernel does. Parts
//! that do not exist yet are appended lexically. Symlinks that cannot be
//! resolved (dangling or looping) make the whole path unresolvable.
//! Comparison is component-wise, so `/tmpfoo` is not under `/tmp`.

use crate::error::CoreError;
use serde_json::{Map, Value};
use std::path::{Component, Path, PathBuf};

/// File extensions that mark a string as a path even without a `/`.
pub const PATH_EXTENSIONS: &[&str] = &[".tif", ".tiff", ".gpkg", ".shp", ".geojson", ".csv"];

/// Validates filesystem paths against a fixed set of allowed prefixes.
#[derive(Debug, Clone)]
pub struct PathGuard {
    prefixes: Vec<PathBuf>,
}

impl PathGuard {
    /// Resolve the allow-list once; prefixes that fail to resolve are dropped.
    pub fn new<I, P>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let prefixes = prefixes
            .into_iter()
            .filter_map(|p| {
                let p = p.as_ref();
                match resolve(p) {
                    Some(resolved) => Some(resolved),
                    None => {
                        tracing::warn!(path = %p.display(), "Ignoring unresolvable allow-list entry");
                        None
                    }
                }
            })
            .collect::<Vec<_>>();
        tracing::debug!(prefixes = ?prefixes, "Path guard configured");
        Self { prefixes }
    }

    /// The resolved allow-list.
    pub fn prefixes(&self) -> &[PathBuf] {
        &self.prefixes
    }

    /// Check whether `path` resolves under one of the allowed prefixes.
    pub fn allowed(&self, path: &str) -> bool {
        if path.is_empty() || path.contains('\0') {
            return false;
        }
        match resolve(Path::new(path)) {
            Some(resolved) => self.prefixes.iter().any(|p| resolved.starts_with(p)),
            None => false,
        }
    }

    /// Return the first path-like string in `params` that is not allowed.
    ///
    /// Nested arrays and objects are searched too.
    pub fn first_disallowed<'a>(&self, params: &'a Map<String, Value>) -> Option<&'a str> {
        params.values().find_map(|v| self.scan(v))
    }

    /// Fail with [`CoreError::PathNotAllowed`] if any parameter is rejected.
    pub fn check(&self, params: &Map<String, Value>) -> Result<(), CoreError> {
        match self.first_disallowed(params) {
            Some(path) => {
                tracing::warn!(path = %path, "Rejected path parameter");
                Err(CoreError::PathNotAllowed(path.to_string()))
            }
            None => Ok(()),
        }
    }

    fn scan<'a>(&self, value: &'a Value) -> Option<&'a str> {
        match value {
            Value::String(s) if looks_like_path(s) && !self.allowed(s) => Some(s),
            Value::Array(items) => items.iter().find_map(|v| self.scan(v)),
            Value::Object(map) => map.values().find_map(|v| self.scan(v)),
            _ => None,
        }
    }
}

/// Heuristic used to decide which string parameters are paths.
pub fn looks_like_path(value: &str) -> bool {
    if value.contains('/') {
        return true;
    }
    let lower = value.to_ascii_lowercase();
    PATH_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Resolve `path` to a canonical absolute form, tolerating nonexistent tails.
fn resolve(path: &Path) -> Option<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };

    // `resolved` never ends in an unresolved symlink, so `..` can pop it.
    let mut resolved = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::Prefix(p) => resolved.push(p.as_os_str()),
            Component::RootDir => resolved.push(Component::RootDir),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(part) => {
                resolved.push(part);
                match resolved.canonicalize() {
                    Ok(canonical) => resolved = canonical,
                    Err(_) if is_symlink(&resolved) => return None,
                    Err(_) => {}
                }
            }
        }
    }
    Some(resolved)
}

fn is_symlink(path: &Path) -> bool {
    path.symlink_metadata()
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
}
