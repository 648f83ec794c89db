//! The content directory object model: a stable bijection between
//! filesystem paths under the served root and UPnP ObjectIDs, plus the
//! directory enumeration and filtering rules.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use url::form_urlencoded;

use crate::dynamic;
use crate::mime::{self, Mime};
use crate::platform;

/// ObjectID of the served root.
pub const ROOT_OBJECT_ID: &str = "0";
/// Synthetic parent of the root object.
pub const ROOT_PARENT_OBJECT_ID: &str = "-1";

/// Recursion ceiling for the interesting-descendant walk.
const MAX_DESCENT: usize = 32;

#[derive(Error, Debug)]
#[error("bad ObjectID: {0}")]
pub struct BadObjectId(pub String);

/// Cleans a slash-separated path: collapses repeats, resolves `.` and
/// `..` lexically. Rooted input stays rooted and never climbs above `/`.
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(last) if *last != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

pub fn query_escape(s: &str) -> String {
    form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

fn query_unescape(s: &str) -> Result<String, BadObjectId> {
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| BadObjectId(s.to_string()))?;
                out.push(hex);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| BadObjectId(s.to_string()))
}

/// A content directory object, identified by its cleaned rooted virtual
/// path; `/` is the served root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub path: String,
}

impl Object {
    pub fn root() -> Self {
        Self { path: "/".into() }
    }

    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    pub fn id(&self) -> String {
        if self.is_root() {
            return ROOT_OBJECT_ID.to_string();
        }
        query_escape(&self.path)
    }

    pub fn parent_id(&self) -> String {
        if self.is_root() {
            return ROOT_PARENT_OBJECT_ID.to_string();
        }
        let parent = match self.path.rsplit_once('/') {
            Some(("", _)) => "/".to_string(),
            Some((dir, _)) => dir.to_string(),
            None => "/".to_string(),
        };
        Object { path: parent }.id()
    }

    /// Base name of the object; the root has none.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or("")
    }
}

/// Decodes an ObjectID back into an object. Anything that does not decode
/// to a rooted path is rejected.
pub fn object_from_id(id: &str) -> Result<Object, BadObjectId> {
    let mut path = query_unescape(id)?;
    if path == ROOT_OBJECT_ID {
        path = "/".to_string();
    }
    let path = clean_path(&path);
    if !path.starts_with('/') {
        return Err(BadObjectId(id.to_string()));
    }
    Ok(Object { path })
}

/// Joins `given` onto `root` such that the result cannot escape the root:
/// the path is cleaned as a rooted string first, so `..` components are
/// resolved away before the join.
pub fn resolve_under_root(root: &Path, given: &str) -> PathBuf {
    let cleaned = clean_path(&format!("/{given}"));
    let mut out = root.to_path_buf();
    for comp in cleaned.split('/').filter(|c| !c.is_empty()) {
        out.push(comp);
    }
    out
}

/// Library filtering knobs, fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct FilterOptions {
    pub ignore_hidden: bool,
    pub ignore_unreadable: bool,
    pub ignore_paths: Vec<PathBuf>,
    pub allow_dynamic_streams: bool,
}

/// A directory entry that survived the of-interest filter.
#[derive(Debug, Clone)]
pub struct Entry {
    pub object: Object,
    pub name: String,
    pub fs_path: PathBuf,
    pub is_dir: bool,
    pub size: u64,
    pub mtime_ns: i64,
    pub mime: Option<Mime>,
    pub dynamic: bool,
}

/// Maps the served filesystem subtree to content directory objects.
pub struct ObjectModel {
    root: PathBuf,
    opts: FilterOptions,
}

fn mtime_ns(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

impl ObjectModel {
    pub fn new(root: PathBuf, opts: FilterOptions) -> Self {
        Self { root, opts }
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> &FilterOptions {
        &self.opts
    }

    /// The local filesystem path for an object.
    pub fn fs_path(&self, object: &Object) -> PathBuf {
        resolve_under_root(&self.root, &object.path)
    }

    fn is_ignored_path(&self, fs_path: &Path) -> bool {
        self.opts.ignore_paths.iter().any(|p| fs_path.starts_with(p))
    }

    fn is_readable(&self, fs_path: &Path, is_dir: bool) -> bool {
        if is_dir {
            std::fs::read_dir(fs_path).is_ok()
        } else {
            std::fs::File::open(fs_path).is_ok()
        }
    }

    fn passes_common_filters(&self, fs_path: &Path, name: &str, meta: &std::fs::Metadata) -> bool {
        if self.is_ignored_path(fs_path) {
            return false;
        }
        if self.opts.ignore_hidden && platform::is_hidden(name, meta) {
            return false;
        }
        if self.opts.ignore_unreadable && !self.is_readable(fs_path, meta.is_dir()) {
            return false;
        }
        true
    }

    /// Whether a directory holds at least one entry of interest, walking
    /// recursively but stopping at the first hit.
    fn has_interesting_descendant(&self, dir: &Path, depth: usize) -> bool {
        if depth >= MAX_DESCENT {
            return false;
        }
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), "readdir failed: {e}");
                return false;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let fs_path = entry.path();
            let Ok(meta) = std::fs::metadata(&fs_path) else {
                continue;
            };
            if !self.passes_common_filters(&fs_path, name, &meta) {
                continue;
            }
            if meta.is_dir() {
                if self.has_interesting_descendant(&fs_path, depth + 1) {
                    return true;
                }
            } else if meta.is_file() && self.file_is_interesting(&fs_path) {
                return true;
            }
        }
        false
    }

    fn file_is_interesting(&self, fs_path: &Path) -> bool {
        if self.opts.allow_dynamic_streams && dynamic::is_descriptor(fs_path) {
            return true;
        }
        mime::mime_type_by_path(fs_path)
            .map(|m| m.is_media())
            .unwrap_or(false)
    }

    /// Classifies one directory entry, returning `None` when it is not of
    /// interest.
    fn classify(&self, parent: &Object, name: &str) -> Option<Entry> {
        let child_path = clean_path(&format!("{}/{}", parent.path.trim_end_matches('/'), name));
        let object = Object { path: child_path };
        let fs_path = self.fs_path(&object);
        let meta = std::fs::metadata(&fs_path).ok()?;
        if !self.passes_common_filters(&fs_path, name, &meta) {
            return None;
        }
        if meta.is_dir() {
            if !self.has_interesting_descendant(&fs_path, 0) {
                return None;
            }
            return Some(Entry {
                object,
                name: name.to_string(),
                fs_path,
                is_dir: true,
                size: 0,
                mtime_ns: mtime_ns(&meta),
                mime: None,
                dynamic: false,
            });
        }
        if !meta.is_file() {
            return None;
        }
        let is_dynamic = self.opts.allow_dynamic_streams && dynamic::is_descriptor(&fs_path);
        let mime = mime::mime_type_by_path(&fs_path);
        if !is_dynamic && !mime.as_ref().map(Mime::is_media).unwrap_or(false) {
            return None;
        }
        Some(Entry {
            object,
            name: name.to_string(),
            fs_path,
            is_dir: false,
            size: meta.len(),
            mtime_ns: mtime_ns(&meta),
            mime,
            dynamic: is_dynamic,
        })
    }

    /// The entry for an object itself, for metadata browses. The root is
    /// always a container.
    pub fn entry(&self, object: &Object) -> std::io::Result<Option<Entry>> {
        let fs_path = self.fs_path(object);
        let meta = std::fs::metadata(&fs_path)?;
        if object.is_root() {
            return Ok(Some(Entry {
                object: object.clone(),
                name: String::new(),
                fs_path,
                is_dir: true,
                size: 0,
                mtime_ns: mtime_ns(&meta),
                mime: None,
                dynamic: false,
            }));
        }
        let parent = Object {
            path: match object.path.rsplit_once('/') {
                Some(("", _)) => "/".to_string(),
                Some((dir, _)) => dir.to_string(),
                None => "/".to_string(),
            },
        };
        Ok(self.classify(&parent, object.name()))
    }

    /// Enumerates and sorts a container's entries of interest. Folders
    /// come first unless `folders_last` is set; names compare
    /// case-insensitively.
    pub fn read_container(
        &self,
        object: &Object,
        folders_last: bool,
    ) -> std::io::Result<Vec<Entry>> {
        let dir = self.fs_path(object);
        let mut entries = Vec::new();
        for dirent in std::fs::read_dir(&dir)? {
            let dirent = match dirent {
                Ok(d) => d,
                Err(e) => {
                    debug!(dir = %dir.display(), "skipping unreadable entry: {e}");
                    continue;
                }
            };
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(entry) = self.classify(object, name) {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| {
            let rank = |e: &Entry| {
                if e.is_dir == folders_last {
                    1
                } else {
                    0
                }
            };
            rank(a)
                .cmp(&rank(b))
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        Ok(entries)
    }

    /// The number of entries of interest in a container. I/O errors count
    /// as an empty directory.
    pub fn child_count(&self, object: &Object) -> usize {
        let dir = self.fs_path(object);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), "readdir failed: {e}");
                return 0;
            }
        };
        entries
            .flatten()
            .filter(|d| {
                d.file_name()
                    .to_str()
                    .map(|name| self.classify(object, name).is_some())
                    .unwrap_or(false)
            })
            .count()
    }

    /// Short-circuits on the first entry of interest.
    pub fn has_children(&self, object: &Object) -> bool {
        let dir = self.fs_path(object);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return false;
        };
        entries.flatten().any(|d| {
            d.file_name()
                .to_str()
                .map(|name| self.classify(object, name).is_some())
                .unwrap_or(false)
        })
    }
}
