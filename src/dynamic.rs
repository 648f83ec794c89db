//! Dynamic stream descriptors.
//!
//! A `<name>.dms.json` file describes one logical item whose resources are
//! produced on demand by external commands. When enabled, these files
//! surface in the directory as items instead of raw JSON files.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// File name suffix that marks a dynamic stream descriptor.
pub const DESCRIPTOR_SUFFIX: &str = ".dms.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicStream {
    /// Display title; defaults to the descriptor base name.
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub resources: Vec<DynamicResource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicResource {
    pub mime_type: String,
    #[serde(default)]
    pub dlna_profile: Option<String>,
    #[serde(default)]
    pub bitrate: Option<u64>,
    #[serde(default)]
    pub resolution: Option<String>,
    /// Duration in seconds.
    #[serde(default)]
    pub duration: Option<f64>,
    /// Shell command producing the stream on stdout.
    pub command: String,
}

/// Whether the path names a dynamic stream descriptor.
pub fn is_descriptor(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(DESCRIPTOR_SUFFIX) && n.len() > DESCRIPTOR_SUFFIX.len())
        .unwrap_or(false)
}

/// The display title for a descriptor path: its base name without the
/// suffix.
pub fn title_from_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    name.strip_suffix(DESCRIPTOR_SUFFIX).map(str::to_owned)
}

pub fn load(path: &Path) -> Result<DynamicStream> {
    let data = std::fs::read(path)
        .with_context(|| format!("reading dynamic stream descriptor {}", path.display()))?;
    serde_json::from_slice(&data)
        .with_context(|| format!("parsing dynamic stream descriptor {}", path.display()))
}
