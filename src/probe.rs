//! Media probing via an external `ffprobe`-compatible binary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::platform;

#[derive(Error, Debug)]
pub enum ProbeError {
    /// No probe binary was found in `PATH`. Callers treat this as "no
    /// metadata available" rather than a per-file failure.
    #[error("ffprobe not available")]
    Unavailable,

    #[error("probe failed: {0}")]
    Failed(String),

    #[error("probe I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Format and stream metadata as reported by the probe. Nothing here is
/// trusted to be present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub format: HashMap<String, String>,
    pub streams: Vec<HashMap<String, String>>,
}

impl ProbeResult {
    pub fn bitrate(&self) -> Option<u64> {
        self.format.get("bit_rate")?.parse().ok()
    }

    pub fn duration(&self) -> Option<Duration> {
        let secs: f64 = self.format.get("duration")?.parse().ok()?;
        if !secs.is_finite() || secs < 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(secs))
    }

    /// `WxH` of the first video stream, if any.
    pub fn resolution(&self) -> Option<String> {
        for stream in &self.streams {
            if stream.get("codec_type").map(String::as_str) != Some("video") {
                continue;
            }
            if let (Some(w), Some(h)) = (stream.get("width"), stream.get("height")) {
                return Some(format!("{w}x{h}"));
            }
        }
        None
    }

    /// First match for a lowercased `tag:` key across the format section
    /// and then the streams in order.
    pub fn tag(&self, name: &str) -> Option<&str> {
        let key = format!("tag:{name}");
        std::iter::once(&self.format)
            .chain(self.streams.iter())
            .find_map(|m| m.get(&key).map(String::as_str))
    }
}

struct ProbeBinary {
    path: PathBuf,
    /// The older binary only understands `-of` for the output format flag.
    legacy: bool,
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&paths) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let exe = dir.join(format!("{name}.exe"));
            if exe.is_file() {
                return Some(exe);
            }
        }
    }
    None
}

fn probe_binary() -> Option<&'static ProbeBinary> {
    static BINARY: OnceLock<Option<ProbeBinary>> = OnceLock::new();
    BINARY
        .get_or_init(|| {
            if let Some(path) = find_in_path("ffprobe") {
                return Some(ProbeBinary {
                    path,
                    legacy: false,
                });
            }
            if let Some(path) = find_in_path("avprobe") {
                return Some(ProbeBinary { path, legacy: true });
            }
            debug!("neither ffprobe nor avprobe found in PATH");
            None
        })
        .as_ref()
}

fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Flattens a probe JSON section into a string map; nested `tags` objects
/// become lowercased `tag:<name>` entries.
fn flatten_section(section: &serde_json::Map<String, serde_json::Value>) -> HashMap<String, String> {
    let mut out = HashMap::with_capacity(section.len());
    for (key, value) in section {
        match value {
            serde_json::Value::Object(tags) if key == "tags" => {
                for (name, tag_value) in tags {
                    out.insert(
                        format!("tag:{}", name.to_lowercase()),
                        stringify(tag_value),
                    );
                }
            }
            _ => {
                out.insert(key.clone(), stringify(value));
            }
        }
    }
    out
}

fn parse_probe_output(stdout: &[u8]) -> Result<ProbeResult, ProbeError> {
    #[derive(Deserialize)]
    struct RawOutput {
        #[serde(default)]
        format: serde_json::Map<String, serde_json::Value>,
        #[serde(default)]
        streams: Vec<serde_json::Map<String, serde_json::Value>>,
    }

    let raw: RawOutput = serde_json::from_slice(stdout)
        .map_err(|e| ProbeError::Failed(format!("undecodable probe output: {e}")))?;
    Ok(ProbeResult {
        format: flatten_section(&raw.format),
        streams: raw.streams.iter().map(flatten_section).collect(),
    })
}

fn last_stderr_line(stderr: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(stderr);
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_owned)
}

/// Runs the probe over `path` and decodes its JSON output. The child is
/// always waited on, including when decoding fails.
pub async fn probe(path: &Path) -> Result<ProbeResult, ProbeError> {
    let binary = probe_binary().ok_or(ProbeError::Unavailable)?;
    let format_flag = if binary.legacy { "-of" } else { "-print_format" };

    let mut cmd = tokio::process::Command::new(&binary.path);
    cmd.arg("-loglevel")
        .arg("error")
        .arg("-show_format")
        .arg("-show_streams")
        .arg(format_flag)
        .arg("json")
        .arg(path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    platform::hide_child_window(&mut cmd);

    // `output` collects both pipes and waits for exit on every path.
    let output = cmd.output().await?;
    if !output.status.success() {
        let mut msg = format!("probe exited with {}", output.status);
        if let Some(line) = last_stderr_line(&output.stderr) {
            msg = format!("{msg}: {line}");
        }
        return Err(ProbeError::Failed(msg));
    }
    match parse_probe_output(&output.stdout) {
        Ok(result) => Ok(result),
        Err(e) => {
            if let Some(line) = last_stderr_line(&output.stderr) {
                return Err(ProbeError::Failed(format!("{e}: {line}")));
            }
            Err(e)
        }
    }
}
