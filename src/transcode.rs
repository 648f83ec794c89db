//! Transcode profiles and the child processes that implement them.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::platform;

/// A fixed transcode target offered to renderers.
#[derive(Debug, Clone, Copy)]
pub struct TranscodeSpec {
    /// Key used in `/res?transcode=<key>` URLs and log directories.
    pub key: &'static str,
    pub mime_type: &'static str,
    pub dlna_profile: Option<&'static str>,
    /// Encoder arguments appended after the input; the output container
    /// must stream to a pipe.
    output_args: &'static [&'static str],
}

/// The fixed profile catalogue.
pub const TRANSCODES: &[TranscodeSpec] = &[
    TranscodeSpec {
        key: "t",
        mime_type: "video/mpeg",
        dlna_profile: Some("MPEG_PS_PAL"),
        output_args: &["-target", "pal-dvd", "-f", "mpegts"],
    },
    TranscodeSpec {
        key: "vp8",
        mime_type: "video/webm",
        dlna_profile: None,
        output_args: &[
            "-c:v", "libvpx", "-crf", "10", "-b:v", "2M", "-c:a", "libvorbis", "-f", "webm",
        ],
    },
    TranscodeSpec {
        key: "chromecast",
        mime_type: "video/x-matroska",
        dlna_profile: None,
        output_args: &[
            "-c:v", "libx264", "-preset", "ultrafast", "-c:a", "aac", "-f", "matroska",
        ],
    },
];

pub fn lookup(key: &str) -> Option<&'static TranscodeSpec> {
    TRANSCODES.iter().find(|spec| spec.key == key)
}

/// The profiles to advertise, honouring a forced profile selection.
pub fn advertised(force: Option<&str>) -> Vec<&'static TranscodeSpec> {
    match force {
        Some(key) => lookup(key).into_iter().collect(),
        None => TRANSCODES.iter().collect(),
    }
}

/// Expands the transcode log pattern: `%p` is the profile key, `%b` the
/// media base name.
pub fn log_path(pattern: &str, profile: &str, media_path: &Path) -> PathBuf {
    let base = media_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "stream".to_string());
    PathBuf::from(pattern.replace("%p", profile).replace("%b", &base))
}

fn format_seconds(d: Duration) -> String {
    format!("{:.3}", d.as_secs_f64())
}

impl TranscodeSpec {
    /// Builds the transcoder command for a time slice of the input.
    pub fn command(&self, path: &Path, start: Duration, length: Option<Duration>) -> Command {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-threads")
            .arg(num_cpus::get().to_string())
            .arg("-async")
            .arg("1");
        if !start.is_zero() {
            cmd.arg("-ss").arg(format_seconds(start));
        }
        if let Some(length) = length {
            cmd.arg("-t").arg(format_seconds(length));
        }
        cmd.arg("-i").arg(path);
        cmd.args(self.output_args);
        cmd.arg("pipe:");
        cmd
    }

    /// Starts the transcoder; stdout carries the stream, stderr goes to a
    /// per-session log file derived from `log_pattern`.
    pub fn spawn(
        &self,
        path: &Path,
        start: Duration,
        length: Option<Duration>,
        log_pattern: &str,
    ) -> Result<Child> {
        let mut cmd = self.command(path, start, length);
        cmd.stdin(Stdio::null()).stdout(Stdio::piped());

        let log_path = log_path(log_pattern, self.key, path);
        match open_log(&log_path) {
            Ok(file) => {
                info!(log = %log_path.display(), profile = self.key, "logging transcode");
                cmd.stderr(Stdio::from(file));
            }
            Err(e) => {
                debug!(log = %log_path.display(), "couldn't create transcode log: {e}");
                cmd.stderr(Stdio::null());
            }
        }

        platform::hide_child_window(&mut cmd);
        cmd.kill_on_drop(true);
        cmd.spawn()
            .with_context(|| format!("starting transcoder for {}", path.display()))
    }
}

fn open_log(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::File::create(path)
}

/// Starts a dynamic stream command, stdout piped.
pub fn spawn_dynamic(command_line: &str) -> Result<Child> {
    let mut cmd = platform::shell_command(command_line);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    platform::hide_child_window(&mut cmd);
    cmd.kill_on_drop(true);
    cmd.spawn()
        .with_context(|| format!("starting dynamic stream command {command_line:?}"))
}
