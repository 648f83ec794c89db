//! Small platform shims: hidden-file detection and child process window
//! suppression.

/// Whether a directory entry counts as hidden. On POSIX this is the
/// leading-dot convention; on Windows the hidden file attribute.
#[cfg(not(windows))]
pub fn is_hidden(name: &str, _meta: &std::fs::Metadata) -> bool {
    name.starts_with('.')
}

#[cfg(windows)]
pub fn is_hidden(name: &str, meta: &std::fs::Metadata) -> bool {
    use std::os::windows::fs::MetadataExt;
    use windows::Win32::Storage::FileSystem::FILE_ATTRIBUTE_HIDDEN;

    name.starts_with('.') || meta.file_attributes() & FILE_ATTRIBUTE_HIDDEN.0 != 0
}

/// Keeps spawned children from popping up a console window on hosts that
/// would otherwise do so.
#[cfg(windows)]
pub fn hide_child_window(cmd: &mut tokio::process::Command) {
    use windows::Win32::System::Threading::CREATE_NO_WINDOW;

    cmd.creation_flags(CREATE_NO_WINDOW.0);
}

#[cfg(not(windows))]
pub fn hide_child_window(_cmd: &mut tokio::process::Command) {}

/// The platform shell used to run dynamic stream commands.
pub fn shell_command(command_line: &str) -> tokio::process::Command {
    #[cfg(windows)]
    {
        let mut cmd = tokio::process::Command::new("cmd");
        cmd.arg("/C").arg(command_line);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command_line);
        cmd
    }
}
