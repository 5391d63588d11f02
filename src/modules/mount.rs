//! Mount and unmount helpers.
//!
//! The controller never issues mount system calls itself. It hands requests
//! to a [`MountHelper`], which launches the platform's `mount` command and
//! later reports `(pid, exit status)` through an [`ExitNotifier`], and which
//! runs `umount` synchronously with a bounded wait.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Output, Stdio};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use super::config::Config;
use super::constants::NFS_FSTYPE;

/// Callback through which helper exits are reported: `(pid, exit status)`.
pub type ExitNotifier = Arc<dyn Fn(u32, i32) + Send + Sync>;

/// Everything a helper needs to mount one remote filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    /// Server hostname
    pub server: String,
    /// Exported path on the server
    pub source: String,
    /// Local directory to mount on
    pub mount_point: PathBuf,
    /// Mount options, joined with commas
    pub options: Vec<String>,
}

impl MountRequest {
    /// `server:path` in the form `mount` expects.
    pub fn remote(&self) -> String {
        format!("{}:{}", self.server, self.source)
    }
}

/// Result of a synchronous unmount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnmountOutcome {
    /// The filesystem is gone
    Unmounted,
    /// Something still uses the filesystem
    Busy,
    /// The helper failed for another reason
    Failed(String),
}

/// Launches mount/unmount helpers on behalf of the controller.
pub trait MountHelper {
    /// Starts mounting `request` and returns the helper's process id.
    ///
    /// The exit status arrives later through the exit notifier the helper was
    /// built with.
    fn spawn_mount(&mut self, request: &MountRequest) -> Result<u32>;

    /// Unmounts `mount_point`, forcibly if `force` is set.
    fn unmount(&mut self, mount_point: &Path, force: bool) -> UnmountOutcome;

    /// Mount points the operating system currently reports as mounted.
    fn mounted_paths(&mut self) -> Result<HashSet<PathBuf>>;
}

/// [`MountHelper`] that runs the system `mount` and `umount` commands.
pub struct CommandHelper {
    mount_command: PathBuf,
    umount_command: PathBuf,
    timeout: Duration,
    notifier: ExitNotifier,
}

impl CommandHelper {
    /// Creates a helper using the commands named in `config`.
    pub fn new(config: &Config, notifier: ExitNotifier) -> Self {
        Self {
            mount_command: config.mount_command.clone(),
            umount_command: config.umount_command.clone(),
            timeout: config.helper_timeout(),
            notifier,
        }
    }

    fn mount_command(&self, request: &MountRequest) -> Command {
        let mut command = Command::new(&self.mount_command);
        command.arg("-t").arg(NFS_FSTYPE);
        if !request.options.is_empty() {
            command.arg("-o").arg(request.options.join(","));
        }
        command
            .arg(request.remote())
            .arg(&request.mount_point)
            .stdin(Stdio::null());
        command
    }
}

impl MountHelper for CommandHelper {
    fn spawn_mount(&mut self, request: &MountRequest) -> Result<u32> {
        let mut child = self.mount_command(request).spawn().with_context(|| {
            format!(
                "failed to launch {} for {}",
                self.mount_command.display(),
                request.remote()
            )
        })?;
        let pid = child.id();
        info!(
            "Launched mount helper {} for {} on {}",
            pid,
            request.remote(),
            request.mount_point.display()
        );

        let notifier = Arc::clone(&self.notifier);
        thread::Builder::new()
            .name(format!("mount-reaper-{}", pid))
            .spawn(move || {
                let status = match child.wait() {
                    Ok(status) => exit_code(status),
                    Err(e) => {
                        error!("Failed to wait for mount helper {}: {}", pid, e);
                        -1
                    }
                };
                notifier(pid, status);
            })
            .context("failed to start mount reaper thread")?;

        Ok(pid)
    }

    fn unmount(&mut self, mount_point: &Path, force: bool) -> UnmountOutcome {
        let mut command = Command::new(&self.umount_command);
        if force {
            command.arg("-f");
        }
        command
            .arg(mount_point)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return UnmountOutcome::Failed(format!("failed to launch umount: {}", e)),
        };
        let child_id = child.id();

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(child.wait_with_output());
        });

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(output)) => classify_unmount(&output),
            Ok(Err(e)) => UnmountOutcome::Failed(e.to_string()),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(
                    "umount of {} timed out after {:?}, killing helper {}",
                    mount_point.display(),
                    self.timeout,
                    child_id
                );
                if let Ok(raw) = i32::try_from(child_id) {
                    let _ = kill(Pid::from_raw(raw), Signal::SIGKILL);
                }
                UnmountOutcome::Failed("umount timed out".to_string())
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                UnmountOutcome::Failed("umount helper vanished".to_string())
            }
        }
    }

    fn mounted_paths(&mut self) -> Result<HashSet<PathBuf>> {
        system_mount_points()
    }
}

/// Exit code of a helper; death by signal maps to `128 + signo`.
pub fn exit_code(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

fn classify_unmount(output: &Output) -> UnmountOutcome {
    if output.status.success() {
        return UnmountOutcome::Unmounted;
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let message = stderr.trim();
    if message.to_ascii_lowercase().contains("busy") {
        debug!("umount reported busy: {}", message);
        UnmountOutcome::Busy
    } else {
        UnmountOutcome::Failed(format!(
            "umount exited with {}: {}",
            exit_code(output.status),
            message
        ))
    }
}

/// Mount points currently known to the operating system.
#[cfg(target_os = "linux")]
pub fn system_mount_points() -> Result<HashSet<PathBuf>> {
    let contents =
        std::fs::read_to_string("/proc/mounts").context("failed to read /proc/mounts")?;
    Ok(contents.lines().filter_map(parse_proc_mounts_line).collect())
}

/// Mount points currently known to the operating system.
#[cfg(not(target_os = "linux"))]
pub fn system_mount_points() -> Result<HashSet<PathBuf>> {
    let output = Command::new("mount")
        .stdin(Stdio::null())
        .output()
        .context("failed to run mount")?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().filter_map(parse_mount_output_line).collect())
}

// "{device} {mountpoint} {fstype} {options} {dump} {pass}"
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_mounts_line(line: &str) -> Option<PathBuf> {
    let mut fields = line.split_whitespace();
    let _device = fields.next()?;
    let mount_point = fields.next()?;
    fields.next()?;
    Some(PathBuf::from(unescape_mount_path(mount_point)))
}

// "{fsname} on {mountpoint} ({fstype}, {options...})"
#[cfg_attr(target_os = "linux", allow(dead_code))]
fn parse_mount_output_line(line: &str) -> Option<PathBuf> {
    let on = line.find(" on ")?;
    let rest = &line[on + 4..];
    let paren = rest.rfind(" (")?;
    Some(PathBuf::from(&rest[..paren]))
}

/// Decodes the octal escapes `/proc/mounts` uses (`\040` for space etc).
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..=i + 3].iter().all(|b| (b'0'..=b'7').contains(b));
        if escaped {
            let value = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            if let Ok(byte) = u8::try_from(value) {
                decoded.push(byte);
                i += 4;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}
