use anyhow::{Context, Result};
use log::{error, info, warn};
use nix::sys::stat;
use nix::unistd::{self, fork, ForkResult};
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Detaches the automounter from its terminal.
///
/// Handles process detachment, standard descriptor redirection and the pid
/// file the init system uses to find the daemon.
pub struct Daemon {
    pid_file: PathBuf,
    work_dir: PathBuf,
}

impl Daemon {
    /// Creates a new daemon instance.
    ///
    /// # Arguments
    ///
    /// * `pid_file` - Where the daemon's process ID is written
    /// * `work_dir` - Working directory for the daemon process
    pub fn new(pid_file: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            pid_file: pid_file.into(),
            work_dir: work_dir.into(),
        }
    }

    /// Path of the pid file.
    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    /// Starts the daemon process.
    ///
    /// This method:
    /// 1. Performs the double-fork to create a daemon process
    /// 2. Sets up the daemon environment (working directory, file descriptors)
    /// 3. Creates the PID file
    ///
    /// Must run before any other thread is started: only the calling thread
    /// survives a fork.
    ///
    /// # Returns
    ///
    /// * `Ok(())` in the daemon process
    /// * `Err` if any step of the daemon creation process failed
    pub fn start(&self) -> Result<()> {
        // First fork: create background process
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child: _ }) => {
                std::process::exit(0);
            }
            Ok(ForkResult::Child) => {
                unistd::setsid()?;

                // Second fork: prevent reacquiring terminal
                match unsafe { fork() } {
                    Ok(ForkResult::Parent { child: _ }) => {
                        std::process::exit(0);
                    }
                    Ok(ForkResult::Child) => {
                        stat::umask(stat::Mode::from_bits_truncate(0o022));
                        std::env::set_current_dir(&self.work_dir).with_context(|| {
                            format!("failed to enter {}", self.work_dir.display())
                        })?;
                        self.close_file_descriptors()?;
                        self.write_pid_file()?;

                        info!("Daemon started with pid {}", std::process::id());
                        Ok(())
                    }
                    Err(err) => {
                        error!("Second fork failed: {}", err);
                        Err(err.into())
                    }
                }
            }
            Err(err) => {
                error!("First fork failed: {}", err);
                Err(err.into())
            }
        }
    }

    pub(crate) fn write_pid_file(&self) -> Result<()> {
        let pid = std::process::id();
        let mut file = File::create(&self.pid_file)
            .with_context(|| format!("failed to create {}", self.pid_file.display()))?;
        writeln!(file, "{}", pid)?;
        Ok(())
    }

    /// Removes the pid file on the way out.
    pub fn remove_pid_file(&self) {
        if let Err(e) = fs::remove_file(&self.pid_file) {
            warn!("Failed to remove {}: {}", self.pid_file.display(), e);
        }
    }

    fn close_file_descriptors(&self) -> Result<()> {
        // Redirect standard file descriptors to /dev/null
        let null_file = File::options().read(true).write(true).open("/dev/null")?;
        let null_fd = null_file.as_raw_fd();

        for fd in 0..3 {
            unistd::dup2(null_fd, fd)?;
        }
        Ok(())
    }
}
