//! Process lifecycle: single-instance marker and detachment.

use crate::error::{DaemonError, Result};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// PID file guarding against a second daemon instance
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fail with [`DaemonError::AlreadyRunning`] if the marker names a live
    /// process. Stale or unreadable markers are removed.
    pub fn check(&self) -> Result<()> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(self.error(e)),
        };

        match content.trim().parse::<i32>() {
            Ok(pid) if pid > 0 && process_alive(pid) => {
                return Err(DaemonError::AlreadyRunning { pid });
            }
            Ok(pid) => debug!("Removing stale PID file for pid {}", pid),
            Err(_) => warn!("Removing unparsable PID file {}", self.path.display()),
        }

        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.error(e)),
        }
    }

    /// Create the marker with our pid. It is removed when the guard drops.
    pub fn write(self) -> Result<PidGuard> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(&self.path)
            .map_err(|e| self.error(e))?;

        writeln!(file, "{}", std::process::id()).map_err(|e| self.error(e))?;
        info!("PID file written: {}", self.path.display());

        Ok(PidGuard { path: self.path })
    }

    fn error(&self, source: io::Error) -> DaemonError {
        DaemonError::PidFile {
            path: self.path.clone(),
            source,
        }
    }
}

/// Removes the PID file on drop
#[derive(Debug)]
pub struct PidGuard {
    path: PathBuf,
}

impl PidGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove PID file {}: {}", self.path.display(), e);
            }
        }
    }
}

/// `kill(pid, 0)` succeeds, or fails only for lack of permission.
fn process_alive(pid: i32) -> bool {
    // SAFETY: signal 0 only probes for existence, nothing is delivered.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Detach from the controlling terminal.
///
/// The parent exits with status 0; only the child returns. Must be called
/// before any thread (including the tokio runtime) is started.
pub fn daemonize() -> Result<()> {
    // SAFETY: called before any other thread exists, so the child inherits a
    // consistent single-threaded process.
    match unsafe { libc::fork() } {
        -1 => return Err(DaemonError::Daemonize(io::Error::last_os_error())),
        0 => {}
        _ => std::process::exit(0),
    }

    // SAFETY: no pointers involved; the child is not a process group leader.
    if unsafe { libc::setsid() } == -1 {
        return Err(DaemonError::Daemonize(io::Error::last_os_error()));
    }

    std::env::set_current_dir("/").map_err(DaemonError::Daemonize)?;
    // SAFETY: umask only replaces the process file mode mask.
    unsafe { libc::umask(0o007) };

    redirect_stdio()
}

fn redirect_stdio() -> Result<()> {
    use std::os::fd::AsRawFd;

    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(DaemonError::Daemonize)?;

    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are open; dup2 atomically replaces `fd`.
        if unsafe { libc::dup2(devnull.as_raw_fd(), fd) } == -1 {
            return Err(DaemonError::Daemonize(io::Error::last_os_error()));
        }
    }
    Ok(())
}
