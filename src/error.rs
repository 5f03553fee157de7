use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Startup and fatal runtime failures of the daemon process.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("another cpacfstatsd (pid={pid}) is already running")]
    AlreadyRunning { pid: i32 },

    #[error("pid file '{}': {source}", path.display())]
    PidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("couldn't detach from terminal: {0}")]
    Daemonize(#[source] io::Error),

    #[error("couldn't initialize counter backend: {0}")]
    BackendInit(#[from] BackendError),

    #[error("couldn't initialize server socket '{}': {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("couldn't establish signal handler for {signal}: {source}")]
    SignalHandler {
        signal: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("accept() failure: {0}")]
    Accept(#[source] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Failures decoding a message received over the socket.
///
/// None of these are answered; the connection is simply dropped.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("received msg with wrong version {found} != {expected}")]
    ProtocolMismatch { found: u32, expected: u32 },

    #[error("received msg with wrong type {found} != {expected}")]
    UnexpectedType { found: u32, expected: u32 },

    #[error("received unknown counter {0}")]
    UnknownCounter(u32),

    #[error("received unknown command {0}")]
    UnknownCommand(u32),

    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// A failed counter backend operation.
///
/// The code is a negative errno value and is forwarded verbatim to clients in
/// the state field of an answer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("counter backend failure (code {code})")]
pub struct BackendError {
    code: i32,
}

impl BackendError {
    /// Build an error from an errno value, positive or already negated.
    pub fn from_errno(errno: i32) -> Self {
        let code = if errno > 0 { -errno } else { errno };
        // 0 would read as a state on the wire
        let code = if code == 0 { -libc::EIO } else { code };
        Self { code }
    }

    /// Error for the calling thread's current `errno`.
    pub fn last_os_error() -> Self {
        let errno = io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO);
        Self::from_errno(errno)
    }

    /// The operation was cut short by a stop request.
    pub fn interrupted() -> Self {
        Self::from_errno(libc::EINTR)
    }

    /// The counter (or sub-counter) is not available on this machine.
    pub fn unsupported() -> Self {
        Self::from_errno(libc::EOPNOTSUPP)
    }

    pub fn invalid() -> Self {
        Self::from_errno(libc::EINVAL)
    }

    pub fn code(&self) -> i32 {
        self.code
    }
}

impl From<io::Error> for BackendError {
    fn from(e: io::Error) -> Self {
        Self::from_errno(e.raw_os_error().unwrap_or(libc::EIO))
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_is_negative() {
        assert_eq!(BackendError::from_errno(libc::EIO).code(), -libc::EIO);
        assert_eq!(BackendError::from_errno(-libc::ENODEV).code(), -libc::ENODEV);
        assert_eq!(BackendError::from_errno(0).code(), -libc::EIO);
        assert_eq!(BackendError::interrupted().code(), -libc::EINTR);
    }

    #[test]
    fn test_backend_error_from_io() {
        let err = io::Error::from_raw_os_error(libc::EBUSY);
        assert_eq!(BackendError::from(err).code(), -libc::EBUSY);

        let err = io::Error::new(io::ErrorKind::Other, "no errno");
        assert_eq!(BackendError::from(err).code(), -libc::EIO);
    }

    #[test]
    fn test_daemon_error_messages() {
        let err = DaemonError::AlreadyRunning { pid: 42 };
        assert!(err.to_string().contains("pid=42"));

        let err = ProtocolError::ProtocolMismatch {
            found: 1,
            expected: 2,
        };
        assert_eq!(err.to_string(), "received msg with wrong version 1 != 2");
    }
}
