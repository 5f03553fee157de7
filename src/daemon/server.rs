use super::dispatch::{DispatchOutcome, Dispatcher};
use super::protocol::{read_frame, Query};
use super::shutdown::{signal_name, stop_on_signal, Shutdown};
use crate::backend::Backend;
use crate::config::DaemonConfig;
use crate::error::{DaemonError, ProtocolError, Result};
use std::ffi::CString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

use tracing::{debug, error, info, trace, warn};

const SOCKET_MODE: u32 = 0o660;

pub struct DaemonServer {
    listener: UnixListener,
    backend: Arc<dyn Backend>,
    shutdown: Shutdown,
    recv_timeout: Duration,
    send_timeout: Duration,
    socket: SocketGuard,
}

impl DaemonServer {
    /// Bind the client socket. Must be called from within a tokio runtime.
    pub fn bind(config: &DaemonConfig, backend: Arc<dyn Backend>) -> Result<Self> {
        let path = config.socket_path.clone();
        let bind_error = |source: io::Error| DaemonError::Bind {
            path: path.clone(),
            source,
        };

        match std::fs::remove_file(&path) {
            Ok(()) => debug!("Removed stale socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(bind_error(e)),
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(bind_error)?;
        }

        let listener = UnixListener::bind(&path).map_err(bind_error)?;
        let socket = SocketGuard { path: path.clone() };

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(SOCKET_MODE);
            std::fs::set_permissions(&path, perms).map_err(bind_error)?;
        }

        if let Some(group) = &config.socket_group {
            match lookup_group(group) {
                Some(gid) => {
                    std::os::unix::fs::chown(&path, None, Some(gid)).map_err(bind_error)?;
                    debug!("Socket group set to {} ({})", group, gid);
                }
                None => warn!("Group '{}' not found, socket group left unchanged", group),
            }
        }

        info!("Listening on: {}", path.display());

        Ok(Self {
            listener,
            backend,
            shutdown: Shutdown::new(),
            recv_timeout: config.recv_timeout(),
            send_timeout: config.send_timeout(),
            socket,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket.path
    }

    /// Handle for requesting a stop from outside the accept loop.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Route every SIGTERM and SIGINT to the backend and the accept loop.
    pub fn install_signal_handlers(&self) -> Result<JoinHandle<()>> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).map_err(|source| {
            DaemonError::SignalHandler {
                signal: signal_name(libc::SIGTERM),
                source,
            }
        })?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(|source| {
            DaemonError::SignalHandler {
                signal: signal_name(libc::SIGINT),
                source,
            }
        })?;

        let backend = Arc::clone(&self.backend);
        let shutdown = self.shutdown.clone();

        Ok(tokio::spawn(async move {
            loop {
                let sig = tokio::select! {
                    Some(()) = sigterm.recv() => libc::SIGTERM,
                    Some(()) = sigint.recv() => libc::SIGINT,
                    else => break,
                };
                stop_on_signal(backend.as_ref(), &shutdown, sig);
            }
        }))
    }

    /// Serve connections one at a time until a stop is requested.
    ///
    /// Returns the signal that ended the loop, if a signal did.
    pub async fn run(self) -> Result<Option<i32>> {
        info!("cpacfstatsd ready");

        loop {
            if self.shutdown.is_requested() {
                break;
            }

            let stream = tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                conn = self.listener.accept() => match conn {
                    Ok((stream, _)) => stream,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        return Err(DaemonError::Accept(e));
                    }
                },
            };

            self.serve(stream).await;
        }

        info!("Shutdown requested, leaving accept loop");
        Ok(self.shutdown.signal())
    }

    /// Run one connection on a blocking worker and wait for it.
    async fn serve(&self, stream: tokio::net::UnixStream) {
        trace!("New connection accepted");

        let stream = match self.into_blocking(stream) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to prepare connection: {}", e);
                return;
            }
        };

        let backend = Arc::clone(&self.backend);
        let worker = tokio::task::spawn_blocking(move || handle_connection(stream, backend.as_ref()));

        match worker.await {
            Ok(Ok(DispatchOutcome::Completed { sent })) => trace!("Response sent, {} answers", sent),
            Ok(Ok(DispatchOutcome::Aborted { counter, code, sent })) => {
                debug!("Response aborted at counter {} ({}), {} answers", counter, code, sent)
            }
            Ok(Err(e)) => warn!("Connection dropped: {}", e),
            Err(e) => error!("Connection worker failed: {}", e),
        }
    }

    fn into_blocking(&self, stream: tokio::net::UnixStream) -> io::Result<std::os::unix::net::UnixStream> {
        let stream = stream.into_std()?;
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.recv_timeout))?;
        stream.set_write_timeout(Some(self.send_timeout))?;
        Ok(stream)
    }
}

/// Receive one query, stream its answers, close.
fn handle_connection(
    mut stream: std::os::unix::net::UnixStream,
    backend: &dyn Backend,
) -> std::result::Result<DispatchOutcome, ProtocolError> {
    let frame = read_frame(&mut stream)?;
    let query = Query::decode(&frame)?;
    debug!("Handling: {} on {:?}", query.command.as_str(), query.scope);

    let outcome = Dispatcher::new(backend).dispatch(&query, &mut stream)?;
    Ok(outcome)
}

fn lookup_group(name: &str) -> Option<libc::gid_t> {
    let name = CString::new(name).ok()?;
    // SAFETY: name is NUL-terminated; the returned entry is read before any
    // other getgr* call can overwrite it.
    let group = unsafe { libc::getgrnam(name.as_ptr()) };
    if group.is_null() {
        None
    } else {
        // SAFETY: non-null pointer to the static group entry.
        Some(unsafe { (*group).gr_gid })
    }
}

/// Removes the socket path on drop
struct SocketGuard {
    path: PathBuf,
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove socket {}: {}", self.path.display(), e);
            }
        }
    }
}
