//! Stop request shared between the signal task and the accept loop.

use crate::backend::Backend;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Records the first termination signal and wakes whoever waits on it.
///
/// Cloning yields another handle onto the same state.
#[derive(Clone)]
pub struct Shutdown {
    signal: Arc<AtomicI32>,
    notify: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            signal: Arc::new(AtomicI32::new(0)),
            notify: Arc::new(notify),
        }
    }

    /// Request a stop on behalf of `sig`. Later requests keep the first signal.
    pub fn request(&self, sig: i32) {
        let _ = self
            .signal
            .compare_exchange(0, sig, Ordering::SeqCst, Ordering::SeqCst);
        self.notify.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.notify.borrow()
    }

    /// Signal that caused the stop, if any.
    pub fn signal(&self) -> Option<i32> {
        match self.signal.load(Ordering::SeqCst) {
            0 => None,
            sig => Some(sig),
        }
    }

    /// Resolve once a stop has been requested.
    pub async fn wait(&self) {
        let mut rx = self.notify.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// What a termination signal does: unblock the backend, then flag the loop.
pub fn stop_on_signal(backend: &dyn Backend, shutdown: &Shutdown, sig: i32) {
    info!("Received {}", signal_name(sig));
    backend.signal_stop();
    shutdown.request(sig);
}

pub fn signal_name(sig: i32) -> &'static str {
    match sig {
        libc::SIGTERM => "SIGTERM",
        libc::SIGINT => "SIGINT",
        libc::SIGHUP => "SIGHUP",
        _ => "signal",
    }
}
