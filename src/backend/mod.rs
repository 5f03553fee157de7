//! Hardware counter backends.
//!
//! The daemon core only talks to the [`Backend`] trait. The production
//! implementation is [`PerfBackend`] (Linux perf events on the CPU-measurement
//! counter facility); [`MemoryBackend`] keeps everything in memory and is
//! what the tests drive.

pub mod memory;
#[cfg(target_os = "linux")]
pub mod perf;

pub use memory::{MemoryBackend, Operation};
#[cfg(target_os = "linux")]
pub use perf::PerfBackend;

use crate::counters::{CounterId, CounterState, DEFAULT_PAI_SUBCOUNTERS};
use crate::error::BackendError;

/// Call surface into the counter facility.
///
/// All methods take `&self`: a backend is shared between the connection
/// worker and the signal task, which may call [`Backend::signal_stop`] at any
/// time.
pub trait Backend: Send + Sync {
    /// Current state of a counter. A backend that cannot tell reports
    /// [`CounterState::Unsupported`].
    fn state_of(&self, id: CounterId) -> CounterState;

    fn enable(&self, id: CounterId) -> Result<(), BackendError>;

    fn disable(&self, id: CounterId) -> Result<(), BackendError>;

    /// Read a counter value. For [`CounterId::HotplugDetected`] the value is
    /// nonzero when the CPU topology changed since initialization.
    fn read(&self, id: CounterId) -> Result<u64, BackendError>;

    /// Zero a counter, returning its value from just before the reset.
    fn reset(&self, id: CounterId) -> Result<u64, BackendError>;

    /// Read sub-counter `index` (0-based) of a composite counter.
    fn read_subcounter(&self, id: CounterId, index: usize) -> Result<u64, BackendError>;

    /// Fixed number of sub-counters behind a composite counter.
    fn subcounter_count(&self, id: CounterId) -> usize {
        if id.is_composite() {
            DEFAULT_PAI_SUBCOUNTERS
        } else {
            0
        }
    }

    /// Unblock any in-flight read or reset and fail further ones.
    ///
    /// Idempotent; must be safe to call while another thread is inside the
    /// backend.
    fn signal_stop(&self);

    /// Release all counter resources. Idempotent.
    fn shutdown(&self);
}
