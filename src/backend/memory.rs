//! In-memory counter backend.
//!
//! Behaves like a well-mannered counter facility: enabling starts a counter at
//! its configured value, disabling zeroes it, reset hands back the old value.
//! Failures can be injected per operation and counter, and reads can be made
//! to block until [`Backend::signal_stop`] is called.

use super::Backend;
use crate::counters::{CounterId, CounterState, DEFAULT_PAI_SUBCOUNTERS};
use crate::error::BackendError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Backend operation, used for failure injection and the call journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Enable,
    Disable,
    Read,
    Reset,
    ReadSubcounter,
}

/// One recorded backend call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Call {
    pub operation: Operation,
    pub counter: CounterId,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: CounterState,
    value: u64,
}

#[derive(Debug, Default)]
struct Inner {
    slots: HashMap<CounterId, Slot>,
    subcounters: HashMap<CounterId, Vec<u64>>,
    failures: HashMap<(Operation, CounterId), i32>,
    subcounter_failures: HashMap<(CounterId, usize), i32>,
    hotplug: bool,
    block_reads: bool,
    blocked: usize,
    calls: Vec<Call>,
    shut_down: bool,
}

pub struct MemoryBackend {
    inner: Mutex<Inner>,
    wakeup: Condvar,
    stopped: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// All counters disabled at zero, composites with the default number of
    /// sub-counters.
    pub fn new() -> Self {
        let mut inner = Inner::default();
        for id in CounterId::ENUMERATION {
            inner.slots.insert(
                id,
                Slot {
                    state: CounterState::Disabled,
                    value: 0,
                },
            );
            if id.is_composite() {
                inner.subcounters.insert(id, vec![0; DEFAULT_PAI_SUBCOUNTERS]);
            }
        }

        Self {
            inner: Mutex::new(inner),
            wakeup: Condvar::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_state(self, id: CounterId, state: CounterState) -> Self {
        self.lock()
            .slots
            .entry(id)
            .and_modify(|slot| slot.state = state)
            .or_insert(Slot { state, value: 0 });
        self
    }

    pub fn with_value(self, id: CounterId, value: u64) -> Self {
        self.set_value(id, value);
        self
    }

    /// Replace the sub-counters of a composite; the length becomes its
    /// sub-counter count.
    pub fn with_subcounters(self, id: CounterId, values: Vec<u64>) -> Self {
        self.lock().subcounters.insert(id, values);
        self
    }

    /// Make `operation` on `id` fail with `errno`.
    pub fn with_failure(self, operation: Operation, id: CounterId, errno: i32) -> Self {
        self.lock().failures.insert((operation, id), errno);
        self
    }

    pub fn with_subcounter_failure(self, id: CounterId, index: usize, errno: i32) -> Self {
        self.lock().subcounter_failures.insert((id, index), errno);
        self
    }

    pub fn with_hotplug(self, detected: bool) -> Self {
        self.lock().hotplug = detected;
        self
    }

    /// Counter reads park until the backend is stopped, then fail with EINTR.
    pub fn with_blocking_reads(self) -> Self {
        self.lock().block_reads = true;
        self
    }

    pub fn set_value(&self, id: CounterId, value: u64) {
        if let Some(slot) = self.lock().slots.get_mut(&id) {
            slot.value = value;
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn count(&self, operation: Operation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Number of reads currently parked in [`MemoryBackend::with_blocking_reads`] mode.
    pub fn blocked_readers(&self) -> usize {
        self.lock().blocked
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the call and apply stop/injected failures common to every op.
    fn begin(
        &self,
        inner: &mut Inner,
        operation: Operation,
        id: CounterId,
    ) -> Result<(), BackendError> {
        inner.calls.push(Call {
            operation,
            counter: id,
        });
        if self.is_stopped() && matches!(operation, Operation::Read | Operation::Reset) {
            return Err(BackendError::interrupted());
        }
        match inner.failures.get(&(operation, id)) {
            Some(errno) => Err(BackendError::from_errno(*errno)),
            None => Ok(()),
        }
    }
}

impl Backend for MemoryBackend {
    fn state_of(&self, id: CounterId) -> CounterState {
        self.lock()
            .slots
            .get(&id)
            .map(|slot| slot.state)
            .unwrap_or(CounterState::Unsupported)
    }

    fn enable(&self, id: CounterId) -> Result<(), BackendError> {
        let mut inner = self.lock();
        self.begin(&mut inner, Operation::Enable, id)?;

        match inner.slots.get_mut(&id) {
            Some(slot) if slot.state != CounterState::Unsupported => {
                slot.state = CounterState::Enabled;
                Ok(())
            }
            _ => Err(BackendError::unsupported()),
        }
    }

    fn disable(&self, id: CounterId) -> Result<(), BackendError> {
        let mut inner = self.lock();
        self.begin(&mut inner, Operation::Disable, id)?;

        match inner.slots.get_mut(&id) {
            Some(slot) if slot.state != CounterState::Unsupported => {
                slot.state = CounterState::Disabled;
                slot.value = 0;
            }
            _ => return Err(BackendError::unsupported()),
        }
        if let Some(values) = inner.subcounters.get_mut(&id) {
            values.iter_mut().for_each(|v| *v = 0);
        }
        Ok(())
    }

    fn read(&self, id: CounterId) -> Result<u64, BackendError> {
        let mut inner = self.lock();
        self.begin(&mut inner, Operation::Read, id)?;

        if id == CounterId::HotplugDetected {
            return Ok(inner.hotplug as u64);
        }

        if inner.block_reads {
            inner.blocked += 1;
            while !self.is_stopped() {
                inner = self
                    .wakeup
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            inner.blocked -= 1;
            return Err(BackendError::interrupted());
        }

        match inner.slots.get(&id) {
            Some(slot) if slot.state != CounterState::Unsupported => Ok(slot.value),
            _ => Err(BackendError::unsupported()),
        }
    }

    fn reset(&self, id: CounterId) -> Result<u64, BackendError> {
        let mut inner = self.lock();
        self.begin(&mut inner, Operation::Reset, id)?;

        match inner.slots.get_mut(&id) {
            Some(slot) if slot.state != CounterState::Unsupported => {
                Ok(std::mem::take(&mut slot.value))
            }
            _ => Err(BackendError::unsupported()),
        }
    }

    fn read_subcounter(&self, id: CounterId, index: usize) -> Result<u64, BackendError> {
        let mut inner = self.lock();
        self.begin(&mut inner, Operation::ReadSubcounter, id)?;

        if let Some(errno) = inner.subcounter_failures.get(&(id, index)) {
            return Err(BackendError::from_errno(*errno));
        }
        inner
            .subcounters
            .get(&id)
            .and_then(|values| values.get(index))
            .copied()
            .ok_or_else(BackendError::invalid)
    }

    fn subcounter_count(&self, id: CounterId) -> usize {
        self.lock().subcounters.get(&id).map_or(0, Vec::len)
    }

    fn signal_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        // Taking the lock orders the store before a parked reader re-checks it.
        let _inner = self.lock();
        self.wakeup.notify_all();
    }

    fn shutdown(&self) {
        let mut inner = self.lock();
        for slot in inner.slots.values_mut() {
            if slot.state == CounterState::Enabled {
                slot.state = CounterState::Disabled;
            }
        }
        inner.shut_down = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_enable_disable_cycle() {
        let backend = MemoryBackend::new().with_value(CounterId::Aes, 7);

        assert_eq!(backend.state_of(CounterId::Aes), CounterState::Disabled);
        backend.enable(CounterId::Aes).unwrap();
        assert_eq!(backend.state_of(CounterId::Aes), CounterState::Enabled);
        assert_eq!(backend.read(CounterId::Aes).unwrap(), 7);

        backend.disable(CounterId::Aes).unwrap();
        assert_eq!(backend.state_of(CounterId::Aes), CounterState::Disabled);
        assert_eq!(backend.read(CounterId::Aes).unwrap(), 0);
    }

    #[test]
    fn test_reset_returns_previous_value() {
        let backend = MemoryBackend::new()
            .with_state(CounterId::Sha, CounterState::Enabled)
            .with_value(CounterId::Sha, 99);

        assert_eq!(backend.reset(CounterId::Sha).unwrap(), 99);
        assert_eq!(backend.read(CounterId::Sha).unwrap(), 0);
    }

    #[test]
    fn test_injected_failures() {
        let backend = MemoryBackend::new()
            .with_failure(Operation::Enable, CounterId::Des, libc::EBUSY)
            .with_subcounter_failure(CounterId::PaiUser, 3, libc::EIO);

        assert_eq!(
            backend.enable(CounterId::Des).unwrap_err().code(),
            -libc::EBUSY
        );
        assert_eq!(
            backend
                .read_subcounter(CounterId::PaiUser, 3)
                .unwrap_err()
                .code(),
            -libc::EIO
        );
        assert_eq!(backend.read_subcounter(CounterId::PaiUser, 2).unwrap(), 0);
        assert_eq!(backend.count(Operation::Enable), 1);
    }

    #[test]
    fn test_unsupported_counter_cannot_be_enabled() {
        let backend = MemoryBackend::new().with_state(CounterId::Ecc, CounterState::Unsupported);

        assert!(backend.enable(CounterId::Ecc).is_err());
        assert_eq!(backend.state_of(CounterId::Ecc), CounterState::Unsupported);
    }

    #[test]
    fn test_hotplug_flag() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.read(CounterId::HotplugDetected).unwrap(), 0);

        let backend = MemoryBackend::new().with_hotplug(true);
        assert_eq!(backend.read(CounterId::HotplugDetected).unwrap(), 1);
    }

    #[test]
    fn test_signal_stop_releases_blocked_read() {
        let backend = Arc::new(
            MemoryBackend::new()
                .with_state(CounterId::Aes, CounterState::Enabled)
                .with_blocking_reads(),
        );

        let reader = {
            let backend = Arc::clone(&backend);
            std::thread::spawn(move || backend.read(CounterId::Aes))
        };

        while backend.blocked_readers() == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
        backend.signal_stop();
        backend.signal_stop();

        let result = reader.join().unwrap();
        assert_eq!(result.unwrap_err(), BackendError::interrupted());
        assert_eq!(backend.blocked_readers(), 0);
        assert!(backend.is_stopped());
    }
}
