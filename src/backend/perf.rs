//! Linux perf backend for the CPU-measurement counter facility.
//!
//! Crypto activity counters live in the `cpum_cf` PMU, the per-instruction
//! crypto counters in `pai_crypto`. Both are discovered through sysfs at
//! init; anything missing shows up as an unsupported counter rather than an
//! init failure. A counter is enabled by opening one system-wide perf event
//! per online CPU and disabled by closing them again, so the set of open
//! descriptors is the counter state.

use super::Backend;
use crate::counters::{CounterId, CounterState};
use crate::error::BackendError;
use std::collections::HashMap;
use std::fs;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use perf_event_open_sys as sys;
use sys::bindings::perf_event_attr;
use tracing::{debug, info, warn};

const CPUMF_PMU: &str = "cpum_cf";
const PAI_PMU: &str = "pai_crypto";
const PAI_ALL_EVENT: &str = "CRYPTO_ALL";

/// Privilege levels an event counts in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Privilege {
    /// No exclude bits; `cpum_cf` counter-set events reject any
    Any,
    UserOnly,
    KernelOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EventSpec {
    pmu_type: u32,
    config: u64,
    privilege: Privilege,
}

#[derive(Debug)]
struct OpenEvents {
    fds: Vec<OwnedFd>,
    subcounters: Vec<Vec<OwnedFd>>,
}

#[derive(Debug, Default)]
struct Slot {
    event: Option<EventSpec>,
    subevents: Vec<EventSpec>,
    open: Option<OpenEvents>,
}

pub struct PerfBackend {
    sysfs_root: PathBuf,
    cpus: Vec<i32>,
    online_at_init: String,
    slots: Mutex<HashMap<CounterId, Slot>>,
    stopped: AtomicBool,
}

impl PerfBackend {
    /// Discover the counter PMUs below `sysfs_root` (normally `/sys`).
    pub fn init(sysfs_root: &Path) -> Result<Self, BackendError> {
        let online_path = online_cpus_path(sysfs_root);
        let online = fs::read_to_string(&online_path).map_err(|e| {
            warn!("Couldn't read online CPUs from {}: {}", online_path.display(), e);
            BackendError::from(e)
        })?;
        let cpus = parse_cpu_list(&online).ok_or_else(|| {
            warn!("Unparsable online CPU list '{}'", online.trim());
            BackendError::invalid()
        })?;

        let cpumf = read_pmu(sysfs_root, CPUMF_PMU);
        let pai = read_pmu(sysfs_root, PAI_PMU);
        if cpumf.is_none() {
            warn!("PMU {} not available, crypto counters unsupported", CPUMF_PMU);
        }
        if pai.is_none() {
            warn!("PMU {} not available, PAI counters unsupported", PAI_PMU);
        }

        let mut slots = HashMap::new();
        for id in CounterId::ENUMERATION {
            let slot = match (id, &cpumf, &pai) {
                (CounterId::PaiUser, _, Some(pai)) => pai.composite_slot(Privilege::UserOnly),
                (CounterId::PaiKernel, _, Some(pai)) => pai.composite_slot(Privilege::KernelOnly),
                (CounterId::PaiUser | CounterId::PaiKernel, _, None) => Slot::default(),
                (id, Some(cpumf), _) => Slot {
                    event: cpumf_event(id).and_then(|name| cpumf.event(name, Privilege::Any)),
                    ..Slot::default()
                },
                (_, None, _) => Slot::default(),
            };
            debug!(
                counter = %id,
                supported = slot.event.is_some(),
                subcounters = slot.subevents.len(),
                "Counter discovered"
            );
            slots.insert(id, slot);
        }

        info!("Counter backend initialized for {} CPUs", cpus.len());
        Ok(Self {
            sysfs_root: sysfs_root.to_path_buf(),
            cpus,
            online_at_init: online.trim().to_string(),
            slots: Mutex::new(slots),
            stopped: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CounterId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_stopped(&self) -> Result<(), BackendError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(BackendError::interrupted());
        }
        Ok(())
    }

    fn open_all(&self, spec: &EventSpec) -> Result<Vec<OwnedFd>, BackendError> {
        self.cpus.iter().map(|cpu| open_event(spec, *cpu)).collect()
    }

    fn sum(&self, fds: &[OwnedFd]) -> Result<u64, BackendError> {
        let mut total: u64 = 0;
        for fd in fds {
            self.check_stopped()?;
            total = total.wrapping_add(read_event(fd)?);
        }
        Ok(total)
    }

    fn hotplug_detected(&self) -> Result<bool, BackendError> {
        let online = fs::read_to_string(online_cpus_path(&self.sysfs_root))?;
        Ok(online.trim() != self.online_at_init)
    }
}

impl Backend for PerfBackend {
    fn state_of(&self, id: CounterId) -> CounterState {
        match self.lock().get(&id) {
            Some(Slot {
                event: Some(_),
                open: Some(_),
                ..
            }) => CounterState::Enabled,
            Some(Slot { event: Some(_), .. }) => CounterState::Disabled,
            _ => CounterState::Unsupported,
        }
    }

    fn enable(&self, id: CounterId) -> Result<(), BackendError> {
        let mut slots = self.lock();
        let slot = slots.get_mut(&id).ok_or_else(BackendError::unsupported)?;
        let event = slot.event.ok_or_else(BackendError::unsupported)?;
        if slot.open.is_some() {
            return Ok(());
        }

        let fds = self.open_all(&event)?;
        let subcounters = slot
            .subevents
            .iter()
            .map(|spec| self.open_all(spec))
            .collect::<Result<Vec<_>, _>>()?;

        debug!("Enabled counter {} ({} events)", id, fds.len());
        slot.open = Some(OpenEvents { fds, subcounters });
        Ok(())
    }

    fn disable(&self, id: CounterId) -> Result<(), BackendError> {
        let mut slots = self.lock();
        let slot = slots.get_mut(&id).ok_or_else(BackendError::unsupported)?;
        if slot.event.is_none() {
            return Err(BackendError::unsupported());
        }
        if slot.open.take().is_some() {
            debug!("Disabled counter {}", id);
        }
        Ok(())
    }

    fn read(&self, id: CounterId) -> Result<u64, BackendError> {
        self.check_stopped()?;
        if id == CounterId::HotplugDetected {
            return self.hotplug_detected().map(u64::from);
        }

        let slots = self.lock();
        match slots.get(&id) {
            Some(Slot {
                open: Some(open), ..
            }) => self.sum(&open.fds),
            Some(Slot { event: Some(_), .. }) => Ok(0),
            _ => Err(BackendError::unsupported()),
        }
    }

    fn reset(&self, id: CounterId) -> Result<u64, BackendError> {
        self.check_stopped()?;

        let slots = self.lock();
        let open = match slots.get(&id) {
            Some(Slot {
                open: Some(open), ..
            }) => open,
            Some(Slot { event: Some(_), .. }) => return Ok(0),
            _ => return Err(BackendError::unsupported()),
        };

        let value = self.sum(&open.fds)?;
        for fd in open.fds.iter().chain(open.subcounters.iter().flatten()) {
            reset_event(fd)?;
        }
        Ok(value)
    }

    fn read_subcounter(&self, id: CounterId, index: usize) -> Result<u64, BackendError> {
        self.check_stopped()?;

        let slots = self.lock();
        let open = slots
            .get(&id)
            .and_then(|slot| slot.open.as_ref())
            .ok_or_else(BackendError::invalid)?;
        let fds = open
            .subcounters
            .get(index)
            .ok_or_else(BackendError::invalid)?;
        self.sum(fds)
    }

    fn subcounter_count(&self, id: CounterId) -> usize {
        self.lock().get(&id).map_or(0, |slot| slot.subevents.len())
    }

    fn signal_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn shutdown(&self) {
        let mut slots = self.lock();
        let enabled = slots
            .values_mut()
            .filter_map(|slot| slot.open.take())
            .count();
        if enabled > 0 {
            info!("Closed {} enabled counters", enabled);
        }
    }
}

struct Pmu {
    pmu_type: u32,
    /// (name, config), sorted by config
    events: Vec<(String, u64)>,
}

impl Pmu {
    fn event(&self, name: &str, privilege: Privilege) -> Option<EventSpec> {
        self.events
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, config)| EventSpec {
                pmu_type: self.pmu_type,
                config: *config,
                privilege,
            })
    }

    fn composite_slot(&self, privilege: Privilege) -> Slot {
        let subevents = self
            .events
            .iter()
            .filter(|(name, _)| name != PAI_ALL_EVENT)
            .map(|(_, config)| EventSpec {
                pmu_type: self.pmu_type,
                config: *config,
                privilege,
            })
            .collect();
        Slot {
            event: self.event(PAI_ALL_EVENT, privilege),
            subevents,
            open: None,
        }
    }
}

fn cpumf_event(id: CounterId) -> Option<&'static str> {
    match id {
        CounterId::Des => Some("DEA_FUNCTIONS"),
        CounterId::Aes => Some("AES_FUNCTIONS"),
        CounterId::Sha => Some("SHA_FUNCTIONS"),
        CounterId::Prng => Some("PRNG_FUNCTIONS"),
        CounterId::Ecc => Some("ECC_FUNCTION_COUNT"),
        _ => None,
    }
}

fn online_cpus_path(sysfs_root: &Path) -> PathBuf {
    sysfs_root.join("devices/system/cpu/online")
}

fn read_pmu(sysfs_root: &Path, name: &str) -> Option<Pmu> {
    let dir = sysfs_root.join("bus/event_source/devices").join(name);
    let pmu_type = fs::read_to_string(dir.join("type"))
        .ok()?
        .trim()
        .parse()
        .ok()?;

    let mut events = Vec::new();
    for entry in fs::read_dir(dir.join("events")).ok()?.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        // scale/unit companions and the like
        if name.contains('.') {
            continue;
        }
        match fs::read_to_string(entry.path())
            .ok()
            .and_then(|s| parse_event_config(&s))
        {
            Some(config) => events.push((name, config)),
            None => debug!("Skipping event {}/{}", dir.display(), name),
        }
    }
    events.sort_by_key(|(_, config)| *config);

    Some(Pmu { pmu_type, events })
}

/// Extract the `event=` term from a sysfs event description such as
/// `event=0x0040`.
fn parse_event_config(desc: &str) -> Option<u64> {
    desc.trim().split(',').find_map(|term| {
        let value = term.trim().strip_prefix("event=")?;
        match value.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => value.parse().ok(),
        }
    })
}

/// Parse a kernel CPU list like `0-3,8,10-11`.
fn parse_cpu_list(list: &str) -> Option<Vec<i32>> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((first, last)) => {
                let first: i32 = first.trim().parse().ok()?;
                let last: i32 = last.trim().parse().ok()?;
                if last < first {
                    return None;
                }
                cpus.extend(first..=last);
            }
            None => cpus.push(part.trim().parse().ok()?),
        }
    }
    if cpus.is_empty() {
        None
    } else {
        Some(cpus)
    }
}

fn build_attr(spec: &EventSpec) -> perf_event_attr {
    let mut attr = perf_event_attr {
        type_: spec.pmu_type,
        size: std::mem::size_of::<perf_event_attr>() as u32,
        config: spec.config,
        ..perf_event_attr::default()
    };
    match spec.privilege {
        Privilege::Any => {}
        Privilege::UserOnly => attr.set_exclude_kernel(1),
        Privilege::KernelOnly => attr.set_exclude_user(1),
    }
    attr
}

fn open_event(spec: &EventSpec, cpu: i32) -> Result<OwnedFd, BackendError> {
    let mut attr = build_attr(spec);

    // SAFETY: attr is a fully initialized perf_event_attr of the size it
    // declares; the kernel does not keep the pointer.
    let fd = unsafe {
        sys::perf_event_open(
            &mut attr,
            -1,
            cpu,
            -1,
            sys::bindings::PERF_FLAG_FD_CLOEXEC as libc::c_ulong,
        )
    };
    if fd < 0 {
        return Err(BackendError::last_os_error());
    }

    // SAFETY: the syscall returned a fresh descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn read_event(fd: &OwnedFd) -> Result<u64, BackendError> {
    let mut value: u64 = 0;
    // SAFETY: reading at most 8 bytes into a u64 we own.
    let n = unsafe {
        libc::read(
            fd.as_raw_fd(),
            &mut value as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if n < 0 {
        return Err(BackendError::last_os_error());
    }
    if n as usize != std::mem::size_of::<u64>() {
        return Err(BackendError::from_errno(libc::EIO));
    }
    Ok(value)
}

fn reset_event(fd: &OwnedFd) -> Result<(), BackendError> {
    // SAFETY: RESET takes no argument beyond the descriptor, which we own.
    if unsafe { sys::ioctls::RESET(fd.as_raw_fd(), 0) } != 0 {
        return Err(BackendError::last_os_error());
    }
    Ok(())
}
