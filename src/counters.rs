//! Counter identities, lifecycle states and the registry view over a backend.
//!
//! The registry never caches anything: every state it reports is asked from
//! the backend at the moment of the call.

use crate::backend::Backend;

/// Wire value of the "every counter" request scope.
pub const ALL_COUNTER: u32 = 5;

/// Default number of sub-counters behind each PAI composite counter.
pub const DEFAULT_PAI_SUBCOUNTERS: usize = 156;

/// A counter slot known to the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterId {
    /// DES/TDES crypto function invocations
    Des,
    /// AES crypto function invocations
    Aes,
    /// SHA crypto function invocations
    Sha,
    /// PRNG/DRBG crypto function invocations
    Prng,
    /// ECC crypto function invocations
    Ecc,
    /// Per-instruction crypto counters, user space only
    PaiUser,
    /// Per-instruction crypto counters, kernel space only
    PaiKernel,
    /// Pseudo counter: CPU topology changed since backend start
    HotplugDetected,
}

impl CounterId {
    /// Iteration order for every command, composites included, hotplug excluded.
    pub const ENUMERATION: [CounterId; 7] = [
        CounterId::Des,
        CounterId::Aes,
        CounterId::Sha,
        CounterId::Prng,
        CounterId::Ecc,
        CounterId::PaiUser,
        CounterId::PaiKernel,
    ];

    pub fn to_wire(self) -> u32 {
        match self {
            CounterId::Des => 0,
            CounterId::Aes => 1,
            CounterId::Sha => 2,
            CounterId::Prng => 3,
            CounterId::Ecc => 4,
            CounterId::PaiUser => 6,
            CounterId::PaiKernel => 7,
            CounterId::HotplugDetected => 8,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(CounterId::Des),
            1 => Some(CounterId::Aes),
            2 => Some(CounterId::Sha),
            3 => Some(CounterId::Prng),
            4 => Some(CounterId::Ecc),
            6 => Some(CounterId::PaiUser),
            7 => Some(CounterId::PaiKernel),
            8 => Some(CounterId::HotplugDetected),
            _ => None,
        }
    }

    /// Whether this slot fronts an array of sub-counters
    pub fn is_composite(self) -> bool {
        matches!(self, CounterId::PaiUser | CounterId::PaiKernel)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CounterId::Des => "des",
            CounterId::Aes => "aes",
            CounterId::Sha => "sha",
            CounterId::Prng => "prng",
            CounterId::Ecc => "ecc",
            CounterId::PaiUser => "pai_user",
            CounterId::PaiKernel => "pai_kernel",
            CounterId::HotplugDetected => "hotplug_detected",
        }
    }
}

impl std::fmt::Display for CounterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which counters a request applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    One(CounterId),
    All,
}

impl Scope {
    pub fn to_wire(self) -> u32 {
        match self {
            Scope::One(id) => id.to_wire(),
            Scope::All => ALL_COUNTER,
        }
    }

    /// Decode a request scope. The hotplug pseudo counter is not requestable.
    pub fn from_wire(value: u32) -> Option<Self> {
        if value == ALL_COUNTER {
            return Some(Scope::All);
        }
        match CounterId::from_wire(value)? {
            CounterId::HotplugDetected => None,
            id => Some(Scope::One(id)),
        }
    }
}

/// Lifecycle state of a counter slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterState {
    Disabled,
    Enabled,
    /// Not available on this machine; no command ever leaves this state
    Unsupported,
}

impl CounterState {
    pub fn to_wire(self) -> i32 {
        match self {
            CounterState::Disabled => 0,
            CounterState::Enabled => 1,
            CounterState::Unsupported => 2,
        }
    }

    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            0 => Some(CounterState::Disabled),
            1 => Some(CounterState::Enabled),
            2 => Some(CounterState::Unsupported),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CounterState::Disabled => "disabled",
            CounterState::Enabled => "enabled",
            CounterState::Unsupported => "unsupported",
        }
    }
}

/// Operation requested by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Enable,
    Disable,
    Reset,
    /// Query state and value without changing anything
    Print,
}

impl Command {
    pub fn to_wire(self) -> u32 {
        match self {
            Command::Enable => 0,
            Command::Disable => 1,
            Command::Reset => 2,
            Command::Print => 3,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(Command::Enable),
            1 => Some(Command::Disable),
            2 => Some(Command::Reset),
            3 => Some(Command::Print),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Enable => "enable",
            Command::Disable => "disable",
            Command::Reset => "reset",
            Command::Print => "print",
        }
    }
}

/// Read-only view of the counter slots, backed by the live backend state.
pub struct Registry<'a> {
    backend: &'a dyn Backend,
}

impl<'a> Registry<'a> {
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &'a dyn Backend {
        self.backend
    }

    /// Current state of a slot, derived from the backend on every call.
    pub fn state_of(&self, id: CounterId) -> CounterState {
        self.backend.state_of(id)
    }

    pub fn enumerate(&self) -> impl Iterator<Item = CounterId> {
        CounterId::ENUMERATION.into_iter()
    }

    /// Identities a request touches, in enumeration order.
    pub fn in_scope(&self, scope: Scope) -> Vec<CounterId> {
        match scope {
            Scope::One(id) => vec![id],
            Scope::All => self.enumerate().collect(),
        }
    }

    /// Number of sub-counters behind a composite slot, 0 for anything else.
    pub fn sub_count(&self, id: CounterId) -> usize {
        if id.is_composite() {
            self.backend.subcounter_count(id)
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[test]
    fn test_enumeration_excludes_pseudo_counters() {
        assert!(!CounterId::ENUMERATION.contains(&CounterId::HotplugDetected));
        assert_eq!(CounterId::ENUMERATION.len(), 7);

        let wire: Vec<u32> = CounterId::ENUMERATION.iter().map(|c| c.to_wire()).collect();
        assert_eq!(wire, vec![0, 1, 2, 3, 4, 6, 7]);
    }

    #[test]
    fn test_counter_wire_values() {
        for id in CounterId::ENUMERATION {
            assert_eq!(CounterId::from_wire(id.to_wire()), Some(id));
        }
        assert_eq!(CounterId::from_wire(ALL_COUNTER), None);
        assert_eq!(CounterId::from_wire(9), None);
    }

    #[test]
    fn test_scope_from_wire() {
        assert_eq!(Scope::from_wire(5), Some(Scope::All));
        assert_eq!(Scope::from_wire(1), Some(Scope::One(CounterId::Aes)));
        assert_eq!(Scope::from_wire(8), None);
        assert_eq!(Scope::from_wire(42), None);
        assert_eq!(Scope::All.to_wire(), ALL_COUNTER);
    }

    #[test]
    fn test_command_and_state_codes() {
        assert_eq!(Command::from_wire(3), Some(Command::Print));
        assert_eq!(Command::from_wire(4), None);
        assert_eq!(CounterState::from_wire(2), Some(CounterState::Unsupported));
        assert_eq!(CounterState::from_wire(-5), None);
    }

    #[test]
    fn test_composites() {
        assert!(CounterId::PaiUser.is_composite());
        assert!(CounterId::PaiKernel.is_composite());
        assert!(!CounterId::Aes.is_composite());
        assert!(!CounterId::HotplugDetected.is_composite());
    }

    #[test]
    fn test_registry_scope_and_sub_count() {
        let backend = MemoryBackend::new();
        let registry = Registry::new(&backend);

        assert_eq!(registry.in_scope(Scope::One(CounterId::Sha)), vec![CounterId::Sha]);
        assert_eq!(registry.in_scope(Scope::All), CounterId::ENUMERATION.to_vec());
        assert_eq!(registry.sub_count(CounterId::PaiUser), DEFAULT_PAI_SUBCOUNTERS);
        assert_eq!(registry.sub_count(CounterId::Des), 0);
    }

    #[test]
    fn test_registry_reads_state_fresh() {
        let backend = MemoryBackend::new();
        let registry = Registry::new(&backend);

        assert_eq!(registry.state_of(CounterId::Aes), CounterState::Disabled);
        backend.enable(CounterId::Aes).unwrap();
        assert_eq!(registry.state_of(CounterId::Aes), CounterState::Enabled);
    }
}
