//! The `ioGate`: a process-wide registry mapping a container's identity to
//! a shared mutex, so that two `Engine` instances opened against the same
//! backing container serialize their physical I/O against each other.
//! `examples/chiro2001-rfs` shares this kind of state via a `cxx` weak
//! table; here a `Weak` reference into a `once_cell::Lazy` registry gets
//! the same "same container => same lock, no leak once both engines
//! drop" behavior without conditional-weak-table machinery.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

pub type IoGate = Arc<Mutex<()>>;

static REGISTRY: Lazy<Mutex<HashMap<u64, Weak<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Return the shared gate for `identity`, creating one if none is live.
pub fn gate_for(identity: u64) -> IoGate {
    let mut registry = REGISTRY.lock();
    if let Some(weak) = registry.get(&identity) {
        if let Some(gate) = weak.upgrade() {
            return gate;
        }
    }
    let gate: IoGate = Arc::new(Mutex::new(()));
    registry.insert(identity, Arc::downgrade(&gate));
    gate
}

/// Number of live (non-expired) entries. Exposed for tests verifying the
/// registry doesn't leak once every engine referencing a container drops.
#[cfg(test)]
pub fn live_count() -> usize {
    REGISTRY
        .lock()
        .values()
        .filter(|w| w.strong_count() > 0)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_identity_shares_gate() {
        let a = gate_for(42);
        let b = gate_for(42);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn different_identity_different_gate() {
        let a = gate_for(1001);
        let b = gate_for(1002);
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn gate_is_dropped_when_unreferenced() {
        let identity = 99999;
        {
            let _gate = gate_for(identity);
            assert!(live_count() >= 1);
        }
        // the Arc dropped; a later lookup creates a fresh gate rather than
        // reusing a dangling Weak.
        let fresh = gate_for(identity);
        assert_eq!(Arc::strong_count(&fresh), 1);
    }
}
