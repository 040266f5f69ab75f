//! Probe registry: an ordered sequence of probe functions, first one
//! returning "claimed" wins. Tie-breaking is source-order only —
//! there is no priority field, and a probe that returns `None` must leave
//! the transport's target list unchanged (it never touches anything beyond
//! reading CPUID/idcode/ROM fingerprint bytes before deciding).

use crate::target::Target;
use crate::transport::Transport;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

/// A probe function: reads enough of the halted core's identity to decide
/// whether it recognises the part, and if so builds and returns the fully
/// populated `Target` (driver installed, RAM/Flash/commands added).
pub type ProbeFn = fn(&Rc<RefCell<dyn Transport>>) -> Option<Target>;

/// Ordered list of probe functions, scanned in registration order.
pub struct Registry {
    probes: Vec<ProbeFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self { probes: Vec::new() }
    }

    /// Registers probes in the given order; later calls append, so the
    /// order `register` is called in is the order `scan` tries them.
    pub fn register(&mut self, probes: &[ProbeFn]) {
        self.probes.extend_from_slice(probes);
    }

    /// Builds a registry with every family driver this crate ships, in the
    /// order `src/drivers/mod.rs` lists them.
    pub fn with_builtin_drivers() -> Self {
        let mut registry = Self::new();
        registry.register(&crate::drivers::ALL_PROBES);
        registry
    }

    /// Halts the core (the transport is assumed already connected) and
    /// tries each probe in turn. The first one that claims the device wins;
    /// every later probe is skipped.
    pub fn scan(&self, transport: Rc<RefCell<dyn Transport>>) -> Option<Target> {
        transport.borrow_mut().halt_request().ok()?;
        for probe in &self.probes {
            if let Some(target) = probe(&transport) {
                return Some(target);
            }
        }
        None
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::target::TargetDriver;
    use alloc::boxed::Box;

    struct StubDriver;
    impl TargetDriver for StubDriver {
        fn attach(&mut self, _xport: &mut dyn Transport) -> Result<(), crate::error::Error> {
            Ok(())
        }
        fn detach(&mut self, _xport: &mut dyn Transport) {}
    }

    fn probe_always_fails(_xport: &Rc<RefCell<dyn Transport>>) -> Option<Target> {
        None
    }

    fn probe_claims_part(xport: &Rc<RefCell<dyn Transport>>) -> Option<Target> {
        Some(Target::new("stub", 0xCAFE, 0, xport.clone(), Box::new(StubDriver)))
    }

    fn probe_never_reached(_xport: &Rc<RefCell<dyn Transport>>) -> Option<Target> {
        panic!("a later probe must not run once an earlier one claims the target");
    }

    #[test]
    fn first_matching_probe_wins_in_source_order() {
        let mut registry = Registry::new();
        registry.register(&[probe_always_fails, probe_claims_part, probe_never_reached]);
        let xport: Rc<RefCell<dyn Transport>> = Rc::new(RefCell::new(MockTransport::new()));
        let target = registry.scan(xport).unwrap();
        assert_eq!(target.part_id, 0xCAFE);
    }

    #[test]
    fn no_probe_matching_returns_none() {
        let mut registry = Registry::new();
        registry.register(&[probe_always_fails]);
        let xport: Rc<RefCell<dyn Transport>> = Rc::new(RefCell::new(MockTransport::new()));
        assert!(registry.scan(xport).is_none());
    }
}
