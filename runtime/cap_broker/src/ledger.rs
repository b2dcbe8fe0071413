//! Resource Ledger - live-resource accounting and failure injection
//!
//! Every acquisition and release that goes through the broker is recorded
//! here. Tests use the live counters to prove that a failed driver load
//! leaves nothing behind, and the journal to prove the release order.

use std::collections::HashSet;
use std::fmt;
use std::time::Instant;

/// Kind of kernel resource a driver can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resource {
    /// Character device number region
    ChrdevRegion,

    /// Device class
    Class,

    /// cdev binding of device numbers to file operations
    Cdev,

    /// Externally visible device node
    Node,

    /// Driver-private memory
    Memory,

    /// IRQ line registration
    Irq,
}

impl Resource {
    /// All resource kinds, in the order a character-device driver acquires them
    pub const ALL: [Resource; 6] = [
        Resource::ChrdevRegion,
        Resource::Class,
        Resource::Cdev,
        Resource::Node,
        Resource::Memory,
        Resource::Irq,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::ChrdevRegion => "chrdev region",
            Resource::Class => "device class",
            Resource::Cdev => "cdev",
            Resource::Node => "device node",
            Resource::Memory => "memory",
            Resource::Irq => "IRQ",
        };
        f.write_str(name)
    }
}

/// Direction of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerAction {
    Acquire,
    Release,
}

/// One journal record
#[derive(Debug, Clone, Copy)]
pub struct LedgerEntry {
    pub resource: Resource,
    pub action: LedgerAction,
    /// When the operation completed
    pub at: Instant,
}

#[derive(Debug, Default)]
pub(crate) struct Ledger {
    live: [usize; Resource::ALL.len()],
    journal: Vec<LedgerEntry>,
    faults: HashSet<Resource>,
}

impl Ledger {
    pub(crate) fn inject(&mut self, resource: Resource) {
        self.faults.insert(resource);
    }

    /// Consume a pending injected fault, if any
    pub(crate) fn take_fault(&mut self, resource: Resource) -> bool {
        self.faults.remove(&resource)
    }

    pub(crate) fn acquired(&mut self, resource: Resource) {
        self.live[resource.index()] += 1;
        self.record(resource, LedgerAction::Acquire);
    }

    pub(crate) fn released(&mut self, resource: Resource) {
        let live = &mut self.live[resource.index()];
        debug_assert!(*live > 0, "release of {} with nothing live", resource);
        *live = live.saturating_sub(1);
        self.record(resource, LedgerAction::Release);
    }

    pub(crate) fn live(&self, resource: Resource) -> usize {
        self.live[resource.index()]
    }

    pub(crate) fn total_live(&self) -> usize {
        self.live.iter().sum()
    }

    pub(crate) fn journal(&self) -> &[LedgerEntry] {
        &self.journal
    }

    fn record(&mut self, resource: Resource, action: LedgerAction) {
        self.journal.push(LedgerEntry {
            resource,
            action,
            at: Instant::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_counts_follow_journal() {
        let mut ledger = Ledger::default();
        ledger.acquired(Resource::Class);
        ledger.acquired(Resource::Memory);
        assert_eq!(ledger.live(Resource::Class), 1);
        assert_eq!(ledger.total_live(), 2);

        ledger.released(Resource::Memory);
        assert_eq!(ledger.live(Resource::Memory), 0);
        assert_eq!(ledger.total_live(), 1);

        let actions: Vec<_> = ledger.journal().iter().map(|e| (e.resource, e.action)).collect();
        assert_eq!(
            actions,
            [
                (Resource::Class, LedgerAction::Acquire),
                (Resource::Memory, LedgerAction::Acquire),
                (Resource::Memory, LedgerAction::Release),
            ]
        );
    }

    #[test]
    fn test_fault_is_one_shot() {
        let mut ledger = Ledger::default();
        ledger.inject(Resource::Irq);
        assert!(!ledger.take_fault(Resource::Memory));
        assert!(ledger.take_fault(Resource::Irq));
        assert!(!ledger.take_fault(Resource::Irq));
    }
}
