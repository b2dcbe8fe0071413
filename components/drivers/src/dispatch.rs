//! Fast-context dispatch
//!
//! The fast handler runs with the line masked on the raising CPU. It must
//! not block, allocate or sleep: it decides whether the event belongs to
//! this device and, if there is work, asks for the IRQ thread. All real
//! processing happens in [`DeferredProcessor`](crate::DeferredProcessor).

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use cap_broker::IrqReturn;

use crate::{ClaimPolicy, DeviceState, StatusBits};

const IDLE: u8 = 0;
const DISPATCHING: u8 = 1;

/// Decision returned by the fast handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Ours, fully handled here
    Handled,
    /// Ours, the IRQ thread has work to do
    WakeDeferred,
    /// Another device on the shared line raised it
    NotMine,
}

impl From<Dispatch> for IrqReturn {
    fn from(dispatch: Dispatch) -> Self {
        match dispatch {
            Dispatch::Handled => IrqReturn::Handled,
            Dispatch::WakeDeferred => IrqReturn::WakeThread,
            Dispatch::NotMine => IrqReturn::None,
        }
    }
}

/// Whether the fast handler is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Dispatching,
}

/// Counters kept by the fast handler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Events seen on the line
    pub received: u64,
    /// Events claimed as ours
    pub claimed: u64,
    /// Events handed to the IRQ thread
    pub handed_off: u64,
}

/// Fast handler of one device
///
/// The IRQ subsystem runs a line's fast handlers one pass at a time, so
/// `dispatch` is never re-entered and `state` reads `Dispatching` exactly
/// while a pass is inside it.
#[derive(Debug)]
pub struct FastDispatcher {
    policy: ClaimPolicy,
    state: AtomicU8,
    received: AtomicU64,
    claimed: AtomicU64,
    handed_off: AtomicU64,
}

impl FastDispatcher {
    pub fn new(policy: ClaimPolicy) -> Self {
        Self {
            policy,
            state: AtomicU8::new(IDLE),
            received: AtomicU64::new(0),
            claimed: AtomicU64::new(0),
            handed_off: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> ClaimPolicy {
        self.policy
    }

    /// Handle one event on the line
    ///
    /// An event that is not ours leaves `state` untouched.
    pub fn dispatch(&self, state: &DeviceState) -> Dispatch {
        self.state.store(DISPATCHING, Ordering::Release);
        self.received.fetch_add(1, Ordering::Relaxed);

        let decision = match self.policy {
            ClaimPolicy::Always => Dispatch::WakeDeferred,
            ClaimPolicy::StatusRegister => {
                let status = state.status().take();
                if status.is_empty() {
                    Dispatch::NotMine
                } else if status.contains(StatusBits::DATA) {
                    Dispatch::WakeDeferred
                } else {
                    Dispatch::Handled
                }
            }
        };

        match decision {
            Dispatch::NotMine => {}
            Dispatch::Handled => {
                self.claimed.fetch_add(1, Ordering::Relaxed);
            }
            Dispatch::WakeDeferred => {
                self.claimed.fetch_add(1, Ordering::Relaxed);
                self.handed_off.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.state.store(IDLE, Ordering::Release);
        decision
    }

    pub fn state(&self) -> DispatcherState {
        match self.state.load(Ordering::Acquire) {
            DISPATCHING => DispatcherState::Dispatching,
            _ => DispatcherState::Idle,
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            received: self.received.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            handed_off: self.handed_off.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_always_wakes_thread() {
        let dispatcher = FastDispatcher::new(ClaimPolicy::Always);
        let state = DeviceState::new(10);

        assert_eq!(dispatcher.dispatch(&state), Dispatch::WakeDeferred);
        assert_eq!(dispatcher.dispatch(&state), Dispatch::WakeDeferred);
        assert_eq!(
            dispatcher.stats(),
            DispatchStats {
                received: 2,
                claimed: 2,
                handed_off: 2
            }
        );
        assert_eq!(dispatcher.state(), DispatcherState::Idle);
        assert_eq!(state.processed(), 0);
    }

    #[test]
    fn test_status_register_policy() {
        let dispatcher = FastDispatcher::new(ClaimPolicy::StatusRegister);
        let state = DeviceState::new(10);

        assert_eq!(dispatcher.dispatch(&state), Dispatch::NotMine);

        state.status().assert(StatusBits::PENDING);
        assert_eq!(dispatcher.dispatch(&state), Dispatch::Handled);
        assert!(state.status().peek().is_empty());

        state.status().assert(StatusBits::PENDING | StatusBits::DATA);
        assert_eq!(dispatcher.dispatch(&state), Dispatch::WakeDeferred);

        assert_eq!(
            dispatcher.stats(),
            DispatchStats {
                received: 3,
                claimed: 2,
                handed_off: 1
            }
        );
    }

    #[test]
    fn test_irq_return_mapping() {
        assert_eq!(IrqReturn::from(Dispatch::Handled), IrqReturn::Handled);
        assert_eq!(IrqReturn::from(Dispatch::WakeDeferred), IrqReturn::WakeThread);
        assert_eq!(IrqReturn::from(Dispatch::NotMine), IrqReturn::None);
    }
}
