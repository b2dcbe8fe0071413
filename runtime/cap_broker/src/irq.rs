//! IRQ Handling - shared interrupt lines with threaded handlers
//!
//! Each registration ("action") on a line supplies two callbacks through
//! [`IrqHandler`]:
//!
//! - `handle` runs in the fast context when the line fires. It must not
//!   block and decides whether the event belongs to it.
//! - `thread_fn` runs on the action's own IRQ thread after `handle` returned
//!   [`IrqReturn::WakeThread`].
//!
//! ## Wakeup semantics
//!
//! The IRQ thread is fed through a single-slot channel. A wakeup that
//! arrives while one is already pending is coalesced: at most one wakeup is
//! queued per action, regardless of how many events fire before the thread
//! gets to run.
//!
//! ## Dispatch
//!
//! Fast handlers of one line never run concurrently: a raise that arrives
//! while the line is being dispatched waits for that pass to finish. Distinct
//! lines dispatch in parallel.
//!
//! ## Teardown
//!
//! [`IrqSubsystem::free_irq`] unlinks the action under the write lock, so no
//! fast-context dispatch can reach it afterwards, then disconnects the wake
//! channel and joins the thread. A pending or running `thread_fn` completes
//! before `free_irq` returns.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use bitflags::bitflags;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use crossbeam::sync::ShardedLock;

use crate::{lock, CapabilityError, Result};

/// Number of interrupt lines
pub const NR_IRQS: u32 = 1024;

bitflags! {
    /// Flags passed when requesting an IRQ line
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IrqFlags: u32 {
        const TRIGGER_RISING = 0x0000_0001;
        const TRIGGER_FALLING = 0x0000_0002;
        const TRIGGER_HIGH = 0x0000_0004;
        const TRIGGER_LOW = 0x0000_0008;
        /// Allow other actions on the same line
        const SHARED = 0x0000_0080;
    }
}

impl IrqFlags {
    const TRIGGER_MASK: IrqFlags = IrqFlags::TRIGGER_RISING
        .union(IrqFlags::TRIGGER_FALLING)
        .union(IrqFlags::TRIGGER_HIGH)
        .union(IrqFlags::TRIGGER_LOW);

    /// Trigger-type bits only
    pub fn trigger(self) -> IrqFlags {
        self & Self::TRIGGER_MASK
    }
}

/// Result of an IRQ callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// The interrupt was not from this device or was not handled
    None,

    /// The interrupt was handled
    Handled,

    /// Handled; wake the action's IRQ thread
    WakeThread,
}

/// Callbacks for one action on an IRQ line
pub trait IrqHandler: Send + Sync {
    /// Fast-context handler
    ///
    /// Runs with the line table read-locked. Must not block, allocate, or
    /// wait on anything `thread_fn` holds.
    fn handle(&self, irq: u32) -> IrqReturn;

    /// Threaded handler, run on the action's IRQ thread
    fn thread_fn(&self, irq: u32) -> IrqReturn;
}

/// Live registration of an action on a line
///
/// Move-only; [`IrqSubsystem::free_irq`] consumes it.
#[derive(Debug)]
pub struct IrqRegistration {
    irq: u32,
    id: u64,
    name: String,
}

impl IrqRegistration {
    pub fn irq(&self) -> u32 {
        self.irq
    }

    /// Name the action was registered under
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// What a single hardware event did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RaiseOutcome {
    /// Actions that claimed the event
    pub handled: usize,

    /// IRQ threads woken
    pub woken: usize,

    /// Wakeups merged into one already pending
    pub coalesced: usize,
}

impl RaiseOutcome {
    /// No action claimed the event
    pub fn is_spurious(&self) -> bool {
        self.handled == 0
    }
}

/// Snapshot of one line, as listed in `/proc/interrupts`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptInfo {
    pub irq: u32,
    pub count: u64,
    pub spurious: u64,
    pub threaded: u64,
    pub actions: Vec<String>,
}

impl fmt::Display for InterruptInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>4}: {:>10}  {}", self.irq, self.count, self.actions.join(", "))
    }
}

#[derive(Debug, Default)]
struct LineStats {
    count: AtomicU64,
    spurious: AtomicU64,
    threaded: AtomicU64,
}

struct IrqAction {
    id: u64,
    name: String,
    flags: IrqFlags,
    handler: Arc<dyn IrqHandler>,
    wake: Sender<()>,
    thread: JoinHandle<()>,
}

#[derive(Default)]
struct IrqLine {
    actions: Vec<IrqAction>,
    stats: Arc<LineStats>,
    /// Held for one pass over the fast handlers
    dispatch: Mutex<()>,
}

impl IrqLine {
    fn with_stats(stats: Arc<LineStats>) -> Self {
        Self {
            stats,
            ..Self::default()
        }
    }
}

/// Interrupt line table and IRQ threads
pub struct IrqSubsystem {
    lines: ShardedLock<BTreeMap<u32, IrqLine>>,
    next_id: AtomicU64,
}

impl IrqSubsystem {
    pub fn new() -> Self {
        Self {
            lines: ShardedLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `handler` on line `irq`
    ///
    /// # Errors
    /// - `InvalidIrq` if `irq` is out of range
    /// - `IrqBusy` if the line is taken and sharing is not agreed by both
    ///   sides, the trigger types differ, or `handler` is already on the line
    /// - `ThreadSpawn` if the IRQ thread cannot be started
    pub fn request_threaded_irq(
        &self,
        irq: u32,
        handler: Arc<dyn IrqHandler>,
        flags: IrqFlags,
        name: &str,
    ) -> Result<IrqRegistration> {
        if irq >= NR_IRQS {
            return Err(CapabilityError::InvalidIrq { irq });
        }

        let mut lines = self.lines.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(line) = lines.get(&irq).filter(|line| !line.actions.is_empty()) {
            let first = &line.actions[0];
            if !(first.flags & flags).contains(IrqFlags::SHARED) {
                return Err(CapabilityError::IrqBusy {
                    irq,
                    reason: "line is not shared",
                });
            }
            if first.flags.trigger() != flags.trigger() {
                return Err(CapabilityError::IrqBusy {
                    irq,
                    reason: "trigger type mismatch",
                });
            }
            if line.actions.iter().any(|a| same_handler(&a.handler, &handler)) {
                return Err(CapabilityError::IrqBusy {
                    irq,
                    reason: "handler already registered",
                });
            }
        }

        self.attach(&mut lines, irq, handler, flags, name)
    }

    /// Start the action's thread, then link the action into its line
    ///
    /// The line is created only once the action exists, so a failed spawn
    /// leaves the table as it was.
    fn attach(
        &self,
        lines: &mut BTreeMap<u32, IrqLine>,
        irq: u32,
        handler: Arc<dyn IrqHandler>,
        flags: IrqFlags,
        name: &str,
    ) -> Result<IrqRegistration> {
        let stats = lines.get(&irq).map(|line| Arc::clone(&line.stats)).unwrap_or_default();
        let (wake, wakeups) = channel::bounded(1);
        let thread = spawn_irq_thread(irq, name, Arc::clone(&handler), wakeups, Arc::clone(&stats))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let line = lines.entry(irq).or_insert_with(|| IrqLine::with_stats(stats));
        line.actions.push(IrqAction {
            id,
            name: name.to_string(),
            flags,
            handler,
            wake,
            thread,
        });
        log::debug!("irq {}: registered action {} ({:?})", irq, name, flags);

        Ok(IrqRegistration {
            irq,
            id,
            name: name.to_string(),
        })
    }

    /// Remove an action and wait for its IRQ thread to drain
    ///
    /// Blocks until any pending or running `thread_fn` of this action has
    /// returned. Must not be called from that action's own IRQ thread.
    pub fn free_irq(&self, registration: IrqRegistration) {
        let irq = registration.irq;
        let action = {
            let mut lines = self.lines.write().unwrap_or_else(PoisonError::into_inner);
            lines.get_mut(&irq).and_then(|line| {
                let index = line.actions.iter().position(|a| a.id == registration.id)?;
                Some(line.actions.remove(index))
            })
        };

        let Some(IrqAction { name, wake, thread, .. }) = action else {
            log::warn!("trying to free already-free IRQ {}", irq);
            return;
        };

        // The thread exits once the channel is drained.
        drop(wake);
        if thread.join().is_err() {
            log::error!("irq {}: thread of {} panicked", irq, name);
        }
        log::debug!("irq {}: freed action {}", irq, name);
    }

    /// Deliver one hardware event on line `irq`
    ///
    /// Calls each action's fast handler in registration order.
    pub fn raise(&self, irq: u32) -> Result<RaiseOutcome> {
        if irq >= NR_IRQS {
            return Err(CapabilityError::InvalidIrq { irq });
        }

        let mut outcome = RaiseOutcome::default();
        let lines = self.lines.read().unwrap_or_else(PoisonError::into_inner);
        let Some(line) = lines.get(&irq) else {
            return Ok(outcome);
        };
        let _dispatching = lock(&line.dispatch);
        line.stats.count.fetch_add(1, Ordering::Relaxed);

        for action in &line.actions {
            match action.handler.handle(irq) {
                IrqReturn::None => {}
                IrqReturn::Handled => outcome.handled += 1,
                IrqReturn::WakeThread => {
                    outcome.handled += 1;
                    match action.wake.try_send(()) {
                        Ok(()) => outcome.woken += 1,
                        Err(TrySendError::Full(())) => outcome.coalesced += 1,
                        Err(TrySendError::Disconnected(())) => {
                            log::warn!("irq {}: thread of {} is gone", irq, action.name);
                        }
                    }
                }
            }
        }

        if outcome.is_spurious() {
            line.stats.spurious.fetch_add(1, Ordering::Relaxed);
            log::debug!("irq {}: nobody cared", irq);
        }

        Ok(outcome)
    }

    /// Number of actions on a line
    pub fn actions(&self, irq: u32) -> usize {
        let lines = self.lines.read().unwrap_or_else(PoisonError::into_inner);
        lines.get(&irq).map_or(0, |line| line.actions.len())
    }

    /// Lines that currently have at least one action
    pub fn interrupts(&self) -> Vec<InterruptInfo> {
        let lines = self.lines.read().unwrap_or_else(PoisonError::into_inner);
        lines
            .iter()
            .filter(|(_, line)| !line.actions.is_empty())
            .map(|(irq, line)| InterruptInfo {
                irq: *irq,
                count: line.stats.count.load(Ordering::Relaxed),
                spurious: line.stats.spurious.load(Ordering::Relaxed),
                threaded: line.stats.threaded.load(Ordering::Relaxed),
                actions: line.actions.iter().map(|a| a.name.clone()).collect(),
            })
            .collect()
    }
}

impl Default for IrqSubsystem {
    fn default() -> Self {
        Self::new()
    }
}

fn same_handler(a: &Arc<dyn IrqHandler>, b: &Arc<dyn IrqHandler>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

fn spawn_irq_thread(
    irq: u32,
    name: &str,
    handler: Arc<dyn IrqHandler>,
    wakeups: Receiver<()>,
    stats: Arc<LineStats>,
) -> Result<JoinHandle<()>> {
    if name.contains('\0') {
        return Err(CapabilityError::ThreadSpawn(format!("invalid thread name {:?}", name)));
    }

    thread::Builder::new()
        .name(format!("irq/{}-{}", irq, name))
        .spawn(move || {
            for () in wakeups.iter() {
                if handler.thread_fn(irq) == IrqReturn::None {
                    log::debug!("irq {}: threaded handler did not handle the event", irq);
                }
                stats.threaded.fetch_add(1, Ordering::Relaxed);
            }
        })
        .map_err(|e| CapabilityError::ThreadSpawn(e.to_string()))
}
