//! Capability Broker - kernel services for character-device drivers
//!
//! # Purpose
//! Hands out the kernel resources a character-device driver needs while it
//! loads, and takes them back when it unloads: device number regions,
//! device classes, cdev bindings, device nodes, driver-private memory and
//! threaded IRQ lines.
//!
//! # Integration Points
//! - Depends on: nothing beyond the host OS threads
//! - Provides to: drivers (through [`CapabilityBroker`]) and host-side
//!   harnesses (node access, IRQ injection, listings)
//!
//! # Architecture
//! [`DefaultCapBroker`] owns one registry per concern. Every acquisition and
//! release is recorded in a ledger so that leaks and release order are
//! observable, and any acquisition can be made to fail once on demand.
//! Handles are move-only; a resource is released by giving its handle back.
//!
//! # Testing Strategy
//! - Unit tests: per-registry behaviour in each module
//! - Integration tests: shared lines, drain on free, node access

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

mod chrdev;
mod irq;
mod ledger;
mod memory;

pub use chrdev::{
    CdevHandle, ChrdevRegion, ClassHandle, DevNum, FileContext, FileOperations, NodeHandle, OpenFile, UserBuffer,
    UserSliceWriter, MINORBITS, MINORMASK,
};
pub use irq::{InterruptInfo, IrqFlags, IrqHandler, IrqRegistration, IrqReturn, IrqSubsystem, RaiseOutcome, NR_IRQS};
pub use ledger::{LedgerAction, LedgerEntry, Resource};
pub use memory::{MemoryRegion, DEFAULT_POOL_SIZE};

use chrdev::ChrdevTable;
use ledger::Ledger;
use memory::MemoryPool;
use thiserror::Error;

/// Error types for kernel-service operations
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("No free dynamic major numbers")]
    OutOfMajors,

    #[error("Invalid device number range: {reason}")]
    InvalidRange { reason: &'static str },

    #[error("Device class already exists: {name}")]
    ClassExists { name: String },

    #[error("Unknown device class: {name}")]
    UnknownClass { name: String },

    #[error("Device number {dev} already bound")]
    DevNumBusy { dev: DevNum },

    #[error("Device node already exists: {name}")]
    NodeExists { name: String },

    #[error("No such device: {name}")]
    NoDevice { name: String },

    #[error("Out of memory (requested: {requested} bytes)")]
    OutOfMemory { requested: usize },

    #[error("Invalid IRQ {irq}")]
    InvalidIrq { irq: u32 },

    #[error("IRQ {irq} busy: {reason}")]
    IrqBusy { irq: u32, reason: &'static str },

    #[error("Failed to spawn IRQ thread: {0}")]
    ThreadSpawn(String),

    #[error("Bad user buffer address")]
    BadAddress,

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Injected {resource} failure")]
    Injected { resource: Resource },
}

pub type Result<T> = core::result::Result<T, CapabilityError>;

/// Kernel services a driver consumes while loading and unloading
///
/// Every acquiring call returns a move-only handle; the matching release
/// call consumes it.
pub trait CapabilityBroker: Send + Sync {
    /// Allocate `count` device numbers under a dynamic major
    fn alloc_chrdev_region(&self, first_minor: u32, count: u32, name: &str) -> Result<ChrdevRegion>;

    fn unregister_chrdev_region(&self, region: ChrdevRegion);

    /// Create a device class
    fn class_create(&self, name: &str) -> Result<ClassHandle>;

    fn class_destroy(&self, class: ClassHandle);

    /// Bind `count` device numbers starting at `dev` to `fops`
    fn cdev_add(&self, dev: DevNum, count: u32, fops: Arc<dyn FileOperations>) -> Result<CdevHandle>;

    fn cdev_del(&self, cdev: CdevHandle);

    /// Create the user-visible node `name` for `dev`
    fn device_create(&self, class: &ClassHandle, dev: DevNum, name: &str) -> Result<NodeHandle>;

    fn device_destroy(&self, node: NodeHandle);

    /// Allocate driver-private memory
    fn allocate_memory(&self, size: usize) -> Result<MemoryRegion>;

    fn free_memory(&self, region: MemoryRegion);

    /// Register a threaded handler on an IRQ line
    fn request_threaded_irq(
        &self,
        irq: u32,
        handler: Arc<dyn IrqHandler>,
        flags: IrqFlags,
        name: &str,
    ) -> Result<IrqRegistration>;

    /// Deregister; blocks until the handler's IRQ thread has drained
    fn free_irq(&self, registration: IrqRegistration);
}

/// In-process implementation of the kernel services
pub struct DefaultCapBroker {
    chrdev: Mutex<ChrdevTable>,
    memory: Mutex<MemoryPool>,
    irqs: IrqSubsystem,
    ledger: Mutex<Ledger>,
    next_session: AtomicU64,
}

impl DefaultCapBroker {
    pub fn new() -> Self {
        Self::with_memory_limit(DEFAULT_POOL_SIZE)
    }

    /// Broker whose memory pool holds `bytes`
    pub fn with_memory_limit(bytes: usize) -> Self {
        Self {
            chrdev: Mutex::new(ChrdevTable::default()),
            memory: Mutex::new(MemoryPool::new(bytes)),
            irqs: IrqSubsystem::new(),
            ledger: Mutex::new(Ledger::default()),
            next_session: AtomicU64::new(1),
        }
    }

    /// Make the next acquisition of `resource` fail with `Injected`
    pub fn inject_fault(&self, resource: Resource) {
        lock(&self.ledger).inject(resource);
    }

    /// Number of live resources of one kind
    pub fn live(&self, resource: Resource) -> usize {
        lock(&self.ledger).live(resource)
    }

    /// Number of live resources of every kind
    pub fn total_live(&self) -> usize {
        lock(&self.ledger).total_live()
    }

    /// Every acquisition and release so far, in completion order
    pub fn journal(&self) -> Vec<LedgerEntry> {
        lock(&self.ledger).journal().to_vec()
    }

    /// Bytes currently allocated from the memory pool
    pub fn memory_in_use(&self) -> usize {
        lock(&self.memory).in_use()
    }

    /// Open a device node by name
    ///
    /// # Errors
    /// `NoDevice` if the node does not exist or nothing is bound to its
    /// number; otherwise whatever the driver's `open` returns.
    pub fn open(&self, name: &str) -> Result<OpenFile> {
        let (dev, fops) = lock(&self.chrdev).lookup(name)?;
        let ctx = FileContext::new(dev, self.next_session.fetch_add(1, Ordering::Relaxed));
        fops.open(&ctx)?;
        Ok(OpenFile::new(fops, ctx))
    }

    /// Fire a hardware event on line `irq`
    pub fn raise_irq(&self, irq: u32) -> Result<RaiseOutcome> {
        self.irqs.raise(irq)
    }

    /// Number of actions registered on `irq`
    pub fn irq_actions(&self, irq: u32) -> usize {
        self.irqs.actions(irq)
    }

    /// Per-line interrupt listing
    pub fn interrupts(&self) -> Vec<InterruptInfo> {
        self.irqs.interrupts()
    }

    /// Allocated majors and their owners
    pub fn devices(&self) -> Vec<(u32, String)> {
        lock(&self.chrdev).devices()
    }

    fn acquire<T>(&self, resource: Resource, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if lock(&self.ledger).take_fault(resource) {
            log::debug!("injected {} failure", resource);
            return Err(CapabilityError::Injected { resource });
        }

        let value = f()?;
        lock(&self.ledger).acquired(resource);
        Ok(value)
    }

    fn release(&self, resource: Resource, f: impl FnOnce()) {
        f();
        lock(&self.ledger).released(resource);
    }
}

impl Default for DefaultCapBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityBroker for DefaultCapBroker {
    fn alloc_chrdev_region(&self, first_minor: u32, count: u32, name: &str) -> Result<ChrdevRegion> {
        self.acquire(Resource::ChrdevRegion, || {
            lock(&self.chrdev).alloc_region(first_minor, count, name)
        })
    }

    fn unregister_chrdev_region(&self, region: ChrdevRegion) {
        self.release(Resource::ChrdevRegion, || lock(&self.chrdev).unregister_region(region));
    }

    fn class_create(&self, name: &str) -> Result<ClassHandle> {
        self.acquire(Resource::Class, || lock(&self.chrdev).class_create(name))
    }

    fn class_destroy(&self, class: ClassHandle) {
        self.release(Resource::Class, || lock(&self.chrdev).class_destroy(class));
    }

    fn cdev_add(&self, dev: DevNum, count: u32, fops: Arc<dyn FileOperations>) -> Result<CdevHandle> {
        self.acquire(Resource::Cdev, || lock(&self.chrdev).cdev_add(dev, count, fops))
    }

    fn cdev_del(&self, cdev: CdevHandle) {
        self.release(Resource::Cdev, || lock(&self.chrdev).cdev_del(cdev));
    }

    fn device_create(&self, class: &ClassHandle, dev: DevNum, name: &str) -> Result<NodeHandle> {
        self.acquire(Resource::Node, || lock(&self.chrdev).device_create(class, dev, name))
    }

    fn device_destroy(&self, node: NodeHandle) {
        self.release(Resource::Node, || lock(&self.chrdev).device_destroy(node));
    }

    fn allocate_memory(&self, size: usize) -> Result<MemoryRegion> {
        self.acquire(Resource::Memory, || lock(&self.memory).allocate(size))
    }

    fn free_memory(&self, region: MemoryRegion) {
        self.release(Resource::Memory, || lock(&self.memory).free(region));
    }

    fn request_threaded_irq(
        &self,
        irq: u32,
        handler: Arc<dyn IrqHandler>,
        flags: IrqFlags,
        name: &str,
    ) -> Result<IrqRegistration> {
        self.acquire(Resource::Irq, || self.irqs.request_threaded_irq(irq, handler, flags, name))
    }

    fn free_irq(&self, registration: IrqRegistration) {
        self.release(Resource::Irq, || self.irqs.free_irq(registration));
    }
}

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
