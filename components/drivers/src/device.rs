//! Driver lifecycle
//!
//! Init acquires six resources in order:
//!
//! 1. a dynamically numbered device region
//! 2. the device class
//! 3. the cdev binding the file operations to the region
//! 4. the device node
//! 5. the device state
//! 6. the shared, threaded IRQ line
//!
//! Each step's result is guarded the moment it succeeds, so a failing step
//! unwinds exactly the completed ones in reverse. Exit releases all six in
//! reverse, starting with the IRQ line: freeing it waits for a running IRQ
//! thread, so the device state is never released under a handler.

use std::sync::Arc;

use cap_broker::{
    CapabilityBroker, CapabilityError, CdevHandle, ChrdevRegion, ClassHandle, DevNum, IrqFlags, IrqRegistration,
    MemoryRegion, NodeHandle, Resource,
};
use dddk_runtime::{Acquired, Driver, DriverError, DriverMetadata, Release, Result};

use crate::handler::ThreadedIrq;
use crate::{
    DeferredProcessor, DeviceFile, DeviceState, EventWork, FastDispatcher, LogEvent, MessageSource, ModuleParams,
    SessionTracker, DEVICE_NAME,
};

/// Everything init needs besides the broker
#[derive(Clone)]
pub struct DeviceConfig {
    pub params: ModuleParams,
    pub work: Arc<dyn EventWork>,
}

impl DeviceConfig {
    pub fn new(params: ModuleParams) -> Self {
        Self {
            params,
            work: Arc::new(LogEvent),
        }
    }

    /// Replace the work the IRQ thread does per event
    pub fn with_work(mut self, work: Arc<dyn EventWork>) -> Self {
        self.work = work;
        self
    }
}

impl From<ModuleParams> for DeviceConfig {
    fn from(params: ModuleParams) -> Self {
        Self::new(params)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new(ModuleParams::default())
    }
}

/// Device state plus the memory it was allocated from
struct StateAllocation {
    region: MemoryRegion,
    state: Arc<DeviceState>,
}

impl StateAllocation {
    fn allocate(broker: &dyn CapabilityBroker, irq: u32) -> cap_broker::Result<Self> {
        let region = broker.allocate_memory(std::mem::size_of::<DeviceState>())?;
        Ok(Self {
            region,
            state: Arc::new(DeviceState::new(irq)),
        })
    }
}

impl Release for StateAllocation {
    const RESOURCE: Resource = Resource::Memory;

    fn release(self, broker: &dyn CapabilityBroker) {
        let Self { region, state } = self;
        match Arc::try_unwrap(state) {
            Ok(state) => log::debug!("{}: freeing state of IRQ {}", DEVICE_NAME, state.irq()),
            Err(state) => log::error!(
                "{}: state of IRQ {} freed with {} other users",
                DEVICE_NAME,
                state.irq(),
                Arc::strong_count(&state) - 1
            ),
        }
        broker.free_memory(region);
    }
}

/// A live threaded IRQ device
///
/// Guards are declared in release order.
pub struct ThreadedIrqDevice {
    irq: Acquired<IrqRegistration>,
    state: Acquired<StateAllocation>,
    node: Acquired<NodeHandle>,
    cdev: Acquired<CdevHandle>,
    class: Acquired<ClassHandle>,
    region: Acquired<ChrdevRegion>,
    file: Arc<DeviceFile>,
    dispatcher: Arc<FastDispatcher>,
    processor: Arc<DeferredProcessor>,
}

/// Log a failed step and wrap its cause
fn step_failed(resource: Resource, what: &'static str) -> impl FnOnce(CapabilityError) -> DriverError {
    move |e| {
        log::error!("{}: {}: {}", DEVICE_NAME, what, e);
        DriverError::exhausted(resource, e)
    }
}

impl ThreadedIrqDevice {
    /// Bring the device up
    ///
    /// # Errors
    /// `RegistrationConflict` if the IRQ line cannot be shared with us,
    /// `ResourceExhausted` for any other step. Completed steps have been
    /// released by the time the error is returned.
    pub fn init(broker: Arc<dyn CapabilityBroker>, config: DeviceConfig) -> Result<Self> {
        let DeviceConfig { params, work } = config;
        let irq_number = params.irq_number;

        let region = Acquired::acquire(&broker, |b| b.alloc_chrdev_region(0, 1, DEVICE_NAME))
            .map_err(step_failed(Resource::ChrdevRegion, "Can't allocate major number"))?;
        let dev = region.get().first();
        log::info!("{}: Major number allocated is {}", DEVICE_NAME, dev.major());

        let class = Acquired::acquire(&broker, |b| b.class_create(DEVICE_NAME))
            .map_err(step_failed(Resource::Class, "Can't create device class"))?;

        let file = Arc::new(DeviceFile::new(MessageSource::default()));
        let cdev = Acquired::acquire(&broker, |b| b.cdev_add(dev, 1, file.clone()))
            .map_err(step_failed(Resource::Cdev, "Can't add cdev"))?;

        let node = Acquired::acquire(&broker, |b| b.device_create(class.get(), dev, DEVICE_NAME))
            .map_err(step_failed(Resource::Node, "Failed to create device node"))?;
        log::info!("{}: Device node created at /dev/{}", DEVICE_NAME, node.get().name());

        let state = Acquired::acquire(&broker, |b| StateAllocation::allocate(b, irq_number))
            .map_err(step_failed(Resource::Memory, "Failed to allocate device structure"))?;

        let dispatcher = Arc::new(FastDispatcher::new(params.claim));
        let processor = Arc::new(DeferredProcessor::new(work));
        let handler = Arc::new(ThreadedIrq::new(
            Arc::clone(&state.get().state),
            Arc::clone(&dispatcher),
            Arc::clone(&processor),
        ));
        let irq = Acquired::acquire(&broker, |b| {
            b.request_threaded_irq(irq_number, handler, IrqFlags::SHARED, DEVICE_NAME)
        })
        .map_err(|e| {
            log::error!("{}: Failed to request IRQ {}: {}", DEVICE_NAME, irq_number, e);
            DriverError::RegistrationConflict {
                irq: irq_number,
                source: e,
            }
        })?;
        log::info!(
            "{}: Successfully registered IRQ {} with threaded handler",
            DEVICE_NAME,
            irq_number
        );

        Ok(Self {
            irq,
            state,
            node,
            cdev,
            class,
            region,
            file,
            dispatcher,
            processor,
        })
    }

    /// Tear the device down
    ///
    /// Blocks until a running IRQ thread has finished.
    pub fn exit(self) {
        let Self {
            irq,
            state,
            node,
            cdev,
            class,
            region,
            ..
        } = self;

        let line = irq.get().irq();
        drop(irq);
        log::info!("{}: Freed IRQ {}", DEVICE_NAME, line);

        drop(state);
        drop(node);
        drop(cdev);
        drop(class);
        drop(region);
    }

    /// Device number of the node
    pub fn dev(&self) -> DevNum {
        self.region.get().first()
    }

    pub fn major(&self) -> u32 {
        self.dev().major()
    }

    /// IRQ line the device is attached to
    pub fn irq(&self) -> u32 {
        self.irq.get().irq()
    }

    /// Name of the device node
    pub fn node_name(&self) -> &str {
        self.node.get().name()
    }

    pub fn state(&self) -> &DeviceState {
        &self.state.get().state
    }

    pub fn dispatcher(&self) -> &FastDispatcher {
        &self.dispatcher
    }

    pub fn processor(&self) -> &DeferredProcessor {
        &self.processor
    }

    pub fn sessions(&self) -> &SessionTracker {
        self.file.sessions()
    }
}

impl DriverMetadata for ThreadedIrqDevice {
    fn driver_name() -> &'static str {
        DEVICE_NAME
    }

    fn driver_version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}

impl Driver for ThreadedIrqDevice {
    type Params = DeviceConfig;

    fn init(broker: Arc<dyn CapabilityBroker>, config: DeviceConfig) -> Result<Self> {
        ThreadedIrqDevice::init(broker, config)
    }

    fn exit(self) {
        ThreadedIrqDevice::exit(self)
    }
}

impl std::fmt::Debug for ThreadedIrqDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedIrqDevice")
            .field("dev", &self.dev())
            .field("irq", &self.irq())
            .field("node", &self.node_name())
            .finish_non_exhaustive()
    }
}
