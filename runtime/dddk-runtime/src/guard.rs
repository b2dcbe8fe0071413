//! Scoped resource guards
//!
//! Every resource a driver acquires is wrapped in an [`Acquired`] guard the
//! moment the acquisition succeeds. The guard gives the resource back to the
//! broker when it goes out of scope. A driver that acquires its resources
//! into locals, in order, therefore unwinds exactly the completed steps in
//! reverse order on any early return, and a driver struct that stores the
//! guards in reverse acquisition order releases them in that order on drop.

use std::fmt;
use std::sync::Arc;

use cap_broker::{
    CapabilityBroker, CdevHandle, ChrdevRegion, ClassHandle, IrqRegistration, MemoryRegion, NodeHandle, Resource,
};

/// A resource that is released by handing it back to the broker
pub trait Release {
    /// Kind of resource, for logging
    const RESOURCE: Resource;

    fn release(self, broker: &dyn CapabilityBroker);
}

impl Release for ChrdevRegion {
    const RESOURCE: Resource = Resource::ChrdevRegion;

    fn release(self, broker: &dyn CapabilityBroker) {
        broker.unregister_chrdev_region(self);
    }
}

impl Release for ClassHandle {
    const RESOURCE: Resource = Resource::Class;

    fn release(self, broker: &dyn CapabilityBroker) {
        broker.class_destroy(self);
    }
}

impl Release for CdevHandle {
    const RESOURCE: Resource = Resource::Cdev;

    fn release(self, broker: &dyn CapabilityBroker) {
        broker.cdev_del(self);
    }
}

impl Release for NodeHandle {
    const RESOURCE: Resource = Resource::Node;

    fn release(self, broker: &dyn CapabilityBroker) {
        broker.device_destroy(self);
    }
}

impl Release for MemoryRegion {
    const RESOURCE: Resource = Resource::Memory;

    fn release(self, broker: &dyn CapabilityBroker) {
        broker.free_memory(self);
    }
}

impl Release for IrqRegistration {
    const RESOURCE: Resource = Resource::Irq;

    fn release(self, broker: &dyn CapabilityBroker) {
        broker.free_irq(self);
    }
}

/// Guard that releases its resource when dropped
pub struct Acquired<R: Release> {
    broker: Arc<dyn CapabilityBroker>,
    resource: Option<R>,
}

impl<R: Release> Acquired<R> {
    /// Run one acquisition step and guard its result
    pub fn acquire<E>(
        broker: &Arc<dyn CapabilityBroker>,
        step: impl FnOnce(&dyn CapabilityBroker) -> Result<R, E>,
    ) -> Result<Self, E> {
        let resource = step(broker.as_ref())?;
        log::debug!("acquired {}", R::RESOURCE);
        Ok(Self {
            broker: Arc::clone(broker),
            resource: Some(resource),
        })
    }

    /// The guarded resource
    pub fn get(&self) -> &R {
        match &self.resource {
            Some(resource) => resource,
            None => unreachable!("{} guard accessed after release", R::RESOURCE),
        }
    }
}

impl<R: Release> Drop for Acquired<R> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            log::debug!("releasing {}", R::RESOURCE);
            resource.release(self.broker.as_ref());
        }
    }
}

impl<R: Release + fmt::Debug> fmt::Debug for Acquired<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Acquired").field(&self.resource).finish()
    }
}
