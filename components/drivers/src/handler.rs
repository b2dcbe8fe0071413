//! Binds the dispatcher and processor to one IRQ action

use std::sync::Arc;

use cap_broker::{IrqHandler, IrqReturn};

use crate::{DeferredProcessor, DeviceState, FastDispatcher};

/// The action registered on the shared line
///
/// Holds the only reference to the device state outside the driver, so
/// the state is released once the IRQ subsystem drops the action.
pub(crate) struct ThreadedIrq {
    state: Arc<DeviceState>,
    dispatcher: Arc<FastDispatcher>,
    processor: Arc<DeferredProcessor>,
}

impl ThreadedIrq {
    pub(crate) fn new(
        state: Arc<DeviceState>,
        dispatcher: Arc<FastDispatcher>,
        processor: Arc<DeferredProcessor>,
    ) -> Self {
        Self {
            state,
            dispatcher,
            processor,
        }
    }
}

impl IrqHandler for ThreadedIrq {
    fn handle(&self, _irq: u32) -> IrqReturn {
        self.dispatcher.dispatch(&self.state).into()
    }

    fn thread_fn(&self, _irq: u32) -> IrqReturn {
        match self.processor.process(&self.state) {
            Ok(()) => IrqReturn::Handled,
            Err(_) => IrqReturn::None,
        }
    }
}
