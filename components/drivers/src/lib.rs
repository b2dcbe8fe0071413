//! Threaded IRQ Driver - character device with a shared, threaded IRQ line
//!
//! # Purpose
//! Exposes a read-only device node serving a fixed message and attaches to
//! a shared IRQ line with a split handler: a fast handler that claims and
//! acknowledges events, and an IRQ thread that processes them.
//!
//! # Integration Points
//! - Depends on: `cap-broker` for kernel services, `dddk-runtime` for the
//!   driver lifecycle, guards and errors
//! - Provides to: the module loader (through [`Driver`](dddk_runtime::Driver))
//!   and readers of `/dev/threaded_irq_example`
//!
//! # Architecture
//! ```text
//!   raise(irq) --> FastDispatcher --WakeDeferred--> IRQ thread --> DeferredProcessor
//!                       |                                              |
//!                       +------------- DeviceState <-------------------+
//!
//!   open/read/release --> DeviceFile --> MessageSource
//! ```
//! The device state is shared by both handlers and released only after the
//! IRQ line has been freed and its thread drained.
//!
//! # Testing Strategy
//! - Unit tests: message slicing, claim decisions, parameter parsing
//! - Integration tests: init unwinding at every step, handoff and drain,
//!   reads through the device node

mod device;
mod dispatch;
mod file;
mod handler;
mod params;
mod process;
mod session;
mod source;
mod state;

pub use device::{DeviceConfig, ThreadedIrqDevice};
pub use dispatch::{Dispatch, DispatchStats, DispatcherState, FastDispatcher};
pub use file::DeviceFile;
pub use params::{ClaimPolicy, ModuleParams, ParamError, DEFAULT_IRQ_NUMBER};
pub use process::{DeferredProcessor, EventWork, LogEvent};
pub use session::SessionTracker;
pub use source::{MessageSource, MESSAGE};
pub use state::{DeviceState, StatusBits, StatusRegister};

/// Name of the region, class, node and IRQ action
pub const DEVICE_NAME: &str = "threaded_irq_example";
