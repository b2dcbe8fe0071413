//! Per-device state shared between the handlers

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Bits latched in the device status register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusBits: u32 {
        /// The device raised the line
        const PENDING = 1 << 0;
        /// Data is waiting for the IRQ thread
        const DATA = 1 << 1;
    }
}

/// Device status register
///
/// The device side latches bits with [`assert`](Self::assert); the fast
/// handler reads and clears them in one step.
#[derive(Debug, Default)]
pub struct StatusRegister {
    bits: AtomicU32,
}

impl StatusRegister {
    /// Latch `bits`
    pub fn assert(&self, bits: StatusBits) {
        self.bits.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    /// Read and acknowledge everything latched
    pub fn take(&self) -> StatusBits {
        StatusBits::from_bits_truncate(self.bits.swap(0, Ordering::AcqRel))
    }

    pub fn peek(&self) -> StatusBits {
        StatusBits::from_bits_truncate(self.bits.load(Ordering::Acquire))
    }
}

/// The driver's record of its device
///
/// Lives from the allocation step of init until after the IRQ line has been
/// freed on exit. The fast handler and the IRQ thread only ever see it
/// through shared references.
#[derive(Debug)]
pub struct DeviceState {
    irq: u32,
    status: StatusRegister,
    processed: AtomicU64,
}

impl DeviceState {
    pub fn new(irq: u32) -> Self {
        Self {
            irq,
            status: StatusRegister::default(),
            processed: AtomicU64::new(0),
        }
    }

    /// IRQ line the device is attached to
    pub fn irq(&self) -> u32 {
        self.irq
    }

    pub fn status(&self) -> &StatusRegister {
        &self.status
    }

    /// Events the IRQ thread has finished processing
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    pub(crate) fn record_processed(&self) -> u64 {
        self.processed.fetch_add(1, Ordering::AcqRel) + 1
    }
}
