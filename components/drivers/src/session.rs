//! Open-file bookkeeping

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use cap_broker::FileContext;

use crate::DEVICE_NAME;

/// Counts sessions on the device node
///
/// Sessions carry no driver state; each open file keeps its own position.
#[derive(Debug, Default)]
pub struct SessionTracker {
    open: AtomicUsize,
    total: AtomicU64,
}

impl SessionTracker {
    pub(crate) fn opened(&self, ctx: &FileContext) {
        self.open.fetch_add(1, Ordering::AcqRel);
        self.total.fetch_add(1, Ordering::Relaxed);
        log::info!("{}: Device opened", DEVICE_NAME);
        log::debug!("{}: session {} on {}", DEVICE_NAME, ctx.session(), ctx.dev());
    }

    pub(crate) fn released(&self, ctx: &FileContext) {
        self.open.fetch_sub(1, Ordering::AcqRel);
        log::info!("{}: Device released", DEVICE_NAME);
        log::debug!("{}: session {} closed", DEVICE_NAME, ctx.session());
    }

    /// Sessions currently open
    pub fn open_sessions(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    /// Sessions ever opened
    pub fn total_sessions(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}
