//! Deferred-context processing
//!
//! Runs on the IRQ thread, one event at a time. It may block. Failures are
//! logged and counted here; they never reach the IRQ subsystem.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dddk_runtime::{DriverError, Result};

use crate::{DeviceState, DEVICE_NAME};

/// Work done for one handed-off event
pub trait EventWork: Send + Sync {
    fn run(&self, state: &DeviceState) -> Result<()>;
}

/// Logs the event
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEvent;

impl EventWork for LogEvent {
    fn run(&self, state: &DeviceState) -> Result<()> {
        log::info!("{}: Received interrupt on IRQ {}", DEVICE_NAME, state.irq());
        Ok(())
    }
}

pub struct DeferredProcessor {
    work: Arc<dyn EventWork>,
    faults: AtomicU64,
}

impl DeferredProcessor {
    pub fn new(work: Arc<dyn EventWork>) -> Self {
        Self {
            work,
            faults: AtomicU64::new(0),
        }
    }

    /// Process one handed-off event
    pub fn process(&self, state: &DeviceState) -> Result<()> {
        log::info!(
            "{}: Interrupt {} processing in thread (bottom half)",
            DEVICE_NAME,
            state.irq()
        );

        match self.work.run(state) {
            Ok(()) => {
                let total = state.record_processed();
                log::debug!("{}: {} events processed", DEVICE_NAME, total);
                Ok(())
            }
            Err(e) => {
                self.faults.fetch_add(1, Ordering::Relaxed);
                let err = match e {
                    DriverError::ProcessingError(_) => e,
                    other => DriverError::ProcessingError(other.to_string()),
                };
                log::warn!("{}: {}", DEVICE_NAME, err);
                Err(err)
            }
        }
    }

    /// Events whose processing failed
    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for DeferredProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredProcessor")
            .field("faults", &self.faults())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl EventWork for Failing {
        fn run(&self, _state: &DeviceState) -> Result<()> {
            Err(DriverError::TransferFailed)
        }
    }

    #[test]
    fn test_success_counts_on_state() {
        let processor = DeferredProcessor::new(Arc::new(LogEvent));
        let state = DeviceState::new(3);

        processor.process(&state).unwrap();
        processor.process(&state).unwrap();
        assert_eq!(state.processed(), 2);
        assert_eq!(processor.faults(), 0);
    }

    #[test]
    fn test_failure_is_contained() {
        let processor = DeferredProcessor::new(Arc::new(Failing));
        let state = DeviceState::new(3);

        let err = processor.process(&state).unwrap_err();
        assert!(matches!(err, DriverError::ProcessingError(_)));
        assert_eq!(err.errno(), -5);
        assert_eq!(processor.faults(), 1);
        assert_eq!(state.processed(), 0);
    }
}
