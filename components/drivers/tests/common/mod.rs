//! Shared fixtures for the driver integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use cap_broker::{CapabilityBroker, DefaultCapBroker, LedgerAction, Resource};
use crossbeam::channel::{self, Receiver, Sender};
use dddk_runtime::{DriverError, Result};
use threaded_irq::{DeviceConfig, DeviceState, EventWork, ModuleParams, ThreadedIrqDevice};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// A broker, both as itself and as the trait object drivers see
pub fn broker() -> (Arc<DefaultCapBroker>, Arc<dyn CapabilityBroker>) {
    let concrete = Arc::new(DefaultCapBroker::new());
    let dynamic: Arc<dyn CapabilityBroker> = concrete.clone();
    (concrete, dynamic)
}

/// Bring the device up on `irq` with `work`
pub fn device_on(broker: &Arc<dyn CapabilityBroker>, params: ModuleParams, work: Arc<dyn EventWork>) -> ThreadedIrqDevice {
    let config = DeviceConfig::new(params).with_work(work);
    ThreadedIrqDevice::init(Arc::clone(broker), config).expect("device init")
}

/// Resources released so far, in order
pub fn releases(broker: &DefaultCapBroker) -> Vec<Resource> {
    broker
        .journal()
        .into_iter()
        .filter(|e| e.action == LedgerAction::Release)
        .map(|e| e.resource)
        .collect()
}

/// Poll `cond` until it holds or the timeout passes
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Reports each event on a channel
pub struct Notify {
    events: Sender<u32>,
}

impl Notify {
    pub fn new() -> (Arc<Self>, Receiver<u32>) {
        let (events, rx) = channel::unbounded();
        (Arc::new(Self { events }), rx)
    }
}

impl EventWork for Notify {
    fn run(&self, state: &DeviceState) -> Result<()> {
        let _ = self.events.send(state.irq());
        Ok(())
    }
}

/// Blocks every event until the test lets it through
pub struct Gated {
    entered: Sender<()>,
    release: Receiver<()>,
    finished: Mutex<Option<Instant>>,
}

pub struct Gate {
    pub entered: Receiver<()>,
    pub release: Sender<()>,
}

impl Gated {
    pub fn new() -> (Arc<Self>, Gate) {
        let (entered_tx, entered_rx) = channel::unbounded();
        let (release_tx, release_rx) = channel::unbounded();
        let work = Arc::new(Self {
            entered: entered_tx,
            release: release_rx,
            finished: Mutex::new(None),
        });
        let gate = Gate {
            entered: entered_rx,
            release: release_tx,
        };
        (work, gate)
    }

    /// When the most recent event finished
    pub fn finished(&self) -> Option<Instant> {
        *self.finished.lock().unwrap()
    }
}

impl EventWork for Gated {
    fn run(&self, _state: &DeviceState) -> Result<()> {
        let _ = self.entered.send(());
        self.release
            .recv()
            .map_err(|_| DriverError::ProcessingError("gate dropped".into()))?;
        *self.finished.lock().unwrap() = Some(Instant::now());
        Ok(())
    }
}

/// Fails every event
#[derive(Default)]
pub struct Faulty {
    pub runs: AtomicUsize,
}

impl EventWork for Faulty {
    fn run(&self, _state: &DeviceState) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Err(DriverError::ProcessingError("device reported an error".into()))
    }
}
