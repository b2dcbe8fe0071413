//! Init and exit of the threaded IRQ device
//!
//! - Every init step unwinds exactly the completed steps when it fails
//! - Exit releases in reverse acquisition order
//! - Conflicts found by the broker surface as the right driver error

mod common;

use std::sync::Arc;

use cap_broker::{CapabilityBroker, CapabilityError, DefaultCapBroker, IrqFlags, IrqHandler, IrqReturn, Resource};
use common::{broker, releases};
use dddk_runtime::{DriverError, ModuleLoader, ModuleState};
use threaded_irq::{DeviceConfig, ModuleParams, ThreadedIrqDevice, DEVICE_NAME};

const ACQUISITION_ORDER: [Resource; 6] = [
    Resource::ChrdevRegion,
    Resource::Class,
    Resource::Cdev,
    Resource::Node,
    Resource::Memory,
    Resource::Irq,
];

struct Bystander;

impl IrqHandler for Bystander {
    fn handle(&self, _irq: u32) -> IrqReturn {
        IrqReturn::None
    }

    fn thread_fn(&self, _irq: u32) -> IrqReturn {
        IrqReturn::None
    }
}

#[test]
fn test_init_publishes_node_and_line() {
    let (concrete, broker) = broker();
    let device = ThreadedIrqDevice::init(broker, DeviceConfig::default()).unwrap();

    assert_eq!(device.irq(), 10);
    assert_eq!(device.node_name(), DEVICE_NAME);
    assert_eq!(device.dev().minor(), 0);
    assert_eq!(
        concrete.devices(),
        vec![(device.major(), DEVICE_NAME.to_string())]
    );
    assert_eq!(concrete.irq_actions(10), 1);
    for resource in ACQUISITION_ORDER {
        assert_eq!(concrete.live(resource), 1, "{} held", resource);
    }

    device.exit();
    assert_eq!(concrete.total_live(), 0);
    assert_eq!(concrete.irq_actions(10), 0);
    assert_eq!(concrete.memory_in_use(), 0);
    assert!(matches!(
        concrete.open(DEVICE_NAME),
        Err(CapabilityError::NoDevice { .. })
    ));
}

#[test]
fn test_exit_releases_in_reverse() {
    let (concrete, broker) = broker();
    let device = ThreadedIrqDevice::init(broker, DeviceConfig::default()).unwrap();
    device.exit();

    let mut expected = ACQUISITION_ORDER.to_vec();
    expected.reverse();
    assert_eq!(releases(&concrete), expected);
}

/// Test a failure at each of the six steps
#[test]
fn test_failed_step_unwinds_completed_steps() {
    for (step, failing) in ACQUISITION_ORDER.into_iter().enumerate() {
        let (concrete, broker) = broker();
        concrete.inject_fault(failing);

        let err = ThreadedIrqDevice::init(broker, DeviceConfig::default()).unwrap_err();
        match failing {
            Resource::Irq => {
                assert!(matches!(err, DriverError::RegistrationConflict { irq: 10, .. }));
                assert_eq!(err.errno(), -16);
            }
            _ => {
                assert!(
                    matches!(err, DriverError::ResourceExhausted { resource, .. } if resource == failing),
                    "step {}: {:?}",
                    step,
                    err
                );
                assert_eq!(err.errno(), -12);
            }
        }

        let mut unwound = ACQUISITION_ORDER[..step].to_vec();
        unwound.reverse();
        assert_eq!(releases(&concrete), unwound, "failing {}", failing);
        assert_eq!(concrete.total_live(), 0, "failing {}", failing);
    }
}

#[test]
fn test_exclusive_owner_refuses_line() {
    let (concrete, broker) = broker();
    let owner = concrete
        .request_threaded_irq(10, Arc::new(Bystander), IrqFlags::empty(), "owner")
        .unwrap();

    let err = ThreadedIrqDevice::init(broker, DeviceConfig::default()).unwrap_err();
    match err {
        DriverError::RegistrationConflict {
            irq: 10,
            source: CapabilityError::IrqBusy { .. },
        } => {}
        other => panic!("unexpected error: {:?}", other),
    }

    // Only the owner's line is left.
    assert_eq!(concrete.total_live(), 1);
    concrete.free_irq(owner);
}

#[test]
fn test_line_shared_with_cooperative_owner() {
    let (concrete, broker) = broker();
    let other = concrete
        .request_threaded_irq(10, Arc::new(Bystander), IrqFlags::SHARED, "other")
        .unwrap();

    let device = ThreadedIrqDevice::init(broker, DeviceConfig::default()).unwrap();
    assert_eq!(concrete.irq_actions(10), 2);

    device.exit();
    assert_eq!(concrete.irq_actions(10), 1);
    concrete.free_irq(other);
}

#[test]
fn test_out_of_range_line() {
    let (concrete, broker) = broker();
    let params = ModuleParams::parse_args(["irq_number=5000"]).unwrap();

    let err = ThreadedIrqDevice::init(broker, params.into()).unwrap_err();
    assert!(matches!(
        err,
        DriverError::RegistrationConflict {
            irq: 5000,
            source: CapabilityError::InvalidIrq { irq: 5000 }
        }
    ));
    assert_eq!(concrete.total_live(), 0);
}

#[test]
fn test_class_name_taken() {
    let (concrete, broker) = broker();
    let squatter = concrete.class_create(DEVICE_NAME).unwrap();

    let err = ThreadedIrqDevice::init(broker, DeviceConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        DriverError::ResourceExhausted {
            resource: Resource::Class,
            source: CapabilityError::ClassExists { .. }
        }
    ));
    assert_eq!(releases(&concrete), [Resource::ChrdevRegion]);

    concrete.class_destroy(squatter);
}

#[test]
fn test_no_memory_for_state() {
    let concrete = Arc::new(DefaultCapBroker::with_memory_limit(0));
    let broker: Arc<dyn CapabilityBroker> = concrete.clone();

    let err = ThreadedIrqDevice::init(broker, DeviceConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        DriverError::ResourceExhausted {
            resource: Resource::Memory,
            source: CapabilityError::OutOfMemory { .. }
        }
    ));
    assert_eq!(
        releases(&concrete),
        [Resource::Node, Resource::Cdev, Resource::Class, Resource::ChrdevRegion]
    );
}

#[test]
fn test_loader_hosts_device() {
    let (concrete, broker) = broker();
    let mut loader = ModuleLoader::<ThreadedIrqDevice>::new(broker);

    let params = ModuleParams::parse_args(["irq_number=12"]).unwrap();
    loader.load(params.into()).unwrap();
    assert_eq!(loader.state(), ModuleState::Live);
    assert_eq!(loader.driver().map(|d| d.irq()), Some(12));
    assert_eq!(concrete.irq_actions(12), 1);

    loader.unload().unwrap();
    assert_eq!(loader.state(), ModuleState::Unloaded);
    assert_eq!(concrete.total_live(), 0);

    // A failed load leaves the loader reusable.
    concrete.inject_fault(Resource::Node);
    assert!(loader.load(DeviceConfig::default()).is_err());
    assert_eq!(loader.state(), ModuleState::Unloaded);
    loader.load(DeviceConfig::default()).unwrap();
    loader.unload().unwrap();
    assert_eq!(concrete.total_live(), 0);
}
