//! Module loader - hosts one driver instance from load to unload
//!
//! ```text
//!  Unloaded --load--> Loading --ok--> Live --unload--> Unloading --> Unloaded
//!                        |
//!                        +--err--> Unloaded
//! ```
//!
//! `Loading` and `Unloading` last only for the duration of the call. The
//! loader serializes lifecycle calls through `&mut self`; calling `load`
//! while live or `unload` while not live is refused with `InvalidState`.

use std::fmt;
use std::sync::Arc;

use cap_broker::CapabilityBroker;

use crate::{Driver, DriverError, Result};

/// Lifecycle state of a hosted driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Unloaded,
    Loading,
    Live,
    Unloading,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleState::Unloaded => "unloaded",
            ModuleState::Loading => "loading",
            ModuleState::Live => "live",
            ModuleState::Unloading => "unloading",
        };
        f.write_str(name)
    }
}

/// Host for one driver instance
pub struct ModuleLoader<D: Driver> {
    broker: Arc<dyn CapabilityBroker>,
    state: ModuleState,
    driver: Option<D>,
}

impl<D: Driver> ModuleLoader<D> {
    pub fn new(broker: Arc<dyn CapabilityBroker>) -> Self {
        Self {
            broker,
            state: ModuleState::Unloaded,
            driver: None,
        }
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    /// The live driver, if loaded
    pub fn driver(&self) -> Option<&D> {
        self.driver.as_ref()
    }

    /// Initialize the driver
    ///
    /// On failure the driver has already released everything it acquired and
    /// the loader is back to `Unloaded`.
    pub fn load(&mut self, params: D::Params) -> Result<()> {
        if self.state != ModuleState::Unloaded {
            return Err(DriverError::InvalidState {
                op: "load",
                state: self.state,
            });
        }

        self.state = ModuleState::Loading;
        log::debug!("{}: loading v{}", D::driver_name(), D::driver_version());

        match D::init(Arc::clone(&self.broker), params) {
            Ok(driver) => {
                self.driver = Some(driver);
                self.state = ModuleState::Live;
                Ok(())
            }
            Err(e) => {
                self.state = ModuleState::Unloaded;
                log::error!("{}: load failed ({}): {}", D::driver_name(), e.errno(), e);
                Err(e)
            }
        }
    }

    /// Tear the driver down
    ///
    /// Blocks for as long as the driver's exit path blocks.
    pub fn unload(&mut self) -> Result<()> {
        if self.state != ModuleState::Live {
            return Err(DriverError::InvalidState {
                op: "unload",
                state: self.state,
            });
        }

        self.state = ModuleState::Unloading;
        if let Some(driver) = self.driver.take() {
            driver.exit();
        }
        self.state = ModuleState::Unloaded;
        log::info!("{}: Module unloaded", D::driver_name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Acquired, DriverMetadata};
    use cap_broker::{ClassHandle, DefaultCapBroker, Resource};

    struct ClassOnly {
        _class: Acquired<ClassHandle>,
    }

    impl DriverMetadata for ClassOnly {
        fn driver_name() -> &'static str {
            "class_only"
        }
    }

    impl Driver for ClassOnly {
        type Params = &'static str;

        fn init(broker: Arc<dyn CapabilityBroker>, name: &'static str) -> Result<Self> {
            let class = Acquired::acquire(&broker, |b| b.class_create(name))
                .map_err(|e| DriverError::exhausted(Resource::Class, e))?;
            Ok(Self { _class: class })
        }

        fn exit(self) {}
    }

    fn loader() -> (Arc<DefaultCapBroker>, ModuleLoader<ClassOnly>) {
        let broker = Arc::new(DefaultCapBroker::new());
        let loader = ModuleLoader::new(broker.clone());
        (broker, loader)
    }

    #[test]
    fn test_load_unload_cycle() {
        let (broker, mut loader) = loader();
        assert_eq!(loader.state(), ModuleState::Unloaded);

        loader.load("demo").unwrap();
        assert_eq!(loader.state(), ModuleState::Live);
        assert!(loader.driver().is_some());
        assert_eq!(broker.live(Resource::Class), 1);

        loader.unload().unwrap();
        assert_eq!(loader.state(), ModuleState::Unloaded);
        assert!(loader.driver().is_none());
        assert_eq!(broker.total_live(), 0);

        // Reloading after unload works.
        loader.load("demo").unwrap();
        loader.unload().unwrap();
    }

    #[test]
    fn test_failed_load_returns_to_unloaded() {
        let (broker, mut loader) = loader();
        broker.inject_fault(Resource::Class);

        let err = loader.load("demo").unwrap_err();
        assert!(matches!(err, DriverError::ResourceExhausted { resource: Resource::Class, .. }));
        assert_eq!(loader.state(), ModuleState::Unloaded);
    }

    #[test]
    fn test_out_of_order_calls_refused() {
        let (_broker, mut loader) = loader();
        assert!(matches!(
            loader.unload(),
            Err(DriverError::InvalidState { op: "unload", state: ModuleState::Unloaded })
        ));

        loader.load("demo").unwrap();
        assert!(matches!(
            loader.load("demo"),
            Err(DriverError::InvalidState { op: "load", state: ModuleState::Live })
        ));
        assert_eq!(loader.state(), ModuleState::Live);
        loader.unload().unwrap();
    }
}
