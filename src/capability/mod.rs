//! Capabilities of the system under test.
//!
//! Adapters for concrete products live outside this crate. They implement the
//! traits below and register them in a [`TraitRegistry`]; stages ask for the
//! capabilities they need through an [`Injector`] and never see the product
//! type.
pub mod registry;

use std::collections::BTreeMap;
use std::sync::Arc;

pub use registry::{Dependency, InjectResult, Injector, TraitRegistry};

use crate::error::CapabilityError;

/// Starting and stopping the service under test on one worker.
pub trait Lifecycle: Send + Sync {
    fn start(&self) -> Result<(), CapabilityError>;
    fn stop(&self) -> Result<(), CapabilityError>;
    fn is_running(&self) -> bool;
}

/// Fallback lifecycle for services that are always up.
pub struct AlwaysRunning;

impl Lifecycle for AlwaysRunning {
    fn start(&self) -> Result<(), CapabilityError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), CapabilityError> {
        Ok(())
    }

    fn is_running(&self) -> bool {
        true
    }
}

/// Key-value access. Implementations are shared by every stress thread and
/// must handle concurrent calls themselves.
pub trait BasicOperations: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CapabilityError>;
    /// Stores `value`, returning the previous value if the product reports it.
    fn put(&self, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>, CapabilityError>;
    /// Returns whether a value was removed.
    fn remove(&self, key: &str) -> Result<bool, CapabilityError>;
}

/// Entry point to transactions.
pub trait Transactional: Send + Sync {
    fn begin(&self) -> Result<Box<dyn Transaction>, CapabilityError>;
}

/// An open transaction. Operations issued through [`Transaction::operations`]
/// belong to it until commit or rollback.
pub trait Transaction: Send {
    fn operations(&self) -> Arc<dyn BasicOperations>;
    fn commit(self: Box<Self>) -> Result<(), CapabilityError>;
    fn rollback(self: Box<Self>) -> Result<(), CapabilityError>;
}

/// Point-in-time gauges of the service, polled by a monitor.
pub trait Sampler: Send + Sync {
    /// Current value of every gauge, keyed by name.
    fn sample(&self) -> Result<BTreeMap<String, f64>, CapabilityError>;
}
