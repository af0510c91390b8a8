use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;

/// Capabilities an adapter exposes, keyed by the capability trait.
///
/// ```rust
/// use std::sync::Arc;
/// use fleetbench::capability::{Lifecycle, TraitRegistry};
/// # use fleetbench::error::CapabilityError;
///
/// struct Service;
/// impl Lifecycle for Service {
///     fn start(&self) -> Result<(), CapabilityError> { Ok(()) }
///     fn stop(&self) -> Result<(), CapabilityError> { Ok(()) }
///     fn is_running(&self) -> bool { true }
/// }
///
/// let mut registry = TraitRegistry::new();
/// registry.register::<dyn Lifecycle>(Arc::new(Service));
/// assert!(registry.get::<dyn Lifecycle>().is_some());
/// ```
#[derive(Clone, Default)]
pub struct TraitRegistry {
    traits: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl TraitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `implementation` as the provider of capability `T`,
    /// replacing any previous provider.
    pub fn register<T>(&mut self, implementation: Arc<T>) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.traits
            .insert(TypeId::of::<T>(), Arc::new(implementation));
        self
    }

    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.traits
            .get(&TypeId::of::<T>())
            .and_then(|provider| provider.downcast_ref::<Arc<T>>())
            .cloned()
    }

    pub fn contains<T>(&self) -> bool
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.traits.contains_key(&TypeId::of::<T>())
    }
}

/// What a stage does when a capability it asks for is not provided.
pub enum Dependency<T: ?Sized> {
    /// The stage cannot run without it.
    Mandatory,
    /// Run anyway and leave the slot empty.
    Optional,
    /// Run anyway with this fallback.
    Default(Arc<T>),
    /// Do not run the stage at all.
    Skip,
}

/// Outcome of resolving all capabilities of a stage.
///
/// Ordered by severity so the outcome of several injections is their max.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum InjectResult {
    Success,
    Skip,
    Failure,
}

/// Resolves a stage's capability requests against a registry and remembers
/// the worst outcome.
pub struct Injector<'a> {
    registry: &'a TraitRegistry,
    result: InjectResult,
    missing: Vec<&'static str>,
}

impl<'a> Injector<'a> {
    pub fn new(registry: &'a TraitRegistry) -> Self {
        Self {
            registry,
            result: InjectResult::Success,
            missing: Vec::new(),
        }
    }

    pub fn inject<T>(&mut self, dependency: Dependency<T>) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        if let Some(provided) = self.registry.get::<T>() {
            return Some(provided);
        }
        let outcome = match dependency {
            Dependency::Default(fallback) => {
                tracing::debug!("Using default implementation of {}", type_name::<T>());
                return Some(fallback);
            }
            Dependency::Optional => return None,
            Dependency::Mandatory => InjectResult::Failure,
            Dependency::Skip => InjectResult::Skip,
        };
        self.missing.push(type_name::<T>());
        self.result = self.result.max(outcome);
        None
    }

    pub fn result(&self) -> InjectResult {
        self.result
    }

    /// Capabilities that were required (mandatory or skip) but not provided.
    pub fn missing(&self) -> &[&'static str] {
        &self.missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{AlwaysRunning, Lifecycle};
    use crate::error::CapabilityError;

    trait Tagged: Send + Sync {
        fn id(&self) -> u32;
    }

    struct Fixed(u32);
    impl Tagged for Fixed {
        fn id(&self) -> u32 {
            self.0
        }
    }

    struct Stopped;
    impl Lifecycle for Stopped {
        fn start(&self) -> Result<(), CapabilityError> {
            Ok(())
        }
        fn stop(&self) -> Result<(), CapabilityError> {
            Ok(())
        }
        fn is_running(&self) -> bool {
            false
        }
    }

    #[test]
    fn registered_capability_is_injected_regardless_of_policy() {
        let mut registry = TraitRegistry::new();
        registry.register::<dyn Tagged>(Arc::new(Fixed(7)));
        let mut injector = Injector::new(&registry);
        let tagged = injector.inject::<dyn Tagged>(Dependency::Mandatory);
        assert_eq!(tagged.map(|p| p.id()), Some(7));
        assert_eq!(injector.result(), InjectResult::Success);
    }

    #[test]
    fn mandatory_missing_fails_and_leaves_slot_unset() {
        let registry = TraitRegistry::new();
        let mut injector = Injector::new(&registry);
        assert!(injector.inject::<dyn Tagged>(Dependency::Mandatory).is_none());
        assert_eq!(injector.result(), InjectResult::Failure);
        assert_eq!(injector.missing().len(), 1);
    }

    #[test]
    fn optional_missing_succeeds_unset() {
        let registry = TraitRegistry::new();
        let mut injector = Injector::new(&registry);
        assert!(injector.inject::<dyn Tagged>(Dependency::Optional).is_none());
        assert_eq!(injector.result(), InjectResult::Success);
    }

    #[test]
    fn skip_missing_signals_skip_unset() {
        let registry = TraitRegistry::new();
        let mut injector = Injector::new(&registry);
        assert!(injector.inject::<dyn Tagged>(Dependency::Skip).is_none());
        assert_eq!(injector.result(), InjectResult::Skip);
    }

    #[test]
    fn default_missing_uses_fallback() {
        let registry = TraitRegistry::new();
        let mut injector = Injector::new(&registry);
        let lifecycle = injector.inject::<dyn Lifecycle>(Dependency::Default(Arc::new(AlwaysRunning)));
        assert!(lifecycle.is_some_and(|l| l.is_running()));
        assert_eq!(injector.result(), InjectResult::Success);
    }

    #[test]
    fn provided_beats_default() {
        let mut registry = TraitRegistry::new();
        registry.register::<dyn Lifecycle>(Arc::new(Stopped));
        let mut injector = Injector::new(&registry);
        let lifecycle = injector
            .inject::<dyn Lifecycle>(Dependency::Default(Arc::new(AlwaysRunning)))
            .unwrap();
        assert!(!lifecycle.is_running());
    }

    #[test]
    fn failure_outranks_skip() {
        let registry = TraitRegistry::new();
        let mut injector = Injector::new(&registry);
        injector.inject::<dyn Tagged>(Dependency::Mandatory);
        injector.inject::<dyn Lifecycle>(Dependency::Skip);
        assert_eq!(injector.result(), InjectResult::Failure);
        assert_eq!(injector.missing().len(), 2);
    }
}
