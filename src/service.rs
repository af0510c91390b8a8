//! Reference service adapters.
#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::{Mutex, RwLock};

    use crate::capability::{
        BasicOperations, Lifecycle, Sampler, Transaction, Transactional, TraitRegistry,
    };
    use crate::error::CapabilityError;

    type Store = RwLock<HashMap<String, Vec<u8>>>;

    /// A key-value map in process memory, with lifecycle, read-committed
    /// transactions and an entry-count gauge. Useful for trying benchmarks
    /// without a real product.
    #[derive(Default)]
    pub struct InMemoryCache {
        store: Arc<Store>,
        running: Arc<AtomicBool>,
    }

    impl InMemoryCache {
        /// A stopped cache; a `ServiceStart` stage brings it up.
        pub fn new() -> Self {
            Self::default()
        }

        pub fn len(&self) -> usize {
            self.store.read().len()
        }

        pub fn is_empty(&self) -> bool {
            self.store.read().is_empty()
        }

        /// Registers every capability of this cache.
        pub fn register(self: Arc<Self>, registry: &mut TraitRegistry) {
            registry
                .register::<dyn Lifecycle>(self.clone())
                .register::<dyn BasicOperations>(self.clone())
                .register::<dyn Sampler>(self.clone())
                .register::<dyn Transactional>(self);
        }

        fn ensure_running(&self) -> Result<(), CapabilityError> {
            if self.running.load(Ordering::Acquire) {
                Ok(())
            } else {
                Err(CapabilityError::Request("cache is stopped".into()))
            }
        }
    }

    impl Lifecycle for InMemoryCache {
        fn start(&self) -> Result<(), CapabilityError> {
            self.running.store(true, Ordering::Release);
            Ok(())
        }

        fn stop(&self) -> Result<(), CapabilityError> {
            self.running.store(false, Ordering::Release);
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::Acquire)
        }
    }

    impl Sampler for InMemoryCache {
        fn sample(&self) -> Result<BTreeMap<String, f64>, CapabilityError> {
            let running = if self.is_running() { 1.0 } else { 0.0 };
            Ok(BTreeMap::from([
                ("entries".to_owned(), self.len() as f64),
                ("running".to_owned(), running),
            ]))
        }
    }

    impl BasicOperations for InMemoryCache {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CapabilityError> {
            self.ensure_running()?;
            Ok(self.store.read().get(key).cloned())
        }

        fn put(&self, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>, CapabilityError> {
            self.ensure_running()?;
            Ok(self.store.write().insert(key.to_owned(), value))
        }

        fn remove(&self, key: &str) -> Result<bool, CapabilityError> {
            self.ensure_running()?;
            Ok(self.store.write().remove(key).is_some())
        }
    }

    impl Transactional for InMemoryCache {
        fn begin(&self) -> Result<Box<dyn Transaction>, CapabilityError> {
            self.ensure_running()?;
            Ok(Box::new(CacheTransaction {
                operations: Arc::new(BufferedWrites {
                    store: self.store.clone(),
                    writes: Mutex::new(HashMap::new()),
                }),
            }))
        }
    }

    /// Writes of an open transaction; `None` marks a removal.
    struct BufferedWrites {
        store: Arc<Store>,
        writes: Mutex<HashMap<String, Option<Vec<u8>>>>,
    }

    impl BasicOperations for BufferedWrites {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CapabilityError> {
            if let Some(pending) = self.writes.lock().get(key) {
                return Ok(pending.clone());
            }
            Ok(self.store.read().get(key).cloned())
        }

        fn put(&self, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>, CapabilityError> {
            let previous = self.get(key)?;
            self.writes.lock().insert(key.to_owned(), Some(value));
            Ok(previous)
        }

        fn remove(&self, key: &str) -> Result<bool, CapabilityError> {
            let existed = self.get(key)?.is_some();
            self.writes.lock().insert(key.to_owned(), None);
            Ok(existed)
        }
    }

    struct CacheTransaction {
        operations: Arc<BufferedWrites>,
    }

    impl Transaction for CacheTransaction {
        fn operations(&self) -> Arc<dyn BasicOperations> {
            self.operations.clone()
        }

        fn commit(self: Box<Self>) -> Result<(), CapabilityError> {
            let writes = std::mem::take(&mut *self.operations.writes.lock());
            let mut store = self.operations.store.write();
            for (key, value) in writes {
                match value {
                    Some(value) => store.insert(key, value),
                    None => store.remove(&key),
                };
            }
            Ok(())
        }

        fn rollback(self: Box<Self>) -> Result<(), CapabilityError> {
            self.operations.writes.lock().clear();
            Ok(())
        }
    }

}
