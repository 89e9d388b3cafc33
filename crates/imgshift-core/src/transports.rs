use imgshift_registry::{RegistryError, TransportHandle, TransportResolver};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Memoizes virtual transports per storage location.
///
/// The lock is held across a miss so concurrent walks resolve each location
/// exactly once. Failed lookups are not cached.
pub struct TransportCache {
    inner: Arc<dyn TransportResolver>,
    handles: Mutex<HashMap<String, TransportHandle>>,
}

impl TransportCache {
    pub fn new(inner: Arc<dyn TransportResolver>) -> Self {
        Self {
            inner,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TransportResolver for TransportCache {
    fn resolve(&self, location: &str) -> Result<TransportHandle, RegistryError> {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = handles.get(location) {
            return Ok(Arc::clone(handle));
        }
        let handle = self.inner.resolve(location)?;
        debug!("resolved transport {} for location '{location}'", handle.name());
        handles.insert(location.to_owned(), Arc::clone(&handle));
        Ok(handle)
    }
}
