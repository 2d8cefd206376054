//! In-memory reference implementation of the [`Collection`] contract.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::{Collection, Record, StoreError, Versioned};

/// Process-local collection backed by a `parking_lot`-guarded map. Honors
/// the full contract including version-token conditional updates, so the
/// engine's concurrency behavior is identical against a remote store.
pub struct InMemoryCollection<T> {
    records: RwLock<FxHashMap<String, Versioned<T>>>,
}

impl<T> Default for InMemoryCollection<T> {
    fn default() -> Self {
        Self {
            records: RwLock::new(FxHashMap::default()),
        }
    }
}

impl<T> InMemoryCollection<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T: Record + Clone + Send + Sync> Collection<T> for InMemoryCollection<T> {
    fn create(&self, doc: T) -> Result<Versioned<T>, StoreError> {
        let mut records = self.records.write();
        let id = doc.id().to_string();
        if records.contains_key(&id) {
            return Err(StoreError::AlreadyExists { id });
        }
        let versioned = Versioned { version: 1, doc };
        records.insert(id, versioned.clone());
        Ok(versioned)
    }

    fn get(&self, id: &str) -> Result<Versioned<T>, StoreError> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    fn conditional_update(
        &self,
        expected_version: u64,
        doc: T,
    ) -> Result<Versioned<T>, StoreError> {
        let mut records = self.records.write();
        let id = doc.id().to_string();
        let stored = records
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound { id: id.clone() })?;
        if stored.version != expected_version {
            return Err(StoreError::stale(
                id,
                format!(
                    "version mismatch: expected {expected_version}, stored {}",
                    stored.version
                ),
            ));
        }
        stored.version += 1;
        stored.doc = doc;
        Ok(stored.clone())
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.records
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    fn find(&self, filter: &dyn Fn(&T) -> bool) -> Vec<Versioned<T>> {
        self.records
            .read()
            .values()
            .filter(|v| filter(&v.doc))
            .cloned()
            .collect()
    }
}
