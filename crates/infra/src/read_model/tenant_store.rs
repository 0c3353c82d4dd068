use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use clinicflow_core::TenantId;

use super::ReadModelError;

/// Tenant-isolated key/value store for disposable read models.
///
/// Every mutation is keyed by natural id, so applying the same projection
/// step twice leaves the row unchanged.
pub trait TenantStore<K, V>: Send + Sync {
    fn get(&self, tenant_id: TenantId, key: &K) -> Result<Option<V>, ReadModelError>;

    /// Insert unless the key exists. Returns `true` when a row was created.
    fn insert_if_absent(&self, tenant_id: TenantId, key: K, value: V) -> Result<bool, ReadModelError>;

    /// Mutate an existing row in place. Returns `false` when the key is unknown.
    fn update(&self, tenant_id: TenantId, key: &K, f: &mut dyn FnMut(&mut V)) -> Result<bool, ReadModelError>;

    fn list(&self, tenant_id: TenantId) -> Result<Vec<V>, ReadModelError>;

    /// Clear all records for a tenant (rebuild support).
    fn clear_tenant(&self, tenant_id: TenantId) -> Result<(), ReadModelError>;
}

impl<K, V, S> TenantStore<K, V> for Arc<S>
where
    S: TenantStore<K, V> + ?Sized,
{
    fn get(&self, tenant_id: TenantId, key: &K) -> Result<Option<V>, ReadModelError> {
        (**self).get(tenant_id, key)
    }

    fn insert_if_absent(&self, tenant_id: TenantId, key: K, value: V) -> Result<bool, ReadModelError> {
        (**self).insert_if_absent(tenant_id, key, value)
    }

    fn update(&self, tenant_id: TenantId, key: &K, f: &mut dyn FnMut(&mut V)) -> Result<bool, ReadModelError> {
        (**self).update(tenant_id, key, f)
    }

    fn list(&self, tenant_id: TenantId) -> Result<Vec<V>, ReadModelError> {
        (**self).list(tenant_id)
    }

    fn clear_tenant(&self, tenant_id: TenantId) -> Result<(), ReadModelError> {
        (**self).clear_tenant(tenant_id)
    }
}

/// In-memory tenant-isolated store for tests/dev.
#[derive(Debug)]
pub struct InMemoryTenantStore<K, V> {
    inner: RwLock<HashMap<(TenantId, K), V>>,
}

impl<K, V> InMemoryTenantStore<K, V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<(TenantId, K), V>>, ReadModelError> {
        self.inner
            .read()
            .map_err(|_| ReadModelError::Backend("tenant store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<(TenantId, K), V>>, ReadModelError> {
        self.inner
            .write()
            .map_err(|_| ReadModelError::Backend("tenant store lock poisoned".to_string()))
    }
}

impl<K, V> Default for InMemoryTenantStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TenantStore<K, V> for InMemoryTenantStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, tenant_id: TenantId, key: &K) -> Result<Option<V>, ReadModelError> {
        Ok(self.read()?.get(&(tenant_id, key.clone())).cloned())
    }

    fn insert_if_absent(&self, tenant_id: TenantId, key: K, value: V) -> Result<bool, ReadModelError> {
        let mut map = self.write()?;
        match map.entry((tenant_id, key)) {
            std::collections::hash_map::Entry::Occupied(_) => Ok(false),
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(true)
            }
        }
    }

    fn update(&self, tenant_id: TenantId, key: &K, f: &mut dyn FnMut(&mut V)) -> Result<bool, ReadModelError> {
        let mut map = self.write()?;
        match map.get_mut(&(tenant_id, key.clone())) {
            Some(value) => {
                f(value);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn list(&self, tenant_id: TenantId) -> Result<Vec<V>, ReadModelError> {
        Ok(self
            .read()?
            .iter()
            .filter_map(|((t, _k), v)| if *t == tenant_id { Some(v.clone()) } else { None })
            .collect())
    }

    fn clear_tenant(&self, tenant_id: TenantId) -> Result<(), ReadModelError> {
        self.write()?.retain(|(t, _k), _v| *t != tenant_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_if_absent_keeps_the_first_value() {
        let store = InMemoryTenantStore::<u32, &'static str>::new();
        let tenant = TenantId::new();

        assert!(store.insert_if_absent(tenant, 1, "first").unwrap());
        assert!(!store.insert_if_absent(tenant, 1, "second").unwrap());
        assert_eq!(store.get(tenant, &1).unwrap(), Some("first"));
    }

    #[test]
    fn update_reports_missing_rows() {
        let store = InMemoryTenantStore::<u32, u32>::new();
        let tenant = TenantId::new();
        store.insert_if_absent(tenant, 1, 10).unwrap();

        assert!(store.update(tenant, &1, &mut |v| *v += 1).unwrap());
        assert!(!store.update(tenant, &2, &mut |v| *v += 1).unwrap());
        assert_eq!(store.get(tenant, &1).unwrap(), Some(11));
    }

    #[test]
    fn tenants_are_isolated() {
        let store = InMemoryTenantStore::<u32, u32>::new();
        let a = TenantId::new();
        let b = TenantId::new();
        store.insert_if_absent(a, 1, 1).unwrap();
        store.insert_if_absent(b, 1, 2).unwrap();

        assert_eq!(store.list(a).unwrap(), vec![1]);
        store.clear_tenant(a).unwrap();
        assert!(store.list(a).unwrap().is_empty());
        assert_eq!(store.get(b, &1).unwrap(), Some(2));
    }

    #[test]
    fn poisoned_lock_is_an_error_not_a_missing_row() {
        let store = Arc::new(InMemoryTenantStore::<u32, u32>::new());
        let tenant = TenantId::new();
        store.insert_if_absent(tenant, 1, 1).unwrap();

        let writer = store.clone();
        let crashed = std::thread::spawn(move || {
            let _ = writer.update(tenant, &1, &mut |_| panic!("projection step panicked"));
        })
        .join();
        assert!(crashed.is_err());

        assert!(matches!(store.insert_if_absent(tenant, 2, 2), Err(ReadModelError::Backend(_))));
        assert!(matches!(store.update(tenant, &1, &mut |v| *v += 1), Err(ReadModelError::Backend(_))));
        assert!(store.get(tenant, &1).is_err());
    }
}
