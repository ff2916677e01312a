// vim: tw=80
//! Persistent records in the pool's metadata container

use std::{
    collections::BTreeMap,
    sync::Mutex
};

#[cfg(test)] use mockall::automock;

use crate::types::*;

/// Named records and numbered objects, stored durably by the pool.
///
/// Updates become durable when the current txg syncs.
#[cfg_attr(test, automock)]
pub trait MetaStore: Send + Sync {
    fn lookup(&self, name: &str) -> Result<Option<Vec<u8>>>;
    fn update(&self, name: &str, buf: &[u8]) -> Result<()>;
    fn remove(&self, name: &str) -> Result<()>;
    /// Allocate a new, empty object
    fn create_object(&self) -> Result<u64>;
    fn read_object(&self, obj: u64) -> Result<Vec<u8>>;
    fn write_object(&self, obj: u64, buf: &[u8]) -> Result<()>;
    fn free_object(&self, obj: u64) -> Result<()>;
}

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<String, Vec<u8>>,
    objects: BTreeMap<u64, Vec<u8>>,
    next_obj: u64,
}

/// A `MetaStore` that lives entirely in RAM.
#[derive(Debug, Default)]
pub struct MemStore {
    inner: Mutex<Inner>
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of allocated objects
    pub fn objects(&self) -> usize {
        self.inner.lock().unwrap().objects.len()
    }
}

impl MetaStore for MemStore {
    fn lookup(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().unwrap().records.get(name).cloned())
    }

    fn update(&self, name: &str, buf: &[u8]) -> Result<()> {
        self.inner.lock().unwrap().records.insert(name.to_owned(), buf.to_vec());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.inner.lock().unwrap().records.remove(name);
        Ok(())
    }

    fn create_object(&self) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        // Object 0 is reserved to mean "no object"
        inner.next_obj += 1;
        let obj = inner.next_obj;
        inner.objects.insert(obj, Vec::new());
        Ok(obj)
    }

    fn read_object(&self, obj: u64) -> Result<Vec<u8>> {
        self.inner.lock().unwrap().objects.get(&obj)
            .cloned()
            .ok_or(Error::ENOENT)
    }

    fn write_object(&self, obj: u64, buf: &[u8]) -> Result<()> {
        match self.inner.lock().unwrap().objects.get_mut(&obj) {
            Some(v) => {
                *v = buf.to_vec();
                Ok(())
            },
            None => Err(Error::ENOENT)
        }
    }

    fn free_object(&self, obj: u64) -> Result<()> {
        self.inner.lock().unwrap().objects.remove(&obj)
            .map(drop)
            .ok_or(Error::ENOENT)
    }
}

// LCOV_EXCL_STOP
