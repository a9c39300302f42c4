//! In-memory blob backend. Implements the full [BlobStore] contract
//! (including conditional create) against a process-local map; used by the
//! test suite and as the reference for what cloud bindings must provide.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::upath::BlobStore;

pub struct MemoryBlobStore {
    scheme: String,
    bucket: String,
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new(scheme: impl Into<String>, bucket: impl Into<String>) -> Self {
        MemoryBlobStore {
            scheme: scheme.into(),
            bucket: bucket.into(),
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn uri(&self, key: &str) -> String {
        format!("{}://{}/{}", self.scheme, self.bucket, key)
    }
}

impl BlobStore for MemoryBlobStore {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(self.uri(key)))
    }

    fn put(&self, key: &str, data: &[u8], overwrite: bool) -> Result<()> {
        let mut objects = self.objects.write().unwrap();
        if !overwrite && objects.contains_key(key) {
            return Err(Error::AlreadyExists(self.uri(key)));
        }
        objects.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.objects
            .write()
            .unwrap()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(self.uri(key)))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read().unwrap().contains_key(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
