// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory [`ObjectStore`] for tests and local runs.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

use vp_core::ArtifactReference;

use crate::{ObjectStore, StoreError};

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: String,
}

/// In-memory object store with per-key transient-failure injection.
///
/// Objects live in a `(bucket, key)`-indexed map. `fail_get_times` arms a
/// counter that makes the next N reads of a key fail with
/// [`StoreError::Transient`], which is how loader retry behavior is
/// exercised.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,
    get_failures: Mutex<BTreeMap<(String, String), u32>>,
}

impl InMemoryObjectStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object directly.
    pub fn put_object(&self, bucket: &str, key: &str, bytes: Vec<u8>, content_type: &str) {
        self.objects.lock().expect("store lock poisoned").insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
    }

    /// Make the next `times` reads of `key` fail transiently.
    pub fn fail_get_times(&self, bucket: &str, key: &str, times: u32) {
        self.get_failures
            .lock()
            .expect("store lock poisoned")
            .insert((bucket.to_string(), key.to_string()), times);
    }

    /// Fetch an object's bytes for assertions.
    #[must_use]
    pub fn object_bytes(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .expect("store lock poisoned")
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.bytes.clone())
    }

    /// Fetch an object's recorded content type for assertions.
    #[must_use]
    pub fn content_type_of(&self, bucket: &str, key: &str) -> Option<String> {
        self.objects
            .lock()
            .expect("store lock poisoned")
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.content_type.clone())
    }

    /// All stored keys in `bucket`, sorted.
    #[must_use]
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .lock()
            .expect("store lock poisoned")
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    fn take_injected_failure(&self, bucket: &str, key: &str) -> bool {
        let mut failures = self.get_failures.lock().expect("store lock poisoned");
        let slot = (bucket.to_string(), key.to_string());
        match failures.get_mut(&slot) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                if *remaining == 0 {
                    failures.remove(&slot);
                }
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, reference: &ArtifactReference) -> Result<Vec<u8>, StoreError> {
        if self.take_injected_failure(&reference.bucket, &reference.key) {
            return Err(StoreError::Transient {
                key: reference.key.clone(),
                reason: "injected transient failure".to_string(),
            });
        }
        self.objects
            .lock()
            .expect("store lock poisoned")
            .get(&(reference.bucket.clone(), reference.key.clone()))
            .map(|o| o.bytes.clone())
            .ok_or_else(|| StoreError::NotFound {
                bucket: reference.bucket.clone(),
                key: reference.key.clone(),
            })
    }

    async fn put(
        &self,
        reference: &ArtifactReference,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StoreError> {
        self.put_object(&reference.bucket, &reference.key, bytes, content_type);
        Ok(())
    }
}
