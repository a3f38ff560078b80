use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use sha2::{Digest, Sha256};

use crate::store::ResourceDescriptor;

/// Cache of attribute digests keyed by mangled resource id.
///
/// Backends only need opaque get/set. Eviction and expiry stay the
/// backend's concern, which is why every guarded mutation rechecks
/// under the resource lock.
pub trait AttributeCache: Send + Sync {
    fn get(&self, key: &str) -> impl Future<Output = Option<String>> + Send;

    fn set(&self, key: &str, digest: String) -> impl Future<Output = ()> + Send;
}

impl<T: AttributeCache> AttributeCache for Arc<T> {
    fn get(&self, key: &str) -> impl Future<Output = Option<String>> + Send {
        (**self).get(key)
    }

    fn set(&self, key: &str, digest: String) -> impl Future<Output = ()> + Send {
        (**self).set(key, digest)
    }
}

/// In-process cache bounded by capacity and entry lifetime.
pub struct MemoryCache {
    inner: Cache<String, String>,
}

impl MemoryCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();

        Self { inner }
    }
}

impl AttributeCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, digest: String) {
        self.inner.insert(key.to_string(), digest).await;
    }
}

/// Digest over the descriptor fields an attribute update touches.
///
/// Declared metrics are excluded so a metric-only difference between
/// create and update forms yields the same digest. The encoding is
/// versioned and map iteration is ordered, so the digest is stable
/// across processes and a shared cache backend works.
pub fn attribute_digest(descriptor: &ResourceDescriptor) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"recordoor-attrs-v1:");
    hasher.update(descriptor.id.as_bytes());
    hasher.update([0]);
    hasher.update(descriptor.project_id.as_bytes());
    hasher.update([0]);
    hasher.update(descriptor.user_id.as_bytes());

    for (name, value) in &descriptor.attributes {
        hasher.update([0]);
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.to_string().as_bytes());
    }

    hex_digest(hasher)
}

/// Opaque cache key for a resource id. Raw ids never reach the cache
/// backend.
pub fn cache_key(resource_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"recordoor-resource-v1:");
    hasher.update(resource_id.as_bytes());
    hex_digest(hasher)
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();

    let mut out = String::with_capacity(64);
    for byte in digest.iter() {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
