//! Shared setup for remote-access integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use data_catalog::{DescriptorSource, Registry};
use remote_access::{AccessorConfig, RemoteAccessor, RetryPolicy, Scheme};
use test_utils::{memory_store, put_object, TEST_BUCKET};

/// Accessor serving `memory://test-bucket/...` from the given objects.
pub async fn accessor_with(objects: Vec<(&str, Vec<u8>)>) -> RemoteAccessor {
    accessor_with_config(AccessorConfig::default().with_retry(RetryPolicy::none()), objects).await
}

pub async fn accessor_with_config(config: AccessorConfig, objects: Vec<(&str, Vec<u8>)>) -> RemoteAccessor {
    let store = memory_store();
    for (key, bytes) in objects {
        put_object(&store, key, bytes).await;
    }
    let accessor = RemoteAccessor::new(config).expect("valid accessor config");
    accessor.register_store(Scheme::Memory, TEST_BUCKET, store);
    accessor
}

/// Registry over one inline YAML catalog.
pub fn registry(yaml: &str) -> Registry {
    Registry::builder()
        .add_source(DescriptorSource::inline("test-catalog", yaml))
        .build()
        .expect("valid test catalog")
}

/// Registry handle shared the way the provider expects it.
pub fn shared_registry(yaml: &str) -> Arc<Registry> {
    Arc::new(registry(yaml))
}
