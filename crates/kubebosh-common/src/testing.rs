//! In-memory stores for tests
//!
//! Enabled for this crate's own tests and for downstream crates through the
//! `test-utils` feature. They behave like the API server where the pipeline
//! depends on it: creates of existing names conflict, replaces are guarded by
//! resourceVersion, and every successful write bumps a global resourceVersion.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;

use crate::config_source::{ConfigObject, ConfigSource};
use crate::crd::ConfigKind;
use crate::versioned_secret::SecretBackend;
use crate::Error;

/// In-memory [`SecretBackend`] that counts writes
#[derive(Default)]
pub struct InMemorySecretBackend {
    secrets: DashMap<(String, String), Secret>,
    resource_version: AtomicU64,
    writes: AtomicUsize,
}

impl InMemorySecretBackend {
    /// Number of successful creates and replaces so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Names of all stored secrets in a namespace, sorted
    pub fn names(&self, namespace: &str) -> Vec<String> {
        let mut names: Vec<_> = self
            .secrets
            .iter()
            .filter(|e| e.key().0 == namespace)
            .map(|e| e.key().1.clone())
            .collect();
        names.sort();
        names
    }

    fn stamp(&self, secret: &Secret) -> Secret {
        let mut stored = secret.clone();
        let rv = self.resource_version.fetch_add(1, Ordering::SeqCst) + 1;
        stored.metadata.resource_version = Some(rv.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        stored
    }
}

fn key(namespace: &str, secret: &Secret) -> (String, String) {
    (
        namespace.to_string(),
        secret.metadata.name.clone().unwrap_or_default(),
    )
}

#[async_trait]
impl SecretBackend for InMemorySecretBackend {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .map(|s| s.clone()))
    }

    async fn list(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Secret>, Error> {
        Ok(self
            .secrets
            .iter()
            .filter(|e| e.key().0 == namespace)
            .filter(|e| {
                let have = e.value().metadata.labels.clone().unwrap_or_default();
                labels.iter().all(|(k, v)| have.get(k) == Some(v))
            })
            .map(|e| e.value().clone())
            .collect())
    }

    async fn create(&self, namespace: &str, secret: &Secret) -> Result<Secret, Error> {
        let key = key(namespace, secret);
        match self.secrets.entry(key.clone()) {
            Entry::Occupied(_) => Err(Error::conflict(key.1, "already exists")),
            Entry::Vacant(slot) => {
                let stored = self.stamp(secret);
                slot.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn replace(&self, namespace: &str, secret: &Secret) -> Result<Secret, Error> {
        let key = key(namespace, secret);
        match self.secrets.entry(key.clone()) {
            Entry::Vacant(_) => Err(Error::not_found("Secret", namespace, key.1)),
            Entry::Occupied(mut slot) => {
                let expected = secret.metadata.resource_version.as_deref();
                if expected.is_some() && expected != slot.get().metadata.resource_version.as_deref()
                {
                    return Err(Error::conflict(key.1, "stale resourceVersion"));
                }
                let stored = self.stamp(secret);
                slot.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.secrets
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}

/// In-memory [`ConfigSource`]
#[derive(Default)]
pub struct InMemoryConfigSource {
    objects: DashMap<(ConfigKind, String, String), ConfigObject>,
    resource_version: AtomicU64,
}

impl InMemoryConfigSource {
    /// Insert or replace an object, bumping its resourceVersion
    pub fn insert(
        &self,
        kind: ConfigKind,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) {
        let rv = self.resource_version.fetch_add(1, Ordering::SeqCst) + 1;
        self.objects.insert(
            (kind, namespace.to_string(), name.to_string()),
            ConfigObject {
                data,
                resource_version: rv.to_string(),
            },
        );
    }

    /// Insert an object with a single data key
    pub fn insert_key(
        &self,
        kind: ConfigKind,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) {
        let mut data = BTreeMap::new();
        data.insert(key.to_string(), value.to_string());
        self.insert(kind, namespace, name, data);
    }

    /// Remove an object
    pub fn remove(&self, kind: ConfigKind, namespace: &str, name: &str) {
        self.objects
            .remove(&(kind, namespace.to_string(), name.to_string()));
    }
}

#[async_trait]
impl ConfigSource for InMemoryConfigSource {
    async fn fetch(
        &self,
        kind: ConfigKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigObject>, Error> {
        Ok(self
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .map(|o| o.clone()))
    }
}
