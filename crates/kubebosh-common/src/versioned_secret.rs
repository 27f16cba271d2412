//! Append-only, monotonically versioned secret store
//!
//! Every pipeline stage writes its output as a new Secret named
//! `<prefix>-v<n>`. Versions for a prefix are never reused or mutated; the
//! current version is the highest existing one. A `<prefix>-vmax` secret
//! records the highest version ever written, so deleting versions never
//! frees their numbers. Concurrent writers race on the create of the next
//! version and the loser re-reads and retries.
//!
//! Plain (unversioned) secrets such as generated variables go through the
//! same backend via [`VersionedSecretStore::create_once`] and
//! [`VersionedSecretStore::put`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::error::{is_kube_conflict, is_kube_not_found};
use crate::kube_utils::{secret_string_data, to_secret_data};
use crate::names;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Error;

/// Label identifying the kind of a generated secret
pub const LABEL_SECRET_KIND: &str = "kubebosh.dev/secret-kind";

/// [`LABEL_SECRET_KIND`] value of versioned secrets
pub const SECRET_KIND_VERSIONED: &str = "versionedSecret";

/// [`LABEL_SECRET_KIND`] value of generated variables
pub const SECRET_KIND_VARIABLE: &str = "generatedVariable";

/// [`LABEL_SECRET_KIND`] value of the per-prefix version high-water mark
pub const SECRET_KIND_VERSION_MARK: &str = "versionMark";

/// Data key of the version high-water mark
const VERSION_MARK_KEY: &str = "version";

/// Label carrying the version of a versioned secret
pub const LABEL_SECRET_VERSION: &str = "kubebosh.dev/secret-version";

/// Label carrying the deployment a secret belongs to
pub const LABEL_DEPLOYMENT_NAME: &str = "kubebosh.dev/deployment-name";

/// Annotation describing what produced a secret
pub const ANNOTATION_SOURCE_DESCRIPTION: &str = "kubebosh.dev/source-description";

// =============================================================================
// Backend
// =============================================================================

/// Raw Secret persistence
///
/// `create` reports an existing object as [`Error::Conflict`]; `replace`
/// reports a stale resourceVersion the same way.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Get a secret, `Ok(None)` when absent
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// List secrets carrying all of the given labels
    async fn list(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Secret>, Error>;

    /// Create a secret that must not exist yet
    async fn create(&self, namespace: &str, secret: &Secret) -> Result<Secret, Error>;

    /// Replace an existing secret, guarded by its resourceVersion
    async fn replace(&self, namespace: &str, secret: &Secret) -> Result<Secret, Error>;

    /// Delete a secret; deleting an absent secret succeeds
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// SecretBackend backed by the Kubernetes API
pub struct KubeSecretBackend {
    client: Client,
}

impl KubeSecretBackend {
    /// Create a backend for the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn secret_name(secret: &Secret) -> String {
    secret.metadata.name.clone().unwrap_or_default()
}

#[async_trait]
impl SecretBackend for KubeSecretBackend {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        match self.api(namespace).get(name).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if is_kube_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Secret>, Error> {
        let selector = labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let list = self
            .api(namespace)
            .list(&ListParams::default().labels(&selector))
            .await?;
        Ok(list.items)
    }

    async fn create(&self, namespace: &str, secret: &Secret) -> Result<Secret, Error> {
        match self
            .api(namespace)
            .create(&PostParams::default(), secret)
            .await
        {
            Ok(s) => Ok(s),
            Err(e) if is_kube_conflict(&e) => {
                Err(Error::conflict(secret_name(secret), "already exists"))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(&self, namespace: &str, secret: &Secret) -> Result<Secret, Error> {
        let name = secret_name(secret);
        match self
            .api(namespace)
            .replace(&name, &PostParams::default(), secret)
            .await
        {
            Ok(s) => Ok(s),
            Err(e) if is_kube_conflict(&e) => Err(Error::conflict(name, "stale resourceVersion")),
            Err(e) if is_kube_not_found(&e) => Err(Error::not_found("Secret", namespace, name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match self
            .api(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_kube_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Store
// =============================================================================

/// Where secrets are written and who owns them
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SecretScope {
    /// Target namespace
    pub namespace: String,
    /// Deployment the secrets belong to, used for listing
    pub deployment: String,
    /// Owner reference attached to every written secret
    pub owner: Option<OwnerReference>,
}

impl SecretScope {
    /// Scope without an owner
    pub fn new(namespace: impl Into<String>, deployment: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            deployment: deployment.into(),
            owner: None,
        }
    }

    /// Attach an owner reference
    pub fn with_owner(mut self, owner: Option<OwnerReference>) -> Self {
        self.owner = owner;
        self
    }

    fn deployment_label(&self) -> String {
        names::limit_length(&self.deployment, names::MAX_NAME_LEN)
    }
}

/// Content of a secret to write
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SecretContent {
    /// Secret data
    pub data: BTreeMap<String, String>,
    /// Extra labels
    pub labels: BTreeMap<String, String>,
    /// Value of the source-description annotation
    pub source_description: String,
}

impl SecretContent {
    /// Content with a single data key
    pub fn single(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut data = BTreeMap::new();
        data.insert(key.into(), value.into());
        Self {
            data,
            ..Default::default()
        }
    }

    /// Content from a data map
    pub fn from_data(data: BTreeMap<String, String>) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    /// Set the source description
    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.source_description = description.into();
        self
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// One version of a versioned secret
#[derive(Clone, Debug, PartialEq)]
pub struct VersionedSecret {
    /// Full secret name `<prefix>-v<version>`
    pub name: String,
    /// Name prefix shared by all versions
    pub prefix: String,
    /// Version number, starting at 1
    pub version: u64,
    /// Decoded data
    pub data: BTreeMap<String, String>,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// resourceVersion of the stored object
    pub resource_version: String,
}

impl VersionedSecret {
    fn from_secret(secret: &Secret) -> Result<Self, Error> {
        let name = secret_name(secret);
        let labels = secret.metadata.labels.clone().unwrap_or_default();
        let (prefix, parsed) = names::split_versioned_name(&name).ok_or_else(|| {
            Error::internal_with_context(
                "secret-store",
                format!("'{name}' is not a versioned secret name"),
            )
        })?;
        let version = labels
            .get(LABEL_SECRET_VERSION)
            .and_then(|v| v.parse().ok())
            .unwrap_or(parsed);
        Ok(Self {
            prefix: prefix.to_string(),
            version,
            data: secret_string_data(secret)?,
            resource_version: secret.metadata.resource_version.clone().unwrap_or_default(),
            labels,
            name,
        })
    }

    /// Get one data value
    pub fn value(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }
}

/// A plain, unversioned secret
#[derive(Clone, Debug, PartialEq)]
pub struct StoredSecret {
    /// Secret name
    pub name: String,
    /// Decoded data
    pub data: BTreeMap<String, String>,
    /// resourceVersion of the stored object
    pub resource_version: String,
}

impl StoredSecret {
    fn from_secret(secret: &Secret) -> Result<Self, Error> {
        Ok(Self {
            name: secret_name(secret),
            data: secret_string_data(secret)?,
            resource_version: secret.metadata.resource_version.clone().unwrap_or_default(),
        })
    }
}

/// Result of a content-gated write
#[derive(Clone, Debug, PartialEq)]
pub enum StoreOutcome {
    /// A new version was written
    Created(VersionedSecret),
    /// The latest version already held identical data
    Unchanged(VersionedSecret),
}

impl StoreOutcome {
    /// The version that now holds the content
    pub fn secret(&self) -> &VersionedSecret {
        match self {
            Self::Created(s) | Self::Unchanged(s) => s,
        }
    }

    /// Version number of [`Self::secret`]
    pub fn version(&self) -> u64 {
        self.secret().version
    }

    /// Whether a write happened
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Versioned secret store over a [`SecretBackend`]
#[derive(Clone)]
pub struct VersionedSecretStore {
    backend: Arc<dyn SecretBackend>,
    retry: RetryConfig,
}

impl VersionedSecretStore {
    /// Create a store over the given backend
    pub fn new(backend: Arc<dyn SecretBackend>) -> Self {
        Self {
            backend,
            retry: RetryConfig::conflict(),
        }
    }

    /// Override the conflict retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Inverse of the versioned naming convention
    pub fn prefix_of(name: &str) -> Option<&str> {
        names::prefix_of(name)
    }

    /// Write `content` as the next version of `prefix`
    ///
    /// Identical content still allocates a new version; use
    /// [`Self::create_if_changed`] to skip unchanged writes. The next version
    /// is above both the highest existing version and the high-water mark.
    pub async fn create(
        &self,
        scope: &SecretScope,
        prefix: &str,
        content: &SecretContent,
    ) -> Result<VersionedSecret, Error> {
        let store = self;
        let written = retry_with_backoff(
            &self.retry,
            "create versioned secret",
            Error::is_conflict,
            move || async move {
                let existing = store.latest_version(scope, prefix).await?;
                let version = existing.max(store.version_mark(scope, prefix).await?) + 1;
                let name = names::versioned_name(prefix, version);
                let secret = build_secret(scope, &name, content, Some(version));
                let created = store.backend.create(&scope.namespace, &secret).await?;
                info!(
                    secret = %name,
                    namespace = %scope.namespace,
                    version,
                    "created versioned secret"
                );
                VersionedSecret::from_secret(&created)
            },
        )
        .await?;
        self.raise_version_mark(scope, prefix, written.version)
            .await?;
        Ok(written)
    }

    /// Write a new version only when the latest one holds different data
    pub async fn create_if_changed(
        &self,
        scope: &SecretScope,
        prefix: &str,
        content: &SecretContent,
    ) -> Result<StoreOutcome, Error> {
        if let Some(latest) = self.latest(scope, prefix).await? {
            if latest.data == content.data {
                debug!(secret = %latest.name, "content unchanged, skipping new version");
                return Ok(StoreOutcome::Unchanged(latest));
            }
        }
        self.create(scope, prefix, content)
            .await
            .map(StoreOutcome::Created)
    }

    /// Get one version
    pub async fn get(
        &self,
        scope: &SecretScope,
        prefix: &str,
        version: u64,
    ) -> Result<Option<VersionedSecret>, Error> {
        let name = names::versioned_name(prefix, version);
        match self.backend.get(&scope.namespace, &name).await? {
            Some(secret) => VersionedSecret::from_secret(&secret).map(Some),
            None => Ok(None),
        }
    }

    /// All versions of `prefix`, oldest first
    pub async fn list(
        &self,
        scope: &SecretScope,
        prefix: &str,
    ) -> Result<Vec<VersionedSecret>, Error> {
        let mut versions = self
            .list_raw(scope, prefix)
            .await?
            .iter()
            .map(VersionedSecret::from_secret)
            .collect::<Result<Vec<_>, _>>()?;
        versions.sort_by_key(|v| v.version);
        Ok(versions)
    }

    /// The highest version of `prefix`
    pub async fn latest(
        &self,
        scope: &SecretScope,
        prefix: &str,
    ) -> Result<Option<VersionedSecret>, Error> {
        Ok(self.list(scope, prefix).await?.pop())
    }

    /// The highest version number of `prefix`, 0 when none exists
    pub async fn latest_version(&self, scope: &SecretScope, prefix: &str) -> Result<u64, Error> {
        Ok(self
            .latest(scope, prefix)
            .await?
            .map(|v| v.version)
            .unwrap_or(0))
    }

    /// Delete every version of `prefix`, returning how many were deleted
    ///
    /// The high-water mark stays, so a later create continues the numbering.
    pub async fn delete(&self, scope: &SecretScope, prefix: &str) -> Result<usize, Error> {
        let secrets = self.list_raw(scope, prefix).await?;
        for secret in &secrets {
            self.backend
                .delete(&scope.namespace, &secret_name(secret))
                .await?;
        }
        Ok(secrets.len())
    }

    /// Add a label to every version of `prefix`
    pub async fn decorate(
        &self,
        scope: &SecretScope,
        prefix: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Error> {
        for secret in self.list_raw(scope, prefix).await? {
            let name = secret_name(&secret);
            let store = self;
            retry_with_backoff(
                &self.retry,
                "decorate versioned secret",
                Error::is_conflict,
                move || {
                    let name = name.clone();
                    async move {
                        let Some(mut current) = store.backend.get(&scope.namespace, &name).await?
                        else {
                            return Ok(());
                        };
                        let labels = current.metadata.labels.get_or_insert_with(BTreeMap::new);
                        if labels.get(key).map(String::as_str) == Some(value) {
                            return Ok(());
                        }
                        labels.insert(key.to_string(), value.to_string());
                        store.backend.replace(&scope.namespace, &current).await?;
                        Ok::<(), Error>(())
                    }
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Get a plain secret by name
    pub async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StoredSecret>, Error> {
        match self.backend.get(namespace, name).await? {
            Some(secret) => StoredSecret::from_secret(&secret).map(Some),
            None => Ok(None),
        }
    }

    /// Create a plain secret unless it already exists
    ///
    /// Returns the stored secret and whether this call created it. An
    /// existing secret is returned untouched, whatever its content.
    pub async fn create_once(
        &self,
        scope: &SecretScope,
        name: &str,
        content: &SecretContent,
    ) -> Result<(StoredSecret, bool), Error> {
        if let Some(existing) = self.get_secret(&scope.namespace, name).await? {
            return Ok((existing, false));
        }
        let secret = build_secret(scope, name, content, None);
        match self.backend.create(&scope.namespace, &secret).await {
            Ok(created) => Ok((StoredSecret::from_secret(&created)?, true)),
            Err(e) if e.is_conflict() => {
                // Lost the race to another writer; theirs is the secret
                let existing = self
                    .get_secret(&scope.namespace, name)
                    .await?
                    .ok_or_else(|| Error::not_found("Secret", &scope.namespace, name))?;
                Ok((existing, false))
            }
            Err(e) => Err(e),
        }
    }

    /// Create or overwrite a plain secret
    pub async fn put(
        &self,
        scope: &SecretScope,
        name: &str,
        content: &SecretContent,
    ) -> Result<StoredSecret, Error> {
        let store = self;
        retry_with_backoff(&self.retry, "put secret", Error::is_conflict, move || async move {
            let mut secret = build_secret(scope, name, content, None);
            let written = match store.backend.get(&scope.namespace, name).await? {
                Some(existing) => {
                    secret.metadata.resource_version = existing.metadata.resource_version;
                    store.backend.replace(&scope.namespace, &secret).await?
                }
                None => store.backend.create(&scope.namespace, &secret).await?,
            };
            StoredSecret::from_secret(&written)
        })
        .await
    }

    /// Highest version ever written for `prefix`, 0 before the first write
    async fn version_mark(&self, scope: &SecretScope, prefix: &str) -> Result<u64, Error> {
        let name = names::version_mark_name(prefix);
        match self.backend.get(&scope.namespace, &name).await? {
            Some(mark) => Ok(marked_version(&mark)?),
            None => Ok(0),
        }
    }

    async fn raise_version_mark(
        &self,
        scope: &SecretScope,
        prefix: &str,
        version: u64,
    ) -> Result<(), Error> {
        let name = names::version_mark_name(prefix);
        let content = SecretContent::single(VERSION_MARK_KEY, version.to_string())
            .with_label(LABEL_SECRET_KIND, SECRET_KIND_VERSION_MARK);
        let (store, name, content) = (self, &name, &content);
        retry_with_backoff(&self.retry, "raise version mark", Error::is_conflict, move || {
            let mut mark = build_secret(scope, name, content, None);
            async move {
                if let Some(existing) = store.backend.get(&scope.namespace, name).await? {
                    if marked_version(&existing)? >= version {
                        return Ok(());
                    }
                    mark.metadata.resource_version = existing.metadata.resource_version;
                    store.backend.replace(&scope.namespace, &mark).await?;
                } else {
                    store.backend.create(&scope.namespace, &mark).await?;
                }
                Ok::<(), Error>(())
            }
        })
        .await
    }

    async fn list_raw(&self, scope: &SecretScope, prefix: &str) -> Result<Vec<Secret>, Error> {
        let mut selector = BTreeMap::new();
        selector.insert(
            LABEL_SECRET_KIND.to_string(),
            SECRET_KIND_VERSIONED.to_string(),
        );
        selector.insert(LABEL_DEPLOYMENT_NAME.to_string(), scope.deployment_label());
        Ok(self
            .backend
            .list(&scope.namespace, &selector)
            .await?
            .into_iter()
            .filter(|s| {
                s.metadata
                    .name
                    .as_deref()
                    .and_then(names::prefix_of)
                    .is_some_and(|p| p == prefix)
            })
            .collect())
    }
}

fn marked_version(mark: &Secret) -> Result<u64, Error> {
    Ok(secret_string_data(mark)?
        .get(VERSION_MARK_KEY)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0))
}

fn build_secret(
    scope: &SecretScope,
    name: &str,
    content: &SecretContent,
    version: Option<u64>,
) -> Secret {
    let mut labels = content.labels.clone();
    if !scope.deployment.is_empty() {
        labels.insert(LABEL_DEPLOYMENT_NAME.to_string(), scope.deployment_label());
    }
    if let Some(version) = version {
        labels.insert(
            LABEL_SECRET_KIND.to_string(),
            SECRET_KIND_VERSIONED.to_string(),
        );
        labels.insert(LABEL_SECRET_VERSION.to_string(), version.to_string());
    }
    let mut annotations = BTreeMap::new();
    if !content.source_description.is_empty() {
        annotations.insert(
            ANNOTATION_SOURCE_DESCRIPTION.to_string(),
            content.source_description.clone(),
        );
    }
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(scope.namespace.clone()),
            labels: Some(labels),
            annotations: if annotations.is_empty() {
                None
            } else {
                Some(annotations)
            },
            owner_references: scope.owner.clone().map(|o| vec![o]),
            ..Default::default()
        },
        data: Some(to_secret_data(&content.data)),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}
